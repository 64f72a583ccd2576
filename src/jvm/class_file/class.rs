use crate::jvm::class_file::{Attribute, ClassConstantIndex, Field, Method};
use crate::jvm::{ClassAccessFlags, Serialize, Version};
use byteorder::WriteBytesExt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Finished class, laid out as in the [`class` file format][0]
///
/// The constant pool is kept in its already encoded form: by the time a `ClassFile` exists, every
/// index in the fields, methods, and attributes has been handed out by the pool.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html
#[derive(Debug)]
pub struct ClassFile {
    pub version: Version,

    /// Value of `constant_pool_count` (one more than the largest index)
    pub constants_count: u16,

    /// Encoded constant pool entries
    pub constants: Vec<u8>,

    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,

    /// Only `java/lang/Object` has no super class
    pub super_class: Option<ClassConstantIndex>,

    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Write the class file to disk, creating package directories along the way
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        self.serialize(&mut writer)?;
        writer.flush()
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(writer)?;
        self.constants_count.serialize(writer)?;
        writer.write_all(&self.constants)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class
            .map_or(0, |super_class| super_class.0 .0)
            .serialize(writer)?;
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ConstantIndex;

    #[test]
    fn header_layout() {
        let class_file = ClassFile {
            version: Version::JAVA8,
            constants_count: 3,
            constants: vec![7, 0, 2, 1, 0, 1, b'A'],
            access_flags: ClassAccessFlags::PUBLIC,
            this_class: ClassConstantIndex(ConstantIndex(1)),
            super_class: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        };
        let bytes = class_file.to_bytes().unwrap();
        assert_eq!(&bytes[..10], &[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 3]);
        assert_eq!(
            &bytes[17..],
            &[0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }
}
