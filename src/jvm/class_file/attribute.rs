use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex, Utf8ConstantIndex};
use crate::jvm::{InnerClassAccessFlags, Serialize};
use byteorder::WriteBytesExt;
use std::io::{Error as IoError, ErrorKind, Result};

/// Attribute ready to be written: the index of its name in the pool and its encoded body
///
/// Every attribute shares this outer layout, so the typed attributes below are encoded into one
/// of these (see `ConstantPool::get_attribute`) as soon as they are complete.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7
#[derive(Clone, Debug)]
pub struct Attribute {
    pub name_index: Utf8ConstantIndex,
    pub info: Vec<u8>,
}

impl Serialize for Attribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.name_index.serialize(writer)?;
        (self.info.len() as u32).serialize(writer)?;
        writer.write_all(&self.info)
    }
}

/// Typed attribute body, whose name is fixed by the class file format
pub trait AttributeLike: Serialize {
    const NAME: &'static str;
}

/// Attributes whose body is exactly one serializable value (often a length-prefixed table)
macro_rules! wrapper_attributes {
    ($($(#[$doc:meta])* $name:ident($inner:ty) = $tag:literal;)*) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Debug)]
            pub struct $name(pub $inner);

            impl AttributeLike for $name {
                const NAME: &'static str = $tag;
            }

            impl Serialize for $name {
                fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
                    self.0.serialize(writer)
                }
            }
        )*
    };
}

wrapper_attributes! {
    /// Initial value of a `static final` field
    ConstantValue(ConstantIndex) = "ConstantValue";

    /// Checked exceptions a method declares
    Exceptions(Vec<ClassConstantIndex>) = "Exceptions";

    StackMapTable(Vec<StackMapFrame>) = "StackMapTable";
    LineNumberTable(Vec<LineNumber>) = "LineNumberTable";
    LocalVariableTable(Vec<LocalVariable>) = "LocalVariableTable";

    /// Same rows as `LocalVariableTable`, but `descriptor_index` points at a generic signature
    LocalVariableTypeTable(Vec<LocalVariable>) = "LocalVariableTypeTable";

    SourceFile(Utf8ConstantIndex) = "SourceFile";

    /// Generic signature of a class, field, or method
    Signature(Utf8ConstantIndex) = "Signature";

    BootstrapMethods(Vec<BootstrapMethod>) = "BootstrapMethods";
    NestHost(ClassConstantIndex) = "NestHost";
    NestMembers(Vec<ClassConstantIndex>) = "NestMembers";

    /// Every nested class the constant pool mentions needs a row here
    InnerClasses(Vec<InnerClass>) = "InnerClasses";
}

/// Body of a method: bytecode plus everything describing it
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Clone, Debug)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl AttributeLike for Code {
    const NAME: &'static str = "Code";
}

impl Serialize for Code {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;
        (self.code.len() as u32).serialize(writer)?;
        writer.write_all(&self.code)?;
        self.exception_table.serialize(writer)?;
        self.attributes.serialize(writer)
    }
}

/// Row of the exception table, protecting `[start_pc, end_pc)`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,

    /// `None` catches everything (as `finally` blocks do)
    pub catch_type: Option<ClassConstantIndex>,
}

/// Optional pool indices are written as `0` when absent
fn serialize_optional<I, W>(index: &Option<I>, writer: &mut W) -> Result<()>
where
    I: Serialize,
    W: WriteBytesExt,
{
    match index {
        Some(index) => index.serialize(writer),
        None => 0u16.serialize(writer),
    }
}

impl Serialize for ExceptionHandler {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        serialize_optional(&self.catch_type, writer)
    }
}

/// Compressed stack map frame
///
/// Each frame is stored relative to the one before it (the first one is relative to the frame
/// implied by the method descriptor). Offsets are deltas too: a frame sits at
/// `previous_offset + offset_delta + 1`, except the first which sits at `offset_delta`.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.4
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StackMapFrame {
    /// `same_frame` (or `same_frame_extended` past a delta of 63)
    SameLocalsNoStack { offset_delta: u16 },

    /// `same_locals_1_stack_item_frame` (or its extended form)
    SameLocalsOneStack {
        offset_delta: u16,
        stack: VerificationType,
    },

    /// `chop_frame`, dropping the last 1 to 3 locals
    ChopLocalsNoStack { offset_delta: u16, chopped_k: u8 },

    /// `append_frame`, adding 1 to 3 locals
    AppendLocalsNoStack {
        offset_delta: u16,
        locals: Vec<VerificationType>,
    },

    Full {
        offset_delta: u16,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::SameLocalsNoStack { offset_delta }
            | StackMapFrame::SameLocalsOneStack { offset_delta, .. }
            | StackMapFrame::ChopLocalsNoStack { offset_delta, .. }
            | StackMapFrame::AppendLocalsNoStack { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

const SAME_LOCALS_ONE_STACK: u8 = 64;
const SAME_LOCALS_ONE_STACK_EXTENDED: u8 = 247;
const SAME_EXTENDED: u8 = 251;
const FULL: u8 = 255;

/// Largest delta that fits in the tag of the short frame kinds
const SHORT_DELTA_MAX: u16 = 63;

impl Serialize for StackMapFrame {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        match self {
            StackMapFrame::SameLocalsNoStack { offset_delta }
                if *offset_delta <= SHORT_DELTA_MAX =>
            {
                (*offset_delta as u8).serialize(writer)
            }
            StackMapFrame::SameLocalsNoStack { offset_delta } => {
                SAME_EXTENDED.serialize(writer)?;
                offset_delta.serialize(writer)
            }
            StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack,
            } => {
                if *offset_delta <= SHORT_DELTA_MAX {
                    (SAME_LOCALS_ONE_STACK + *offset_delta as u8).serialize(writer)?;
                } else {
                    SAME_LOCALS_ONE_STACK_EXTENDED.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
                stack.serialize(writer)
            }
            StackMapFrame::ChopLocalsNoStack {
                offset_delta,
                chopped_k,
            } => {
                if !(1..=3).contains(chopped_k) {
                    return Err(IoError::new(
                        ErrorKind::InvalidInput,
                        format!("chop frame cannot remove {} locals", chopped_k),
                    ));
                }
                (SAME_EXTENDED - chopped_k).serialize(writer)?;
                offset_delta.serialize(writer)
            }
            StackMapFrame::AppendLocalsNoStack {
                offset_delta,
                locals,
            } => {
                if !(1..=3).contains(&locals.len()) {
                    return Err(IoError::new(
                        ErrorKind::InvalidInput,
                        format!("append frame cannot add {} locals", locals.len()),
                    ));
                }
                (SAME_EXTENDED + locals.len() as u8).serialize(writer)?;
                offset_delta.serialize(writer)?;
                locals.iter().try_for_each(|local| local.serialize(writer))
            }
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                FULL.serialize(writer)?;
                offset_delta.serialize(writer)?;
                locals.serialize(writer)?;
                stack.serialize(writer)
            }
        }
    }
}

/// Verification type as written in a stack map frame
///
/// `Long` and `Double` stand for both of the slots they occupy, so no `Top` follows them here.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(ClassConstantIndex),

    /// Result of the `new` at this offset, before its constructor ran
    Uninitialized(u16),
}

impl VerificationType {
    fn tag(&self) -> u8 {
        match self {
            VerificationType::Top => 0,
            VerificationType::Integer => 1,
            VerificationType::Float => 2,
            VerificationType::Double => 3,
            VerificationType::Long => 4,
            VerificationType::Null => 5,
            VerificationType::UninitializedThis => 6,
            VerificationType::Object(_) => 7,
            VerificationType::Uninitialized(_) => 8,
        }
    }
}

impl Serialize for VerificationType {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.tag().serialize(writer)?;
        match self {
            VerificationType::Object(class) => class.serialize(writer),
            VerificationType::Uninitialized(offset) => offset.serialize(writer),
            _ => Ok(()),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line_number: u16,
}

impl Serialize for LineNumber {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.start_pc.serialize(writer)?;
        self.line_number.serialize(writer)
    }
}

/// Scope of a local variable: `[start_pc, start_pc + length)` in slot `index`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: Utf8ConstantIndex,
    pub descriptor_index: Utf8ConstantIndex,
    pub index: u16,
}

impl Serialize for LocalVariable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.start_pc.serialize(writer)?;
        self.length.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.index.serialize(writer)
    }
}

/// Row of the bootstrap method table: a method handle and its static arguments
#[derive(Clone, Debug)]
pub struct BootstrapMethod {
    pub bootstrap_method: ConstantIndex,
    pub bootstrap_arguments: Vec<ConstantIndex>,
}

impl Serialize for BootstrapMethod {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.bootstrap_method.serialize(writer)?;
        self.bootstrap_arguments.serialize(writer)
    }
}

/// Anonymous and local classes have no outer class (and anonymous ones have no name either)
#[derive(Clone, Debug)]
pub struct InnerClass {
    pub inner_class: ClassConstantIndex,
    pub outer_class: Option<ClassConstantIndex>,
    pub inner_name: Option<Utf8ConstantIndex>,
    pub access_flags: InnerClassAccessFlags,
}

impl Serialize for InnerClass {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.inner_class.serialize(writer)?;
        serialize_optional(&self.outer_class, writer)?;
        serialize_optional(&self.inner_name, writer)?;
        self.access_flags.serialize(writer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_frame_encodings() {
        let same = StackMapFrame::SameLocalsNoStack { offset_delta: 5 };
        assert_eq!(same.to_bytes().unwrap(), vec![5]);

        let same_extended = StackMapFrame::SameLocalsNoStack { offset_delta: 300 };
        assert_eq!(same_extended.to_bytes().unwrap(), vec![251, 1, 44]);

        let one_stack = StackMapFrame::SameLocalsOneStack {
            offset_delta: 3,
            stack: VerificationType::Integer,
        };
        assert_eq!(one_stack.to_bytes().unwrap(), vec![67, 1]);

        let one_stack_extended = StackMapFrame::SameLocalsOneStack {
            offset_delta: 64,
            stack: VerificationType::Null,
        };
        assert_eq!(one_stack_extended.to_bytes().unwrap(), vec![247, 0, 64, 5]);

        let chop = StackMapFrame::ChopLocalsNoStack {
            offset_delta: 2,
            chopped_k: 2,
        };
        assert_eq!(chop.to_bytes().unwrap(), vec![249, 0, 2]);

        let append = StackMapFrame::AppendLocalsNoStack {
            offset_delta: 0,
            locals: vec![VerificationType::Long],
        };
        assert_eq!(append.to_bytes().unwrap(), vec![252, 0, 0, 4]);
    }

    #[test]
    fn full_frame_encoding() {
        let full = StackMapFrame::Full {
            offset_delta: 7,
            locals: vec![
                VerificationType::Object(ClassConstantIndex(ConstantIndex(4))),
                VerificationType::Long,
            ],
            stack: vec![VerificationType::Uninitialized(12)],
        };
        assert_eq!(
            full.to_bytes().unwrap(),
            vec![255, 0, 7, 0, 2, 7, 0, 4, 4, 0, 1, 8, 0, 12]
        );
    }

    #[test]
    fn out_of_range_frames_are_rejected() {
        let chop = StackMapFrame::ChopLocalsNoStack {
            offset_delta: 0,
            chopped_k: 4,
        };
        assert!(chop.to_bytes().is_err());

        let append = StackMapFrame::AppendLocalsNoStack {
            offset_delta: 0,
            locals: vec![],
        };
        assert!(append.to_bytes().is_err());
    }

    #[test]
    fn code_and_handlers() {
        let code = Code {
            max_stack: 1,
            max_locals: 2,
            code: vec![0x03, 0xAC],
            exception_table: vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: None,
            }],
            attributes: vec![],
        };
        assert_eq!(
            code.to_bytes().unwrap(),
            vec![0, 1, 0, 2, 0, 0, 0, 2, 0x03, 0xAC, 0, 1, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0]
        );
    }
}
