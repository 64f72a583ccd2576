use byteorder::{BigEndian, WriteBytesExt};
use std::io::Result;

/// Utility trait for serializing data inside class files
///
/// Class files are big-endian throughout, tags are single bytes, and sequences are almost always
/// prefixed with a `u16` length. That is regular enough to warrant a tiny trait of our own.
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;

    /// Serialize into a fresh byte vector
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }
}

macro_rules! serialize_big_endian {
    ($($typ:ty => $write:ident),* $(,)?) => {
        $(
            impl Serialize for $typ {
                fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
                    writer.$write::<BigEndian>(*self)
                }
            }
        )*
    };
}

serialize_big_endian! {
    u16 => write_u16,
    u32 => write_u32,
    u64 => write_u64,
    i16 => write_i16,
    i32 => write_i32,
    i64 => write_i64,
    f32 => write_f32,
    f64 => write_f64,
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

/// Size in `u16` is the first thing serialized
impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u16).serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

/// Patch a big-endian `u16` in place
pub fn write_u16_at(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

/// Patch a big-endian `i32` in place
pub fn write_i32_at(bytes: &mut [u8], at: usize, value: i32) {
    bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn read_u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub fn read_i16_at(bytes: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub fn read_i32_at(bytes: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn big_endian_numbers() {
        assert_eq!(0xCAFEu16.to_bytes().unwrap(), vec![0xCA, 0xFE]);
        assert_eq!((-2i32).to_bytes().unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(1.0f32.to_bytes().unwrap(), vec![0x3F, 0x80, 0, 0]);
    }

    #[test]
    fn vectors_are_length_prefixed() {
        let elems: Vec<u16> = vec![1, 2, 3];
        assert_eq!(elems.to_bytes().unwrap(), vec![0, 3, 0, 1, 0, 2, 0, 3]);
    }

    #[test]
    fn patching_in_place() {
        let mut bytes = vec![0u8; 6];
        write_u16_at(&mut bytes, 0, 0xBEEF);
        write_i32_at(&mut bytes, 2, -32769);
        assert_eq!(read_u16_at(&bytes, 0), 0xBEEF);
        assert_eq!(read_i32_at(&bytes, 2), -32769);
        assert_eq!(read_i16_at(&[0x80, 0x00], 0), i16::MIN);
    }
}
