use super::Serialize;
use byteorder::WriteBytesExt;
use std::io::Result;

/// Version of the class file, which is used to verify that the JVM has the
/// necessary features to interpret the class
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Version {
    pub major_version: u16,
    pub minor_version: u16,
}

impl Version {
    /// Java SE 5 (last version without `StackMapTable`)
    pub const JAVA5: Version = Version::major(49);

    /// Java SE 6 (`StackMapTable` introduced, but the old verifier is still a fallback)
    pub const JAVA6: Version = Version::major(50);

    /// Java SE 7 (`invokedynamic`, stack map frames mandatory)
    pub const JAVA7: Version = Version::major(51);

    /// JVM class file version corresponding to Java SE 8 (released March 2014)
    pub const JAVA8: Version = Version::major(52);

    /// Java SE 11 (nestmates)
    pub const JAVA11: Version = Version::major(55);

    /// Java SE 17
    pub const JAVA17: Version = Version::major(61);

    pub const fn major(major_version: u16) -> Version {
        Version {
            major_version,
            minor_version: 0,
        }
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor_version.serialize(writer)?;
        self.major_version.serialize(writer)?;
        Ok(())
    }
}
