mod access_flags;
mod binary_format;
mod class_writer;
mod descriptors;
mod errors;
mod version;
mod visitor;

pub mod class_file;
pub mod code;
pub mod hierarchy;
pub mod opcodes;

pub use access_flags::*;
pub use binary_format::*;
pub use class_writer::ClassWriter;
pub use code::{Compute, ExplicitFrame, FrameItem, Label, MethodWriter};
pub use descriptors::*;
pub use errors::Error;
pub use hierarchy::{ClassHierarchy, ClassInfo, StaticClassHierarchy};
pub use version::Version;
pub use visitor::{ClassVisitor, MethodVisitor};
