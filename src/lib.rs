//! Assemble JVM class files from a stream of structural events
//!
//! The entry point is [`jvm::ClassWriter`]: declare a class, its fields and methods, feed each
//! method body instruction by instruction through a [`jvm::MethodVisitor`], and serialize. Depending
//! on the [`jvm::Compute`] mode, the writer takes `max_stack`/`max_locals`/frames verbatim from
//! the caller, computes the maximum sizes, or runs a full type inference pass to produce the
//! `StackMapTable` the verifier needs.

pub mod jvm;
pub mod util;
