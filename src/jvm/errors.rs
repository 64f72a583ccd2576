use crate::jvm::code::Label;

/// Everything that can go wrong while assembling a class
///
/// Errors fall into a handful of families:
///
///   - the caller broke the construction protocol (events out of order, labels used before they
///     were placed, malformed descriptors)
///   - some class file limit was exceeded (constant pool size, code length)
///   - the input uses subroutines (`jsr`/`ret`) while frames are being computed
///
/// None of these are recoverable for the class being assembled. Branch offsets overflowing their
/// 16-bit encoding is _not_ an error: those jumps are widened once the method is complete.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("constant pool overflow: no room for {constant} at index {offset}")]
    ConstantPoolOverflow { constant: String, offset: usize },

    #[error("code of method `{method}` is {length} bytes long (at most 65535 are allowed)")]
    MethodCodeOverflow { method: String, length: usize },

    #[error("method `{method}` needs {count} {what} slots (at most 65535 are allowed)")]
    MethodSlotsOverflow {
        method: String,
        what: &'static str,
        count: usize,
    },

    /// An event arrived in a state that does not accept it
    #[error("`{event}` is not allowed {state}")]
    InvalidState {
        event: &'static str,
        state: &'static str,
    },

    /// A label was needed at a time when it had not been placed yet
    #[error("label {0:?} is used before being placed")]
    UnresolvedLabel(Label),

    /// A label is placed twice, or belongs to a different method
    #[error("label {0:?} cannot be placed here")]
    LabelPlacedTwice(Label),

    #[error("opcode {opcode:#04x} cannot be used with `{event}`")]
    InvalidOpcode { opcode: u8, event: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid descriptor `{descriptor}`: {reason}")]
    BadDescriptor { descriptor: String, reason: String },

    /// Common super class computation hit a class the hierarchy does not know about
    #[error("class `{0}` is missing from the class hierarchy")]
    MissingClass(String),

    /// `jsr`/`ret` have no abstract interpretation, so frames cannot be computed for them
    #[error("`{opcode}` (offset {offset}) is not supported when computing frames")]
    UnsupportedSubroutine { opcode: &'static str, offset: usize },

    /// Two paths reach the same instruction with different operand stack heights
    #[error("stack height at offset {offset} is {expected} along one path but {found} along another")]
    StackHeightMismatch {
        offset: usize,
        expected: usize,
        found: usize,
    },

    /// Freshly written bytecode could not be decoded back (indicates a bug)
    #[error("malformed code at offset {offset}: {reason}")]
    MalformedCode { offset: usize, reason: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
