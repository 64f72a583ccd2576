//! Method bodies: labels, basic blocks, frames, and the writer tying them together
//!
//! [`MethodWriter`] is where instructions turn into bytes. Everything else in here supports it:
//!
//!   - `label` holds the per-label (and per-block) bookkeeping
//!   - `frame` interprets instructions over verification types
//!   - `stack_map` compresses frames into `StackMapTable` entries
//!   - `jump_encoding` widens jumps whose 16-bit offsets overflowed
//!   - `code_reader` decodes finished code so it can be written again

mod code_reader;
mod frame;
mod handler;
mod jump_encoding;
mod label;
mod method_writer;
mod stack_map;

pub use handler::{remove as remove_handler_range, Handler};
pub use label::Label;
pub use method_writer::{Compute, ExplicitFrame, FrameItem, MethodWriter};

pub(crate) use frame::Frame;
pub(crate) use label::EdgeInfo;
pub(crate) use method_writer::{ClassContext, MethodDeclaration};
