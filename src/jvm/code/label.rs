use crate::jvm::code::Frame;
use crate::jvm::class_file::TypeIndex;
use bitflags::bitflags;
use std::fmt;

/// Position in the code of a method, possibly not yet placed
///
/// Labels are handles into the label table of the method that created them, so they are cheap to
/// copy around but meaningless outside of that method.
#[derive(Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

bitflags! {
    /// Status bits of a label (most only make sense when the label heads a basic block)
    #[derive(Default)]
    pub(crate) struct LabelFlags: u16 {
        /// Position is known
        const RESOLVED = 1 << 0;

        /// Jump target (or exception handler), so it may need a stack map frame
        const TARGET = 1 << 1;

        /// Reachable jump target: a frame will be emitted for it
        const STORE = 1 << 2;

        /// Reached by the frame fixpoint
        const REACHABLE = 1 << 3;

        /// Already pushed during the stack size walk
        const PUSHED = 1 << 4;

        /// Block ends in a `jsr`
        const JSR = 1 << 5;

        /// Block ends in a `ret`
        const RET = 1 << 6;

        /// Start of a subroutine
        const SUBROUTINE = 1 << 7;

        /// Block belongs to at least one subroutine (or the main code)
        const VISITED = 1 << 8;

        /// Seen during the walk linking `ret` blocks to one `jsr`
        const VISITED2 = 1 << 9;

        /// Currently in the frame fixpoint worklist
        const CHANGED = 1 << 10;
    }
}

/// Site where the offset to a label must be written once the label is placed
#[derive(Copy, Clone, Debug)]
pub(crate) struct ForwardRef {
    /// Position of the opcode the offset is relative to
    pub source: u32,

    /// Position of the offset bytes
    pub reference: u32,

    /// Whether 4 bytes were reserved (otherwise 2)
    pub wide: bool,
}

/// What an edge between two blocks carries
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum EdgeInfo {
    /// Sizing: stack height at the jump, relative to the height on entry of the source block
    Stack(i32),

    /// Sizing: exception handler entry (the handler starts with exactly one stack item)
    Exception,

    /// Sizing: the `jsr` edge into a subroutine, with the relative height after the push
    JsrTarget(i32),

    /// Sizing: the fall through edge after a `jsr`, to where the subroutine returns
    JsrReturnSite(i32),

    /// Frames: ordinary control flow
    Normal,

    /// Frames: exception handler entry, catching this class
    Catch(TypeIndex),
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Edge {
    pub info: EdgeInfo,
    pub successor: Label,
}

/// Everything known about a label
///
/// Labels which head a basic block also carry the block's successor edges and (when frames are
/// being computed) the block's frame. Consecutive labels at the same position are collapsed: all
/// but the first point to that first one through `canonical`.
#[derive(Default)]
pub(crate) struct LabelData {
    pub flags: LabelFlags,
    pub position: u32,
    pub forward_refs: Vec<ForwardRef>,

    /// Label heading the block this label was collapsed into
    pub canonical: Option<Label>,

    /// Next block, in code order
    pub next_block: Option<Label>,

    pub edges: Vec<Edge>,

    /// Stack height on entry (sizing) or, at a `ret`, the relative height there
    pub input_stack_top: i32,

    /// Highest stack height inside the block, relative to the height on entry
    pub output_stack_max: i32,

    pub frame: Option<Box<Frame>>,

    /// Bitset of the subroutines the block belongs to (bit 0 is the main code)
    pub subroutines: Vec<u64>,
}

impl LabelData {
    pub fn is_resolved(&self) -> bool {
        self.flags.contains(LabelFlags::RESOLVED)
    }

    pub fn in_subroutine(&self, id: usize) -> bool {
        self.subroutines
            .get(id / 64)
            .map_or(false, |word| word & (1 << (id % 64)) != 0)
    }

    pub fn add_to_subroutine(&mut self, id: usize) {
        if self.subroutines.len() <= id / 64 {
            self.subroutines.resize(id / 64 + 1, 0);
        }
        self.subroutines[id / 64] |= 1 << (id % 64);
        self.flags.insert(LabelFlags::VISITED);
    }

    pub fn shares_subroutine_with(&self, other: &LabelData) -> bool {
        self.subroutines
            .iter()
            .zip(other.subroutines.iter())
            .any(|(word1, word2)| word1 & word2 != 0)
    }
}

/// Encoding an offset that does not fit its reserved 16 bits is deferred to the resizer
pub(crate) fn fits_in_short(offset: i64) -> bool {
    i16::MIN as i64 <= offset && offset <= i16::MAX as i64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subroutine_bitsets() {
        let mut block1 = LabelData::default();
        let mut block2 = LabelData::default();
        block1.add_to_subroutine(0);
        block1.add_to_subroutine(70);
        block2.add_to_subroutine(3);
        assert!(block1.in_subroutine(70));
        assert!(!block1.in_subroutine(3));
        assert!(!block1.shares_subroutine_with(&block2));
        block2.add_to_subroutine(70);
        assert!(block1.shares_subroutine_with(&block2));
        assert!(block2.flags.contains(LabelFlags::VISITED));
    }

    #[test]
    fn short_offsets() {
        assert!(fits_in_short(32767));
        assert!(fits_in_short(-32768));
        assert!(!fits_in_short(32768));
        assert!(!fits_in_short(-32769));
    }
}
