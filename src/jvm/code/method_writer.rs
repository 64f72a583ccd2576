use crate::jvm::class_file::{
    Attribute, Code, ConstantPool, ExceptionHandler, Exceptions, Handle,
    LineNumber, LineNumberTable, LoadableConstant, LocalVariable, LocalVariableTable,
    LocalVariableTypeTable, Method, Signature, StackMapFrame, StackMapTable, VerificationType,
};
use crate::jvm::code::frame::{frame_verification_types, Frame, Operand, TypeContext};
use crate::jvm::code::label::{fits_in_short, Edge, EdgeInfo, ForwardRef, LabelData, LabelFlags};
use crate::jvm::code::stack_map::StackMapBuilder;
use crate::jvm::code::{code_reader, handler, jump_encoding, Handler, Label};
use crate::jvm::hierarchy::WithClass;
use crate::jvm::opcodes::*;
use crate::jvm::{
    Error, FieldType, MethodAccessFlags, MethodDescriptor, MethodVisitor, ParseDescriptor,
    Version,
};
use crate::util::Width;

/// How much of `max_stack`, `max_locals`, and the stack map frames gets computed
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Compute {
    /// Everything is taken from the caller, verbatim
    AsGiven,

    /// `max_stack` and `max_locals` are computed, frames are taken from the caller
    MaxStackAndLocals,

    /// Everything is computed (frames through type inference, which rejects `jsr`/`ret`)
    Frames,
}

/// Verification type in a frame supplied by the caller
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FrameItem {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,

    /// Internal name of a class, or descriptor of an array type
    Object(String),

    /// Object created by the `new` instruction placed at the label
    Uninitialized(Label),
}

impl Width for FrameItem {
    fn width(&self) -> usize {
        match self {
            FrameItem::Long | FrameItem::Double => 2,
            _ => 1,
        }
    }
}

/// Stack map frame supplied by the caller, relative to the previous one
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ExplicitFrame {
    /// Same locals, empty stack
    Same,

    /// Same locals, one item on the stack
    Same1(FrameItem),

    /// Up to three extra locals, empty stack
    Append(Vec<FrameItem>),

    /// Up to three fewer locals, empty stack
    Chop(u8),

    Full {
        locals: Vec<FrameItem>,
        stack: Vec<FrameItem>,
    },
}

/// Everything about the class a method writer needs to share with other method writers
pub(crate) struct ClassContext<'a> {
    pub pool: &'a mut ConstantPool,
    pub hierarchy: WithClass<'a>,
    pub this_class: &'a str,
    pub version: Version,

    /// Where the method ends up once it is complete
    pub methods: &'a mut Vec<Method>,
}

/// Header of a method
#[derive(Clone, Debug)]
pub(crate) struct MethodDeclaration {
    pub access_flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub exceptions: Vec<String>,
}

/// Entry for the local variable tables
#[derive(Clone, Debug)]
pub(crate) struct LocalVariableRange<L> {
    pub start: L,
    pub end: L,
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub index: u16,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Declared,
    CodeOpen,
    Sealed,
    Ended,
}

impl State {
    fn describe(self) -> &'static str {
        match self {
            State::Declared => "before `visit_code`",
            State::CodeOpen => "while code is being written",
            State::Sealed => "after `visit_maxs`",
            State::Ended => "after `visit_end`",
        }
    }
}

/// Writes one method, from its declaration to its `method_info` structure
///
/// Instructions are encoded as soon as they arrive. Jumps to labels that are not placed yet get
/// their offset patched in when the label is placed. Depending on [`Compute`], the writer also
/// splits the code into basic blocks as it goes:
///
///   - for sizing, each block tracks how high the stack gets relative to its entry, and every
///     edge out of it the relative height at the jump. A walk over the graph on `visit_maxs` then
///     turns those into absolute heights.
///
///   - for frames, each block interprets its instructions into a [`Frame`]. A fixpoint over the
///     graph on `visit_maxs` finds the input frame of every block, and frames are stored for the
///     blocks that the verifier needs them for. Unreachable blocks are replaced with
///     `nop* athrow` since the verifier cannot type them.
///
/// Jumps whose offsets overflowed are widened on `visit_end`. Since that moves code around and
/// invalidates frames, a method with frames is then written again in full from its own widened
/// code.
pub struct MethodWriter<'a> {
    class: ClassContext<'a>,
    compute: Compute,
    declaration: MethodDeclaration,
    parsed_descriptor: MethodDescriptor,
    state: State,

    code: Vec<u8>,
    labels: Vec<LabelData>,

    /// Entry block (absent when nothing is computed)
    entry: Option<Label>,

    /// Block the next instruction belongs to (`None` after an unconditional jump or exit)
    current_block: Option<Label>,

    /// Last block in code order
    previous_block: Option<Label>,

    /// Stack height relative to the entry of the current block (sizing only)
    stack_size: i32,

    /// Highest `stack_size` in the current block (sizing only)
    max_stack_size: i32,

    subroutine_count: usize,

    max_stack: usize,
    max_locals: usize,

    handlers: Vec<Handler<Label>>,
    line_numbers: Vec<(Label, u16)>,
    local_variables: Vec<LocalVariableRange<Label>>,

    /// Frames computed or supplied so far
    stack_map: Option<StackMapBuilder>,

    /// Locals of the last frame supplied by the caller
    caller_locals: Vec<FrameItem>,

    /// Some 16-bit jump offset overflowed
    needs_resize: bool,

    /// Whether widening jumps may trigger writing the method again (off for that second write)
    allow_restart: bool,
}

impl<'a> MethodWriter<'a> {
    pub(crate) fn new(
        class: ClassContext<'a>,
        compute: Compute,
        declaration: MethodDeclaration,
    ) -> Result<MethodWriter<'a>, Error> {
        let parsed_descriptor = MethodDescriptor::parse_descriptor(&declaration.descriptor)?;
        class.pool.utf8(&declaration.name)?;
        class.pool.utf8(&declaration.descriptor)?;
        for exception in &declaration.exceptions {
            class.pool.class(exception)?;
        }

        let is_static = declaration
            .access_flags
            .contains(MethodAccessFlags::STATIC);
        let max_locals = if compute == Compute::AsGiven {
            0
        } else {
            parsed_descriptor.parameter_length(!is_static)
        };

        Ok(MethodWriter {
            class,
            compute,
            declaration,
            parsed_descriptor,
            state: State::Declared,
            code: vec![],
            labels: vec![],
            entry: None,
            current_block: None,
            previous_block: None,
            stack_size: 0,
            max_stack_size: 0,
            subroutine_count: 0,
            max_stack: 0,
            max_locals,
            handlers: vec![],
            line_numbers: vec![],
            local_variables: vec![],
            stack_map: None,
            caller_locals: vec![],
            needs_resize: false,
            allow_restart: true,
        })
    }

    fn require(&self, state: State, event: &'static str) -> Result<(), Error> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidState {
                event,
                state: self.state.describe(),
            })
        }
    }

    fn check_label(&self, label: Label) -> Result<(), Error> {
        if label.index() < self.labels.len() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "label {:?} was not made by this method",
                label
            )))
        }
    }

    /// Block a label was collapsed into (or the label itself)
    fn first(&self, label: Label) -> Label {
        self.labels[label.index()].canonical.unwrap_or(label)
    }

    fn add_successor(&mut self, info: EdgeInfo, successor: Label) {
        if let Some(current) = self.current_block {
            self.labels[current.index()]
                .edges
                .push(Edge { info, successor });
        }
    }

    /// Run an instruction through the frame of the current block (frames only)
    fn execute(&mut self, opcode: u8, arg: u32, operand: Operand<'_>) -> Result<(), Error> {
        if self.compute != Compute::Frames {
            return Ok(());
        }
        if let Some(current) = self.current_block {
            if let Some(frame) = self.labels[current.index()].frame.as_deref_mut() {
                frame.execute(opcode, arg, operand, self.class.pool)?;
            }
        }
        Ok(())
    }

    /// Track the stack height in the current block (sizing only)
    fn grow_stack(&mut self, delta: i32) {
        if self.compute == Compute::MaxStackAndLocals && self.current_block.is_some() {
            let size = self.stack_size + delta;
            self.max_stack_size = self.max_stack_size.max(size);
            self.stack_size = size;
        }
    }

    fn use_locals(&mut self, count: usize) {
        if self.compute != Compute::AsGiven {
            self.max_locals = self.max_locals.max(count);
        }
    }

    fn put_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn put_opcode_u16(&mut self, opcode: u8, value: u16) {
        self.code.push(opcode);
        self.put_u16(value);
    }

    /// Write the offset from `source` to `label`, or reserve space for it if `label` is not placed
    fn put_reference(&mut self, label: Label, source: u32, wide: bool) {
        let reference = self.code.len() as u32;
        let data = &mut self.labels[label.index()];
        if data.is_resolved() {
            let offset = data.position as i64 - source as i64;
            if wide {
                self.put_i32(offset as i32);
            } else {
                self.put_u16(offset as i16 as u16);
            }
        } else {
            data.forward_refs.push(ForwardRef {
                source,
                reference,
                wide,
            });
            if wide {
                self.put_i32(-1);
            } else {
                self.put_u16(u16::MAX);
            }
        }
    }

    /// Fix the position of a label and patch every offset waiting on it
    fn resolve(&mut self, label: Label) -> Result<(), Error> {
        let position = self.code.len() as u32;
        let data = &mut self.labels[label.index()];
        if data.is_resolved() {
            return Err(Error::LabelPlacedTwice(label));
        }
        data.flags.insert(LabelFlags::RESOLVED);
        data.position = position;

        for forward_ref in std::mem::take(&mut data.forward_refs) {
            let offset = position as i64 - forward_ref.source as i64;
            let reference = forward_ref.reference as usize;
            if forward_ref.wide {
                crate::jvm::write_i32_at(&mut self.code, reference, offset as i32);
            } else {
                if !fits_in_short(offset) {
                    let opcode = self.code[reference - 1];
                    self.code[reference - 1] = oversized_marker(opcode);
                    self.needs_resize = true;
                }
                crate::jvm::write_u16_at(&mut self.code, reference, offset as u16);
            }
        }
        Ok(())
    }

    /// End the current block without a fall through successor
    fn no_successor(&mut self) -> Result<(), Error> {
        match self.compute {
            Compute::Frames => {
                let label = self.new_label();
                self.resolve(label)?;
                self.labels[label.index()].frame = Some(Box::default());
                if let Some(previous) = self.previous_block {
                    self.labels[previous.index()].next_block = Some(label);
                }
                self.previous_block = Some(label);
            }
            Compute::MaxStackAndLocals => {
                if let Some(current) = self.current_block {
                    self.labels[current.index()].output_stack_max = self.max_stack_size;
                }
            }
            Compute::AsGiven => (),
        }
        self.current_block = None;
        Ok(())
    }

    fn verification_type(&mut self, item: &FrameItem) -> Result<VerificationType, Error> {
        Ok(match item {
            FrameItem::Top => VerificationType::Top,
            FrameItem::Integer => VerificationType::Integer,
            FrameItem::Float => VerificationType::Float,
            FrameItem::Long => VerificationType::Long,
            FrameItem::Double => VerificationType::Double,
            FrameItem::Null => VerificationType::Null,
            FrameItem::UninitializedThis => VerificationType::UninitializedThis,
            FrameItem::Object(class) => VerificationType::Object(self.class.pool.class(class)?),
            FrameItem::Uninitialized(label) => {
                self.check_label(*label)?;
                let data = &self.labels[label.index()];
                if !data.is_resolved() {
                    return Err(Error::UnresolvedLabel(*label));
                }
                VerificationType::Uninitialized(data.position as u16)
            }
        })
    }

    fn verification_types(&mut self, items: &[FrameItem]) -> Result<Vec<VerificationType>, Error> {
        items
            .iter()
            .map(|item| self.verification_type(item))
            .collect()
    }

    /// Blocks in code order
    fn blocks(&self) -> Vec<Label> {
        let mut blocks = vec![];
        let mut cursor = self.entry;
        while let Some(block) = cursor {
            blocks.push(block);
            cursor = self.labels[block.index()].next_block;
        }
        blocks
    }

    fn check_resolved(&self, label: Label) -> Result<(), Error> {
        if self.labels[label.index()].is_resolved() {
            Ok(())
        } else {
            Err(Error::UnresolvedLabel(label))
        }
    }

    /// Compute `max_stack` from the relative stack heights of blocks and edges
    fn compute_max_stack(&mut self) -> Result<(), Error> {
        let entry = match self.entry {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if let Some(current) = self.current_block {
            self.labels[current.index()].output_stack_max = self.max_stack_size;
        }

        // Every block in a protected range may jump to the handler
        let handlers = self.handlers.clone();
        for handler in &handlers {
            let mut cursor = Some(handler.start);
            while let Some(block) = cursor {
                if block == handler.end {
                    break;
                }
                let data = &mut self.labels[block.index()];
                data.edges.push(Edge {
                    info: EdgeInfo::Exception,
                    successor: handler.handler,
                });
                cursor = data.next_block;
            }
        }

        if self.subroutine_count > 0 {
            self.link_subroutines(entry);
        }

        let entry_data = &mut self.labels[entry.index()];
        entry_data.input_stack_top = 0;
        entry_data.flags.insert(LabelFlags::PUSHED);
        let mut to_visit = vec![entry];
        let mut max = 0;
        while let Some(block) = to_visit.pop() {
            let data = &self.labels[block.index()];
            let start = data.input_stack_top;
            max = max.max(start + data.output_stack_max);

            for edge in data.edges.clone() {
                let input = match edge.info {
                    EdgeInfo::JsrReturnSite(_) => continue,
                    EdgeInfo::Exception => 1,
                    EdgeInfo::Stack(height) | EdgeInfo::JsrTarget(height) => start + height,
                    EdgeInfo::Normal | EdgeInfo::Catch(_) => start,
                };
                let successor = &mut self.labels[edge.successor.index()];
                if !successor.flags.contains(LabelFlags::PUSHED) {
                    successor.input_stack_top = input;
                    successor.flags.insert(LabelFlags::PUSHED);
                    to_visit.push(edge.successor);
                }
            }
        }
        self.max_stack = max.max(0) as usize;
        Ok(())
    }

    fn jsr_target(&self, block: Label) -> Option<Label> {
        self.labels[block.index()]
            .edges
            .iter()
            .find(|edge| matches!(edge.info, EdgeInfo::JsrTarget(_)))
            .map(|edge| edge.successor)
    }

    fn jsr_return_site(&self, block: Label) -> Option<Label> {
        self.labels[block.index()]
            .edges
            .iter()
            .find(|edge| matches!(edge.info, EdgeInfo::JsrReturnSite(_)))
            .map(|edge| edge.successor)
    }

    /// Find which blocks belong to which subroutine, then connect every `ret` to the return sites
    /// of the `jsr`s calling into its subroutine
    fn link_subroutines(&mut self, entry: Label) {
        let blocks = self.blocks();

        self.mark_subroutine(entry, 0);
        let mut id = 0;
        for &block in &blocks {
            if !self.labels[block.index()].flags.contains(LabelFlags::JSR) {
                continue;
            }
            if let Some(target) = self.jsr_target(block) {
                if !self.labels[target.index()].flags.contains(LabelFlags::VISITED) {
                    id += 1;
                    self.mark_subroutine(target, id);
                }
            }
        }
        log::trace!("Found {} subroutines", id);

        for &block in &blocks {
            if !self.labels[block.index()].flags.contains(LabelFlags::JSR) {
                continue;
            }
            for &other in &blocks {
                self.labels[other.index()]
                    .flags
                    .remove(LabelFlags::VISITED2);
            }
            if let (Some(target), Some(return_site)) =
                (self.jsr_target(block), self.jsr_return_site(block))
            {
                self.link_returns(block, target, return_site);
            }
        }
    }

    /// Add every block reachable from `start` (without entering other subroutines) to `id`
    fn mark_subroutine(&mut self, start: Label, id: usize) {
        let mut to_visit = vec![start];
        while let Some(block) = to_visit.pop() {
            let data = &mut self.labels[block.index()];
            if data.in_subroutine(id) {
                continue;
            }
            data.add_to_subroutine(id);
            for edge in &data.edges {
                if !matches!(edge.info, EdgeInfo::JsrTarget(_)) {
                    to_visit.push(edge.successor);
                }
            }
        }
    }

    fn link_returns(&mut self, jsr_block: Label, start: Label, return_site: Label) {
        let mut to_visit = vec![start];
        while let Some(block) = to_visit.pop() {
            let data = &self.labels[block.index()];
            if data.flags.contains(LabelFlags::VISITED2) {
                continue;
            }
            let returns_to_caller = data.flags.contains(LabelFlags::RET)
                && !data.shares_subroutine_with(&self.labels[jsr_block.index()]);

            let data = &mut self.labels[block.index()];
            data.flags.insert(LabelFlags::VISITED2);
            if returns_to_caller {
                let height = data.input_stack_top;
                data.edges.push(Edge {
                    info: EdgeInfo::Stack(height),
                    successor: return_site,
                });
            }
            for edge in &data.edges {
                if !matches!(edge.info, EdgeInfo::JsrTarget(_)) {
                    to_visit.push(edge.successor);
                }
            }
        }
    }

    /// Infer the input frame of every block, store the frames the verifier needs, and void
    /// unreachable code
    fn compute_frames(&mut self) -> Result<(), Error> {
        let entry = match self.entry {
            Some(entry) => entry,
            None => return Ok(()),
        };

        // Every block in a protected range may jump to the handler
        for handler in self.handlers.clone() {
            let catch_type = handler
                .catch_type
                .as_deref()
                .unwrap_or("java/lang/Throwable");
            let caught = self.class.pool.add_type(catch_type);
            let handler_block = self.first(handler.handler);
            self.labels[handler_block.index()]
                .flags
                .insert(LabelFlags::TARGET);

            let end = self.first(handler.end);
            let mut cursor = Some(self.first(handler.start));
            while let Some(block) = cursor {
                if block == end {
                    break;
                }
                let data = &mut self.labels[block.index()];
                data.edges.push(Edge {
                    info: EdgeInfo::Catch(caught),
                    successor: handler_block,
                });
                cursor = data.next_block;
            }
        }

        // Input of the entry block comes from the parameters, and is not stored as a frame
        let is_static = self
            .declaration
            .access_flags
            .contains(MethodAccessFlags::STATIC);
        let is_constructor = self.declaration.name == "<init>";
        let missing_frame = || Error::MalformedCode {
            offset: 0,
            reason: String::from("basic block without a frame"),
        };
        let entry_frame = self.labels[entry.index()]
            .frame
            .as_deref_mut()
            .ok_or_else(missing_frame)?;
        entry_frame.init_input(
            self.class.pool,
            self.class.this_class,
            is_static,
            is_constructor,
            &self.parsed_descriptor,
            self.max_locals,
        );
        let initial_locals = match &entry_frame.input {
            Some(input) => frame_verification_types(input, self.class.pool)?.0,
            None => vec![],
        };

        let mut changed = vec![entry];
        self.labels[entry.index()].flags.insert(LabelFlags::CHANGED);
        let mut max = 0;
        let mut iterations = 0;
        while let Some(block) = changed.pop() {
            iterations += 1;
            let data = &mut self.labels[block.index()];
            data.flags.remove(LabelFlags::CHANGED);
            if data.flags.contains(LabelFlags::TARGET) {
                data.flags.insert(LabelFlags::STORE);
            }
            data.flags.insert(LabelFlags::REACHABLE);
            let mut frame: Box<Frame> = data.frame.take().ok_or_else(missing_frame)?;
            let input_height = frame.input.as_ref().map_or(0, |input| input.stack.len());
            max = max.max(input_height as i32 + frame.output_stack_max);

            for edge in data.edges.clone() {
                let successor = self.first(edge.successor);
                let position = self.labels[successor.index()].position;
                let mut context = TypeContext {
                    pool: &mut *self.class.pool,
                    hierarchy: &self.class.hierarchy,
                    this_class: self.class.this_class,
                };
                let did_change = if successor == block {
                    let mut input = frame.input.clone();
                    let did_change = frame.merge(&mut input, edge.info, position, &mut context)?;
                    frame.input = input;
                    did_change
                } else {
                    let successor_frame = self.labels[successor.index()]
                        .frame
                        .as_deref_mut()
                        .ok_or_else(missing_frame)?;
                    frame.merge(
                        &mut successor_frame.input,
                        edge.info,
                        position,
                        &mut context,
                    )?
                };

                let successor_data = &mut self.labels[successor.index()];
                if did_change && !successor_data.flags.contains(LabelFlags::CHANGED) {
                    successor_data.flags.insert(LabelFlags::CHANGED);
                    changed.push(successor);
                }
            }
            self.labels[block.index()].frame = Some(frame);
        }
        log::debug!(
            "Frames of `{}{}` converged after {} block visits",
            self.declaration.name,
            self.declaration.descriptor,
            iterations
        );

        let mut stack_map = StackMapBuilder::new(initial_locals);
        let blocks = self.blocks();
        for (idx, &block) in blocks.iter().enumerate() {
            let next = blocks.get(idx + 1).copied();
            let data = &self.labels[block.index()];
            let start = data.position;

            if data.flags.contains(LabelFlags::STORE) {
                let input = data
                    .frame
                    .as_ref()
                    .and_then(|frame| frame.input.as_ref())
                    .ok_or_else(missing_frame)?;
                let (locals, stack) = frame_verification_types(input, self.class.pool)?;
                stack_map.push_expanded(start, locals, stack)?;
            }

            if !data.flags.contains(LabelFlags::REACHABLE) {
                let end = next.map_or(self.code.len() as u32, |next| {
                    self.labels[next.index()].position
                });
                if end > start {
                    log::trace!("Voiding unreachable code at [{}, {})", start, end);
                    max = max.max(1);
                    let (start_idx, end_idx) = (start as usize, end as usize);
                    for byte in &mut self.code[start_idx..end_idx - 1] {
                        *byte = NOP;
                    }
                    self.code[end_idx - 1] = ATHROW;
                    let throwable = self.class.pool.class("java/lang/Throwable")?;
                    stack_map.push_expanded(
                        start,
                        vec![],
                        vec![VerificationType::Object(throwable)],
                    )?;

                    let labels = &self.labels;
                    let handlers = std::mem::take(&mut self.handlers);
                    self.handlers = handler::remove(handlers, block, next, |label| {
                        labels[label.index()].position
                    });
                }
            }
        }

        self.max_stack = max as usize;
        self.stack_map = Some(stack_map);
        Ok(())
    }

    /// Widen overflowing jumps, and shift every position in the method to match
    fn widen_jumps(&mut self) -> Result<(), Error> {
        self.check_code_length()?;
        let resized = jump_encoding::widen_oversized_jumps(&self.code)?;
        for data in &mut self.labels {
            if data.is_resolved() {
                data.position = resized.insertions.new_position(data.position);
            }
        }
        self.code = resized.code;
        self.needs_resize = false;
        log::debug!(
            "Widened jumps in `{}{}`",
            self.declaration.name,
            self.declaration.descriptor
        );
        self.check_code_length()
    }

    fn check_code_length(&self) -> Result<(), Error> {
        if self.code.len() > u16::MAX as usize {
            Err(Error::MethodCodeOverflow {
                method: format!("{}{}", self.declaration.name, self.declaration.descriptor),
                length: self.code.len(),
            })
        } else {
            Ok(())
        }
    }

    fn label_position(&self, label: Label) -> Result<u32, Error> {
        let data = &self.labels[label.index()];
        if data.is_resolved() {
            Ok(data.position)
        } else {
            Err(Error::UnresolvedLabel(label))
        }
    }

    /// Write the method again, in frame computation mode, from its own (widened) code
    fn rederive(&mut self) -> Result<(), Error> {
        let handlers = self
            .handlers
            .iter()
            .map(|handler| {
                Ok(Handler {
                    start: self.label_position(handler.start)?,
                    end: self.label_position(handler.end)?,
                    handler: self.label_position(handler.handler)?,
                    catch_type: handler.catch_type.clone(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let line_numbers = self
            .line_numbers
            .iter()
            .map(|(label, line)| Ok((self.label_position(*label)?, *line)))
            .collect::<Result<Vec<_>, Error>>()?;
        let local_variables = self
            .local_variables
            .iter()
            .map(|local| {
                Ok(LocalVariableRange {
                    start: self.label_position(local.start)?,
                    end: self.label_position(local.end)?,
                    name: local.name.clone(),
                    descriptor: local.descriptor.clone(),
                    signature: local.signature.clone(),
                    index: local.index,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let instructions = code_reader::decode(&self.code, self.class.pool)?;

        let mut rewritten = vec![];
        let mut writer = MethodWriter::new(
            ClassContext {
                pool: &mut *self.class.pool,
                hierarchy: self.class.hierarchy,
                this_class: self.class.this_class,
                version: self.class.version,
                methods: &mut rewritten,
            },
            Compute::Frames,
            self.declaration.clone(),
        )?;
        writer.allow_restart = false;
        code_reader::replay(
            &instructions,
            self.code.len() as u32,
            &handlers,
            &line_numbers,
            &local_variables,
            &mut writer,
        )?;
        writer.visit_maxs(0, 0)?;
        writer.visit_end()?;
        self.class.methods.append(&mut rewritten);
        Ok(())
    }

    fn code_attribute(&mut self) -> Result<Attribute, Error> {
        let method_name = || {
            format!(
                "{}{}",
                self.declaration.name, self.declaration.descriptor
            )
        };
        if self.max_stack > u16::MAX as usize {
            return Err(Error::MethodSlotsOverflow {
                method: method_name(),
                what: "stack",
                count: self.max_stack,
            });
        }
        if self.max_locals > u16::MAX as usize {
            return Err(Error::MethodSlotsOverflow {
                method: method_name(),
                what: "local variable",
                count: self.max_locals,
            });
        }

        let mut exception_table = vec![];
        for handler in &self.handlers {
            let catch_type = match &handler.catch_type {
                Some(catch_type) => Some(self.class.pool.class(catch_type)?),
                None => None,
            };
            exception_table.push(ExceptionHandler {
                start_pc: self.label_position(handler.start)? as u16,
                end_pc: self.label_position(handler.end)? as u16,
                handler_pc: self.label_position(handler.handler)? as u16,
                catch_type,
            });
        }

        let mut attributes = vec![];
        if !self.local_variables.is_empty() {
            let mut variables = vec![];
            let mut variable_types = vec![];
            for local in &self.local_variables {
                let start = self.label_position(local.start)?;
                let end = self.label_position(local.end)?;
                let mut row = LocalVariable {
                    start_pc: start as u16,
                    length: end.saturating_sub(start) as u16,
                    name_index: self.class.pool.utf8(&local.name)?,
                    descriptor_index: self.class.pool.utf8(&local.descriptor)?,
                    index: local.index,
                };
                variables.push(row);
                if let Some(signature) = &local.signature {
                    row.descriptor_index = self.class.pool.utf8(signature)?;
                    variable_types.push(row);
                }
            }
            attributes.push(self.class.pool.get_attribute(LocalVariableTable(variables))?);
            if !variable_types.is_empty() {
                let table = LocalVariableTypeTable(variable_types);
                attributes.push(self.class.pool.get_attribute(table)?);
            }
        }
        if !self.line_numbers.is_empty() {
            let lines = self
                .line_numbers
                .iter()
                .map(|(label, line)| {
                    Ok(LineNumber {
                        start_pc: self.label_position(*label)? as u16,
                        line_number: *line,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            attributes.push(self.class.pool.get_attribute(LineNumberTable(lines))?);
        }
        if let Some(stack_map) = self.stack_map.take() {
            if self.class.version < Version::JAVA6 {
                log::debug!(
                    "Dropping {} frames of `{}`: class version predates StackMapTable",
                    stack_map.len(),
                    method_name()
                );
            } else if !stack_map.is_empty() {
                let table = StackMapTable(stack_map.finish());
                attributes.push(self.class.pool.get_attribute(table)?);
            }
        }

        let code = Code {
            max_stack: self.max_stack as u16,
            max_locals: self.max_locals as u16,
            code: std::mem::take(&mut self.code),
            exception_table,
            attributes,
        };
        self.class.pool.get_attribute(code)
    }

    fn method_info(&mut self, has_code: bool) -> Result<Method, Error> {
        let mut attributes = vec![];
        if has_code {
            attributes.push(self.code_attribute()?);
        }
        if !self.declaration.exceptions.is_empty() {
            let exceptions = self
                .declaration
                .exceptions
                .iter()
                .map(|exception| self.class.pool.class(exception))
                .collect::<Result<Vec<_>, Error>>()?;
            attributes.push(self.class.pool.get_attribute(Exceptions(exceptions))?);
        }
        if let Some(signature) = &self.declaration.signature {
            let signature = self.class.pool.utf8(signature)?;
            attributes.push(self.class.pool.get_attribute(Signature(signature))?);
        }
        Ok(Method {
            access_flags: self.declaration.access_flags,
            name_index: self.class.pool.utf8(&self.declaration.name)?,
            descriptor_index: self.class.pool.utf8(&self.declaration.descriptor)?,
            attributes,
        })
    }

    /// Fold a label into the block already starting at the same position
    fn collapse_into(&mut self, label: Label, block: Label) {
        let target = self.labels[label.index()].flags & LabelFlags::TARGET;
        self.labels[label.index()].canonical = Some(block);
        self.labels[label.index()].frame = None;
        self.labels[block.index()].flags.insert(target);
    }

    fn visit_switch_targets(&mut self, default: Label, labels: &[Label]) -> Result<(), Error> {
        if self.current_block.is_some() {
            match self.compute {
                Compute::Frames => {
                    self.execute(LOOKUPSWITCH, 0, Operand::None)?;
                    for &label in std::iter::once(&default).chain(labels) {
                        self.add_successor(EdgeInfo::Normal, label);
                        let first = self.first(label);
                        self.labels[first.index()].flags.insert(LabelFlags::TARGET);
                    }
                }
                Compute::MaxStackAndLocals => {
                    self.stack_size -= 1;
                    let height = self.stack_size;
                    for &label in std::iter::once(&default).chain(labels) {
                        self.add_successor(EdgeInfo::Stack(height), label);
                    }
                }
                Compute::AsGiven => (),
            }
            self.no_successor()?;
        }
        Ok(())
    }

    fn pad_switch(&mut self) {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
    }
}

impl<'a> MethodVisitor for MethodWriter<'a> {
    fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelData::default());
        label
    }

    fn visit_code(&mut self) -> Result<(), Error> {
        self.require(State::Declared, "visit_code")?;
        self.state = State::CodeOpen;
        if self.compute != Compute::AsGiven {
            let entry = self.new_label();
            self.entry = Some(entry);
            self.visit_label(entry)?;
        }
        Ok(())
    }

    fn visit_frame(&mut self, frame: ExplicitFrame) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_frame")?;
        let offset = self.code.len() as u32;
        if self.compute == Compute::Frames {
            log::warn!(
                "Ignoring frame supplied at offset {} of `{}`: frames are being computed",
                offset,
                self.declaration.name
            );
            return Ok(());
        }

        let compressed = match frame {
            ExplicitFrame::Same => StackMapFrame::SameLocalsNoStack { offset_delta: 0 },
            ExplicitFrame::Same1(item) => StackMapFrame::SameLocalsOneStack {
                offset_delta: 0,
                stack: self.verification_type(&item)?,
            },
            ExplicitFrame::Append(items) => {
                if items.is_empty() || items.len() > 3 {
                    return Err(Error::InvalidArgument(format!(
                        "append frame with {} locals",
                        items.len()
                    )));
                }
                let locals = self.verification_types(&items)?;
                self.caller_locals.extend(items);
                StackMapFrame::AppendLocalsNoStack {
                    offset_delta: 0,
                    locals,
                }
            }
            ExplicitFrame::Chop(chopped_k) => {
                if chopped_k == 0 || chopped_k > 3 {
                    return Err(Error::InvalidArgument(format!(
                        "chop frame removing {} locals",
                        chopped_k
                    )));
                }
                let kept = self.caller_locals.len().saturating_sub(chopped_k as usize);
                self.caller_locals.truncate(kept);
                StackMapFrame::ChopLocalsNoStack {
                    offset_delta: 0,
                    chopped_k,
                }
            }
            ExplicitFrame::Full { locals, stack } => {
                let locals_types = self.verification_types(&locals)?;
                let stack_types = self.verification_types(&stack)?;
                self.caller_locals = locals;
                StackMapFrame::Full {
                    offset_delta: 0,
                    locals: locals_types,
                    stack: stack_types,
                }
            }
        };

        let local_slots = self.caller_locals.iter().map(Width::width).sum();
        self.use_locals(local_slots);
        self.stack_map
            .get_or_insert_with(|| StackMapBuilder::new(vec![]))
            .push_compressed(offset, compressed)
    }

    fn visit_insn(&mut self, opcode: u8) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_insn")?;
        if SHAPES[opcode as usize] != InsnShape::NoArg {
            return Err(Error::InvalidOpcode {
                opcode,
                event: "visit_insn",
            });
        }
        let position = self.code.len() as u32;
        self.execute(opcode, position, Operand::None)?;
        self.grow_stack(STACK_DELTAS[opcode as usize] as i32);
        self.code.push(opcode);
        if is_exit(opcode) && self.current_block.is_some() {
            self.no_successor()?;
        }
        Ok(())
    }

    fn visit_int_insn(&mut self, opcode: u8, operand: i32) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_int_insn")?;
        let in_range = match opcode {
            BIPUSH => i8::MIN as i32 <= operand && operand <= i8::MAX as i32,
            SIPUSH => i16::MIN as i32 <= operand && operand <= i16::MAX as i32,
            NEWARRAY => (4..=11).contains(&operand),
            _ => {
                return Err(Error::InvalidOpcode {
                    opcode,
                    event: "visit_int_insn",
                })
            }
        };
        if !in_range {
            return Err(Error::InvalidArgument(format!(
                "operand {} out of range for `{}`",
                operand,
                mnemonic(opcode)
            )));
        }

        self.execute(opcode, operand as u32, Operand::None)?;
        if opcode != NEWARRAY {
            self.grow_stack(1);
        }
        if opcode == SIPUSH {
            self.put_opcode_u16(opcode, operand as i16 as u16);
        } else {
            self.code.push(opcode);
            self.code.push(operand as u8);
        }
        Ok(())
    }

    fn visit_var_insn(&mut self, opcode: u8, var: u16) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_var_insn")?;
        if !matches!(opcode, ILOAD..=ALOAD | ISTORE..=ASTORE | RET) {
            return Err(Error::InvalidOpcode {
                opcode,
                event: "visit_var_insn",
            });
        }

        // Rejected even in dead code
        if opcode == RET && self.compute == Compute::Frames {
            return Err(Error::UnsupportedSubroutine {
                opcode: "ret",
                offset: self.code.len(),
            });
        }
        if let Some(current) = self.current_block {
            match self.compute {
                Compute::Frames => self.execute(opcode, var as u32, Operand::None)?,
                Compute::MaxStackAndLocals if opcode == RET => {
                    let data = &mut self.labels[current.index()];
                    data.flags.insert(LabelFlags::RET);
                    data.input_stack_top = self.stack_size;
                    self.no_successor()?;
                }
                Compute::MaxStackAndLocals => self.grow_stack(STACK_DELTAS[opcode as usize] as i32),
                Compute::AsGiven => (),
            }
        }
        let wide_value = matches!(opcode, LLOAD | DLOAD | LSTORE | DSTORE);
        self.use_locals(var as usize + if wide_value { 2 } else { 1 });

        if var < 4 && opcode != RET {
            let short_form = if opcode < ISTORE {
                ILOAD_0 + ((opcode - ILOAD) << 2) + var as u8
            } else {
                ISTORE_0 + ((opcode - ISTORE) << 2) + var as u8
            };
            self.code.push(short_form);
        } else if var >= 256 {
            self.code.push(WIDE);
            self.put_opcode_u16(opcode, var);
        } else {
            self.code.push(opcode);
            self.code.push(var as u8);
        }

        // Handlers see locals as they are after each store, so each store starts a block (also
        // before any handler is declared, since one may still cover this code)
        if opcode >= ISTORE && self.compute == Compute::Frames {
            let label = self.new_label();
            self.visit_label(label)?;
        }
        Ok(())
    }

    fn visit_type_insn(&mut self, opcode: u8, class: &str) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_type_insn")?;
        if !matches!(opcode, NEW | ANEWARRAY | CHECKCAST | INSTANCEOF) {
            return Err(Error::InvalidOpcode {
                opcode,
                event: "visit_type_insn",
            });
        }
        let index = self.class.pool.class(class)?;
        let position = self.code.len() as u32;
        self.execute(opcode, position, Operand::Class(class))?;
        self.grow_stack(STACK_DELTAS[opcode as usize] as i32);
        self.put_opcode_u16(opcode, index.0 .0);
        Ok(())
    }

    fn visit_field_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_field_insn")?;
        if !matches!(opcode, GETSTATIC..=PUTFIELD) {
            return Err(Error::InvalidOpcode {
                opcode,
                event: "visit_field_insn",
            });
        }
        let width = FieldType::parse_descriptor(descriptor)?.width() as i32;
        let index = self.class.pool.field_ref(owner, name, descriptor)?;
        let position = self.code.len() as u32;
        self.execute(opcode, position, Operand::Field(descriptor))?;
        let delta = match opcode {
            GETSTATIC => width,
            PUTSTATIC => -width,
            GETFIELD => width - 1,
            _ => -width - 1,
        };
        self.grow_stack(delta);
        self.put_opcode_u16(opcode, index.0 .0);
        Ok(())
    }

    fn visit_method_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_method_insn")?;
        if !matches!(opcode, INVOKEVIRTUAL..=INVOKEINTERFACE) {
            return Err(Error::InvalidOpcode {
                opcode,
                event: "visit_method_insn",
            });
        }
        let parsed = MethodDescriptor::parse_descriptor(descriptor)?;
        let is_interface = is_interface || opcode == INVOKEINTERFACE;
        let index = self
            .class
            .pool
            .method_ref(owner, name, descriptor, is_interface)?;
        let position = self.code.len() as u32;
        self.execute(opcode, position, Operand::Method { name, descriptor })?;
        let popped = parsed.parameter_length(opcode != INVOKESTATIC) as i32;
        self.grow_stack(parsed.return_length() as i32 - popped);

        self.put_opcode_u16(opcode, index.0 .0);
        if opcode == INVOKEINTERFACE {
            self.code.push(parsed.parameter_length(true) as u8);
            self.code.push(0);
        }
        Ok(())
    }

    fn visit_invoke_dynamic_insn(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap: &Handle,
        arguments: &[LoadableConstant],
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_invoke_dynamic_insn")?;
        let parsed = MethodDescriptor::parse_descriptor(descriptor)?;
        let index = self
            .class
            .pool
            .invoke_dynamic(name, descriptor, bootstrap, arguments)?;
        let position = self.code.len() as u32;
        self.execute(INVOKEDYNAMIC, position, Operand::InvokeDynamic(descriptor))?;
        let popped = parsed.parameter_length(false) as i32;
        self.grow_stack(parsed.return_length() as i32 - popped);
        self.put_opcode_u16(INVOKEDYNAMIC, index.0 .0);
        self.put_u16(0);
        Ok(())
    }

    fn visit_jump_insn(&mut self, opcode: u8, label: Label) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_jump_insn")?;
        self.check_label(label)?;
        let (base_opcode, always_wide) = match opcode {
            GOTO_W => (GOTO, true),
            JSR_W => (JSR, true),
            IFEQ..=JSR | IFNULL | IFNONNULL => (opcode, false),
            _ => {
                return Err(Error::InvalidOpcode {
                    opcode,
                    event: "visit_jump_insn",
                })
            }
        };

        if base_opcode == JSR && self.compute == Compute::Frames {
            return Err(Error::UnsupportedSubroutine {
                opcode: mnemonic(opcode),
                offset: self.code.len(),
            });
        }

        let position = self.code.len() as u32;
        let mut next_insn = None;
        if let Some(current) = self.current_block {
            match self.compute {
                Compute::Frames => {
                    self.execute(opcode, position, Operand::None)?;
                    let first = self.first(label);
                    self.labels[first.index()].flags.insert(LabelFlags::TARGET);
                    self.add_successor(EdgeInfo::Normal, label);
                    if base_opcode != GOTO {
                        next_insn = Some(self.new_label());
                    }
                }
                Compute::MaxStackAndLocals if base_opcode == JSR => {
                    let target = &mut self.labels[label.index()];
                    if !target.flags.contains(LabelFlags::SUBROUTINE) {
                        target.flags.insert(LabelFlags::SUBROUTINE);
                        self.subroutine_count += 1;
                    }
                    self.labels[current.index()].flags.insert(LabelFlags::JSR);
                    self.add_successor(EdgeInfo::JsrTarget(self.stack_size + 1), label);
                    next_insn = Some(self.new_label());
                }
                Compute::MaxStackAndLocals => {
                    self.stack_size += STACK_DELTAS[base_opcode as usize] as i32;
                    self.add_successor(EdgeInfo::Stack(self.stack_size), label);
                }
                Compute::AsGiven => (),
            }
        }

        let target = &self.labels[label.index()];
        if always_wide {
            self.code.push(opcode);
            self.put_reference(label, position, true);
        } else if target.is_resolved() && (target.position as i64 - position as i64) < i16::MIN as i64
        {
            if base_opcode == GOTO {
                self.code.push(GOTO_W);
            } else if base_opcode == JSR {
                self.code.push(JSR_W);
            } else {
                // Jump over a `goto_w` when the condition does not hold
                if let Some(next_insn) = next_insn {
                    self.labels[next_insn.index()]
                        .flags
                        .insert(LabelFlags::TARGET);
                }
                self.put_opcode_u16(invert_condition(base_opcode), 8);
                self.code.push(GOTO_W);
            }
            let source = self.code.len() as u32 - 1;
            self.put_reference(label, source, true);
        } else {
            self.code.push(opcode);
            self.put_reference(label, position, false);
        }

        if self.current_block.is_some() {
            if let Some(next_insn) = next_insn {
                self.visit_label(next_insn)?;
            }
            if base_opcode == GOTO {
                self.no_successor()?;
            }
        }
        Ok(())
    }

    fn visit_label(&mut self, label: Label) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_label")?;
        self.check_label(label)?;
        self.resolve(label)?;
        let position = self.code.len() as u32;

        match self.compute {
            Compute::Frames => {
                if let Some(current) = self.current_block {
                    if self.labels[current.index()].position == position {
                        self.collapse_into(label, current);
                        return Ok(());
                    }
                    self.add_successor(EdgeInfo::Normal, label);
                }
                self.current_block = Some(label);
                self.labels[label.index()].frame = Some(Box::default());
                if let Some(previous) = self.previous_block {
                    if self.labels[previous.index()].position == position {
                        self.collapse_into(label, previous);
                        self.current_block = Some(previous);
                        return Ok(());
                    }
                    self.labels[previous.index()].next_block = Some(label);
                }
                self.previous_block = Some(label);
            }
            Compute::MaxStackAndLocals => {
                if let Some(current) = self.current_block {
                    let data = &mut self.labels[current.index()];
                    data.output_stack_max = self.max_stack_size;
                    let info = if data.flags.contains(LabelFlags::JSR) {
                        EdgeInfo::JsrReturnSite(self.stack_size)
                    } else {
                        EdgeInfo::Stack(self.stack_size)
                    };
                    self.add_successor(info, label);
                }
                self.current_block = Some(label);
                self.stack_size = 0;
                self.max_stack_size = 0;
                if let Some(previous) = self.previous_block {
                    self.labels[previous.index()].next_block = Some(label);
                }
                self.previous_block = Some(label);
            }
            Compute::AsGiven => (),
        }
        Ok(())
    }

    fn visit_ldc_insn(&mut self, constant: &LoadableConstant) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_ldc_insn")?;
        let index = self.class.pool.loadable(constant)?;
        let position = self.code.len() as u32;
        self.execute(LDC, position, Operand::Constant(constant))?;
        let is_wide = constant.is_wide();
        self.grow_stack(if is_wide { 2 } else { 1 });
        if is_wide {
            self.put_opcode_u16(LDC2_W, index.0);
        } else if index.0 >= 256 {
            self.put_opcode_u16(LDC_W, index.0);
        } else {
            self.code.push(LDC);
            self.code.push(index.0 as u8);
        }
        Ok(())
    }

    fn visit_iinc_insn(&mut self, var: u16, increment: i16) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_iinc_insn")?;
        self.execute(IINC, var as u32, Operand::None)?;
        self.use_locals(var as usize + 1);
        if var > 255 || increment < i8::MIN as i16 || increment > i8::MAX as i16 {
            self.code.push(WIDE);
            self.put_opcode_u16(IINC, var);
            self.put_u16(increment as u16);
        } else {
            self.code.push(IINC);
            self.code.push(var as u8);
            self.code.push(increment as i8 as u8);
        }
        Ok(())
    }

    fn visit_table_switch_insn(
        &mut self,
        low: i32,
        high: i32,
        default: Label,
        labels: &[Label],
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_table_switch_insn")?;
        if high < low || (high as i64 - low as i64 + 1) != labels.len() as i64 {
            return Err(Error::InvalidArgument(format!(
                "tableswitch from {} to {} with {} labels",
                low,
                high,
                labels.len()
            )));
        }
        self.check_label(default)?;
        for &label in labels {
            self.check_label(label)?;
        }

        let source = self.code.len() as u32;
        self.code.push(TABLESWITCH);
        self.pad_switch();
        self.put_reference(default, source, true);
        self.put_i32(low);
        self.put_i32(high);
        for &label in labels {
            self.put_reference(label, source, true);
        }
        self.visit_switch_targets(default, labels)
    }

    fn visit_lookup_switch_insn(
        &mut self,
        default: Label,
        keys: &[i32],
        labels: &[Label],
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_lookup_switch_insn")?;
        if keys.len() != labels.len() {
            return Err(Error::InvalidArgument(format!(
                "lookupswitch with {} keys but {} labels",
                keys.len(),
                labels.len()
            )));
        }
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::InvalidArgument(String::from(
                "lookupswitch keys must be strictly increasing",
            )));
        }
        self.check_label(default)?;
        for &label in labels {
            self.check_label(label)?;
        }

        let source = self.code.len() as u32;
        self.code.push(LOOKUPSWITCH);
        self.pad_switch();
        self.put_reference(default, source, true);
        self.put_i32(keys.len() as i32);
        for (&key, &label) in keys.iter().zip(labels) {
            self.put_i32(key);
            self.put_reference(label, source, true);
        }
        self.visit_switch_targets(default, labels)
    }

    fn visit_multi_anew_array_insn(
        &mut self,
        descriptor: &str,
        dimensions: u8,
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_multi_anew_array_insn")?;
        if dimensions == 0 {
            return Err(Error::InvalidArgument(String::from(
                "multianewarray needs at least one dimension",
            )));
        }
        let index = self.class.pool.class(descriptor)?;
        self.execute(MULTIANEWARRAY, dimensions as u32, Operand::Class(descriptor))?;
        self.grow_stack(1 - dimensions as i32);
        self.put_opcode_u16(MULTIANEWARRAY, index.0 .0);
        self.code.push(dimensions);
        Ok(())
    }

    fn visit_try_catch_block(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_try_catch_block")?;
        self.check_label(start)?;
        self.check_label(end)?;
        self.check_label(handler)?;
        if let Some(catch_type) = catch_type {
            self.class.pool.class(catch_type)?;
        }
        self.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type: catch_type.map(String::from),
        });
        Ok(())
    }

    fn visit_local_variable(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        start: Label,
        end: Label,
        index: u16,
    ) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_local_variable")?;
        self.check_label(start)?;
        self.check_label(end)?;
        self.class.pool.utf8(name)?;
        self.class.pool.utf8(descriptor)?;
        if let Some(signature) = signature {
            self.class.pool.utf8(signature)?;
        }
        let wide = descriptor.starts_with('J') || descriptor.starts_with('D');
        self.use_locals(index as usize + if wide { 2 } else { 1 });
        self.local_variables.push(LocalVariableRange {
            start,
            end,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            signature: signature.map(String::from),
            index,
        });
        Ok(())
    }

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_line_number")?;
        self.check_label(start)?;
        self.line_numbers.push((start, line));
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<(), Error> {
        self.require(State::CodeOpen, "visit_maxs")?;
        for (idx, data) in self.labels.iter().enumerate() {
            if !data.forward_refs.is_empty() {
                return Err(Error::UnresolvedLabel(Label(idx as u32)));
            }
        }
        for handler in &self.handlers {
            self.check_resolved(handler.start)?;
            self.check_resolved(handler.end)?;
            self.check_resolved(handler.handler)?;
        }

        match self.compute {
            Compute::AsGiven => {
                self.max_stack = max_stack as usize;
                self.max_locals = max_locals as usize;
            }
            Compute::MaxStackAndLocals => self.compute_max_stack()?,
            Compute::Frames => self.compute_frames()?,
        }
        log::trace!(
            "Sealed `{}{}`: {} bytes, max_stack {}, max_locals {}",
            self.declaration.name,
            self.declaration.descriptor,
            self.code.len(),
            self.max_stack,
            self.max_locals
        );
        self.state = State::Sealed;
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        let has_code = match self.state {
            State::Declared => false,
            State::Sealed => true,
            _ => {
                return Err(Error::InvalidState {
                    event: "visit_end",
                    state: self.state.describe(),
                })
            }
        };
        self.state = State::Ended;

        if has_code && self.needs_resize {
            if !self.allow_restart {
                return Err(Error::MalformedCode {
                    offset: 0,
                    reason: String::from("jumps still overflow after frames were re-derived"),
                });
            }
            self.widen_jumps()?;

            let has_frames = self.compute == Compute::Frames
                || self.stack_map.as_ref().map_or(false, |frames| !frames.is_empty());
            if has_frames && self.class.version >= Version::JAVA6 {
                log::debug!(
                    "Frames of `{}{}` invalidated by widened jumps, re-deriving them",
                    self.declaration.name,
                    self.declaration.descriptor
                );
                return self.rederive();
            }
        }
        if has_code {
            self.check_code_length()?;
        }

        let method = self.method_info(has_code)?;
        self.class.methods.push(method);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::{ClassInfo, StaticClassHierarchy};

    struct Fixture {
        pool: ConstantPool,
        hierarchy: StaticClassHierarchy,
        info: ClassInfo,
        methods: Vec<Method>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                pool: ConstantPool::new(),
                hierarchy: StaticClassHierarchy::with_java_lang(),
                info: ClassInfo::class("java/lang/Object", &[]),
                methods: vec![],
            }
        }

        fn writer(
            &mut self,
            compute: Compute,
            access_flags: MethodAccessFlags,
            name: &str,
            descriptor: &str,
        ) -> MethodWriter<'_> {
            let context = ClassContext {
                pool: &mut self.pool,
                hierarchy: WithClass {
                    base: &self.hierarchy,
                    name: "Test",
                    info: &self.info,
                },
                this_class: "Test",
                version: Version::JAVA8,
                methods: &mut self.methods,
            };
            let declaration = MethodDeclaration {
                access_flags,
                name: name.to_owned(),
                descriptor: descriptor.to_owned(),
                signature: None,
                exceptions: vec![],
            };
            MethodWriter::new(context, compute, declaration).unwrap()
        }
    }

    #[test]
    fn sizes_of_straight_line_code() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::MaxStackAndLocals,
            MethodAccessFlags::STATIC,
            "f",
            "(JI)J",
        );
        writer.visit_code().unwrap();
        writer.visit_var_insn(LLOAD, 0).unwrap();
        writer.visit_var_insn(ILOAD, 2).unwrap();
        writer.visit_insn(I2L).unwrap();
        writer.visit_insn(LADD).unwrap();
        writer.visit_insn(LRETURN).unwrap();
        writer.visit_maxs(0, 0).unwrap();
        assert_eq!(writer.max_stack, 4);
        assert_eq!(writer.max_locals, 3);
        assert_eq!(writer.code, vec![30, 28, I2L, LADD, LRETURN]);
    }

    #[test]
    fn sizes_across_branches() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::MaxStackAndLocals,
            MethodAccessFlags::STATIC,
            "f",
            "(I)I",
        );
        let else_branch = writer.new_label();
        let join = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_var_insn(ILOAD, 0).unwrap();
        writer.visit_jump_insn(IFEQ, else_branch).unwrap();
        writer.visit_insn(ICONST_1).unwrap();
        writer.visit_jump_insn(GOTO, join).unwrap();
        writer.visit_label(else_branch).unwrap();
        writer.visit_insn(ICONST_2).unwrap();
        writer.visit_insn(ICONST_3).unwrap();
        writer.visit_insn(IADD).unwrap();
        writer.visit_label(join).unwrap();
        writer.visit_insn(IRETURN).unwrap();
        writer.visit_maxs(0, 0).unwrap();
        assert_eq!(writer.max_stack, 2);
        assert_eq!(writer.max_locals, 1);
    }

    #[test]
    fn sizes_through_subroutines() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::MaxStackAndLocals,
            MethodAccessFlags::STATIC,
            "f",
            "()V",
        );
        let subroutine = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_jump_insn(JSR, subroutine).unwrap();
        writer.visit_insn(RETURN).unwrap();
        writer.visit_label(subroutine).unwrap();
        writer.visit_var_insn(ASTORE, 0).unwrap();
        writer.visit_insn(ICONST_0).unwrap();
        writer.visit_insn(ICONST_0).unwrap();
        writer.visit_insn(POP2).unwrap();
        writer.visit_var_insn(RET, 0).unwrap();
        writer.visit_maxs(0, 0).unwrap();

        // The return address, then two ints on an empty stack
        assert_eq!(writer.max_stack, 2);
        assert_eq!(writer.subroutine_count, 1);

        // The `ret` block flows back to the instruction after the `jsr`
        let ret_block = writer
            .blocks()
            .into_iter()
            .find(|block| writer.labels[block.index()].flags.contains(LabelFlags::RET))
            .unwrap();
        assert!(writer.labels[ret_block.index()]
            .edges
            .iter()
            .any(|edge| matches!(edge.info, EdgeInfo::Stack(_))));
    }

    #[test]
    fn frames_reject_subroutines() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::Frames, MethodAccessFlags::STATIC, "f", "()V");
        let subroutine = writer.new_label();
        writer.visit_code().unwrap();
        assert!(matches!(
            writer.visit_jump_insn(JSR, subroutine),
            Err(Error::UnsupportedSubroutine { opcode: "jsr", offset: 0 })
        ));
    }

    #[test]
    fn frames_reject_subroutines_in_dead_code() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::Frames, MethodAccessFlags::STATIC, "f", "()V");
        let subroutine = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_insn(RETURN).unwrap();
        assert!(matches!(
            writer.visit_jump_insn(JSR_W, subroutine),
            Err(Error::UnsupportedSubroutine { opcode: "jsr_w", offset: 1 })
        ));
        assert!(matches!(
            writer.visit_var_insn(RET, 0),
            Err(Error::UnsupportedSubroutine { opcode: "ret", offset: 1 })
        ));
    }

    #[test]
    fn short_and_wide_local_forms() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::AsGiven, MethodAccessFlags::STATIC, "f", "()V");
        writer.visit_code().unwrap();
        writer.visit_var_insn(ASTORE, 3).unwrap();
        writer.visit_var_insn(DLOAD, 4).unwrap();
        writer.visit_var_insn(ILOAD, 300).unwrap();
        writer.visit_iinc_insn(2, 1).unwrap();
        writer.visit_iinc_insn(2, 1000).unwrap();
        assert_eq!(
            writer.code,
            vec![
                ASTORE_3, DLOAD, 4, WIDE, ILOAD, 1, 44, IINC, 2, 1, WIDE, IINC, 0, 2, 3, 232
            ]
        );
    }

    #[test]
    fn backward_jump_out_of_range_is_widened_up_front() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::MaxStackAndLocals,
            MethodAccessFlags::STATIC,
            "f",
            "(I)V",
        );
        let top = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_label(top).unwrap();
        for _ in 0..40000 {
            writer.visit_insn(NOP).unwrap();
        }
        writer.visit_var_insn(ILOAD, 0).unwrap();
        writer.visit_jump_insn(IFNE, top).unwrap();
        writer.visit_insn(RETURN).unwrap();

        let jump = 40001;
        assert_eq!(&writer.code[jump..jump + 4], &[IFEQ, 0, 8, GOTO_W]);
        assert_eq!(
            crate::jvm::read_i32_at(&writer.code, jump + 4),
            -(jump as i32 + 3)
        );
        assert!(!writer.needs_resize);
    }

    #[test]
    fn dead_code_is_voided() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::Frames, MethodAccessFlags::STATIC, "f", "()I");
        writer.visit_code().unwrap();
        writer.visit_insn(ICONST_0).unwrap();
        writer.visit_insn(IRETURN).unwrap();
        writer.visit_insn(ICONST_1).unwrap();
        writer.visit_insn(ICONST_2).unwrap();
        writer.visit_insn(IRETURN).unwrap();
        writer.visit_maxs(0, 0).unwrap();

        assert_eq!(writer.code, vec![ICONST_0, IRETURN, NOP, NOP, ATHROW]);
        assert_eq!(writer.max_stack, 1);
        let frames = writer.stack_map.take().unwrap().finish();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            StackMapFrame::SameLocalsOneStack {
                offset_delta: 2,
                stack: VerificationType::Object(_)
            }
        ));
    }

    #[test]
    fn stores_split_blocks_under_handlers() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::Frames, MethodAccessFlags::STATIC, "f", "()V");
        let (start, end, handler) = (writer.new_label(), writer.new_label(), writer.new_label());
        writer.visit_code().unwrap();
        writer.visit_try_catch_block(start, end, handler, None).unwrap();
        writer.visit_label(start).unwrap();
        writer.visit_insn(ICONST_0).unwrap();
        writer.visit_var_insn(ISTORE, 0).unwrap();
        writer.visit_insn(FCONST_0).unwrap();
        writer.visit_var_insn(FSTORE, 0).unwrap();
        writer.visit_label(end).unwrap();
        writer.visit_insn(RETURN).unwrap();
        writer.visit_label(handler).unwrap();
        writer.visit_insn(ATHROW).unwrap();
        writer.visit_maxs(0, 0).unwrap();

        // Entry, after each store, and the handler
        assert_eq!(writer.blocks().len(), 5);

        // Local 0 is an int or a float depending on where the exception hit, so it merges to top
        let frames = writer.stack_map.take().unwrap().finish();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            StackMapFrame::SameLocalsOneStack {
                offset_delta: 5,
                stack: VerificationType::Object(_)
            }
        ));
    }

    #[test]
    fn handlers_declared_after_their_code_see_stores() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::Frames,
            MethodAccessFlags::STATIC,
            "f",
            "(Ljava/lang/String;)V",
        );
        let (start, end, handler) = (writer.new_label(), writer.new_label(), writer.new_label());
        writer.visit_code().unwrap();
        writer.visit_label(start).unwrap();
        writer.visit_insn(ICONST_0).unwrap();
        writer.visit_var_insn(ISTORE, 0).unwrap();
        writer.visit_insn(ACONST_NULL).unwrap();
        writer
            .visit_method_insn(INVOKEVIRTUAL, "java/lang/Object", "hashCode", "()I", false)
            .unwrap();
        writer.visit_insn(POP).unwrap();
        writer.visit_label(end).unwrap();
        writer.visit_insn(RETURN).unwrap();
        writer.visit_label(handler).unwrap();
        writer.visit_insn(ATHROW).unwrap();
        writer.visit_try_catch_block(start, end, handler, None).unwrap();
        writer.visit_maxs(0, 0).unwrap();

        // A block starts right after the store, so the handler sees local 0 as an int too
        let positions: Vec<u32> = writer
            .blocks()
            .into_iter()
            .map(|block| writer.labels[block.index()].position)
            .collect();
        assert!(positions.contains(&2), "{:?}", positions);

        // `String` on entry and `int` after the store merge to top, which is dropped
        let frames = writer.stack_map.take().unwrap().finish();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                assert_eq!(*offset_delta, 8);
                assert!(locals.is_empty(), "{:?}", locals);
                assert!(matches!(stack[..], [VerificationType::Object(_)]));
            }
            other => panic!("expected a full frame, got {:?}", other),
        }
    }

    #[test]
    fn caller_frames_are_rebased() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(
            Compute::MaxStackAndLocals,
            MethodAccessFlags::STATIC,
            "f",
            "()V",
        );
        let target = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_jump_insn(GOTO, target).unwrap();
        writer.visit_label(target).unwrap();
        writer
            .visit_frame(ExplicitFrame::Append(vec![FrameItem::Long, FrameItem::Integer]))
            .unwrap();
        writer.visit_frame(ExplicitFrame::Same).unwrap();
        writer.visit_insn(RETURN).unwrap();
        writer.visit_maxs(0, 0).unwrap();

        assert_eq!(writer.max_locals, 3);
        let frames = writer.stack_map.take().unwrap().finish();
        assert_eq!(
            frames,
            vec![StackMapFrame::AppendLocalsNoStack {
                offset_delta: 3,
                locals: vec![VerificationType::Long, VerificationType::Integer],
            }]
        );
    }

    #[test]
    fn events_out_of_order() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::AsGiven, MethodAccessFlags::STATIC, "f", "()V");
        assert!(matches!(
            writer.visit_insn(RETURN),
            Err(Error::InvalidState { event: "visit_insn", .. })
        ));
        writer.visit_code().unwrap();
        assert!(matches!(
            writer.visit_end(),
            Err(Error::InvalidState { event: "visit_end", .. })
        ));
    }

    #[test]
    fn unplaced_jump_target() {
        let mut fixture = Fixture::new();
        let mut writer = fixture.writer(Compute::AsGiven, MethodAccessFlags::STATIC, "f", "()V");
        let nowhere = writer.new_label();
        writer.visit_code().unwrap();
        writer.visit_jump_insn(GOTO, nowhere).unwrap();
        assert!(matches!(
            writer.visit_maxs(0, 0),
            Err(Error::UnresolvedLabel(label)) if label == nowhere
        ));
    }
}
