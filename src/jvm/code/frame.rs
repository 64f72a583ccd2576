use crate::jvm::class_file::{ConstantPool, LoadableConstant, TypeIndex, TypeRow, VerificationType};
use crate::jvm::code::EdgeInfo;
use crate::jvm::descriptors::{BaseType, FieldType, MethodDescriptor, ParseDescriptor, RefType};
use crate::jvm::hierarchy::ClassHierarchy;
use crate::jvm::opcodes::*;
use crate::jvm::Error;
use crate::util::Width;

/// What sits in a frame slot, ignoring array dimensions
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Kind {
    Top,

    /// Only ever the element type of an array (a lone `boolean` is an `Integer`)
    Boolean,
    Byte,
    Char,
    Short,

    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,

    /// Class or interface, as a row in the type table
    Object(TypeIndex),

    /// Object created by `new`, as a row in the type table (which records the offset of the `new`)
    Uninitialized(TypeIndex),

    /// Whatever was in this local of the input frame
    Local(u32),

    /// Whatever was this many slots from the top of the input stack (`Stack(1)` is the top)
    Stack(u32),
}

/// Type in a frame slot
///
/// Inside a block, slots may hold types relative to the block's (still unknown) input frame: those
/// use the `Local` and `Stack` kinds and get resolved when the block's output is merged into its
/// successors. `dims` is added to the dimensions of the resolved type, so that `aaload` can be
/// expressed as "one dimension less than whatever was in the input".
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FrameType {
    pub dims: i32,
    pub kind: Kind,

    /// Resolve to `Top` if the type resolves to a `long` or `double`
    ///
    /// Set on a local when the local after it is overwritten: if it held the first half of a wide
    /// value, that value is now broken.
    pub top_if_wide: bool,
}

impl FrameType {
    pub const TOP: FrameType = FrameType::base(Kind::Top);
    pub const INTEGER: FrameType = FrameType::base(Kind::Integer);
    pub const FLOAT: FrameType = FrameType::base(Kind::Float);
    pub const LONG: FrameType = FrameType::base(Kind::Long);
    pub const DOUBLE: FrameType = FrameType::base(Kind::Double);
    pub const NULL: FrameType = FrameType::base(Kind::Null);
    pub const UNINITIALIZED_THIS: FrameType = FrameType::base(Kind::UninitializedThis);

    const fn base(kind: Kind) -> FrameType {
        FrameType {
            dims: 0,
            kind,
            top_if_wide: false,
        }
    }

    pub fn object(index: TypeIndex) -> FrameType {
        FrameType::base(Kind::Object(index))
    }

    fn array_of(self) -> FrameType {
        FrameType {
            dims: self.dims + 1,
            ..self
        }
    }

    fn element(self) -> FrameType {
        FrameType {
            dims: self.dims - 1,
            ..self
        }
    }

    pub fn is_wide(&self) -> bool {
        self.dims == 0 && matches!(self.kind, Kind::Long | Kind::Double)
    }

    /// Objects and arrays (but not `null` or uninitialized objects)
    pub fn is_reference(&self) -> bool {
        self.dims != 0 || matches!(self.kind, Kind::Object(_))
    }

    fn is_relative(&self) -> bool {
        matches!(self.kind, Kind::Local(_) | Kind::Stack(_))
    }

    /// Coarse kind used to decide if two references of the same dimension can be merged
    fn base_kind(&self) -> u8 {
        match self.kind {
            Kind::Object(_) => 1,
            Kind::Uninitialized(_) => 2,
            _ => 0,
        }
    }

    /// `null` has no dimensions, and taking the element of a non-array gives an unusable type
    fn normalized(self) -> FrameType {
        if self.kind == Kind::Null {
            FrameType::NULL
        } else if self.dims < 0 {
            FrameType::TOP
        } else {
            self
        }
    }

    /// Frame type of a value with the given field type
    pub fn from_field_type(pool: &mut ConstantPool, field_type: &FieldType) -> FrameType {
        let base_kind = |base_type: &BaseType, in_array: bool| match base_type {
            BaseType::Boolean if in_array => Kind::Boolean,
            BaseType::Byte if in_array => Kind::Byte,
            BaseType::Char if in_array => Kind::Char,
            BaseType::Short if in_array => Kind::Short,
            BaseType::Boolean
            | BaseType::Byte
            | BaseType::Char
            | BaseType::Short
            | BaseType::Int => Kind::Integer,
            BaseType::Float => Kind::Float,
            BaseType::Long => Kind::Long,
            BaseType::Double => Kind::Double,
        };
        match field_type {
            FieldType::Base(base_type) => FrameType::base(base_kind(base_type, false)),
            FieldType::Ref(RefType::Object(class)) => {
                FrameType::object(pool.add_type(class.as_str()))
            }
            FieldType::Ref(RefType::PrimitiveArray(array)) => FrameType {
                dims: array.dimensions() as i32,
                kind: base_kind(&array.element_type, true),
                top_if_wide: false,
            },
            FieldType::Ref(RefType::ObjectArray(array)) => FrameType {
                dims: array.dimensions() as i32,
                kind: Kind::Object(pool.add_type(array.element_type.as_str())),
                top_if_wide: false,
            },
        }
    }

    /// Frame type of an instance of a class constant (internal name or array descriptor)
    pub fn from_class_name(pool: &mut ConstantPool, name: &str) -> Result<FrameType, Error> {
        if name.starts_with('[') {
            let field_type = FieldType::parse_descriptor(name)?;
            Ok(FrameType::from_field_type(pool, &field_type))
        } else {
            Ok(FrameType::object(pool.add_type(name)))
        }
    }

    /// Encode a resolved type for the `StackMapTable`
    pub fn to_verification_type(&self, pool: &mut ConstantPool) -> Result<VerificationType, Error> {
        if self.dims > 0 {
            let mut descriptor = "[".repeat(self.dims as usize);
            match self.kind {
                Kind::Boolean => descriptor.push('Z'),
                Kind::Byte => descriptor.push('B'),
                Kind::Char => descriptor.push('C'),
                Kind::Short => descriptor.push('S'),
                Kind::Integer => descriptor.push('I'),
                Kind::Float => descriptor.push('F'),
                Kind::Long => descriptor.push('J'),
                Kind::Double => descriptor.push('D'),
                Kind::Object(index) => {
                    descriptor.push('L');
                    descriptor.push_str(pool.type_name(index));
                    descriptor.push(';');
                }
                _ => return Ok(VerificationType::Top),
            }
            return Ok(VerificationType::Object(pool.class(&descriptor)?));
        }
        Ok(match self.kind {
            Kind::Top | Kind::Local(_) | Kind::Stack(_) => VerificationType::Top,
            Kind::Boolean | Kind::Byte | Kind::Char | Kind::Short | Kind::Integer => {
                VerificationType::Integer
            }
            Kind::Float => VerificationType::Float,
            Kind::Long => VerificationType::Long,
            Kind::Double => VerificationType::Double,
            Kind::Null => VerificationType::Null,
            Kind::UninitializedThis => VerificationType::UninitializedThis,
            Kind::Object(index) => {
                let name = pool.type_name(index).to_owned();
                VerificationType::Object(pool.class(&name)?)
            }
            Kind::Uninitialized(index) => match pool.type_row(index) {
                TypeRow::Uninitialized { offset, .. } => VerificationType::Uninitialized(*offset as u16),
                TypeRow::Normal(_) => VerificationType::Top,
            },
        })
    }
}

/// Extra operand of an instruction, as far as its effect on types is concerned
#[derive(Copy, Clone, Debug)]
pub(crate) enum Operand<'a> {
    None,

    /// Internal name or array descriptor, for type instructions and `multianewarray`
    Class(&'a str),

    /// Field descriptor
    Field(&'a str),

    Method { name: &'a str, descriptor: &'a str },

    /// Method descriptor of the call site
    InvokeDynamic(&'a str),

    Constant(&'a LoadableConstant),
}

/// Absolute types on entry of a block
///
/// `None` marks slots that have not been reached by any merge yet.
#[derive(Clone, Default, Debug)]
pub(crate) struct FrameInput {
    pub locals: Vec<Option<FrameType>>,
    pub stack: Vec<Option<FrameType>>,
}

/// Everything needed to merge types across an edge
pub(crate) struct TypeContext<'a> {
    pub pool: &'a mut ConstantPool,
    pub hierarchy: &'a dyn ClassHierarchy,

    /// Internal name of the class being assembled
    pub this_class: &'a str,
}

/// Abstract state of one basic block
///
/// The block's instructions are interpreted once, as they are emitted, into an _output_ state
/// expressed relative to the _input_ state. The fixpoint over the control flow graph then only
/// needs to resolve the output against concrete inputs and merge.
#[derive(Clone, Default, Debug)]
pub(crate) struct Frame {
    pub input: Option<FrameInput>,

    /// Locals written by the block (`None` for untouched locals)
    output_locals: Vec<Option<FrameType>>,

    /// Values pushed by the block and still on the stack at its end
    output_stack: Vec<FrameType>,

    /// How many input stack slots the block has popped (as a non-positive number)
    input_stack_top: i32,

    /// Largest stack height reached in the block, relative to its input stack height
    pub output_stack_max: i32,

    /// Receivers of constructor calls made in the block
    initializations: Vec<FrameType>,
}

impl Frame {
    fn get(&mut self, local: u32) -> FrameType {
        let relative = FrameType::base(Kind::Local(local));
        match self.output_locals.get_mut(local as usize) {
            None => relative,
            Some(slot) => *slot.get_or_insert(relative),
        }
    }

    fn set(&mut self, local: u32, typ: FrameType) {
        let local = local as usize;
        if local >= self.output_locals.len() {
            self.output_locals.resize(local + 1, None);
        }
        self.output_locals[local] = Some(typ);
    }

    fn push(&mut self, typ: FrameType) {
        self.output_stack.push(typ);
        let top = self.input_stack_top + self.output_stack.len() as i32;
        self.output_stack_max = self.output_stack_max.max(top);
    }

    fn push_wide(&mut self, typ: FrameType) {
        self.push(typ);
        self.push(FrameType::TOP);
    }

    fn push_field_type(&mut self, pool: &mut ConstantPool, field_type: &FieldType) {
        let typ = FrameType::from_field_type(pool, field_type);
        if typ.is_wide() {
            self.push_wide(typ);
        } else {
            self.push(typ);
        }
    }

    fn pop(&mut self) -> FrameType {
        match self.output_stack.pop() {
            Some(typ) => typ,
            None => {
                self.input_stack_top -= 1;
                FrameType::base(Kind::Stack(-self.input_stack_top as u32))
            }
        }
    }

    fn pop_n(&mut self, count: u32) {
        let count = count as usize;
        if self.output_stack.len() >= count {
            self.output_stack.truncate(self.output_stack.len() - count);
        } else {
            self.input_stack_top -= (count - self.output_stack.len()) as i32;
            self.output_stack.clear();
        }
    }

    /// Storing into `local` breaks a wide value starting in the local before it
    fn invalidate_before(&mut self, local: u32) {
        if local == 0 {
            return;
        }
        let before = self.get(local - 1);
        if before.is_wide() {
            self.set(local - 1, FrameType::TOP);
        } else if before.is_relative() {
            self.set(
                local - 1,
                FrameType {
                    top_if_wide: true,
                    ..before
                },
            );
        }
    }

    /// Update the output state with the effect of one instruction
    ///
    /// `arg` is the local variable index for local variable instructions, the type code for
    /// `newarray`, the dimensions for `multianewarray`, and the offset of the instruction for
    /// everything else.
    pub fn execute(
        &mut self,
        opcode: u8,
        arg: u32,
        operand: Operand<'_>,
        pool: &mut ConstantPool,
    ) -> Result<(), Error> {
        match opcode {
            NOP | INEG | LNEG | FNEG | DNEG | I2B | I2C | I2S | GOTO | GOTO_W | RETURN => (),
            ACONST_NULL => self.push(FrameType::NULL),
            ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH | ILOAD => self.push(FrameType::INTEGER),
            LCONST_0 | LCONST_1 | LLOAD => self.push_wide(FrameType::LONG),
            FCONST_0..=FCONST_2 | FLOAD => self.push(FrameType::FLOAT),
            DCONST_0 | DCONST_1 | DLOAD => self.push_wide(FrameType::DOUBLE),
            LDC | LDC_W | LDC2_W => {
                let constant = match operand {
                    Operand::Constant(constant) => constant,
                    _ => return Err(missing_operand(opcode)),
                };
                match constant {
                    LoadableConstant::Integer(_) => self.push(FrameType::INTEGER),
                    LoadableConstant::Float(_) => self.push(FrameType::FLOAT),
                    LoadableConstant::Long(_) => self.push_wide(FrameType::LONG),
                    LoadableConstant::Double(_) => self.push_wide(FrameType::DOUBLE),
                    LoadableConstant::String(_) => {
                        self.push(FrameType::object(pool.add_type("java/lang/String")))
                    }
                    LoadableConstant::Class(_) => {
                        self.push(FrameType::object(pool.add_type("java/lang/Class")))
                    }
                    LoadableConstant::MethodType(_) => {
                        let method_type = pool.add_type("java/lang/invoke/MethodType");
                        self.push(FrameType::object(method_type))
                    }
                    LoadableConstant::MethodHandle(_) => {
                        let method_handle = pool.add_type("java/lang/invoke/MethodHandle");
                        self.push(FrameType::object(method_handle))
                    }
                }
            }
            ALOAD => {
                let typ = self.get(arg);
                self.push(typ);
            }
            IALOAD | BALOAD | CALOAD | SALOAD => {
                self.pop_n(2);
                self.push(FrameType::INTEGER);
            }
            LALOAD | D2L => {
                self.pop_n(2);
                self.push_wide(FrameType::LONG);
            }
            FALOAD => {
                self.pop_n(2);
                self.push(FrameType::FLOAT);
            }
            DALOAD | L2D => {
                self.pop_n(2);
                self.push_wide(FrameType::DOUBLE);
            }
            AALOAD => {
                self.pop_n(1);
                let array = self.pop();
                self.push(array.element());
            }
            ISTORE | FSTORE | ASTORE => {
                let typ = self.pop();
                self.set(arg, typ);
                self.invalidate_before(arg);
            }
            LSTORE | DSTORE => {
                self.pop_n(1);
                let typ = self.pop();
                self.set(arg, typ);
                self.set(arg + 1, FrameType::TOP);
                self.invalidate_before(arg);
            }
            IASTORE | BASTORE | CASTORE | SASTORE | FASTORE | AASTORE => self.pop_n(3),
            LASTORE | DASTORE => self.pop_n(4),
            POP | IFEQ..=IFLE | IRETURN | FRETURN | ARETURN | TABLESWITCH | LOOKUPSWITCH
            | ATHROW | MONITORENTER | MONITOREXIT | IFNULL | IFNONNULL => self.pop_n(1),
            POP2 | IF_ICMPEQ..=IF_ACMPNE | LRETURN | DRETURN => self.pop_n(2),
            DUP => {
                let value1 = self.pop();
                self.push(value1);
                self.push(value1);
            }
            DUP_X1 => {
                let value1 = self.pop();
                let value2 = self.pop();
                self.push(value1);
                self.push(value2);
                self.push(value1);
            }
            DUP_X2 => {
                let value1 = self.pop();
                let value2 = self.pop();
                let value3 = self.pop();
                self.push(value1);
                self.push(value3);
                self.push(value2);
                self.push(value1);
            }
            DUP2 => {
                let value1 = self.pop();
                let value2 = self.pop();
                self.push(value2);
                self.push(value1);
                self.push(value2);
                self.push(value1);
            }
            DUP2_X1 => {
                let value1 = self.pop();
                let value2 = self.pop();
                let value3 = self.pop();
                self.push(value2);
                self.push(value1);
                self.push(value3);
                self.push(value2);
                self.push(value1);
            }
            DUP2_X2 => {
                let value1 = self.pop();
                let value2 = self.pop();
                let value3 = self.pop();
                let value4 = self.pop();
                self.push(value2);
                self.push(value1);
                self.push(value4);
                self.push(value3);
                self.push(value2);
                self.push(value1);
            }
            SWAP => {
                let value1 = self.pop();
                let value2 = self.pop();
                self.push(value1);
                self.push(value2);
            }
            IADD | ISUB | IMUL | IDIV | IREM | IAND | IOR | IXOR | ISHL | ISHR | IUSHR | L2I
            | D2I | FCMPL | FCMPG => {
                self.pop_n(2);
                self.push(FrameType::INTEGER);
            }
            LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => {
                self.pop_n(4);
                self.push_wide(FrameType::LONG);
            }
            FADD | FSUB | FMUL | FDIV | FREM | L2F | D2F => {
                self.pop_n(2);
                self.push(FrameType::FLOAT);
            }
            DADD | DSUB | DMUL | DDIV | DREM => {
                self.pop_n(4);
                self.push_wide(FrameType::DOUBLE);
            }
            LSHL | LSHR | LUSHR => {
                self.pop_n(3);
                self.push_wide(FrameType::LONG);
            }
            IINC => self.set(arg, FrameType::INTEGER),
            I2L | F2L => {
                self.pop_n(1);
                self.push_wide(FrameType::LONG);
            }
            I2F => {
                self.pop_n(1);
                self.push(FrameType::FLOAT);
            }
            I2D | F2D => {
                self.pop_n(1);
                self.push_wide(FrameType::DOUBLE);
            }
            F2I | ARRAYLENGTH | INSTANCEOF => {
                self.pop_n(1);
                self.push(FrameType::INTEGER);
            }
            LCMP | DCMPL | DCMPG => {
                self.pop_n(4);
                self.push(FrameType::INTEGER);
            }
            JSR | JSR_W | RET => {
                return Err(Error::UnsupportedSubroutine {
                    opcode: mnemonic(opcode),
                    offset: arg as usize,
                })
            }
            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                let descriptor = match operand {
                    Operand::Field(descriptor) => descriptor,
                    _ => return Err(missing_operand(opcode)),
                };
                let field_type = FieldType::parse_descriptor(descriptor)?;
                match opcode {
                    GETSTATIC => self.push_field_type(pool, &field_type),
                    PUTSTATIC => self.pop_n(field_type.width() as u32),
                    GETFIELD => {
                        self.pop_n(1);
                        self.push_field_type(pool, &field_type);
                    }
                    _ => self.pop_n(field_type.width() as u32 + 1),
                }
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                let (name, descriptor) = match operand {
                    Operand::Method { name, descriptor } => (name, descriptor),
                    _ => return Err(missing_operand(opcode)),
                };
                let descriptor = MethodDescriptor::parse_descriptor(descriptor)?;
                self.pop_n(descriptor.parameter_length(false) as u32);
                if opcode != INVOKESTATIC {
                    let receiver = self.pop();
                    if opcode == INVOKESPECIAL && name.starts_with('<') {
                        self.initializations.push(receiver);
                    }
                }
                if let Some(return_type) = &descriptor.return_type {
                    self.push_field_type(pool, return_type);
                }
            }
            INVOKEDYNAMIC => {
                let descriptor = match operand {
                    Operand::InvokeDynamic(descriptor) => descriptor,
                    _ => return Err(missing_operand(opcode)),
                };
                let descriptor = MethodDescriptor::parse_descriptor(descriptor)?;
                self.pop_n(descriptor.parameter_length(false) as u32);
                if let Some(return_type) = &descriptor.return_type {
                    self.push_field_type(pool, return_type);
                }
            }
            NEW => {
                let class = class_operand(opcode, operand)?;
                let uninitialized = pool.add_uninitialized_type(class, arg);
                self.push(FrameType::base(Kind::Uninitialized(uninitialized)));
            }
            NEWARRAY => {
                self.pop_n(1);
                let element = BaseType::from_array_type_code(arg as u8).ok_or_else(|| {
                    Error::InvalidArgument(format!("invalid newarray type code {}", arg))
                })?;
                let kind = match element {
                    BaseType::Boolean => Kind::Boolean,
                    BaseType::Byte => Kind::Byte,
                    BaseType::Char => Kind::Char,
                    BaseType::Short => Kind::Short,
                    BaseType::Int => Kind::Integer,
                    BaseType::Float => Kind::Float,
                    BaseType::Long => Kind::Long,
                    BaseType::Double => Kind::Double,
                };
                self.push(FrameType::base(kind).array_of());
            }
            ANEWARRAY => {
                let class = class_operand(opcode, operand)?;
                self.pop_n(1);
                let element = FrameType::from_class_name(pool, class)?;
                self.push(element.array_of());
            }
            CHECKCAST => {
                let class = class_operand(opcode, operand)?;
                self.pop_n(1);
                let typ = FrameType::from_class_name(pool, class)?;
                self.push(typ);
            }
            MULTIANEWARRAY => {
                let class = class_operand(opcode, operand)?;
                self.pop_n(arg);
                let typ = FrameType::from_class_name(pool, class)?;
                self.push(typ);
            }
            _ => {
                return Err(Error::InvalidOpcode {
                    opcode,
                    event: "frame computation",
                })
            }
        }
        Ok(())
    }

    /// Set up the input of the entry block from the method's parameters
    pub fn init_input(
        &mut self,
        pool: &mut ConstantPool,
        this_class: &str,
        is_static: bool,
        is_constructor: bool,
        descriptor: &MethodDescriptor,
        max_locals: usize,
    ) {
        let mut locals = Vec::with_capacity(max_locals);
        if !is_static {
            if is_constructor {
                locals.push(Some(FrameType::UNINITIALIZED_THIS));
            } else {
                locals.push(Some(FrameType::object(pool.add_type(this_class))));
            }
        }
        for parameter in &descriptor.parameters {
            let typ = FrameType::from_field_type(pool, parameter);
            locals.push(Some(typ));
            if typ.is_wide() {
                locals.push(Some(FrameType::TOP));
            }
        }
        while locals.len() < max_locals {
            locals.push(Some(FrameType::TOP));
        }
        self.input = Some(FrameInput {
            locals,
            stack: vec![],
        });
    }

    /// Resolve an output type against the input
    fn resolve(output: FrameType, input: &FrameInput) -> Option<FrameType> {
        let resolved = match output.kind {
            Kind::Local(local) => input.locals.get(local as usize).copied().flatten(),
            Kind::Stack(depth) => input
                .stack
                .len()
                .checked_sub(depth as usize)
                .and_then(|idx| input.stack[idx]),
            _ => return Some(output),
        };
        let resolved = match resolved {
            None => return Some(FrameType::TOP),
            Some(resolved) => FrameType {
                dims: resolved.dims + output.dims,
                kind: resolved.kind,
                top_if_wide: false,
            },
        };
        if output.top_if_wide && resolved.is_wide() {
            Some(FrameType::TOP)
        } else {
            Some(resolved)
        }
    }

    /// Replace uninitialized types whose constructor was called in this block
    fn initialized(
        &self,
        typ: Option<FrameType>,
        input: &FrameInput,
        context: &mut TypeContext<'_>,
    ) -> Option<FrameType> {
        let typ = typ?;
        if self.initializations.is_empty() || typ.dims != 0 {
            return Some(typ);
        }
        let class = match typ.kind {
            Kind::UninitializedThis => context.this_class.to_owned(),
            Kind::Uninitialized(index) => context.pool.type_name(index).to_owned(),
            _ => return Some(typ),
        };
        let was_initialized = self
            .initializations
            .iter()
            .any(|receiver| Frame::resolve(*receiver, input) == Some(typ));
        if was_initialized {
            Some(FrameType::object(context.pool.add_type(&class)))
        } else {
            Some(typ)
        }
    }

    /// Merge the output of this block into the input of a successor
    ///
    /// Returns whether the successor's input changed. Across exception edges, only the locals
    /// flow (both as they were on entry and as they are at the end of the block) and the stack is
    /// replaced with the caught exception.
    pub fn merge(
        &self,
        target: &mut Option<FrameInput>,
        edge: EdgeInfo,
        target_position: u32,
        context: &mut TypeContext<'_>,
    ) -> Result<bool, Error> {
        let input = match &self.input {
            Some(input) => input,
            None => return Ok(false),
        };
        let mut changed = target.is_none();
        let fresh = changed;
        let target = target.get_or_insert_with(FrameInput::default);
        if target.locals.len() < input.locals.len() {
            target.locals.resize(input.locals.len(), None);
        }

        for local in 0..input.locals.len() {
            let typ = match self.output_locals.get(local).copied().flatten() {
                Some(output) => Frame::resolve(output, input),
                None => input.locals[local],
            };
            let typ = self.initialized(typ, input, context);
            changed |= merge_type(typ, &mut target.locals, local, context)?;
        }

        if let EdgeInfo::Catch(catch_type) = edge {
            for local in 0..input.locals.len() {
                changed |= merge_type(input.locals[local], &mut target.locals, local, context)?;
            }
            if target.stack.is_empty() {
                target.stack.push(None);
                changed = true;
            }
            let exception = Some(FrameType::object(catch_type));
            changed |= merge_type(exception, &mut target.stack, 0, context)?;
            return Ok(changed);
        }

        let kept_input = (input.stack.len() as i32 + self.input_stack_top).max(0) as usize;
        let stack_height = kept_input + self.output_stack.len();
        if fresh {
            target.stack = vec![None; stack_height];
        } else if target.stack.len() != stack_height {
            return Err(Error::StackHeightMismatch {
                offset: target_position as usize,
                expected: target.stack.len(),
                found: stack_height,
            });
        }

        for slot in 0..kept_input {
            let typ = self.initialized(input.stack[slot], input, context);
            changed |= merge_type(typ, &mut target.stack, slot, context)?;
        }
        for (slot, output) in self.output_stack.iter().enumerate() {
            let typ = self.initialized(Frame::resolve(*output, input), input, context);
            changed |= merge_type(typ, &mut target.stack, kept_input + slot, context)?;
        }
        Ok(changed)
    }
}

fn missing_operand(opcode: u8) -> Error {
    Error::InvalidArgument(format!("`{}` is missing its operand", mnemonic(opcode)))
}

fn class_operand<'a>(opcode: u8, operand: Operand<'a>) -> Result<&'a str, Error> {
    match operand {
        Operand::Class(class) => Ok(class),
        _ => Err(missing_operand(opcode)),
    }
}

/// Merge a type into a slot of an input frame, returning whether the slot changed
///
/// Identical types and `null` into any reference leave the slot alone. References of the same
/// dimension merge into their common super class (or `java/lang/Object` when the elements are
/// primitive), other references into `java/lang/Object`, and everything else into `Top`.
pub(crate) fn merge_type(
    typ: Option<FrameType>,
    types: &mut [Option<FrameType>],
    index: usize,
    context: &mut TypeContext<'_>,
) -> Result<bool, Error> {
    let current = types[index];
    let typ = match typ {
        Some(typ) => typ.normalized(),
        None => {
            if current.is_none() || current == Some(FrameType::TOP) {
                return Ok(false);
            }
            types[index] = Some(FrameType::TOP);
            return Ok(true);
        }
    };
    if current == Some(typ) {
        return Ok(false);
    }
    let current = match current {
        None => {
            types[index] = Some(typ);
            return Ok(true);
        }
        Some(current) => current,
    };

    let merged = if current.is_reference() {
        if typ == FrameType::NULL {
            return Ok(false);
        } else if typ.dims == current.dims && typ.base_kind() == current.base_kind() {
            match (typ.kind, current.kind) {
                (Kind::Object(index1), Kind::Object(index2)) => FrameType {
                    dims: typ.dims,
                    kind: Kind::Object(context.pool.merged_type(
                        index1,
                        index2,
                        context.hierarchy,
                    )?),
                    top_if_wide: false,
                },
                _ => FrameType::object(context.pool.add_type("java/lang/Object")),
            }
        } else if typ.is_reference() {
            FrameType::object(context.pool.add_type("java/lang/Object"))
        } else {
            FrameType::TOP
        }
    } else if current == FrameType::NULL {
        if typ.is_reference() {
            typ
        } else {
            FrameType::TOP
        }
    } else {
        FrameType::TOP
    };

    if merged != current {
        types[index] = Some(merged);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Verification types of a complete input frame
///
/// The slot following a `long` or `double` is implied, and trailing `Top` locals are dropped.
pub(crate) fn frame_verification_types(
    input: &FrameInput,
    pool: &mut ConstantPool,
) -> Result<(Vec<VerificationType>, Vec<VerificationType>), Error> {
    let compact = |types: &[Option<FrameType>]| {
        let mut compacted = vec![];
        let mut slot = 0;
        while slot < types.len() {
            let typ = types[slot].unwrap_or(FrameType::TOP);
            compacted.push(typ);
            slot += if typ.is_wide() { 2 } else { 1 };
        }
        compacted
    };

    let mut locals = compact(&input.locals);
    while locals.last() == Some(&FrameType::TOP) {
        locals.pop();
    }
    let stack = compact(&input.stack);

    let locals = locals
        .iter()
        .map(|typ| typ.to_verification_type(pool))
        .collect::<Result<Vec<_>, Error>>()?;
    let stack = stack
        .iter()
        .map(|typ| typ.to_verification_type(pool))
        .collect::<Result<Vec<_>, Error>>()?;
    Ok((locals, stack))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::StaticClassHierarchy;

    fn object(pool: &mut ConstantPool, name: &str) -> FrameType {
        FrameType::object(pool.add_type(name))
    }

    fn entry_input(locals: Vec<FrameType>) -> FrameInput {
        FrameInput {
            locals: locals.into_iter().map(Some).collect(),
            stack: vec![],
        }
    }

    #[test]
    fn stores_and_loads_are_relative() {
        let mut pool = ConstantPool::new();
        let mut frame = Frame::default();
        frame.execute(ALOAD, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ASTORE, 2, Operand::None, &mut pool).unwrap();
        frame.execute(ICONST_1, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ISTORE, 1, Operand::None, &mut pool).unwrap();

        assert_eq!(frame.output_locals[1], Some(FrameType::INTEGER));
        assert_eq!(frame.output_locals[2], Some(FrameType::base(Kind::Local(0))));
        assert!(frame.output_stack.is_empty());
        assert_eq!(frame.output_stack_max, 1);
    }

    #[test]
    fn popping_past_the_output_reaches_into_the_input() {
        let mut pool = ConstantPool::new();
        let mut frame = Frame::default();
        frame.execute(SWAP, 0, Operand::None, &mut pool).unwrap();
        assert_eq!(
            frame.output_stack,
            vec![
                FrameType::base(Kind::Stack(1)),
                FrameType::base(Kind::Stack(2))
            ]
        );
        assert_eq!(frame.input_stack_top, -2);
        assert_eq!(frame.output_stack_max, 0);
    }

    #[test]
    fn overwriting_second_half_of_wide_local() {
        let mut pool = ConstantPool::new();
        let mut frame = Frame::default();
        frame.execute(LCONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.execute(LSTORE, 1, Operand::None, &mut pool).unwrap();
        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ISTORE, 2, Operand::None, &mut pool).unwrap();
        assert_eq!(frame.output_locals[1], Some(FrameType::TOP));

        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ISTORE, 5, Operand::None, &mut pool).unwrap();
        let flagged = frame.output_locals[4].unwrap();
        assert!(flagged.top_if_wide);
        assert_eq!(flagged.kind, Kind::Local(4));
    }

    #[test]
    fn wide_local_broken_on_merge() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let mut frame = Frame::default();
        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ISTORE, 1, Operand::None, &mut pool).unwrap();
        frame.input = Some(entry_input(vec![FrameType::LONG, FrameType::TOP]));

        let mut target = None;
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        assert!(frame
            .merge(&mut target, EdgeInfo::Normal, 0, &mut context)
            .unwrap());
        let target = target.unwrap();
        assert_eq!(
            target.locals,
            vec![Some(FrameType::TOP), Some(FrameType::INTEGER)]
        );
    }

    #[test]
    fn lattice_merges() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let integer = object(&mut pool, "java/lang/Integer");
        let long = object(&mut pool, "java/lang/Long");
        let number = object(&mut pool, "java/lang/Number");
        let string = object(&mut pool, "java/lang/String");
        let java_object = object(&mut pool, "java/lang/Object");
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        let mut merge = |typ: FrameType, into: FrameType| {
            let mut slots = [Some(into)];
            merge_type(Some(typ), &mut slots, 0, &mut context).unwrap();
            slots[0].unwrap()
        };

        assert_eq!(merge(integer, long), number);
        assert_eq!(merge(long, integer), number);
        assert_eq!(merge(string, string), string);
        assert_eq!(merge(FrameType::NULL, string), string);
        assert_eq!(merge(string, FrameType::NULL), string);
        assert_eq!(merge(FrameType::INTEGER, FrameType::FLOAT), FrameType::TOP);
        assert_eq!(merge(FrameType::INTEGER, string), FrameType::TOP);
        assert_eq!(merge(integer.array_of(), long.array_of()), number.array_of());
        assert_eq!(merge(integer.array_of(), long), java_object);
        assert_eq!(
            merge(FrameType::INTEGER.array_of(), FrameType::FLOAT.array_of()),
            java_object
        );
    }

    #[test]
    fn unset_slots_take_the_incoming_type() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        let mut slots = [None, Some(FrameType::INTEGER)];
        assert!(merge_type(Some(FrameType::FLOAT), &mut slots, 0, &mut context).unwrap());
        assert!(!merge_type(Some(FrameType::FLOAT), &mut slots, 0, &mut context).unwrap());
        assert!(merge_type(None, &mut slots, 1, &mut context).unwrap());
        assert_eq!(slots, [Some(FrameType::FLOAT), Some(FrameType::TOP)]);
    }

    #[test]
    fn constructor_calls_initialize_objects() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let mut frame = Frame::default();
        let class = Operand::Class("java/lang/Object");
        let init = Operand::Method {
            name: "<init>",
            descriptor: "()V",
        };
        frame.execute(NEW, 0, class, &mut pool).unwrap();
        frame.execute(DUP, 0, Operand::None, &mut pool).unwrap();
        frame.execute(INVOKESPECIAL, 0, init, &mut pool).unwrap();
        frame.input = Some(entry_input(vec![]));

        let mut target = None;
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        frame
            .merge(&mut target, EdgeInfo::Normal, 7, &mut context)
            .unwrap();
        let java_object = object(&mut pool, "java/lang/Object");
        assert_eq!(target.unwrap().stack, vec![Some(java_object)]);
    }

    #[test]
    fn exception_edges_replace_the_stack() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let throwable = pool.add_type("java/lang/Throwable");
        let mut frame = Frame::default();
        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ISTORE, 0, Operand::None, &mut pool).unwrap();
        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.input = Some(entry_input(vec![FrameType::FLOAT]));

        let mut target = None;
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        frame
            .merge(&mut target, EdgeInfo::Catch(throwable), 0, &mut context)
            .unwrap();
        let target = target.unwrap();
        assert_eq!(target.locals, vec![Some(FrameType::TOP)]);
        assert_eq!(target.stack, vec![Some(FrameType::object(throwable))]);
    }

    #[test]
    fn inconsistent_stack_heights() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let mut frame = Frame::default();
        frame.execute(ICONST_0, 0, Operand::None, &mut pool).unwrap();
        frame.input = Some(entry_input(vec![]));
        let mut target = Some(entry_input(vec![]));
        let mut context = TypeContext {
            pool: &mut pool,
            hierarchy: &hierarchy,
            this_class: "Foo",
        };
        assert!(matches!(
            frame.merge(&mut target, EdgeInfo::Normal, 12, &mut context),
            Err(Error::StackHeightMismatch { offset: 12, .. })
        ));
    }

    #[test]
    fn subroutines_are_rejected() {
        let mut pool = ConstantPool::new();
        let mut frame = Frame::default();
        assert!(matches!(
            frame.execute(JSR, 4, Operand::None, &mut pool),
            Err(Error::UnsupportedSubroutine { opcode: "jsr", offset: 4 })
        ));
    }

    #[test]
    fn array_types_in_frames() {
        let mut pool = ConstantPool::new();
        let mut frame = Frame::default();
        frame.execute(ICONST_2, 0, Operand::None, &mut pool).unwrap();
        frame.execute(NEWARRAY, 4, Operand::None, &mut pool).unwrap();
        frame.execute(ICONST_2, 0, Operand::None, &mut pool).unwrap();
        let strings = Operand::Class("java/lang/String");
        frame.execute(ANEWARRAY, 0, strings, &mut pool).unwrap();
        let boolean_array = frame.output_stack[0];
        let string_array = frame.output_stack[1];
        assert_eq!(
            boolean_array.to_verification_type(&mut pool).unwrap(),
            VerificationType::Object(pool.class("[Z").unwrap())
        );
        assert_eq!(
            string_array.to_verification_type(&mut pool).unwrap(),
            VerificationType::Object(pool.class("[Ljava/lang/String;").unwrap())
        );
    }

    #[test]
    fn compact_frames() {
        let mut pool = ConstantPool::new();
        let input = FrameInput {
            locals: vec![
                Some(FrameType::LONG),
                Some(FrameType::TOP),
                Some(FrameType::INTEGER),
                Some(FrameType::TOP),
                None,
            ],
            stack: vec![Some(FrameType::DOUBLE), Some(FrameType::TOP)],
        };
        let (locals, stack) = frame_verification_types(&input, &mut pool).unwrap();
        assert_eq!(locals, vec![VerificationType::Long, VerificationType::Integer]);
        assert_eq!(stack, vec![VerificationType::Double]);
    }
}
