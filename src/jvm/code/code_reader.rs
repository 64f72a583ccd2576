//! Decoding of already assembled bytecode
//!
//! Widening jumps moves instructions around, which invalidates every frame computed for a method.
//! Rather than patching frames, the method's final code is decoded back into instructions here and
//! replayed through a fresh method writer, which then derives frames for the new layout from
//! scratch.

use crate::jvm::class_file::{ConstantPool, Handle, LoadableConstant, Symbol};
use crate::jvm::code::method_writer::LocalVariableRange;
use crate::jvm::code::{Handler, Label};
use crate::jvm::opcodes::*;
use crate::jvm::{read_i16_at, read_i32_at, read_u16_at, Error, MethodVisitor};
use std::collections::BTreeMap;

/// One decoded instruction, with jump targets as absolute positions
#[derive(Clone, PartialEq, Debug)]
pub(crate) enum Instruction {
    Insn(u8),
    Int(u8, i32),
    Var(u8, u16),
    Iinc(u16, i16),
    Type(u8, String),
    Field {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
    },
    Method {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
        is_interface: bool,
    },
    InvokeDynamic {
        name: String,
        descriptor: String,
        bootstrap: Handle,
        arguments: Vec<LoadableConstant>,
    },
    Jump(u8, u32),
    Ldc(LoadableConstant),
    TableSwitch {
        low: i32,
        high: i32,
        default: u32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        keys: Vec<i32>,
        targets: Vec<u32>,
    },
    MultiANewArray(String, u8),
}

fn malformed(offset: usize, reason: impl Into<String>) -> Error {
    Error::MalformedCode {
        offset,
        reason: reason.into(),
    }
}

struct Decoder<'a> {
    code: &'a [u8],
    pool: &'a ConstantPool,
}

impl<'a> Decoder<'a> {
    fn need(&self, offset: usize, length: usize) -> Result<(), Error> {
        if offset + length <= self.code.len() {
            Ok(())
        } else {
            Err(malformed(offset, "instruction runs past the end of the code"))
        }
    }

    fn u16_at(&self, offset: usize) -> Result<u16, Error> {
        self.need(offset, 2)?;
        Ok(read_u16_at(self.code, offset))
    }

    fn i32_at(&self, offset: usize) -> Result<i32, Error> {
        self.need(offset, 4)?;
        Ok(read_i32_at(self.code, offset))
    }

    fn target(&self, position: usize, offset: i64) -> Result<u32, Error> {
        let target = position as i64 + offset;
        if target < 0 || target > self.code.len() as i64 {
            return Err(malformed(position, format!("jump target {} is out of bounds", target)));
        }
        Ok(target as u32)
    }

    fn symbol(&self, position: usize, index: u16) -> Result<&'a Symbol, Error> {
        self.pool
            .symbol(index)
            .ok_or_else(|| malformed(position, format!("no constant at index {}", index)))
    }

    fn class(&self, position: usize, index: u16) -> Result<String, Error> {
        match self.symbol(position, index)? {
            Symbol::Class(name) => Ok(name.clone()),
            other => Err(malformed(position, format!("expected a class, found {:?}", other))),
        }
    }

    fn loadable(&self, position: usize, index: u16) -> Result<LoadableConstant, Error> {
        Ok(match self.symbol(position, index)? {
            Symbol::Integer(integer) => LoadableConstant::Integer(*integer),
            Symbol::Float(bits) => LoadableConstant::Float(f32::from_bits(*bits)),
            Symbol::Long(long) => LoadableConstant::Long(*long),
            Symbol::Double(bits) => LoadableConstant::Double(f64::from_bits(*bits)),
            Symbol::String(string) => LoadableConstant::String(string.clone()),
            Symbol::Class(name) => LoadableConstant::Class(name.clone()),
            Symbol::MethodType(descriptor) => LoadableConstant::MethodType(descriptor.clone()),
            Symbol::MethodHandle(handle) => LoadableConstant::MethodHandle(handle.clone()),
            other => {
                return Err(malformed(
                    position,
                    format!("expected a loadable constant, found {:?}", other),
                ))
            }
        })
    }

    fn member(&self, position: usize, opcode: u8, index: u16) -> Result<Instruction, Error> {
        let symbol = self.symbol(position, index)?;
        Ok(match symbol {
            Symbol::FieldRef(member) if matches!(opcode, GETSTATIC..=PUTFIELD) => {
                Instruction::Field {
                    opcode,
                    owner: member.owner.clone(),
                    name: member.name.clone(),
                    descriptor: member.descriptor.clone(),
                }
            }
            Symbol::MethodRef(member) | Symbol::InterfaceMethodRef(member)
                if matches!(opcode, INVOKEVIRTUAL..=INVOKEINTERFACE) =>
            {
                Instruction::Method {
                    opcode,
                    owner: member.owner.clone(),
                    name: member.name.clone(),
                    descriptor: member.descriptor.clone(),
                    is_interface: matches!(symbol, Symbol::InterfaceMethodRef(_)),
                }
            }
            other => {
                return Err(malformed(
                    position,
                    format!("`{}` cannot refer to {:?}", mnemonic(opcode), other),
                ))
            }
        })
    }

    /// Decode the instruction at `position`, returning it with its length
    fn instruction(&self, position: usize) -> Result<(Instruction, usize), Error> {
        let opcode = self.code[position];
        let decoded = match SHAPES[opcode as usize] {
            InsnShape::NoArg => (Instruction::Insn(opcode), 1),
            InsnShape::ImplicitVar => {
                let (base, first) = if opcode < ISTORE_0 {
                    (ILOAD, ILOAD_0)
                } else {
                    (ISTORE, ISTORE_0)
                };
                let relative = opcode - first;
                (
                    Instruction::Var(base + (relative >> 2), (relative & 3) as u16),
                    1,
                )
            }
            InsnShape::Var => {
                self.need(position, 2)?;
                (Instruction::Var(opcode, self.code[position + 1] as u16), 2)
            }
            InsnShape::Byte => {
                self.need(position, 2)?;
                let byte = self.code[position + 1];
                let operand = if opcode == BIPUSH {
                    byte as i8 as i32
                } else {
                    byte as i32
                };
                (Instruction::Int(opcode, operand), 2)
            }
            InsnShape::Short => {
                self.need(position, 3)?;
                let operand = read_i16_at(self.code, position + 1) as i32;
                (Instruction::Int(opcode, operand), 3)
            }
            InsnShape::Ldc => {
                self.need(position, 2)?;
                let index = self.code[position + 1] as u16;
                (Instruction::Ldc(self.loadable(position, index)?), 2)
            }
            InsnShape::LdcWide => {
                let index = self.u16_at(position + 1)?;
                (Instruction::Ldc(self.loadable(position, index)?), 3)
            }
            InsnShape::FieldOrMethod => {
                let index = self.u16_at(position + 1)?;
                (self.member(position, opcode, index)?, 3)
            }
            InsnShape::InterfaceMethod => {
                self.need(position, 5)?;
                let index = self.u16_at(position + 1)?;
                (self.member(position, opcode, index)?, 5)
            }
            InsnShape::InvokeDynamic => {
                self.need(position, 5)?;
                let index = self.u16_at(position + 1)?;
                let instruction = match self.symbol(position, index)? {
                    Symbol::InvokeDynamic {
                        bootstrap_method,
                        name,
                        descriptor,
                    } => {
                        let entry = self
                            .pool
                            .bootstrap_method_entry(*bootstrap_method)
                            .ok_or_else(|| {
                                malformed(
                                    position,
                                    format!("no bootstrap method at index {}", bootstrap_method),
                                )
                            })?;
                        Instruction::InvokeDynamic {
                            name: name.clone(),
                            descriptor: descriptor.clone(),
                            bootstrap: entry.handle.clone(),
                            arguments: entry.arguments.clone(),
                        }
                    }
                    other => {
                        return Err(malformed(
                            position,
                            format!("`invokedynamic` cannot refer to {:?}", other),
                        ))
                    }
                };
                (instruction, 5)
            }
            InsnShape::Type => {
                let index = self.u16_at(position + 1)?;
                (Instruction::Type(opcode, self.class(position, index)?), 3)
            }
            InsnShape::Iinc => {
                self.need(position, 3)?;
                let var = self.code[position + 1] as u16;
                let increment = self.code[position + 2] as i8 as i16;
                (Instruction::Iinc(var, increment), 3)
            }
            InsnShape::Jump => {
                self.need(position, 3)?;
                let offset = read_i16_at(self.code, position + 1) as i64;
                (Instruction::Jump(opcode, self.target(position, offset)?), 3)
            }
            InsnShape::WideJump => {
                let offset = self.i32_at(position + 1)? as i64;
                (Instruction::Jump(opcode, self.target(position, offset)?), 5)
            }
            InsnShape::TableSwitch => {
                let mut cursor = (position + 4) & !3;
                let default = self.target(position, self.i32_at(cursor)? as i64)?;
                let low = self.i32_at(cursor + 4)?;
                let high = self.i32_at(cursor + 8)?;
                cursor += 12;
                if high < low {
                    return Err(malformed(position, "tableswitch bounds are reversed"));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                self.need(cursor, count * 4)?;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(self.target(position, self.i32_at(cursor)? as i64)?);
                    cursor += 4;
                }
                let instruction = Instruction::TableSwitch {
                    low,
                    high,
                    default,
                    targets,
                };
                (instruction, cursor - position)
            }
            InsnShape::LookupSwitch => {
                let mut cursor = (position + 4) & !3;
                let default = self.target(position, self.i32_at(cursor)? as i64)?;
                let count = self.i32_at(cursor + 4)?;
                cursor += 8;
                if count < 0 {
                    return Err(malformed(position, "lookupswitch has a negative pair count"));
                }
                self.need(cursor, count as usize * 8)?;
                let mut keys = Vec::with_capacity(count as usize);
                let mut targets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    keys.push(self.i32_at(cursor)?);
                    targets.push(self.target(position, self.i32_at(cursor + 4)? as i64)?);
                    cursor += 8;
                }
                let instruction = Instruction::LookupSwitch {
                    default,
                    keys,
                    targets,
                };
                (instruction, cursor - position)
            }
            InsnShape::Wide => {
                self.need(position, 4)?;
                let widened = self.code[position + 1];
                let var = read_u16_at(self.code, position + 2);
                if widened == IINC {
                    self.need(position, 6)?;
                    let increment = read_i16_at(self.code, position + 4);
                    (Instruction::Iinc(var, increment), 6)
                } else if SHAPES[widened as usize] == InsnShape::Var {
                    (Instruction::Var(widened, var), 4)
                } else {
                    return Err(malformed(
                        position,
                        format!("`wide` cannot prefix `{}`", mnemonic(widened)),
                    ));
                }
            }
            InsnShape::MultiANewArray => {
                self.need(position, 4)?;
                let index = self.u16_at(position + 1)?;
                let dimensions = self.code[position + 3];
                (
                    Instruction::MultiANewArray(self.class(position, index)?, dimensions),
                    4,
                )
            }
            InsnShape::OversizedJump => {
                return Err(malformed(position, "jump offset overflow was never widened"))
            }
            InsnShape::Invalid => {
                return Err(malformed(position, format!("invalid opcode {}", opcode)))
            }
        };
        Ok(decoded)
    }
}

/// Decode a whole code array, resolving constants through the pool it was written against
pub(crate) fn decode(
    code: &[u8],
    pool: &ConstantPool,
) -> Result<Vec<(u32, Instruction)>, Error> {
    let decoder = Decoder { code, pool };
    let mut instructions = vec![];
    let mut position = 0;
    while position < code.len() {
        let (instruction, length) = decoder.instruction(position)?;
        instructions.push((position as u32, instruction));
        position += length;
    }
    Ok(instructions)
}

/// Send decoded instructions, and the tables of the method they came from, to a method visitor
///
/// Everything up to (and excluding) `visit_maxs` is sent. Exception handlers go first, so the
/// visitor knows about them before seeing any instruction they protect.
pub(crate) fn replay(
    instructions: &[(u32, Instruction)],
    code_length: u32,
    handlers: &[Handler<u32>],
    line_numbers: &[(u32, u16)],
    local_variables: &[LocalVariableRange<u32>],
    visitor: &mut dyn MethodVisitor,
) -> Result<(), Error> {
    let mut positions: Vec<u32> = vec![];
    for (_, instruction) in instructions {
        match instruction {
            Instruction::Jump(_, target) => positions.push(*target),
            Instruction::TableSwitch {
                default, targets, ..
            }
            | Instruction::LookupSwitch {
                default, targets, ..
            } => {
                positions.push(*default);
                positions.extend(targets);
            }
            _ => (),
        }
    }
    for handler in handlers {
        positions.extend([handler.start, handler.end, handler.handler]);
    }
    positions.extend(line_numbers.iter().map(|(position, _)| *position));
    for local in local_variables {
        positions.extend([local.start, local.end]);
    }

    let mut labels: BTreeMap<u32, Label> = BTreeMap::new();
    for position in positions {
        if position > code_length {
            return Err(malformed(position as usize, "label is past the end of the code"));
        }
        labels
            .entry(position)
            .or_insert_with(|| visitor.new_label());
    }
    let label = |position: u32| {
        labels
            .get(&position)
            .copied()
            .ok_or_else(|| malformed(position as usize, "missing label"))
    };

    visitor.visit_code()?;
    for handler in handlers {
        visitor.visit_try_catch_block(
            label(handler.start)?,
            label(handler.end)?,
            label(handler.handler)?,
            handler.catch_type.as_deref(),
        )?;
    }

    let mut pending = labels.iter().peekable();
    for (position, instruction) in instructions {
        while let Some((&label_position, &label)) = pending.peek() {
            if label_position > *position {
                break;
            }
            if label_position < *position {
                return Err(malformed(
                    label_position as usize,
                    "label falls inside an instruction",
                ));
            }
            visitor.visit_label(label)?;
            pending.next();
        }

        match instruction {
            Instruction::Insn(opcode) => visitor.visit_insn(*opcode)?,
            Instruction::Int(opcode, operand) => visitor.visit_int_insn(*opcode, *operand)?,
            Instruction::Var(opcode, var) => visitor.visit_var_insn(*opcode, *var)?,
            Instruction::Iinc(var, increment) => visitor.visit_iinc_insn(*var, *increment)?,
            Instruction::Type(opcode, class) => visitor.visit_type_insn(*opcode, class)?,
            Instruction::Field {
                opcode,
                owner,
                name,
                descriptor,
            } => visitor.visit_field_insn(*opcode, owner, name, descriptor)?,
            Instruction::Method {
                opcode,
                owner,
                name,
                descriptor,
                is_interface,
            } => visitor.visit_method_insn(*opcode, owner, name, descriptor, *is_interface)?,
            Instruction::InvokeDynamic {
                name,
                descriptor,
                bootstrap,
                arguments,
            } => visitor.visit_invoke_dynamic_insn(name, descriptor, bootstrap, arguments)?,
            Instruction::Jump(opcode, target) => visitor.visit_jump_insn(*opcode, label(*target)?)?,
            Instruction::Ldc(constant) => visitor.visit_ldc_insn(constant)?,
            Instruction::TableSwitch {
                low,
                high,
                default,
                targets,
            } => {
                let targets = targets
                    .iter()
                    .map(|target| label(*target))
                    .collect::<Result<Vec<_>, Error>>()?;
                visitor.visit_table_switch_insn(*low, *high, label(*default)?, &targets)?
            }
            Instruction::LookupSwitch {
                default,
                keys,
                targets,
            } => {
                let targets = targets
                    .iter()
                    .map(|target| label(*target))
                    .collect::<Result<Vec<_>, Error>>()?;
                visitor.visit_lookup_switch_insn(label(*default)?, keys, &targets)?
            }
            Instruction::MultiANewArray(descriptor, dimensions) => {
                visitor.visit_multi_anew_array_insn(descriptor, *dimensions)?
            }
        }
    }
    for (&label_position, &label) in pending {
        if label_position != code_length {
            return Err(malformed(
                label_position as usize,
                "label falls inside an instruction",
            ));
        }
        visitor.visit_label(label)?;
    }

    for (position, line) in line_numbers {
        visitor.visit_line_number(*line, label(*position)?)?;
    }
    for local in local_variables {
        visitor.visit_local_variable(
            &local.name,
            &local.descriptor,
            local.signature.as_deref(),
            label(local.start)?,
            label(local.end)?,
            local.index,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::HandleKind;

    // `opcodes` only names the ends of the implicit-var ranges
    const ALOAD_0: u8 = 42;

    #[test]
    fn short_and_wide_forms() {
        let pool = ConstantPool::new();
        let code = [
            ALOAD_0, 40, LSTORE, 7, WIDE, ISTORE, 1, 0, WIDE, IINC, 0, 3, 0xFF, 0xFE, IINC, 1, 0xFF,
            BIPUSH, 0x80, NEWARRAY, 10, RETURN,
        ];
        assert_eq!(
            decode(&code, &pool).unwrap(),
            vec![
                (0, Instruction::Var(ALOAD, 0)),
                (1, Instruction::Var(DLOAD, 2)),
                (2, Instruction::Var(LSTORE, 7)),
                (4, Instruction::Var(ISTORE, 256)),
                (8, Instruction::Iinc(3, -2)),
                (14, Instruction::Iinc(1, -1)),
                (17, Instruction::Int(BIPUSH, -128)),
                (19, Instruction::Int(NEWARRAY, 10)),
                (21, Instruction::Insn(RETURN)),
            ]
        );
    }

    #[test]
    fn constants_come_back_from_the_pool() {
        let mut pool = ConstantPool::new();
        let string = pool.string("hello").unwrap();
        let field = pool.field_ref("Test", "count", "I").unwrap();
        let method = pool
            .method_ref("java/util/List", "size", "()I", true)
            .unwrap();
        let handle = Handle {
            kind: HandleKind::InvokeStatic,
            owner: String::from("Bootstrap"),
            name: String::from("make"),
            descriptor: String::from("()V"),
            is_interface: false,
        };
        let arguments = [LoadableConstant::Integer(3)];
        let call_site = pool
            .invoke_dynamic("run", "()Ljava/lang/Runnable;", &handle, &arguments)
            .unwrap();

        let mut code = vec![LDC_W];
        code.extend_from_slice(&string.0 .0.to_be_bytes());
        code.push(GETSTATIC);
        code.extend_from_slice(&field.0 .0.to_be_bytes());
        code.push(INVOKEINTERFACE);
        code.extend_from_slice(&method.0 .0.to_be_bytes());
        code.extend_from_slice(&[1, 0, INVOKEDYNAMIC]);
        code.extend_from_slice(&call_site.0 .0.to_be_bytes());
        code.extend_from_slice(&[0, 0]);

        let decoded = decode(&code, &pool).unwrap();
        assert_eq!(
            decoded[0].1,
            Instruction::Ldc(LoadableConstant::String(String::from("hello")))
        );
        assert!(matches!(
            &decoded[1].1,
            Instruction::Field { opcode: GETSTATIC, name, .. } if name == "count"
        ));
        assert!(matches!(
            &decoded[2].1,
            Instruction::Method { is_interface: true, name, .. } if name == "size"
        ));
        assert_eq!(
            decoded[3],
            (
                11,
                Instruction::InvokeDynamic {
                    name: String::from("run"),
                    descriptor: String::from("()Ljava/lang/Runnable;"),
                    bootstrap: handle,
                    arguments: arguments.to_vec(),
                }
            )
        );
    }

    #[test]
    fn switch_targets_are_absolute() {
        let pool = ConstantPool::new();
        let mut code = vec![NOP, TABLESWITCH, 0, 0];
        for word in [23i32, 0, 1, 23, 24] {
            code.extend_from_slice(&word.to_be_bytes());
        }
        code.extend_from_slice(&[RETURN, RETURN]);
        let decoded = decode(&code, &pool).unwrap();
        assert_eq!(
            decoded[1],
            (
                1,
                Instruction::TableSwitch {
                    low: 0,
                    high: 1,
                    default: 24,
                    targets: vec![24, 25],
                }
            )
        );
        assert_eq!(decoded.len(), 4);
    }

    #[test]
    fn bad_code_is_rejected() {
        let pool = ConstantPool::new();
        let marked = [oversized_marker(GOTO), 0x80, 0x00];
        assert!(matches!(
            decode(&marked, &pool),
            Err(Error::MalformedCode { offset: 0, .. })
        ));
        assert!(matches!(
            decode(&[GOTO, 0x00, 0x10], &pool),
            Err(Error::MalformedCode { offset: 0, .. })
        ));
        assert!(matches!(
            decode(&[NOP, SIPUSH, 1], &pool),
            Err(Error::MalformedCode { offset: 1, .. })
        ));
    }
}
