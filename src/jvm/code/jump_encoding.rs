//! Widen jumps whose offsets outgrew their 16-bit encoding
//!
//! Most jump instructions carry a signed 16-bit offset. While a method is being written, offsets
//! to labels that are not placed yet cannot be known, so 16 bits are reserved and the offset gets
//! patched in later. When the patched offset does not fit, the jump opcode is replaced with a
//! marker (see [`oversized_marker`]) and the fix is deferred to the end of the method, where this
//! module rewrites the code in two passes.
//!
//! ### Deciding what grows
//!
//! The first pass only records insertions, as pairs of (position just after the instruction,
//! number of bytes inserted there). Any position in the old code then maps to a position in the
//! new code by adding up the insertions before it. Growing one jump may push another jump out of
//! range, so the pass is repeated until no new jump needs to grow. Termination is guaranteed since
//! a jump is only ever grown once.
//!
//! `tableswitch` and `lookupswitch` complicate this: their padding depends on their position modulo
//! four, which is only known once every insertion is. Until then, they are given an
//! over-estimate of their padding (a sure upper bound, so jumps are never under-estimated), and a
//! final pass corrects every switch with an exact negative insertion.
//!
//! ### Rewriting
//!
//! The second pass copies the code, remapping every offset. `goto` and `jsr` simply turn into
//! `goto_w` and `jsr_w` (growing by 2 bytes), while conditional jumps, which have no wide form,
//! are inverted to jump over an unconditional wide jump (growing by 5 bytes):
//!
//! ```text,ignore,no_run
//!     if* L2               ifnot* L1
//! L1: ...         =>       goto_w L2
//!     ...              L1: ...
//! L2: ...                  ...
//!                      L2: ...
//! ```

use crate::jvm::binary_format::{read_i16_at, read_i32_at, read_u16_at};
use crate::jvm::opcodes::*;
use crate::jvm::Error;

/// Bytes inserted into the code, keyed by the old position they are inserted at
#[derive(Default, Debug)]
pub(crate) struct Insertions {
    /// Old position (just after the instruction that grew or shrank) and size of the insertion
    entries: Vec<(u32, i32)>,
}

impl Insertions {
    /// Offset from `begin` to `end` in the new code, given both as positions in the old code
    pub fn new_offset(&self, begin: u32, end: u32) -> i64 {
        let mut offset = end as i64 - begin as i64;
        for &(index, size) in &self.entries {
            if begin < index && index <= end {
                offset += size as i64;
            } else if end < index && index <= begin {
                offset -= size as i64;
            }
        }
        offset
    }

    /// Position in the new code of a position in the old code
    pub fn new_position(&self, position: u32) -> u32 {
        self.new_offset(0, position) as u32
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of widening the jumps of a method
pub(crate) struct Resized {
    pub code: Vec<u8>,
    pub insertions: Insertions,
}

fn malformed(offset: usize, reason: &str) -> Error {
    Error::MalformedCode {
        offset,
        reason: reason.to_owned(),
    }
}

fn check_bounds(code: &[u8], offset: usize, needed: usize) -> Result<(), Error> {
    if offset + needed > code.len() {
        Err(malformed(offset, "instruction runs past the end of the code"))
    } else {
        Ok(())
    }
}

/// Position of the first switch operand (after the padding)
fn switch_operands(position: usize) -> usize {
    position + 4 - (position & 3)
}

/// Length of the non-jump, non-switch instruction at `position`
fn fixed_length(code: &[u8], position: usize, shape: InsnShape) -> Result<usize, Error> {
    let length = match shape {
        InsnShape::NoArg | InsnShape::ImplicitVar => 1,
        InsnShape::Var | InsnShape::Byte | InsnShape::Ldc => 2,
        InsnShape::Short
        | InsnShape::LdcWide
        | InsnShape::FieldOrMethod
        | InsnShape::Type
        | InsnShape::Iinc => 3,
        InsnShape::InterfaceMethod | InsnShape::InvokeDynamic => 5,
        InsnShape::MultiANewArray => 4,
        InsnShape::Wide => {
            check_bounds(code, position, 2)?;
            if code[position + 1] == IINC {
                6
            } else {
                4
            }
        }
        _ => return Err(malformed(position, "unexpected instruction shape")),
    };
    check_bounds(code, position, length)?;
    Ok(length)
}

/// Decode the opcode and absolute target of a 16-bit jump (possibly a marked oversized one)
fn short_jump(code: &[u8], position: usize) -> Result<(u8, u32), Error> {
    check_bounds(code, position, 3)?;
    let opcode = code[position];
    if SHAPES[opcode as usize] == InsnShape::OversizedJump {
        let target = position as i64 + read_u16_at(code, position + 1) as i64;
        Ok((unmark_oversized(opcode), target as u32))
    } else {
        let target = position as i64 + read_i16_at(code, position + 1) as i64;
        if target < 0 {
            return Err(malformed(position, "jump before the start of the code"));
        }
        Ok((opcode, target as u32))
    }
}

fn wide_target(code: &[u8], position: usize, offset_at: usize) -> Result<u32, Error> {
    check_bounds(code, offset_at, 4)?;
    let target = position as i64 + read_i32_at(code, offset_at) as i64;
    if target < 0 {
        return Err(malformed(position, "jump before the start of the code"));
    }
    Ok(target as u32)
}

/// Number of 4-byte words after the switch padding (including the default offset)
fn switch_words(code: &[u8], position: usize, opcode: u8) -> Result<usize, Error> {
    let operands = switch_operands(position);
    check_bounds(code, operands, 12)?;
    let words = if opcode == TABLESWITCH {
        let low = read_i32_at(code, operands + 4) as i64;
        let high = read_i32_at(code, operands + 8) as i64;
        if high < low {
            return Err(malformed(position, "tableswitch with high below low"));
        }
        3 + (high - low + 1) as usize
    } else {
        let pairs = read_i32_at(code, operands + 4);
        if pairs < 0 {
            return Err(malformed(position, "lookupswitch with a negative count"));
        }
        2 + 2 * pairs as usize
    };
    check_bounds(code, operands, 4 * words)?;
    Ok(words)
}

/// Work out which instructions need to grow (and switches to be re-padded)
fn plan_insertions(code: &[u8]) -> Result<(Insertions, Vec<bool>), Error> {
    let mut insertions = Insertions::default();
    let mut resized = vec![false; code.len()];

    // 3: something grew in the last pass, 2: one more pass to double check, 1: exact switch
    // padding pass, 0: done
    let mut state = 3;
    let mut passes = 0;
    while state != 0 {
        if state == 3 {
            state = 2;
        }
        passes += 1;
        let mut position = 0;
        while position < code.len() {
            let opcode = code[position];
            let mut insert = 0;
            match SHAPES[opcode as usize] {
                InsnShape::Jump | InsnShape::OversizedJump => {
                    let (opcode, target) = short_jump(code, position)?;
                    let new_offset = insertions.new_offset(position as u32, target);
                    if !resized[position]
                        && (new_offset < i16::MIN as i64 || new_offset > i16::MAX as i64)
                    {
                        insert = if opcode == GOTO || opcode == JSR { 2 } else { 5 };
                        resized[position] = true;
                    }
                    position += 3;
                }
                InsnShape::WideJump => {
                    check_bounds(code, position, 5)?;
                    position += 5;
                }
                InsnShape::TableSwitch | InsnShape::LookupSwitch => {
                    if state == 1 {
                        let new_position = insertions.new_offset(0, position as u32);
                        insert = -((new_position & 3) as i32);
                    } else if !resized[position] {
                        insert = (position & 3) as i32;
                        resized[position] = true;
                    }
                    let words = switch_words(code, position, opcode)?;
                    position = switch_operands(position) + 4 * words;
                }
                InsnShape::Invalid => return Err(malformed(position, "invalid opcode")),
                shape => position += fixed_length(code, position, shape)?,
            }
            if insert != 0 {
                insertions.entries.push((position as u32, insert));
                if insert > 0 {
                    state = 3;
                }
            }
        }
        if state < 3 {
            state -= 1;
        }
    }
    log::trace!(
        "Planned {} insertions in {} passes",
        insertions.entries.len(),
        passes
    );
    Ok((insertions, resized))
}

fn put_u16(code: &mut Vec<u8>, value: u16) {
    code.extend_from_slice(&value.to_be_bytes());
}

fn put_i32(code: &mut Vec<u8>, value: i32) {
    code.extend_from_slice(&value.to_be_bytes());
}

/// Rewrite `code`, widening every jump whose offset does not fit in 16 bits
///
/// The returned insertions map old positions into new ones, for everything else in the method
/// that refers to code positions.
pub(crate) fn widen_oversized_jumps(code: &[u8]) -> Result<Resized, Error> {
    let (insertions, resized) = plan_insertions(code)?;

    let mut new_code = Vec::with_capacity(code.len() + 8);
    let mut position = 0;
    while position < code.len() {
        let opcode = code[position];
        match SHAPES[opcode as usize] {
            InsnShape::Jump | InsnShape::OversizedJump => {
                let (opcode, target) = short_jump(code, position)?;
                let mut new_offset = insertions.new_offset(position as u32, target);
                if resized[position] {
                    if opcode == GOTO {
                        new_code.push(GOTO_W);
                    } else if opcode == JSR {
                        new_code.push(JSR_W);
                    } else {
                        new_code.push(invert_condition(opcode));
                        put_u16(&mut new_code, 8);
                        new_code.push(GOTO_W);
                        new_offset -= 3;
                    }
                    put_i32(&mut new_code, new_offset as i32);
                } else {
                    new_code.push(opcode);
                    put_u16(&mut new_code, new_offset as i16 as u16);
                }
                position += 3;
            }
            InsnShape::WideJump => {
                let target = wide_target(code, position, position + 1)?;
                new_code.push(opcode);
                put_i32(
                    &mut new_code,
                    insertions.new_offset(position as u32, target) as i32,
                );
                position += 5;
            }
            InsnShape::TableSwitch | InsnShape::LookupSwitch => {
                let words = switch_words(code, position, opcode)?;
                let operands = switch_operands(position);
                new_code.push(opcode);
                while new_code.len() % 4 != 0 {
                    new_code.push(0);
                }

                let remap = |new_code: &mut Vec<u8>, at: usize| -> Result<(), Error> {
                    let target = wide_target(code, position, at)?;
                    let new_offset = insertions.new_offset(position as u32, target);
                    put_i32(new_code, new_offset as i32);
                    Ok(())
                };
                remap(&mut new_code, operands)?;
                if opcode == TABLESWITCH {
                    new_code.extend_from_slice(&code[operands + 4..operands + 12]);
                    for word in 3..words {
                        remap(&mut new_code, operands + 4 * word)?;
                    }
                } else {
                    new_code.extend_from_slice(&code[operands + 4..operands + 8]);
                    for pair in 0..(words - 2) / 2 {
                        let key = operands + 8 + 8 * pair;
                        new_code.extend_from_slice(&code[key..key + 4]);
                        remap(&mut new_code, key + 4)?;
                    }
                }
                position = operands + 4 * words;
            }
            InsnShape::Invalid => return Err(malformed(position, "invalid opcode")),
            shape => {
                let length = fixed_length(code, position, shape)?;
                new_code.extend_from_slice(&code[position..position + length]);
                position += length;
            }
        }
    }

    log::debug!(
        "Widened jumps: code grew from {} to {} bytes",
        code.len(),
        new_code.len()
    );
    Ok(Resized {
        code: new_code,
        insertions,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn short_jump_bytes(opcode: u8, offset: i16) -> Vec<u8> {
        let mut bytes = vec![opcode];
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes
    }

    #[test]
    fn nothing_to_do() {
        let mut code = short_jump_bytes(GOTO, 4);
        code.push(NOP);
        code.push(RETURN);
        let resized = widen_oversized_jumps(&code).unwrap();
        assert_eq!(resized.code, code);
        assert!(resized.insertions.is_empty());
    }

    #[test]
    fn oversized_conditional_jump() {
        // ifeq (marked) jumping 40000 bytes forward, over nops
        let mut code = vec![ICONST_0, oversized_marker(IFEQ)];
        code.extend_from_slice(&40000u16.to_be_bytes());
        code.resize(1 + 40000, NOP);
        code.push(RETURN);

        let resized = widen_oversized_jumps(&code).unwrap();
        assert_eq!(resized.code.len(), code.len() + 5);
        assert_eq!(&resized.code[..4], &[ICONST_0, IFNE, 0, 8]);
        assert_eq!(resized.code[4], GOTO_W);
        assert_eq!(read_i32_at(&resized.code, 5), 40000 + 5 - 3);

        // Target of the jump lands on the `return`
        let target = 4 + read_i32_at(&resized.code, 5) as usize;
        assert_eq!(resized.code[target], RETURN);
        assert_eq!(resized.insertions.new_position(4), 9);
        assert_eq!(resized.insertions.new_position(1), 1);
    }

    #[test]
    fn oversized_goto_and_switch_padding() {
        // goto (marked) over a tableswitch that needs re-padding once the goto grows
        let mut code = vec![oversized_marker(GOTO)];
        code.extend_from_slice(&40000u16.to_be_bytes());
        code.push(ICONST_0);
        code.push(TABLESWITCH); // at 4, so 3 bytes of padding
        code.extend_from_slice(&[0, 0, 0]);
        code.extend_from_slice(&20i32.to_be_bytes()); // default
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&0i32.to_be_bytes()); // high
        code.extend_from_slice(&20i32.to_be_bytes());
        assert_eq!(code.len(), 24);
        code.resize(40000, NOP);
        code.push(RETURN);

        let resized = widen_oversized_jumps(&code).unwrap();
        let new_code = &resized.code;
        assert_eq!(new_code[0], GOTO_W);
        assert_eq!(new_code[5], ICONST_0);
        assert_eq!(new_code[6], TABLESWITCH);

        // Switch at 6 needs one byte of padding instead of three
        assert_eq!(read_i32_at(new_code, 8), 18);
        assert_eq!(read_i32_at(new_code, 20), 18);
        assert_eq!(new_code.len(), code.len());
        assert_eq!(new_code[read_i32_at(new_code, 1) as usize], RETURN);
        assert_eq!(new_code[6 + read_i32_at(new_code, 8) as usize], NOP);
        assert_eq!(resized.insertions.new_position(24), 24);
    }

    #[test]
    fn backward_offsets_shrink() {
        let insertions = Insertions {
            entries: vec![(10, 5), (20, 2)],
        };
        assert_eq!(insertions.new_offset(25, 5), -27);
        assert_eq!(insertions.new_offset(5, 25), 27);
        assert_eq!(insertions.new_offset(12, 18), 6);
        assert_eq!(insertions.new_position(10), 15);
    }

    #[test]
    fn truncated_code_is_rejected() {
        assert!(matches!(
            widen_oversized_jumps(&[GOTO, 0]),
            Err(Error::MalformedCode { offset: 0, .. })
        ));
    }
}
