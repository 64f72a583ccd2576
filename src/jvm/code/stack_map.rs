use crate::jvm::class_file::{StackMapFrame, VerificationType};
use crate::jvm::Error;

/// Accumulates the frames of a `StackMapTable`, each encoded relative to the one before it
///
/// Frames are added in increasing offset order. Computed frames arrive fully expanded and get
/// compressed into the smallest of the five frame kinds that can express the difference with the
/// previous frame. Frames supplied by a caller arrive already compressed and are only re-based to
/// the right offset delta.
#[derive(Debug, Default)]
pub(crate) struct StackMapBuilder {
    frames: Vec<StackMapFrame>,

    /// Offset of the last frame added (`None` before the first explicit frame)
    previous_offset: Option<u32>,

    /// Locals of the last frame added (the implicit frame of the entry block to start with)
    previous_locals: Vec<VerificationType>,
}

impl StackMapBuilder {
    /// Start from the implicit frame at offset 0 (described by the method's parameters)
    pub fn new(initial_locals: Vec<VerificationType>) -> StackMapBuilder {
        StackMapBuilder {
            frames: vec![],
            previous_offset: None,
            previous_locals: initial_locals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Offset delta for a frame at `offset`, or `None` if it is not past the previous frame
    fn offset_delta(&self, offset: u32) -> Option<u16> {
        let delta = match self.previous_offset {
            None => offset as i64,
            Some(previous) => offset as i64 - previous as i64 - 1,
        };
        if delta < 0 || delta > u16::MAX as i64 {
            None
        } else {
            Some(delta as u16)
        }
    }

    /// Add a fully expanded frame
    pub fn push_expanded(
        &mut self,
        offset: u32,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    ) -> Result<(), Error> {
        let offset_delta = self.offset_delta(offset).ok_or_else(|| {
            Error::InvalidArgument(format!("frame at offset {} is out of order", offset))
        })?;
        let previous_len = self.previous_locals.len();
        let shares_locals = |count: usize| {
            locals.len() >= count && locals[..count] == self.previous_locals[..count]
        };

        let frame = if stack.is_empty() && locals.len() < previous_len {
            let chopped_k = previous_len - locals.len();
            if chopped_k <= 3 && shares_locals(locals.len()) {
                Some(StackMapFrame::ChopLocalsNoStack {
                    offset_delta,
                    chopped_k: chopped_k as u8,
                })
            } else {
                None
            }
        } else if stack.is_empty() && locals.len() == previous_len {
            if shares_locals(previous_len) {
                Some(StackMapFrame::SameLocalsNoStack { offset_delta })
            } else {
                None
            }
        } else if stack.is_empty() {
            if locals.len() - previous_len <= 3 && shares_locals(previous_len) {
                Some(StackMapFrame::AppendLocalsNoStack {
                    offset_delta,
                    locals: locals[previous_len..].to_vec(),
                })
            } else {
                None
            }
        } else if stack.len() == 1 && locals.len() == previous_len && shares_locals(previous_len) {
            Some(StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack: stack[0],
            })
        } else {
            None
        };

        let frame = frame.unwrap_or_else(|| StackMapFrame::Full {
            offset_delta,
            locals: locals.clone(),
            stack,
        });
        self.frames.push(frame);
        self.previous_offset = Some(offset);
        self.previous_locals = locals;
        Ok(())
    }

    /// Add an already compressed frame
    ///
    /// The offset delta of `frame` is ignored and recomputed from `offset`. A `Same` frame that is
    /// not past the previous frame is dropped, but any other frame there is an error.
    pub fn push_compressed(&mut self, offset: u32, frame: StackMapFrame) -> Result<(), Error> {
        let offset_delta = match self.offset_delta(offset) {
            Some(offset_delta) => offset_delta,
            None if matches!(frame, StackMapFrame::SameLocalsNoStack { .. }) => {
                log::trace!("Dropping redundant frame at offset {}", offset);
                return Ok(());
            }
            None => {
                return Err(Error::InvalidArgument(format!(
                    "frame at offset {} is out of order",
                    offset
                )))
            }
        };
        let frame = match frame {
            StackMapFrame::SameLocalsNoStack { .. } => {
                StackMapFrame::SameLocalsNoStack { offset_delta }
            }
            StackMapFrame::SameLocalsOneStack { stack, .. } => StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack,
            },
            StackMapFrame::ChopLocalsNoStack { chopped_k, .. } => {
                StackMapFrame::ChopLocalsNoStack {
                    offset_delta,
                    chopped_k,
                }
            }
            StackMapFrame::AppendLocalsNoStack { locals, .. } => {
                StackMapFrame::AppendLocalsNoStack {
                    offset_delta,
                    locals,
                }
            }
            StackMapFrame::Full { locals, stack, .. } => StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            },
        };
        self.frames.push(frame);
        self.previous_offset = Some(offset);
        Ok(())
    }

    pub fn finish(self) -> Vec<StackMapFrame> {
        self.frames
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex};

    const INT: VerificationType = VerificationType::Integer;
    const LONG: VerificationType = VerificationType::Long;

    fn object(index: u16) -> VerificationType {
        VerificationType::Object(ClassConstantIndex(ConstantIndex(index)))
    }

    #[test]
    fn picks_the_smallest_kind() {
        let mut builder = StackMapBuilder::new(vec![object(1), INT]);
        builder.push_expanded(4, vec![object(1), INT], vec![]).unwrap();
        builder.push_expanded(9, vec![object(1), INT], vec![LONG]).unwrap();
        builder.push_expanded(12, vec![object(1), INT, INT, LONG], vec![]).unwrap();
        builder.push_expanded(20, vec![object(1)], vec![]).unwrap();
        builder.push_expanded(21, vec![object(2)], vec![]).unwrap();
        builder.push_expanded(30, vec![object(2)], vec![INT, INT]).unwrap();

        assert_eq!(
            builder.finish(),
            vec![
                StackMapFrame::SameLocalsNoStack { offset_delta: 4 },
                StackMapFrame::SameLocalsOneStack {
                    offset_delta: 4,
                    stack: LONG
                },
                StackMapFrame::AppendLocalsNoStack {
                    offset_delta: 2,
                    locals: vec![INT, LONG]
                },
                StackMapFrame::ChopLocalsNoStack {
                    offset_delta: 7,
                    chopped_k: 3
                },
                StackMapFrame::Full {
                    offset_delta: 0,
                    locals: vec![object(2)],
                    stack: vec![]
                },
                StackMapFrame::Full {
                    offset_delta: 8,
                    locals: vec![object(2)],
                    stack: vec![INT, INT]
                },
            ]
        );
    }

    #[test]
    fn chop_and_append_limits() {
        let mut builder = StackMapBuilder::new(vec![]);
        builder.push_expanded(0, vec![INT, INT, INT, INT], vec![]).unwrap();
        builder.push_expanded(1, vec![], vec![]).unwrap();
        let frames = builder.finish();
        assert!(matches!(frames[0], StackMapFrame::Full { offset_delta: 0, .. }));
        assert!(matches!(frames[1], StackMapFrame::Full { offset_delta: 0, .. }));
    }

    #[test]
    fn compressed_frames_are_rebased() {
        let mut builder = StackMapBuilder::new(vec![]);
        let same = StackMapFrame::SameLocalsNoStack { offset_delta: 0 };
        builder.push_compressed(5, same.clone()).unwrap();
        builder.push_compressed(5, same).unwrap();
        builder
            .push_compressed(
                9,
                StackMapFrame::ChopLocalsNoStack {
                    offset_delta: 0,
                    chopped_k: 1,
                },
            )
            .unwrap();
        assert!(builder
            .push_compressed(
                9,
                StackMapFrame::SameLocalsOneStack {
                    offset_delta: 0,
                    stack: INT
                }
            )
            .is_err());
        assert_eq!(
            builder.finish(),
            vec![
                StackMapFrame::SameLocalsNoStack { offset_delta: 5 },
                StackMapFrame::ChopLocalsNoStack {
                    offset_delta: 3,
                    chopped_k: 1
                },
            ]
        );
    }
}
