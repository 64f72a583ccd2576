/// Entry of the exception table, before it is serialized
///
/// `L` is usually a [`Label`](crate::jvm::code::Label), but the range arithmetic only needs to know
/// where each one ended up, so it is kept generic.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Handler<L> {
    /// Start of the protected range (inclusive)
    pub start: L,

    /// End of the protected range (exclusive)
    pub end: L,

    /// Start of the handler code
    pub handler: L,

    /// Internal name of the class caught (`None` catches everything)
    pub catch_type: Option<String>,
}

/// Cut the range `[start, end)` out of every handler's protected range
///
/// An `end` of `None` means the end of the code. Handlers entirely covered by the range are
/// dropped, handlers overlapping one side of it are shortened, and handlers strictly containing it
/// are split in two around it. The relative order of handlers is preserved (with the two halves of
/// a split handler adjacent), since order decides which handler wins when ranges overlap.
pub fn remove<L: Copy>(
    handlers: Vec<Handler<L>>,
    start: L,
    end: Option<L>,
    position: impl Fn(L) -> u32,
) -> Vec<Handler<L>> {
    let removed_start = position(start);
    let removed_end = end.map_or(u32::MAX, &position);

    let mut kept = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let handler_start = position(handler.start);
        let handler_end = position(handler.end);
        if removed_start >= handler_end || removed_end <= handler_start {
            kept.push(handler);
            continue;
        }

        if removed_start <= handler_start {
            // Only the tail of the handler range survives (`end` is known since it is in range)
            if let (Some(end), true) = (end, removed_end < handler_end) {
                kept.push(Handler { start: end, ..handler });
            }
        } else if removed_end >= handler_end {
            kept.push(Handler { end: start, ..handler });
        } else if let Some(end) = end {
            kept.push(Handler {
                end: start,
                ..handler.clone()
            });
            kept.push(Handler { start: end, ..handler });
        }
    }
    kept
}

#[cfg(test)]
mod test {
    use super::*;

    fn handler(start: u32, end: u32, catch_type: Option<&str>) -> Handler<u32> {
        Handler {
            start,
            end,
            handler: 100,
            catch_type: catch_type.map(String::from),
        }
    }

    fn remove_range(handlers: Vec<Handler<u32>>, start: u32, end: Option<u32>) -> Vec<Handler<u32>> {
        remove(handlers, start, end, |position| position)
    }

    #[test]
    fn fully_covered_handlers_are_dropped() {
        let handlers = vec![handler(10, 20, None), handler(0, 5, None)];
        assert_eq!(
            remove_range(handlers, 8, Some(25)),
            vec![handler(0, 5, None)]
        );
    }

    #[test]
    fn overlapping_one_side() {
        let handlers = vec![handler(10, 20, None)];
        assert_eq!(
            remove_range(handlers.clone(), 5, Some(15)),
            vec![handler(15, 20, None)]
        );
        assert_eq!(
            remove_range(handlers.clone(), 15, Some(30)),
            vec![handler(10, 15, None)]
        );
        assert_eq!(remove_range(handlers, 15, None), vec![handler(10, 15, None)]);
    }

    #[test]
    fn middle_removal_splits() {
        let handlers = vec![
            handler(0, 4, Some("java/lang/Exception")),
            handler(10, 20, Some("java/lang/RuntimeException")),
            handler(30, 40, None),
        ];
        let split = remove_range(handlers, 12, Some(15));
        assert_eq!(
            split,
            vec![
                handler(0, 4, Some("java/lang/Exception")),
                handler(10, 12, Some("java/lang/RuntimeException")),
                handler(15, 20, Some("java/lang/RuntimeException")),
                handler(30, 40, None),
            ]
        );

        // The two halves and the hole make up the original range
        assert_eq!(split[1].end, 12);
        assert_eq!(split[2].start, 15);
    }

    #[test]
    fn disjoint_ranges_are_untouched() {
        let handlers = vec![handler(10, 20, None)];
        assert_eq!(
            remove_range(handlers.clone(), 20, Some(30)),
            handlers.clone()
        );
        assert_eq!(remove_range(handlers.clone(), 0, Some(10)), handlers);
    }
}
