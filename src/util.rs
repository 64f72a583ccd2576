/// Elements with a width, measured in slots
///
/// Several places in class files count in slots rather than entries: `long` and `double`
/// constants take two constant pool indices, and `long` and `double` values take two local
/// variable (or operand stack) slots.
pub trait Width {
    fn width(&self) -> usize;
}
