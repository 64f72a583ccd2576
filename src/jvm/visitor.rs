use crate::jvm::class_file::{Handle, LoadableConstant};
use crate::jvm::code::{ExplicitFrame, Label};
use crate::jvm::{
    ClassAccessFlags, Error, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags, Version,
};

/// Receiver of the events describing one class
///
/// Events must arrive in this order:
///
/// ```text,ignore,no_run
/// visit (visit_source | visit_signature | visit_nest_host | visit_nest_member
///        | visit_inner_class | visit_field | visit_method)* visit_end
/// ```
///
/// and the method visitor returned by `visit_method` must see its own `visit_end` before the next
/// event on the class.
pub trait ClassVisitor {
    fn visit(
        &mut self,
        version: Version,
        access_flags: ClassAccessFlags,
        name: &str,
        super_class: Option<&str>,
        interfaces: &[&str],
    ) -> Result<(), Error>;

    fn visit_source(&mut self, source_file: &str) -> Result<(), Error>;

    /// Generic signature of the class
    fn visit_signature(&mut self, signature: &str) -> Result<(), Error>;

    fn visit_nest_host(&mut self, host: &str) -> Result<(), Error>;

    fn visit_nest_member(&mut self, member: &str) -> Result<(), Error>;

    fn visit_inner_class(
        &mut self,
        name: &str,
        outer_name: Option<&str>,
        inner_name: Option<&str>,
        access_flags: InnerClassAccessFlags,
    ) -> Result<(), Error>;

    fn visit_field(
        &mut self,
        access_flags: FieldAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        constant_value: Option<&LoadableConstant>,
    ) -> Result<(), Error>;

    fn visit_method<'a>(
        &'a mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<Box<dyn MethodVisitor + 'a>, Error>;

    fn visit_end(&mut self) -> Result<(), Error>;
}

/// Receiver of the events describing one method
///
/// Events must arrive in this order:
///
/// ```text,ignore,no_run
/// (visit_code
///    (visit_frame | visit_*_insn | visit_label | visit_try_catch_block
///     | visit_local_variable | visit_line_number)*
///  visit_maxs)?
/// visit_end
/// ```
///
/// Labels come from `new_label` and are only meaningful to the visitor that made them.
pub trait MethodVisitor {
    fn new_label(&mut self) -> Label;

    fn visit_code(&mut self) -> Result<(), Error>;

    /// Stack map frame for the current position (ignored when frames are computed)
    fn visit_frame(&mut self, frame: ExplicitFrame) -> Result<(), Error>;

    /// Instruction without operands
    fn visit_insn(&mut self, opcode: u8) -> Result<(), Error>;

    /// `bipush`, `sipush`, or `newarray`
    fn visit_int_insn(&mut self, opcode: u8, operand: i32) -> Result<(), Error>;

    /// Local variable load or store, or `ret`
    fn visit_var_insn(&mut self, opcode: u8, var: u16) -> Result<(), Error>;

    /// `new`, `anewarray`, `checkcast`, or `instanceof`
    fn visit_type_insn(&mut self, opcode: u8, class: &str) -> Result<(), Error>;

    fn visit_field_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), Error>;

    fn visit_method_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<(), Error>;

    fn visit_invoke_dynamic_insn(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap: &Handle,
        arguments: &[LoadableConstant],
    ) -> Result<(), Error>;

    fn visit_jump_insn(&mut self, opcode: u8, label: Label) -> Result<(), Error>;

    /// Place a label at the current position
    fn visit_label(&mut self, label: Label) -> Result<(), Error>;

    fn visit_ldc_insn(&mut self, constant: &LoadableConstant) -> Result<(), Error>;

    fn visit_iinc_insn(&mut self, var: u16, increment: i16) -> Result<(), Error>;

    fn visit_table_switch_insn(
        &mut self,
        low: i32,
        high: i32,
        default: Label,
        labels: &[Label],
    ) -> Result<(), Error>;

    /// Keys must be sorted in increasing order
    fn visit_lookup_switch_insn(
        &mut self,
        default: Label,
        keys: &[i32],
        labels: &[Label],
    ) -> Result<(), Error>;

    fn visit_multi_anew_array_insn(&mut self, descriptor: &str, dimensions: u8)
        -> Result<(), Error>;

    /// Protect `[start, end)` with the handler at `handler` (`None` catches everything)
    fn visit_try_catch_block(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<(), Error>;

    fn visit_local_variable(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        start: Label,
        end: Label,
        index: u16,
    ) -> Result<(), Error>;

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<(), Error>;

    /// Close the code (the sizes are only used when nothing is computed)
    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<(), Error>;

    fn visit_end(&mut self) -> Result<(), Error>;
}
