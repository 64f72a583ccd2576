use crate::parser::{ClassDecl, FrameDecl, Insn, ItemDecl, Listing, MethodDecl, Statement};
use classasm::jvm::class_file::ClassFile;
use classasm::jvm::{
    ClassAccessFlags, ClassInfo, ClassVisitor, ClassWriter, Compute, Error, ExplicitFrame,
    FrameItem, Label, MethodVisitor, StaticClassHierarchy, Version,
};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("class `{class}`: {source}")]
    Class {
        class: String,
        #[source]
        source: Error,
    },

    #[error("method `{class}.{method}` (line {line}): {source}")]
    Method {
        class: String,
        method: String,
        line: usize,
        #[source]
        source: Error,
    },
}

/// Hierarchy knowing `java.lang`, every class in the listing, and everything it declares
pub fn hierarchy(listing: &Listing) -> StaticClassHierarchy {
    let mut hierarchy = StaticClassHierarchy::with_java_lang();
    for declared in &listing.hierarchy {
        hierarchy.insert(
            &declared.name,
            ClassInfo {
                super_class: declared.super_class.clone(),
                interfaces: declared.interfaces.clone(),
                is_interface: declared.is_interface,
            },
        );
    }
    for class in &listing.classes {
        hierarchy.insert(
            &class.name,
            ClassInfo {
                super_class: class.super_class.clone(),
                interfaces: class.interfaces.clone(),
                is_interface: class.access_flags.contains(ClassAccessFlags::INTERFACE),
            },
        );
    }
    hierarchy
}

/// Assemble one class into a finished class file
pub fn assemble(
    class: &ClassDecl,
    hierarchy: &StaticClassHierarchy,
    compute: Compute,
    version: Version,
) -> Result<ClassFile, AssembleError> {
    let in_class = |source: Error| AssembleError::Class {
        class: class.name.clone(),
        source,
    };

    let mut writer = ClassWriter::with_hierarchy(compute, Box::new(hierarchy.clone()));
    let interfaces: Vec<&str> = class.interfaces.iter().map(String::as_str).collect();
    writer
        .visit(
            version,
            class.access_flags,
            &class.name,
            class.super_class.as_deref(),
            &interfaces,
        )
        .map_err(in_class)?;
    if let Some(source_file) = &class.source_file {
        writer.visit_source(source_file).map_err(in_class)?;
    }
    if let Some(signature) = &class.signature {
        writer.visit_signature(signature).map_err(in_class)?;
    }
    if let Some(host) = &class.nest_host {
        writer.visit_nest_host(host).map_err(in_class)?;
    }
    for member in &class.nest_members {
        writer.visit_nest_member(member).map_err(in_class)?;
    }
    for field in &class.fields {
        writer
            .visit_field(
                field.access_flags,
                &field.name,
                &field.descriptor,
                None,
                field.constant_value.as_ref(),
            )
            .map_err(in_class)?;
    }

    for method in &class.methods {
        log::debug!("Assembling `{}.{}{}`", class.name, method.name, method.descriptor);
        emit_method(&mut writer, method).map_err(|source| AssembleError::Method {
            class: class.name.clone(),
            method: method.name.clone(),
            line: method.line,
            source,
        })?;
    }

    writer.visit_end().map_err(in_class)?;
    writer.into_class_file().map_err(in_class)
}

/// Labels by name, created the first time they are mentioned
struct Labels(HashMap<String, Label>);

impl Labels {
    fn get(&mut self, name: &str, method: &mut dyn MethodVisitor) -> Label {
        *self
            .0
            .entry(name.to_owned())
            .or_insert_with(|| method.new_label())
    }

    fn item(&mut self, item: &ItemDecl, method: &mut dyn MethodVisitor) -> FrameItem {
        match item {
            ItemDecl::Top => FrameItem::Top,
            ItemDecl::Integer => FrameItem::Integer,
            ItemDecl::Float => FrameItem::Float,
            ItemDecl::Long => FrameItem::Long,
            ItemDecl::Double => FrameItem::Double,
            ItemDecl::Null => FrameItem::Null,
            ItemDecl::UninitializedThis => FrameItem::UninitializedThis,
            ItemDecl::Object(class) => FrameItem::Object(class.clone()),
            ItemDecl::Uninitialized(label) => FrameItem::Uninitialized(self.get(label, method)),
        }
    }

    fn items(&mut self, items: &[ItemDecl], method: &mut dyn MethodVisitor) -> Vec<FrameItem> {
        items.iter().map(|item| self.item(item, method)).collect()
    }
}

fn emit_method(writer: &mut ClassWriter, decl: &MethodDecl) -> Result<(), Error> {
    let exceptions: Vec<&str> = decl.exceptions.iter().map(String::as_str).collect();
    let mut method = writer.visit_method(
        decl.access_flags,
        &decl.name,
        &decl.descriptor,
        None,
        &exceptions,
    )?;
    let method: &mut dyn MethodVisitor = &mut *method;

    // Abstract and native methods have no code
    if decl.body.is_empty() {
        return method.visit_end();
    }

    method.visit_code()?;
    let mut labels = Labels(HashMap::new());

    // Handlers go first so they are known before any of their labels are placed
    for statement in &decl.body {
        if let Statement::Catch {
            catch_type,
            start,
            end,
            handler,
        } = statement
        {
            let start = labels.get(start, method);
            let end = labels.get(end, method);
            let handler = labels.get(handler, method);
            method.visit_try_catch_block(start, end, handler, catch_type.as_deref())?;
        }
    }

    for statement in &decl.body {
        match statement {
            Statement::Label(name) => {
                let label = labels.get(name, method);
                method.visit_label(label)?;
            }
            Statement::Insn(insn) => emit_insn(method, &mut labels, insn)?,
            Statement::Catch { .. } => (),
            Statement::Line(line) => {
                let label = method.new_label();
                method.visit_label(label)?;
                method.visit_line_number(*line, label)?;
            }
            Statement::Var {
                index,
                name,
                descriptor,
                signature,
                start,
                end,
            } => {
                let start = labels.get(start, method);
                let end = labels.get(end, method);
                method.visit_local_variable(
                    name,
                    descriptor,
                    signature.as_deref(),
                    start,
                    end,
                    *index,
                )?;
            }
            Statement::Frame(frame) => {
                let frame = match frame {
                    FrameDecl::Same => ExplicitFrame::Same,
                    FrameDecl::Same1(item) => ExplicitFrame::Same1(labels.item(item, method)),
                    FrameDecl::Append(items) => ExplicitFrame::Append(labels.items(items, method)),
                    FrameDecl::Chop(count) => ExplicitFrame::Chop(*count),
                    FrameDecl::Full { locals, stack } => ExplicitFrame::Full {
                        locals: labels.items(locals, method),
                        stack: labels.items(stack, method),
                    },
                };
                method.visit_frame(frame)?;
            }
        }
    }

    method.visit_maxs(decl.max_stack.unwrap_or(0), decl.max_locals.unwrap_or(0))?;
    method.visit_end()
}

fn emit_insn(
    method: &mut dyn MethodVisitor,
    labels: &mut Labels,
    insn: &Insn,
) -> Result<(), Error> {
    match insn {
        Insn::Plain(opcode) => method.visit_insn(*opcode),
        Insn::Int(opcode, operand) => method.visit_int_insn(*opcode, *operand),
        Insn::Var(opcode, var) => method.visit_var_insn(*opcode, *var),
        Insn::Type(opcode, class) => method.visit_type_insn(*opcode, class),
        Insn::Field {
            opcode,
            owner,
            name,
            descriptor,
        } => method.visit_field_insn(*opcode, owner, name, descriptor),
        Insn::Method {
            opcode,
            owner,
            name,
            descriptor,
            is_interface,
        } => method.visit_method_insn(*opcode, owner, name, descriptor, *is_interface),
        Insn::InvokeDynamic {
            name,
            descriptor,
            bootstrap,
            arguments,
        } => method.visit_invoke_dynamic_insn(name, descriptor, bootstrap, arguments),
        Insn::Jump(opcode, target) => {
            let target = labels.get(target, method);
            method.visit_jump_insn(*opcode, target)
        }
        Insn::Ldc(constant) => method.visit_ldc_insn(constant),
        Insn::Iinc(var, increment) => method.visit_iinc_insn(*var, *increment),
        Insn::TableSwitch {
            low,
            targets,
            default,
        } => {
            let default = labels.get(default, method);
            let targets: Vec<Label> = targets
                .iter()
                .map(|target| labels.get(target, method))
                .collect();
            let high = *low + targets.len() as i32 - 1;
            method.visit_table_switch_insn(*low, high, default, &targets)
        }
        Insn::LookupSwitch {
            keys,
            targets,
            default,
        } => {
            let default = labels.get(default, method);
            let targets: Vec<Label> = targets
                .iter()
                .map(|target| labels.get(target, method))
                .collect();
            method.visit_lookup_switch_insn(default, keys, &targets)
        }
        Insn::MultiANewArray(descriptor, dimensions) => {
            method.visit_multi_anew_array_insn(descriptor, *dimensions)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::parse;
    use classasm::jvm::Serialize;

    fn assemble_one(source: &str, compute: Compute) -> Result<Vec<u8>, AssembleError> {
        let listing = parse(source).unwrap();
        let hierarchy = hierarchy(&listing);
        let class_file = assemble(&listing.classes[0], &hierarchy, compute, Version::JAVA8)?;
        Ok(class_file.to_bytes().unwrap())
    }

    #[test]
    fn assembles_a_class_file() {
        let bytes = assemble_one(
            ".class public Answer\n\
             .method public static get ()I\n\
             \x20   bipush 42\n\
             \x20   ireturn\n\
             .end method",
            Compute::Frames,
        )
        .unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(&bytes[6..8], &[0, 52]);
    }

    #[test]
    fn abstract_methods_have_no_code() {
        let bytes = assemble_one(
            ".class public abstract Shape\n\
             .method public abstract area ()D\n\
             .end method",
            Compute::Frames,
        )
        .unwrap();
        assert!(!bytes.windows(4).any(|window| window == b"Code"));
    }

    #[test]
    fn errors_name_the_method() {
        let err = assemble_one(
            ".class Broken\n\
             .method static loop ()V\n\
             \x20   goto nowhere\n\
             .end method",
            Compute::Frames,
        )
        .unwrap_err();
        match err {
            AssembleError::Method { method, line, .. } => {
                assert_eq!(method, "loop");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn listing_classes_join_the_hierarchy() {
        let listing = parse(
            ".hierarchy interface com/example/Service\n\
             .class Base\n\
             .class Derived extends Base implements com/example/Service",
        )
        .unwrap();
        let hierarchy = hierarchy(&listing);
        assert_eq!(hierarchy.len(), StaticClassHierarchy::with_java_lang().len() + 3);
    }
}
