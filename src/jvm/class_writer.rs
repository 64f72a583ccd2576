use crate::jvm::class_file::{
    ClassConstantIndex, ClassFile, ConstantPool, ConstantValue, Field, InnerClass, InnerClasses,
    LoadableConstant, Method, NestHost, NestMembers, Signature, SourceFile,
};
use crate::jvm::code::{ClassContext, Compute, MethodDeclaration, MethodWriter};
use crate::jvm::hierarchy::{ClassHierarchy, ClassInfo, StaticClassHierarchy, WithClass};
use crate::jvm::{
    ClassAccessFlags, ClassVisitor, Error, FieldAccessFlags, FieldType, InnerClassAccessFlags,
    MethodAccessFlags, MethodVisitor, ParseDescriptor, Serialize, Version,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Fresh,
    Open,
    Ended,
}

/// Builds one class file from [`ClassVisitor`] events
///
/// The writer owns the constant pool for the class. Each method gets its own [`MethodWriter`],
/// which borrows the pool (and the rest of the class context) until it is done, so methods are
/// written one at a time.
///
/// ```
/// use classasm::jvm::*;
///
/// let mut class = ClassWriter::new(Compute::Frames);
/// class.visit(
///     Version::JAVA8,
///     ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
///     "Answer",
///     Some("java/lang/Object"),
///     &[],
/// )?;
///
/// let mut method = class.method(
///     MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
///     "get",
///     "()I",
///     None,
///     &[],
/// )?;
/// method.visit_code()?;
/// method.visit_int_insn(opcodes::BIPUSH, 42)?;
/// method.visit_insn(opcodes::IRETURN)?;
/// method.visit_maxs(0, 0)?;
/// method.visit_end()?;
///
/// class.visit_end()?;
/// let bytes = class.into_bytes()?;
/// assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
/// # Ok::<(), Error>(())
/// ```
pub struct ClassWriter {
    compute: Compute,
    hierarchy: Box<dyn ClassHierarchy>,
    pool: ConstantPool,
    state: State,

    version: Version,
    access_flags: ClassAccessFlags,
    name: String,

    /// What the hierarchy should know about the class being written
    info: ClassInfo,

    this_class: Option<ClassConstantIndex>,
    super_class: Option<ClassConstantIndex>,
    interfaces: Vec<ClassConstantIndex>,
    fields: Vec<Field>,
    methods: Vec<Method>,

    source_file: Option<String>,
    signature: Option<String>,
    nest_host: Option<String>,
    nest_members: Vec<String>,
    inner_classes: Vec<InnerClass>,
}

impl ClassWriter {
    /// Class writer resolving common super classes against the core `java.lang` types only
    pub fn new(compute: Compute) -> ClassWriter {
        ClassWriter::with_hierarchy(compute, Box::new(StaticClassHierarchy::with_java_lang()))
    }

    pub fn with_hierarchy(compute: Compute, hierarchy: Box<dyn ClassHierarchy>) -> ClassWriter {
        ClassWriter {
            compute,
            hierarchy,
            pool: ConstantPool::new(),
            state: State::Fresh,
            version: Version::JAVA8,
            access_flags: ClassAccessFlags::empty(),
            name: String::new(),
            info: ClassInfo::class("java/lang/Object", &[]),
            this_class: None,
            super_class: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            source_file: None,
            signature: None,
            nest_host: None,
            nest_members: vec![],
            inner_classes: vec![],
        }
    }

    pub fn compute(&self) -> Compute {
        self.compute
    }

    /// Constant pool of the class (eg. to intern constants for custom attributes)
    pub fn constants(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    fn require(&self, state: State, event: &'static str) -> Result<(), Error> {
        if self.state == state {
            return Ok(());
        }
        let state = match self.state {
            State::Fresh => "before `visit`",
            State::Open => "after `visit`",
            State::Ended => "after `visit_end`",
        };
        Err(Error::InvalidState { event, state })
    }

    /// Start a method, returning the writer for its body
    ///
    /// The method is added to the class when the returned writer sees `visit_end`.
    pub fn method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<MethodWriter<'_>, Error> {
        self.require(State::Open, "visit_method")?;
        let declaration = MethodDeclaration {
            access_flags,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            signature: signature.map(String::from),
            exceptions: exceptions.iter().map(|name| String::from(*name)).collect(),
        };
        let context = ClassContext {
            pool: &mut self.pool,
            hierarchy: WithClass {
                base: &*self.hierarchy,
                name: &self.name,
                info: &self.info,
            },
            this_class: &self.name,
            version: self.version,
            methods: &mut self.methods,
        };
        MethodWriter::new(context, self.compute, declaration)
    }

    /// Assemble the class file (only once `visit_end` has been seen)
    pub fn into_class_file(mut self) -> Result<ClassFile, Error> {
        self.require(State::Ended, "into_class_file")?;
        let this_class = self.this_class.ok_or(Error::InvalidState {
            event: "into_class_file",
            state: "before `visit`",
        })?;

        let mut attributes = vec![];
        if let Some(source_file) = &self.source_file {
            let source_file = self.pool.utf8(source_file)?;
            attributes.push(self.pool.get_attribute(SourceFile(source_file))?);
        }
        if let Some(signature) = &self.signature {
            let signature = self.pool.utf8(signature)?;
            attributes.push(self.pool.get_attribute(Signature(signature))?);
        }
        if !self.inner_classes.is_empty() {
            let inner_classes = std::mem::take(&mut self.inner_classes);
            attributes.push(self.pool.get_attribute(InnerClasses(inner_classes))?);
        }
        if let Some(nest_host) = &self.nest_host {
            let nest_host = self.pool.class(nest_host)?;
            attributes.push(self.pool.get_attribute(NestHost(nest_host))?);
        }
        if !self.nest_members.is_empty() {
            let members = self
                .nest_members
                .iter()
                .map(|member| self.pool.class(member))
                .collect::<Result<Vec<_>, Error>>()?;
            attributes.push(self.pool.get_attribute(NestMembers(members))?);
        }
        if let Some(bootstrap_methods) = self.pool.bootstrap_methods_attribute()? {
            attributes.push(bootstrap_methods);
        }

        log::debug!(
            "Assembled `{}`: {} constants, {} fields, {} methods",
            self.name,
            self.pool.count(),
            self.fields.len(),
            self.methods.len()
        );
        Ok(ClassFile {
            version: self.version,
            constants_count: self.pool.count(),
            constants: self.pool.bytes().to_vec(),
            access_flags: self.access_flags,
            this_class,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields: self.fields,
            methods: self.methods,
            attributes,
        })
    }

    /// Assemble and serialize the class file
    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        Ok(self.into_class_file()?.to_bytes()?)
    }
}

impl ClassVisitor for ClassWriter {
    fn visit(
        &mut self,
        version: Version,
        access_flags: ClassAccessFlags,
        name: &str,
        super_class: Option<&str>,
        interfaces: &[&str],
    ) -> Result<(), Error> {
        self.require(State::Fresh, "visit")?;
        self.version = version;
        self.access_flags = access_flags;
        self.name = name.to_owned();
        self.info = ClassInfo {
            super_class: super_class.map(String::from),
            interfaces: interfaces.iter().map(|name| String::from(*name)).collect(),
            is_interface: access_flags.contains(ClassAccessFlags::INTERFACE),
        };

        self.this_class = Some(self.pool.class(name)?);
        self.super_class = match super_class {
            Some(super_class) => Some(self.pool.class(super_class)?),
            None => None,
        };
        for interface in interfaces {
            let interface = self.pool.class(interface)?;
            self.interfaces.push(interface);
        }
        self.state = State::Open;
        Ok(())
    }

    fn visit_source(&mut self, source_file: &str) -> Result<(), Error> {
        self.require(State::Open, "visit_source")?;
        self.source_file = Some(source_file.to_owned());
        Ok(())
    }

    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        self.require(State::Open, "visit_signature")?;
        self.signature = Some(signature.to_owned());
        Ok(())
    }

    fn visit_nest_host(&mut self, host: &str) -> Result<(), Error> {
        self.require(State::Open, "visit_nest_host")?;
        self.nest_host = Some(host.to_owned());
        Ok(())
    }

    fn visit_nest_member(&mut self, member: &str) -> Result<(), Error> {
        self.require(State::Open, "visit_nest_member")?;
        self.nest_members.push(member.to_owned());
        Ok(())
    }

    fn visit_inner_class(
        &mut self,
        name: &str,
        outer_name: Option<&str>,
        inner_name: Option<&str>,
        access_flags: InnerClassAccessFlags,
    ) -> Result<(), Error> {
        self.require(State::Open, "visit_inner_class")?;
        let inner_class = self.pool.class(name)?;
        let outer_class = match outer_name {
            Some(outer_name) => Some(self.pool.class(outer_name)?),
            None => None,
        };
        let inner_name = match inner_name {
            Some(inner_name) => Some(self.pool.utf8(inner_name)?),
            None => None,
        };
        self.inner_classes.push(InnerClass {
            inner_class,
            outer_class,
            inner_name,
            access_flags,
        });
        Ok(())
    }

    fn visit_field(
        &mut self,
        access_flags: FieldAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        constant_value: Option<&LoadableConstant>,
    ) -> Result<(), Error> {
        self.require(State::Open, "visit_field")?;
        FieldType::parse_descriptor(descriptor)?;

        let mut attributes = vec![];
        if let Some(constant_value) = constant_value {
            match constant_value {
                LoadableConstant::Integer(_)
                | LoadableConstant::Float(_)
                | LoadableConstant::Long(_)
                | LoadableConstant::Double(_)
                | LoadableConstant::String(_) => (),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "{:?} cannot be the constant value of field `{}`",
                        other, name
                    )))
                }
            }
            let index = self.pool.loadable(constant_value)?;
            attributes.push(self.pool.get_attribute(ConstantValue(index))?);
        }
        if let Some(signature) = signature {
            let signature = self.pool.utf8(signature)?;
            attributes.push(self.pool.get_attribute(Signature(signature))?);
        }

        self.fields.push(Field {
            access_flags,
            name_index: self.pool.utf8(name)?,
            descriptor_index: self.pool.utf8(descriptor)?,
            attributes,
        });
        Ok(())
    }

    fn visit_method<'a>(
        &'a mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<Box<dyn MethodVisitor + 'a>, Error> {
        let method = self.method(access_flags, name, descriptor, signature, exceptions)?;
        Ok(Box::new(method))
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.require(State::Open, "visit_end")?;
        self.state = State::Ended;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::opcodes::*;

    fn open(compute: Compute) -> ClassWriter {
        let mut class = ClassWriter::new(compute);
        class
            .visit(
                Version::JAVA8,
                ClassAccessFlags::PUBLIC,
                "Example",
                Some("java/lang/Object"),
                &["java/lang/Runnable"],
            )
            .unwrap();
        class
    }

    #[test]
    fn events_before_visit_are_rejected() {
        let mut class = ClassWriter::new(Compute::AsGiven);
        assert!(matches!(
            class.visit_source("Example.java"),
            Err(Error::InvalidState { event: "visit_source", .. })
        ));
        assert!(class
            .method(MethodAccessFlags::PUBLIC, "run", "()V", None, &[])
            .is_err());
    }

    #[test]
    fn unfinished_class_cannot_be_assembled() {
        let class = open(Compute::AsGiven);
        assert!(matches!(
            class.into_class_file(),
            Err(Error::InvalidState { event: "into_class_file", .. })
        ));
    }

    #[test]
    fn methods_are_added_on_visit_end() {
        let mut class = open(Compute::MaxStackAndLocals);
        {
            let mut method = class
                .method(MethodAccessFlags::PUBLIC, "run", "()V", None, &[])
                .unwrap();
            method.visit_code().unwrap();
            method.visit_insn(RETURN).unwrap();
            method.visit_maxs(0, 0).unwrap();
        }
        assert!(class.methods.is_empty());

        let mut method = class
            .method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
                "call",
                "()Ljava/lang/Object;",
                None,
                &["java/lang/Exception"],
            )
            .unwrap();
        method.visit_end().unwrap();
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].attributes.len(), 1);
    }

    #[test]
    fn field_constants_must_be_primitive_or_string() {
        let mut class = open(Compute::AsGiven);
        let flags = FieldAccessFlags::STATIC | FieldAccessFlags::FINAL;
        class
            .visit_field(flags, "MAX", "J", None, Some(&LoadableConstant::Long(1 << 40)))
            .unwrap();
        let bad = LoadableConstant::Class(String::from("java/lang/String"));
        assert!(matches!(
            class.visit_field(flags, "TYPE", "Ljava/lang/Class;", None, Some(&bad)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            class.visit_field(flags, "BROKEN", "Q", None, None),
            Err(Error::BadDescriptor { .. })
        ));
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.fields[0].attributes.len(), 1);
    }

    #[test]
    fn class_attributes_in_order() {
        let mut class = open(Compute::AsGiven);
        class.visit_source("Example.java").unwrap();
        class.visit_nest_member("Example$Inner").unwrap();
        class
            .visit_inner_class(
                "Example$Inner",
                Some("Example"),
                Some("Inner"),
                InnerClassAccessFlags::STATIC,
            )
            .unwrap();
        class.visit_end().unwrap();

        let class_file = class.into_class_file().unwrap();
        assert_eq!(class_file.attributes.len(), 3);
        assert_eq!(class_file.interfaces.len(), 1);
        assert!(class_file.super_class.is_some());
    }
}
