use crate::jvm::class_file::{Attribute, AttributeLike, BootstrapMethod, BootstrapMethods};
use crate::jvm::hierarchy::{common_super_class, ClassHierarchy};
use crate::jvm::{Error, Serialize};
use crate::util::Width;
use byteorder::WriteBytesExt;
use std::result::Result;

/// Class file constants pool builder
///
/// The pool is append only: entries are encoded into the pool's byte buffer as soon as they are
/// interned, and the buffer is copied verbatim into the class file at the very end. Interning is
/// idempotent - structurally equal constants always come back with the same index. Deduplication
/// goes through a hash table of our own (chained buckets over an arena of entries) since the same
/// table also serves two kinds of rows that never reach the pool:
///
///   - the bootstrap method table (entries of the `BootstrapMethods` attribute), deduplicated by
///     their encoded bytes
///   - the type table used when computing frames: plain class names, uninitialized object types
///     (class name plus offset of the `new`), and memoized results of merging two types
///
/// Type table indices live in their own index space, so they never collide with pool indices.
pub struct ConstantPool {
    /// Encoded pool entries (without the leading count)
    bytes: Vec<u8>,

    /// Next free pool index (this is also the `constant_pool_count` of the class file)
    next_index: u16,

    /// Hash table buckets, pointing to the head of a chain in `entries`
    buckets: Vec<Option<usize>>,

    /// Every interned row
    entries: Vec<PoolEntry>,

    /// Arena index of the row at each pool index (`None` for index 0 and second halves of wide
    /// constants)
    by_index: Vec<Option<usize>>,

    /// Rows of the bootstrap method table
    bootstrap_methods: Vec<BootstrapEntry>,

    /// Rows of the type table
    types: Vec<TypeRow>,
}

struct PoolEntry {
    symbol: Symbol,
    hash: u32,

    /// Pool index, bootstrap table index, or type table index depending on the symbol
    index: u32,

    /// Next entry in the same bucket
    next: Option<usize>,
}

const INITIAL_BUCKETS: usize = 256;

impl ConstantPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantPool {
        ConstantPool {
            bytes: vec![],
            next_index: 1,
            buckets: vec![None; INITIAL_BUCKETS],
            entries: vec![],
            by_index: vec![None],
            bootstrap_methods: vec![],
            types: vec![],
        }
    }

    /// Value of the `constant_pool_count` field (one more than the largest index)
    pub fn count(&self) -> u16 {
        self.next_index
    }

    /// Encoded pool entries
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Look up what is stored at a pool index
    pub fn symbol(&self, index: u16) -> Option<&Symbol> {
        self.by_index
            .get(index as usize)
            .copied()
            .flatten()
            .map(|entry| &self.entries[entry].symbol)
    }

    /// Look up a row of the bootstrap method table
    pub fn bootstrap_method_entry(&self, index: u16) -> Option<&BootstrapEntry> {
        self.bootstrap_methods.get(index as usize)
    }

    pub fn bootstrap_method_count(&self) -> usize {
        self.bootstrap_methods.len()
    }

    fn find(&self, symbol: &Symbol, hash: u32) -> Option<u32> {
        let mut cursor = self.buckets[hash as usize % self.buckets.len()];
        while let Some(entry_idx) = cursor {
            let entry = &self.entries[entry_idx];
            if entry.hash == hash && entry.symbol == *symbol {
                return Some(entry.index);
            }
            cursor = entry.next;
        }
        None
    }

    /// Chain a new row into its bucket, growing and rehashing the table when it gets too full
    fn insert(&mut self, symbol: Symbol, hash: u32, index: u32) -> usize {
        if (self.entries.len() + 1) * 4 > self.buckets.len() * 3 {
            let new_len = self.buckets.len() * 2 + 1;
            log::trace!("Rehashing constant pool table into {} buckets", new_len);
            let mut buckets = vec![None; new_len];
            for (entry_idx, entry) in self.entries.iter_mut().enumerate() {
                let bucket = entry.hash as usize % new_len;
                entry.next = buckets[bucket];
                buckets[bucket] = Some(entry_idx);
            }
            self.buckets = buckets;
        }

        let entry_idx = self.entries.len();
        let bucket = hash as usize % self.buckets.len();
        self.entries.push(PoolEntry {
            symbol,
            hash,
            index,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(entry_idx);
        entry_idx
    }

    /// Find a pool row or append it, using `make_constant` to build the encoded entry
    fn intern(
        &mut self,
        symbol: Symbol,
        make_constant: impl FnOnce(&mut Self) -> Result<Constant, Error>,
    ) -> Result<ConstantIndex, Error> {
        let hash = symbol.hash();
        if let Some(index) = self.find(&symbol, hash) {
            return Ok(ConstantIndex(index as u16));
        }

        // Referenced constants get interned first (and so get smaller indices)
        let constant = make_constant(self)?;
        let index = self.push_constant(&constant)?;
        let entry_idx = self.insert(symbol, hash, index.0 as u32);
        self.by_index[index.0 as usize] = Some(entry_idx);
        Ok(index)
    }

    /// Append an encoded constant, provided there is space for it
    ///
    /// Note: the largest valid count is 65535, indexing starts at 1, and some constants take two
    /// spaces.
    fn push_constant(&mut self, constant: &Constant) -> Result<ConstantIndex, Error> {
        let offset = self.next_index;
        let width = constant.width();
        if offset as usize + width > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow {
                constant: format!("{:?}", constant),
                offset: offset as usize,
            });
        }

        constant.serialize(&mut self.bytes)?;
        self.next_index += width as u16;
        self.by_index.resize(self.next_index as usize, None);
        Ok(ConstantIndex(offset))
    }

    /// Get or insert a utf8 constant
    pub fn utf8(&mut self, utf8: &str) -> Result<Utf8ConstantIndex, Error> {
        let symbol = Symbol::Utf8(utf8.to_owned());
        self.intern(symbol, |_| {
            let encoded_len = encode_modified_utf8(utf8).len();
            if encoded_len > u16::MAX as usize {
                let msg = format!("string constant is {} bytes long once encoded", encoded_len);
                return Err(Error::InvalidArgument(msg));
            }
            Ok(Constant::Utf8(utf8.to_owned()))
        })
        .map(Utf8ConstantIndex)
    }

    /// Get or insert a class constant
    ///
    /// Use the internal name (`java/lang/String`) for classes and interfaces, but the descriptor
    /// (`[Ljava/lang/String;`) for array types.
    pub fn class(&mut self, name: &str) -> Result<ClassConstantIndex, Error> {
        let symbol = Symbol::Class(name.to_owned());
        self.intern(symbol, |pool| Ok(Constant::Class(pool.utf8(name)?)))
            .map(ClassConstantIndex)
    }

    /// Get or insert a string constant
    pub fn string(&mut self, string: &str) -> Result<StringConstantIndex, Error> {
        let symbol = Symbol::String(string.to_owned());
        self.intern(symbol, |pool| Ok(Constant::String(pool.utf8(string)?)))
            .map(StringConstantIndex)
    }

    pub fn integer(&mut self, integer: i32) -> Result<ConstantIndex, Error> {
        self.intern(Symbol::Integer(integer), |_| Ok(Constant::Integer(integer)))
    }

    /// Floats are compared by bit pattern (so `NaN`s deduplicate and `-0.0 != 0.0`)
    pub fn float(&mut self, float: f32) -> Result<ConstantIndex, Error> {
        self.intern(Symbol::Float(float.to_bits()), |_| Ok(Constant::Float(float)))
    }

    pub fn long(&mut self, long: i64) -> Result<ConstantIndex, Error> {
        self.intern(Symbol::Long(long), |_| Ok(Constant::Long(long)))
    }

    pub fn double(&mut self, double: f64) -> Result<ConstantIndex, Error> {
        self.intern(Symbol::Double(double.to_bits()), |_| {
            Ok(Constant::Double(double))
        })
    }

    /// Get or insert a name & type constant
    pub fn name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<NameAndTypeConstantIndex, Error> {
        let symbol = Symbol::NameAndType {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        };
        self.intern(symbol, |pool| {
            Ok(Constant::NameAndType {
                name: pool.utf8(name)?,
                descriptor: pool.utf8(descriptor)?,
            })
        })
        .map(NameAndTypeConstantIndex)
    }

    /// Get or insert a `CONSTANT_Fieldref_info`
    pub fn field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<FieldRefConstantIndex, Error> {
        let symbol = Symbol::FieldRef(MemberRef::new(owner, name, descriptor));
        self.intern(symbol, |pool| {
            let class = pool.class(owner)?;
            let name_and_type = pool.name_and_type(name, descriptor)?;
            Ok(Constant::FieldRef(class, name_and_type))
        })
        .map(FieldRefConstantIndex)
    }

    /// Get or insert a `CONSTANT_Methodref_info` or `CONSTANT_InterfaceMethodref_info`
    pub fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<MethodRefConstantIndex, Error> {
        let member = MemberRef::new(owner, name, descriptor);
        let symbol = if is_interface {
            Symbol::InterfaceMethodRef(member)
        } else {
            Symbol::MethodRef(member)
        };
        self.intern(symbol, |pool| {
            let class = pool.class(owner)?;
            let name_and_type = pool.name_and_type(name, descriptor)?;
            Ok(Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            })
        })
        .map(MethodRefConstantIndex)
    }

    /// Get or insert a method type constant
    pub fn method_type(&mut self, descriptor: &str) -> Result<ConstantIndex, Error> {
        let symbol = Symbol::MethodType(descriptor.to_owned());
        self.intern(symbol, |pool| {
            Ok(Constant::MethodType {
                descriptor: pool.utf8(descriptor)?,
            })
        })
    }

    /// Get or insert a method handle constant
    pub fn method_handle(&mut self, handle: &Handle) -> Result<ConstantIndex, Error> {
        let symbol = Symbol::MethodHandle(handle.clone());
        self.intern(symbol, |pool| {
            let member: ConstantIndex = if handle.kind.is_field_access() {
                pool.field_ref(&handle.owner, &handle.name, &handle.descriptor)?
                    .into()
            } else {
                pool.method_ref(
                    &handle.owner,
                    &handle.name,
                    &handle.descriptor,
                    handle.is_interface,
                )?
                .into()
            };
            Ok(Constant::MethodHandle {
                handle_kind: handle.kind,
                member,
            })
        })
    }

    /// Get or insert a constant which can be loaded with `ldc` (or used as a bootstrap argument)
    pub fn loadable(&mut self, constant: &LoadableConstant) -> Result<ConstantIndex, Error> {
        match constant {
            LoadableConstant::Integer(integer) => self.integer(*integer),
            LoadableConstant::Float(float) => self.float(*float),
            LoadableConstant::Long(long) => self.long(*long),
            LoadableConstant::Double(double) => self.double(*double),
            LoadableConstant::String(string) => self.string(string).map(Into::into),
            LoadableConstant::Class(class) => self.class(class).map(Into::into),
            LoadableConstant::MethodType(descriptor) => self.method_type(descriptor),
            LoadableConstant::MethodHandle(handle) => self.method_handle(handle),
        }
    }

    /// Get or insert a row in the bootstrap method table, returning its index in that table
    ///
    /// Rows are deduplicated on their encoded bytes, so call sites with equal bootstrap methods and
    /// equal arguments share one row.
    pub fn bootstrap_method(
        &mut self,
        handle: &Handle,
        arguments: &[LoadableConstant],
    ) -> Result<u16, Error> {
        let method_handle = self.method_handle(handle)?;
        let argument_indices = arguments
            .iter()
            .map(|argument| self.loadable(argument))
            .collect::<Result<Vec<ConstantIndex>, Error>>()?;
        let row = BootstrapMethod {
            bootstrap_method: method_handle,
            bootstrap_arguments: argument_indices,
        };

        let symbol = Symbol::BootstrapMethod(row.to_bytes()?);
        let hash = symbol.hash();
        if let Some(index) = self.find(&symbol, hash) {
            return Ok(index as u16);
        }
        if self.bootstrap_methods.len() >= u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow {
                constant: String::from("bootstrap method"),
                offset: self.bootstrap_methods.len(),
            });
        }
        let index = self.bootstrap_methods.len() as u16;
        self.bootstrap_methods.push(BootstrapEntry {
            row,
            handle: handle.clone(),
            arguments: arguments.to_vec(),
        });
        self.insert(symbol, hash, index as u32);
        Ok(index)
    }

    /// Get or insert an invoke dynamic constant (and the bootstrap row it points to)
    pub fn invoke_dynamic(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap_handle: &Handle,
        bootstrap_arguments: &[LoadableConstant],
    ) -> Result<InvokeDynamicConstantIndex, Error> {
        let bootstrap_method = self.bootstrap_method(bootstrap_handle, bootstrap_arguments)?;
        let symbol = Symbol::InvokeDynamic {
            bootstrap_method,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        };
        self.intern(symbol, |pool| {
            Ok(Constant::InvokeDynamic {
                bootstrap_method,
                method_descriptor: pool.name_and_type(name, descriptor)?,
            })
        })
        .map(InvokeDynamicConstantIndex)
    }

    /// The `BootstrapMethods` attribute, if any call site needed it
    pub fn bootstrap_methods_attribute(&mut self) -> Result<Option<Attribute>, Error> {
        if self.bootstrap_methods.is_empty() {
            return Ok(None);
        }
        let rows = self
            .bootstrap_methods
            .iter()
            .map(|entry| entry.row.clone())
            .collect();
        self.get_attribute(BootstrapMethods(rows)).map(Some)
    }

    /// Add an attribute to the constant pool
    pub fn get_attribute<A: AttributeLike>(&mut self, attribute: A) -> Result<Attribute, Error> {
        let name_index = self.utf8(A::NAME)?;
        let info = attribute.to_bytes()?;
        Ok(Attribute { name_index, info })
    }

    fn add_type_row(&mut self, symbol: Symbol, row: TypeRow) -> TypeIndex {
        let hash = symbol.hash();
        if let Some(index) = self.find(&symbol, hash) {
            return TypeIndex(index);
        }
        let index = self.types.len() as u32;
        self.types.push(row);
        self.insert(symbol, hash, index);
        TypeIndex(index)
    }

    /// Get or insert a type table row for a class (internal name)
    pub fn add_type(&mut self, name: &str) -> TypeIndex {
        let symbol = Symbol::NormalType(name.to_owned());
        self.add_type_row(symbol, TypeRow::Normal(name.to_owned()))
    }

    /// Get or insert a type table row for an object created by the `new` at `offset`
    pub fn add_uninitialized_type(&mut self, name: &str, offset: u32) -> TypeIndex {
        let symbol = Symbol::UninitializedType {
            name: name.to_owned(),
            offset,
        };
        let row = TypeRow::Uninitialized {
            name: name.to_owned(),
            offset,
        };
        self.add_type_row(symbol, row)
    }

    /// Type table row for the common super class of two classes
    ///
    /// Results are memoized in the table, keyed on the unordered pair, so the hierarchy is asked
    /// at most once per pair.
    pub fn merged_type(
        &mut self,
        type1: TypeIndex,
        type2: TypeIndex,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<TypeIndex, Error> {
        let (low, high) = if type1 <= type2 {
            (type1, type2)
        } else {
            (type2, type1)
        };
        let symbol = Symbol::MergedType(low.0, high.0);
        let hash = symbol.hash();
        if let Some(result) = self.find(&symbol, hash) {
            return Ok(TypeIndex(result));
        }

        let common = common_super_class(hierarchy, self.type_name(low), self.type_name(high))?;
        log::trace!(
            "Merged {} and {} into {}",
            self.type_name(low),
            self.type_name(high),
            common
        );
        let result = self.add_type(&common);
        self.insert(symbol, hash, result.0);
        Ok(result)
    }

    /// Look up a row of the type table
    pub fn type_row(&self, index: TypeIndex) -> &TypeRow {
        &self.types[index.0 as usize]
    }

    /// Class name behind a type table row
    pub fn type_name(&self, index: TypeIndex) -> &str {
        match self.type_row(index) {
            TypeRow::Normal(name) => name,
            TypeRow::Uninitialized { name, .. } => name,
        }
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        ConstantPool::new()
    }
}

/// Index into the type table (disjoint from pool indices)
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TypeIndex(pub u32);

/// Row of the type table
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TypeRow {
    /// Class or interface, by internal name
    Normal(String),

    /// Object created by the `new` instruction at `offset`, not yet initialized
    Uninitialized { name: String, offset: u32 },
}

/// Row of the bootstrap method table, along with the values it was built from
#[derive(Clone, Debug)]
pub struct BootstrapEntry {
    pub row: BootstrapMethod,
    pub handle: Handle,
    pub arguments: Vec<LoadableConstant>,
}

/// Owner, name, and descriptor of a field or method
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    fn new(owner: &str, name: &str, descriptor: &str) -> MemberRef {
        MemberRef {
            owner: owner.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }
}

/// Key identifying a row of the pool (or of the bootstrap and type tables)
///
/// Floating point payloads are stored as bit patterns.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Symbol {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(String),
    String(String),
    MethodType(String),
    NameAndType {
        name: String,
        descriptor: String,
    },
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    MethodHandle(Handle),
    InvokeDynamic {
        bootstrap_method: u16,
        name: String,
        descriptor: String,
    },
    BootstrapMethod(Vec<u8>),
    NormalType(String),
    UninitializedType {
        name: String,
        offset: u32,
    },
    MergedType(u32, u32),
}

impl Symbol {
    /// Kind-specific hash
    ///
    /// This is FNV-1a over a kind byte followed by the payload, so a `Utf8` and a `Class` with the
    /// same text land in different buckets.
    fn hash(&self) -> u32 {
        let hasher = Fnv1a::new();
        match self {
            Symbol::Utf8(text) => hasher.tag(1).text(text),
            Symbol::Integer(int) => hasher.tag(3).bytes(&int.to_be_bytes()),
            Symbol::Float(bits) => hasher.tag(4).bytes(&bits.to_be_bytes()),
            Symbol::Long(long) => hasher.tag(5).bytes(&long.to_be_bytes()),
            Symbol::Double(bits) => hasher.tag(6).bytes(&bits.to_be_bytes()),
            Symbol::Class(name) => hasher.tag(7).text(name),
            Symbol::String(text) => hasher.tag(8).text(text),
            Symbol::FieldRef(member) => hasher.tag(9).member(member),
            Symbol::MethodRef(member) => hasher.tag(10).member(member),
            Symbol::InterfaceMethodRef(member) => hasher.tag(11).member(member),
            Symbol::NameAndType { name, descriptor } => hasher.tag(12).text(name).text(descriptor),
            Symbol::MethodHandle(handle) => hasher
                .tag(15)
                .tag(handle.kind.tag())
                .text(&handle.owner)
                .text(&handle.name)
                .text(&handle.descriptor),
            Symbol::MethodType(descriptor) => hasher.tag(16).text(descriptor),
            Symbol::InvokeDynamic {
                bootstrap_method,
                name,
                descriptor,
            } => hasher
                .tag(18)
                .bytes(&bootstrap_method.to_be_bytes())
                .text(name)
                .text(descriptor),
            Symbol::BootstrapMethod(bytes) => hasher.tag(64).bytes(bytes),
            Symbol::NormalType(name) => hasher.tag(65).text(name),
            Symbol::UninitializedType { name, offset } => {
                hasher.tag(66).text(name).bytes(&offset.to_be_bytes())
            }
            Symbol::MergedType(low, high) => hasher
                .tag(67)
                .bytes(&low.to_be_bytes())
                .bytes(&high.to_be_bytes()),
        }
        .finish()
    }
}

struct Fnv1a(u32);

impl Fnv1a {
    fn new() -> Fnv1a {
        Fnv1a(0x811c_9dc5)
    }

    fn tag(self, tag: u8) -> Fnv1a {
        Fnv1a((self.0 ^ tag as u32).wrapping_mul(0x0100_0193))
    }

    fn bytes(self, bytes: &[u8]) -> Fnv1a {
        bytes.iter().fold(self, |hasher, byte| hasher.tag(*byte))
    }

    /// Strings are terminated so that `("ab", "c")` and `("a", "bc")` hash differently
    fn text(self, text: &str) -> Fnv1a {
        self.bytes(text.as_bytes()).tag(0xFF)
    }

    fn member(self, member: &MemberRef) -> Fnv1a {
        self.text(&member.owner)
            .text(&member.name)
            .text(&member.descriptor)
    }

    fn finish(self) -> u32 {
        self.0 & 0x7FFF_FFFF
    }
}

/// Constants that can be pushed with `ldc` or passed as bootstrap method arguments
#[derive(Clone, PartialEq, Debug)]
pub enum LoadableConstant {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),

    /// Internal name of a class, or descriptor of an array type
    Class(String),

    /// Method descriptor
    MethodType(String),
    MethodHandle(Handle),
}

impl LoadableConstant {
    /// Does this constant need `ldc2_w`?
    pub fn is_wide(&self) -> bool {
        matches!(self, LoadableConstant::Long(_) | LoadableConstant::Double(_))
    }
}

/// Method handle, as used in `ldc` and bootstrap methods
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    pub kind: HandleKind,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub is_interface: bool,
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone)]
pub enum Constant {
    /// Class or an interface
    Class(Utf8ConstantIndex),

    /// Field
    FieldRef(ClassConstantIndex, NameAndTypeConstantIndex),

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    },

    /// Constant object of type `java.lang.String`
    String(Utf8ConstantIndex),

    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),

    /// Name and a type (eg. for a field or a method)
    NameAndType {
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    },

    /// Constant raw string value (encoded as modified UTF-8)
    Utf8(String),

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle {
        handle_kind: HandleKind,

        /// `FieldRef` for field accesses, `MethodRef` for the rest
        member: ConstantIndex,
    },

    MethodType {
        descriptor: Utf8ConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        method_descriptor: NameAndTypeConstantIndex,
    },
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(float) => {
                4u8.serialize(writer)?;
                float.to_bits().serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(double) => {
                6u8.serialize(writer)?;
                double.to_bits().serialize(writer)?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(utf8) => {
                8u8.serialize(writer)?;
                utf8.serialize(writer)?;
            }
            Constant::FieldRef(class, name_and_type) => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if *is_interface { 11u8 } else { 10u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                15u8.serialize(writer)?;
                handle_kind.tag().serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                method_descriptor,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                method_descriptor.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u0000` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = Vec::with_capacity(string.len());
    let mut units = [0u16; 2];
    for c in string.chars() {
        // Supplementary characters become two surrogates of 3 bytes each
        for unit in c.encode_utf16(&mut units).iter().map(|unit| *unit as u32) {
            match unit {
                0x0001..=0x007F => buffer.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    buffer.push(0b1100_0000 | (unit >> 6 & 0x1F) as u8);
                    buffer.push(0b1000_0000 | (unit & 0x3F) as u8);
                }
                _ => {
                    buffer.push(0b1110_0000 | (unit >> 12 & 0x0F) as u8);
                    buffer.push(0b1000_0000 | (unit >> 6 & 0x3F) as u8);
                    buffer.push(0b1000_0000 | (unit & 0x3F) as u8);
                }
            }
        }
    }
    buffer
}

/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`:
///
/// > All 8-byte constants take up two entries in the constant_pool table of the class file. If a
/// > CONSTANT_Long_info or CONSTANT_Double_info structure is the item in the constant_pool table
/// > at index n, then the next usable item in the pool is located at index n+2.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct ConstantIndex(pub u16);

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

macro_rules! typed_constant_indices {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
            pub struct $name(pub ConstantIndex);

            impl From<$name> for ConstantIndex {
                fn from(index: $name) -> ConstantIndex {
                    index.0
                }
            }

            impl Serialize for $name {
                fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
                    self.0.serialize(writer)
                }
            }
        )*
    };
}

typed_constant_indices! {
    /// Index of a `CONSTANT_Utf8_info`
    Utf8ConstantIndex,
    StringConstantIndex,
    NameAndTypeConstantIndex,
    /// Index of a `CONSTANT_Class_info`
    ClassConstantIndex,
    FieldRefConstantIndex,
    /// Index of a `CONSTANT_Methodref_info` or `CONSTANT_InterfaceMethodref_info`
    MethodRefConstantIndex,
    InvokeDynamicConstantIndex,
}

/// Type of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-5.html#jvms-5.4.3.5-220
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub const ALL: [HandleKind; 9] = [
        HandleKind::GetField,
        HandleKind::GetStatic,
        HandleKind::PutField,
        HandleKind::PutStatic,
        HandleKind::InvokeVirtual,
        HandleKind::InvokeStatic,
        HandleKind::InvokeSpecial,
        HandleKind::NewInvokeSpecial,
        HandleKind::InvokeInterface,
    ];

    /// `reference_kind` byte in `CONSTANT_MethodHandle_info`
    pub fn tag(&self) -> u8 {
        match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<HandleKind> {
        HandleKind::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// Does the handle refer to a field (as opposed to a method)?
    pub fn is_field_access(&self) -> bool {
        matches!(
            self,
            HandleKind::GetField
                | HandleKind::GetStatic
                | HandleKind::PutField
                | HandleKind::PutStatic
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::StaticClassHierarchy;

    #[test]
    fn interning_is_idempotent() {
        let mut pool = ConstantPool::new();
        let a = pool.utf8("hello").unwrap();
        let b = pool.utf8("world").unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.utf8("hello").unwrap(), a);

        let string1 = pool.string("hello").unwrap();
        let string2 = pool.string("hello").unwrap();
        assert_eq!(string1, string2);
        assert_ne!(ConstantIndex::from(string1), ConstantIndex::from(a));

        let field1 = pool.field_ref("Foo", "x", "I").unwrap();
        let field2 = pool.field_ref("Foo", "x", "I").unwrap();
        let field3 = pool.field_ref("Foo", "x", "J").unwrap();
        assert_eq!(field1, field2);
        assert_ne!(field1, field3);
    }

    #[test]
    fn method_and_interface_refs_are_distinct() {
        let mut pool = ConstantPool::new();
        let method = pool.method_ref("Foo", "run", "()V", false).unwrap();
        let interface = pool.method_ref("Foo", "run", "()V", true).unwrap();
        assert_ne!(method, interface);
        assert!(matches!(
            pool.symbol(interface.0 .0),
            Some(Symbol::InterfaceMethodRef(_))
        ));
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long = pool.long(1234567890123).unwrap();
        let next = pool.integer(42).unwrap();
        assert_eq!(next.0, long.0 + 2);
        assert_eq!(pool.symbol(long.0), Some(&Symbol::Long(1234567890123)));
        assert_eq!(pool.symbol(long.0 + 1), None);

        let double = pool.double(0.5).unwrap();
        assert_eq!(pool.count(), double.0 + 2);
    }

    #[test]
    fn floats_compare_by_bits() {
        let mut pool = ConstantPool::new();
        let nan1 = pool.float(f32::NAN).unwrap();
        let nan2 = pool.float(f32::NAN).unwrap();
        assert_eq!(nan1, nan2);
        let zero = pool.float(0.0).unwrap();
        let negative_zero = pool.float(-0.0).unwrap();
        assert_ne!(zero, negative_zero);
    }

    #[test]
    fn encoded_entries() {
        let mut pool = ConstantPool::new();
        let class = pool.class("Foo").unwrap();
        assert_eq!(class.0 .0, 2);
        assert_eq!(pool.bytes(), &[1, 0, 3, b'F', b'o', b'o', 7, 0, 1]);
        pool.integer(-1).unwrap();
        assert_eq!(&pool.bytes()[9..], &[3, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn table_growth_keeps_everything_findable() {
        let mut pool = ConstantPool::new();
        let indices: Vec<ConstantIndex> = (0..2000).map(|i| pool.integer(i).unwrap()).collect();
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(pool.integer(i as i32).unwrap(), *index);
        }
        assert_eq!(pool.count(), 2001);
    }

    #[test]
    fn pool_overflow_is_reported() {
        let mut pool = ConstantPool::new();
        for i in 0..65534 {
            pool.integer(i).unwrap();
        }
        assert_eq!(pool.count(), 65535);
        assert!(matches!(
            pool.integer(-1),
            Err(Error::ConstantPoolOverflow { .. })
        ));
        assert!(pool.integer(7).is_ok());
    }

    #[test]
    fn bootstrap_rows_are_shared() {
        let mut pool = ConstantPool::new();
        let bootstrap = Handle {
            kind: HandleKind::InvokeStatic,
            owner: String::from("Boot"),
            name: String::from("bsm"),
            descriptor: String::from(
                "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;I)Ljava/lang/invoke/CallSite;",
            ),
            is_interface: false,
        };
        let args = [LoadableConstant::Integer(7)];
        let site1 = pool.invoke_dynamic("a", "()V", &bootstrap, &args).unwrap();
        let site2 = pool.invoke_dynamic("b", "()I", &bootstrap, &args).unwrap();
        let site3 = pool
            .invoke_dynamic("a", "()V", &bootstrap, &[LoadableConstant::Integer(8)])
            .unwrap();
        assert_ne!(site1, site2);
        assert_ne!(site1, site3);
        assert_eq!(pool.bootstrap_method_count(), 2);
        assert_eq!(
            pool.invoke_dynamic("a", "()V", &bootstrap, &args).unwrap(),
            site1
        );
    }

    #[test]
    fn type_table_is_separate() {
        let mut pool = ConstantPool::new();
        let count_before = pool.count();
        let object = pool.add_type("java/lang/Object");
        let string = pool.add_type("java/lang/String");
        let uninit = pool.add_uninitialized_type("java/lang/String", 4);
        assert_eq!(pool.add_type("java/lang/Object"), object);
        assert_ne!(object, string);
        assert_ne!(uninit, string);
        assert_eq!(pool.count(), count_before);
        assert_eq!(
            pool.type_row(uninit),
            &TypeRow::Uninitialized {
                name: String::from("java/lang/String"),
                offset: 4
            }
        );
    }

    #[test]
    fn merged_types_are_memoized() {
        let mut pool = ConstantPool::new();
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let string = pool.add_type("java/lang/String");
        let integer = pool.add_type("java/lang/Integer");
        let merged = pool.merged_type(string, integer, &hierarchy).unwrap();
        assert_eq!(pool.type_name(merged), "java/lang/Object");
        assert_eq!(pool.merged_type(integer, string, &hierarchy).unwrap(), merged);
    }

    #[test]
    fn containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
    }

    #[test]
    fn two_and_three_byte_encodings() {
        assert_eq!(encode_modified_utf8("ĄӒ"), vec![196, 132, 211, 146]);
        assert_eq!(encode_modified_utf8("अ"), vec![224, 164, 133]);
    }

    #[test]
    fn supplementary_characters() {
        assert_eq!(
            encode_modified_utf8("\u{10000}\u{10FFFF}"),
            vec![237, 160, 128, 237, 176, 128, 237, 175, 191, 237, 191, 191]
        );
    }
}
