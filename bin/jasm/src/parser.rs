//! Textual class listings
//!
//! A listing holds one or more classes. Directives start with a dot, labels end with a colon,
//! and `#` starts a comment running to the end of the line:
//!
//! ```text
//! .class public Hello
//! .source "Hello.java"
//!
//! .method public static main ([Ljava/lang/String;)V
//!     getstatic java/lang/System out Ljava/io/PrintStream;
//!     ldc "hello"
//!     invokevirtual java/io/PrintStream println (Ljava/lang/String;)V
//!     return
//! .end method
//! ```
//!
//! A class runs until the next `.class` (or the end of the listing). Instructions are written
//! with their usual mnemonics, but the assembler always picks the encoding: `iload_2`,
//! `iload 2`, and `wide iload 2` are the same thing, as are `ldc`, `ldc_w`, and `ldc2_w`.

use classasm::jvm::class_file::{Handle, HandleKind, LoadableConstant};
use classasm::jvm::opcodes::{self, InsnShape, SHAPES};
use classasm::jvm::{BaseType, ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

/// Super types of a class that is referenced but not defined in the listing
#[derive(Clone, PartialEq, Debug)]
pub struct HierarchyDecl {
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ClassDecl {
    pub access_flags: ClassAccessFlags,
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub signature: Option<String>,
    pub nest_host: Option<String>,
    pub nest_members: Vec<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct FieldDecl {
    pub access_flags: FieldAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub constant_value: Option<LoadableConstant>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MethodDecl {
    /// Line of the `.method` directive
    pub line: usize,
    pub access_flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub exceptions: Vec<String>,
    pub max_stack: Option<u16>,
    pub max_locals: Option<u16>,
    pub body: Vec<Statement>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Statement {
    Label(String),
    Insn(Insn),
    Catch {
        catch_type: Option<String>,
        start: String,
        end: String,
        handler: String,
    },
    Line(u16),
    Var {
        index: u16,
        name: String,
        descriptor: String,
        signature: Option<String>,
        start: String,
        end: String,
    },
    Frame(FrameDecl),
}

/// Instruction, with jump targets still referring to labels by name
#[derive(Clone, PartialEq, Debug)]
pub enum Insn {
    Plain(u8),
    Int(u8, i32),
    Var(u8, u16),
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
    Jump(u8, String),
    Ldc(LoadableConstant),
    Iinc(u16, i16),
    TableSwitch {
        low: i32,
        targets: Vec<String>,
        default: String,
    },
    LookupSwitch {
        keys: Vec<i32>,
        targets: Vec<String>,
        default: String,
    },
    MultiANewArray(String, u8),
}

#[derive(Clone, PartialEq, Debug)]
pub enum FrameDecl {
    Same,
    Same1(ItemDecl),
    Append(Vec<ItemDecl>),
    Chop(u8),
    Full {
        locals: Vec<ItemDecl>,
        stack: Vec<ItemDecl>,
    },
}

#[derive(Clone, PartialEq, Debug)]
pub enum ItemDecl {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),

    /// Result of the `new` at the named label
    Uninitialized(String),
}

/// Everything found in a listing
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Listing {
    pub hierarchy: Vec<HierarchyDecl>,
    pub classes: Vec<ClassDecl>,
}

#[derive(Clone, PartialEq, Debug)]
enum Token {
    Word(String),
    Quoted(String),
}

/// Split a line into words and quoted strings, dropping any comment
fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = vec![];
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '#' {
            break;
        } else if c == '"' {
            chars.next();
            let mut units: Vec<u16> = vec![];
            let mut buffer = [0; 2];
            loop {
                match chars.next() {
                    None => return Err(String::from("unterminated string")),
                    Some('"') => break,
                    Some('\\') => {
                        let escaped = match chars.next() {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some('r') => '\r',
                            Some('0') => '\0',
                            Some(c @ ('\\' | '"' | '\'')) => c,
                            Some('u') => {
                                let hex: String = chars.by_ref().take(4).collect();
                                let unit = u16::from_str_radix(&hex, 16)
                                    .ok()
                                    .filter(|_| hex.len() == 4)
                                    .ok_or_else(|| format!("bad unicode escape `\\u{}`", hex))?;
                                units.push(unit);
                                continue;
                            }
                            Some(other) => return Err(format!("unknown escape `\\{}`", other)),
                            None => return Err(String::from("unterminated string")),
                        };
                        units.extend_from_slice(escaped.encode_utf16(&mut buffer));
                    }
                    Some(c) => units.extend_from_slice(c.encode_utf16(&mut buffer)),
                }
            }
            let string = String::from_utf16(&units)
                .map_err(|_| String::from("string contains an unpaired surrogate"))?;
            tokens.push(Token::Quoted(string));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '#' || c == '"' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

struct Cursor<'t> {
    tokens: &'t [Token],
    position: usize,
}

impl<'t> Cursor<'t> {
    fn new(tokens: &'t [Token]) -> Cursor<'t> {
        Cursor {
            tokens,
            position: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn peek_word(&self) -> Option<&'t str> {
        match self.tokens.get(self.position) {
            Some(Token::Word(word)) => Some(word),
            _ => None,
        }
    }

    /// Consume the next token if it is exactly `keyword`
    fn keyword(&mut self, keyword: &str) -> bool {
        if self.peek_word() == Some(keyword) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, keyword: &str) -> Result<(), String> {
        if self.keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected `{}`", keyword))
        }
    }

    fn word(&mut self, what: &str) -> Result<&'t str, String> {
        match self.tokens.get(self.position) {
            Some(Token::Word(word)) => {
                self.position += 1;
                Ok(word)
            }
            Some(Token::Quoted(_)) => Err(format!("expected {} but found a string", what)),
            None => Err(format!("expected {}", what)),
        }
    }

    fn quoted(&mut self, what: &str) -> Result<&'t str, String> {
        match self.tokens.get(self.position) {
            Some(Token::Quoted(string)) => {
                self.position += 1;
                Ok(string)
            }
            _ => Err(format!("expected {} (as a quoted string)", what)),
        }
    }

    fn number<T: FromStr>(&mut self, what: &str) -> Result<T, String> {
        let word = self.word(what)?;
        word.parse()
            .map_err(|_| format!("`{}` is not a valid {}", word, what))
    }

    /// Words up to the end of the line
    fn rest(&mut self, what: &str) -> Result<Vec<String>, String> {
        let mut words = vec![];
        while !self.is_empty() {
            words.push(self.word(what)?.to_owned());
        }
        Ok(words)
    }

    fn finish(&self) -> Result<(), String> {
        match self.tokens.get(self.position) {
            None => Ok(()),
            Some(Token::Word(word)) => Err(format!("unexpected `{}`", word)),
            Some(Token::Quoted(string)) => Err(format!("unexpected string {:?}", string)),
        }
    }

    fn flags<F>(&mut self, from_keyword: impl Fn(&str) -> Option<F>) -> Vec<F> {
        let mut flags = vec![];
        while let Some(flag) = self.peek_word().and_then(&from_keyword) {
            flags.push(flag);
            self.position += 1;
        }
        flags
    }

    fn constant(&mut self) -> Result<LoadableConstant, String> {
        if let Some(Token::Quoted(string)) = self.tokens.get(self.position) {
            self.position += 1;
            return Ok(LoadableConstant::String(string.clone()));
        }
        let word = self.word("a constant")?;
        Ok(match word {
            "class" => LoadableConstant::Class(self.word("a class name")?.to_owned()),
            "methodtype" => {
                LoadableConstant::MethodType(self.word("a method descriptor")?.to_owned())
            }
            "handle" => LoadableConstant::MethodHandle(self.handle()?),
            number => parse_number(number)?,
        })
    }

    /// `kind [interface] owner name descriptor`
    fn handle(&mut self) -> Result<Handle, String> {
        let kind_name = self.word("a handle kind")?;
        let kind = handle_kind(kind_name)
            .ok_or_else(|| format!("`{}` is not a method handle kind", kind_name))?;
        let is_interface = self.keyword("interface") || kind == HandleKind::InvokeInterface;
        Ok(Handle {
            kind,
            owner: self.word("an owner class")?.to_owned(),
            name: self.word("a member name")?.to_owned(),
            descriptor: self.word("a descriptor")?.to_owned(),
            is_interface,
        })
    }

    fn item(&mut self) -> Result<ItemDecl, String> {
        Ok(match self.word("a frame item")? {
            "top" => ItemDecl::Top,
            "int" => ItemDecl::Integer,
            "float" => ItemDecl::Float,
            "long" => ItemDecl::Long,
            "double" => ItemDecl::Double,
            "null" => ItemDecl::Null,
            "uninitialized_this" => ItemDecl::UninitializedThis,
            "uninitialized" => ItemDecl::Uninitialized(self.word("a label")?.to_owned()),
            class => ItemDecl::Object(class.to_owned()),
        })
    }

    fn items(&mut self, until: Option<&str>) -> Result<Vec<ItemDecl>, String> {
        let mut items = vec![];
        while !self.is_empty() && (until.is_none() || self.peek_word() != until) {
            items.push(self.item()?);
        }
        Ok(items)
    }
}

fn handle_kind(name: &str) -> Option<HandleKind> {
    Some(match name {
        "getfield" => HandleKind::GetField,
        "getstatic" => HandleKind::GetStatic,
        "putfield" => HandleKind::PutField,
        "putstatic" => HandleKind::PutStatic,
        "invokevirtual" => HandleKind::InvokeVirtual,
        "invokestatic" => HandleKind::InvokeStatic,
        "invokespecial" => HandleKind::InvokeSpecial,
        "newinvokespecial" => HandleKind::NewInvokeSpecial,
        "invokeinterface" => HandleKind::InvokeInterface,
        _ => return None,
    })
}

/// Numeric literal: `10`, `10L`, `1.5f`, `1.5`, `1e3`, `2d`, `NaN`, or `-Infinity`
fn parse_number(word: &str) -> Result<LoadableConstant, String> {
    let invalid = || format!("`{}` is not a valid constant", word);
    let special = |body: &str| match body {
        "NaN" => Some(f64::NAN),
        "Infinity" | "+Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    };

    if let Some(value) = special(word) {
        return Ok(LoadableConstant::Double(value));
    }
    if let Some(body) = word.strip_suffix(|c| c == 'f' || c == 'F') {
        let value = match special(body) {
            Some(value) => value as f32,
            None => body.parse().map_err(|_| invalid())?,
        };
        return Ok(LoadableConstant::Float(value));
    }
    if let Some(body) = word.strip_suffix(|c| c == 'd' || c == 'D') {
        let value = match special(body) {
            Some(value) => value,
            None => body.parse().map_err(|_| invalid())?,
        };
        return Ok(LoadableConstant::Double(value));
    }
    if let Some(body) = word.strip_suffix(|c| c == 'l' || c == 'L') {
        return Ok(LoadableConstant::Long(body.parse().map_err(|_| invalid())?));
    }
    if word.contains(|c| matches!(c, '.' | 'e' | 'E')) {
        return Ok(LoadableConstant::Double(word.parse().map_err(|_| invalid())?));
    }
    Ok(LoadableConstant::Integer(word.parse().map_err(|_| invalid())?))
}

fn newarray_type(name: &str) -> Option<BaseType> {
    Some(match name {
        "boolean" => BaseType::Boolean,
        "char" => BaseType::Char,
        "float" => BaseType::Float,
        "double" => BaseType::Double,
        "byte" => BaseType::Byte,
        "short" => BaseType::Short,
        "int" => BaseType::Int,
        "long" => BaseType::Long,
        _ => return None,
    })
}

fn instruction(mnemonic: &str, cursor: &mut Cursor) -> Result<Insn, String> {
    let opcode = match opcodes::from_mnemonic(mnemonic) {
        Some(opcodes::WIDE) => {
            // The `wide` prefix is implied by the operands
            let mnemonic = cursor.word("an instruction")?;
            return match instruction(mnemonic, cursor)? {
                insn @ (Insn::Var(..) | Insn::Iinc(..)) => Ok(insn),
                _ => Err(format!("`{}` cannot be widened", mnemonic)),
            };
        }
        Some(opcode) => opcode,
        None => return Err(format!("unknown instruction `{}`", mnemonic)),
    };

    Ok(match SHAPES[opcode as usize] {
        InsnShape::NoArg => Insn::Plain(opcode),
        InsnShape::ImplicitVar => {
            let (base, first) = if opcode < opcodes::ISTORE {
                (opcodes::ILOAD, opcodes::ILOAD_0)
            } else {
                (opcodes::ISTORE, opcodes::ISTORE_0)
            };
            let offset = opcode - first;
            Insn::Var(base + offset / 4, (offset % 4) as u16)
        }
        InsnShape::Var => Insn::Var(opcode, cursor.number("local variable index")?),
        InsnShape::Byte if opcode == opcodes::NEWARRAY => {
            let name = cursor.word("an array element type")?;
            let element =
                newarray_type(name).ok_or_else(|| format!("`{}` is not a primitive type", name))?;
            Insn::Int(opcode, element.array_type_code() as i32)
        }
        InsnShape::Byte => Insn::Int(opcode, cursor.number::<i8>("byte")? as i32),
        InsnShape::Short => Insn::Int(opcode, cursor.number::<i16>("short")? as i32),
        InsnShape::Ldc | InsnShape::LdcWide => Insn::Ldc(cursor.constant()?),
        InsnShape::FieldOrMethod if opcode <= opcodes::PUTFIELD => Insn::Field {
            opcode,
            owner: cursor.word("an owner class")?.to_owned(),
            name: cursor.word("a field name")?.to_owned(),
            descriptor: cursor.word("a field descriptor")?.to_owned(),
        },
        InsnShape::FieldOrMethod | InsnShape::InterfaceMethod => {
            let is_interface = cursor.keyword("interface") || opcode == opcodes::INVOKEINTERFACE;
            Insn::Method {
                opcode,
                owner: cursor.word("an owner class")?.to_owned(),
                name: cursor.word("a method name")?.to_owned(),
                descriptor: cursor.word("a method descriptor")?.to_owned(),
                is_interface,
            }
        }
        InsnShape::InvokeDynamic => {
            let name = cursor.word("a method name")?.to_owned();
            let descriptor = cursor.word("a method descriptor")?.to_owned();
            let bootstrap = cursor.handle()?;
            let mut arguments = vec![];
            while !cursor.is_empty() {
                arguments.push(cursor.constant()?);
            }
            Insn::InvokeDynamic {
                name,
                descriptor,
                bootstrap,
                arguments,
            }
        }
        InsnShape::Type => Insn::Type(opcode, cursor.word("a class name")?.to_owned()),
        InsnShape::Iinc => Insn::Iinc(
            cursor.number("local variable index")?,
            cursor.number("increment")?,
        ),
        InsnShape::Jump | InsnShape::WideJump => {
            Insn::Jump(opcode, cursor.word("a label")?.to_owned())
        }
        InsnShape::TableSwitch => {
            let low = cursor.number("low key")?;
            let mut targets = vec![];
            while !cursor.is_empty() && cursor.peek_word() != Some("default") {
                targets.push(cursor.word("a label")?.to_owned());
            }
            cursor.expect("default")?;
            let default = cursor.word("a label")?.to_owned();
            Insn::TableSwitch {
                low,
                targets,
                default,
            }
        }
        InsnShape::LookupSwitch => {
            let mut keys = vec![];
            let mut targets = vec![];
            while !cursor.is_empty() && cursor.peek_word() != Some("default") {
                let pair = cursor.word("`key:label`")?;
                let (key, label) = pair
                    .split_once(':')
                    .ok_or_else(|| format!("expected `key:label` but found `{}`", pair))?;
                keys.push(
                    key.parse()
                        .map_err(|_| format!("`{}` is not a valid key", key))?,
                );
                targets.push(label.to_owned());
            }
            cursor.expect("default")?;
            let default = cursor.word("a label")?.to_owned();
            Insn::LookupSwitch {
                keys,
                targets,
                default,
            }
        }
        InsnShape::MultiANewArray => Insn::MultiANewArray(
            cursor.word("an array descriptor")?.to_owned(),
            cursor.number("dimension count")?,
        ),
        InsnShape::Wide | InsnShape::OversizedJump | InsnShape::Invalid => {
            return Err(format!("`{}` cannot be written directly", mnemonic))
        }
    })
}

/// Parser state between lines
struct Parser {
    listing: Listing,
    class: Option<ClassDecl>,
    method: Option<MethodDecl>,
}

impl Parser {
    fn class(&mut self, directive: &str) -> Result<&mut ClassDecl, String> {
        if self.method.is_some() {
            return Err(format!("`{}` is not allowed inside a method", directive));
        }
        self.class
            .as_mut()
            .ok_or_else(|| format!("`{}` must follow `.class`", directive))
    }

    fn method(&mut self, what: &str) -> Result<&mut MethodDecl, String> {
        self.method
            .as_mut()
            .ok_or_else(|| format!("{} must be inside a method", what))
    }

    fn line(&mut self, line_number: usize, tokens: &[Token]) -> Result<(), String> {
        let mut cursor = Cursor::new(tokens);
        let first = match cursor.word("a directive, label, or instruction") {
            Ok(first) => first,
            Err(_) if cursor.is_empty() => return Ok(()),
            Err(err) => return Err(err),
        };

        if let Some(label) = first.strip_suffix(':') {
            self.method("labels")?
                .body
                .push(Statement::Label(label.to_owned()));
            // An instruction may follow its label on the same line
            return match cursor.word("an instruction") {
                Ok(mnemonic) => {
                    let insn = instruction(mnemonic, &mut cursor)?;
                    cursor.finish()?;
                    self.method("instructions")?.body.push(Statement::Insn(insn));
                    Ok(())
                }
                Err(_) => cursor.finish(),
            };
        }

        if !first.starts_with('.') {
            let insn = instruction(first, &mut cursor)?;
            cursor.finish()?;
            self.method("instructions")?.body.push(Statement::Insn(insn));
            return Ok(());
        }

        match first {
            ".class" => {
                if self.method.is_some() {
                    return Err(String::from("`.class` inside a method (missing `.end method`?)"));
                }
                let access_flags = cursor
                    .flags(ClassAccessFlags::from_keyword)
                    .into_iter()
                    .fold(ClassAccessFlags::empty(), |acc, flag| acc | flag);
                let name = cursor.word("a class name")?.to_owned();
                let super_class = if cursor.keyword("extends") {
                    Some(cursor.word("a super class")?.to_owned())
                } else {
                    Some(String::from("java/lang/Object"))
                };
                let interfaces = if cursor.keyword("implements") {
                    cursor.rest("an interface name")?
                } else {
                    vec![]
                };
                let class = ClassDecl {
                    access_flags,
                    name,
                    super_class,
                    interfaces,
                    source_file: None,
                    signature: None,
                    nest_host: None,
                    nest_members: vec![],
                    fields: vec![],
                    methods: vec![],
                };
                if let Some(previous) = self.class.replace(class) {
                    self.listing.classes.push(previous);
                }
            }
            ".hierarchy" => {
                if self.method.is_some() {
                    return Err(String::from("`.hierarchy` is not allowed inside a method"));
                }
                let is_interface = cursor.keyword("interface");
                let name = cursor.word("a class name")?.to_owned();
                let super_class = if cursor.keyword("extends") {
                    Some(cursor.word("a super class")?.to_owned())
                } else if name == "java/lang/Object" {
                    None
                } else {
                    Some(String::from("java/lang/Object"))
                };
                let interfaces = if cursor.keyword("implements") {
                    cursor.rest("an interface name")?
                } else {
                    vec![]
                };
                self.listing.hierarchy.push(HierarchyDecl {
                    name,
                    super_class,
                    interfaces,
                    is_interface,
                });
            }
            ".source" => {
                let source = cursor.quoted("a file name")?.to_owned();
                self.class(first)?.source_file = Some(source);
            }
            ".signature" => {
                let signature = cursor.quoted("a signature")?.to_owned();
                self.class(first)?.signature = Some(signature);
            }
            ".nesthost" => {
                let host = cursor.word("a class name")?.to_owned();
                self.class(first)?.nest_host = Some(host);
            }
            ".nestmember" => {
                let member = cursor.word("a class name")?.to_owned();
                self.class(first)?.nest_members.push(member);
            }
            ".field" => {
                let access_flags = cursor
                    .flags(FieldAccessFlags::from_keyword)
                    .into_iter()
                    .fold(FieldAccessFlags::empty(), |acc, flag| acc | flag);
                let name = cursor.word("a field name")?.to_owned();
                let descriptor = cursor.word("a field descriptor")?.to_owned();
                let constant_value = if cursor.keyword("=") {
                    Some(cursor.constant()?)
                } else {
                    None
                };
                self.class(first)?.fields.push(FieldDecl {
                    access_flags,
                    name,
                    descriptor,
                    constant_value,
                });
            }
            ".method" => {
                self.class(first)?;
                let access_flags = cursor
                    .flags(MethodAccessFlags::from_keyword)
                    .into_iter()
                    .fold(MethodAccessFlags::empty(), |acc, flag| acc | flag);
                let name = cursor.word("a method name")?.to_owned();
                let descriptor = cursor.word("a method descriptor")?.to_owned();
                let exceptions = if cursor.keyword("throws") {
                    cursor.rest("an exception class")?
                } else {
                    vec![]
                };
                self.method = Some(MethodDecl {
                    line: line_number,
                    access_flags,
                    name,
                    descriptor,
                    exceptions,
                    max_stack: None,
                    max_locals: None,
                    body: vec![],
                });
            }
            ".end" => {
                cursor.expect("method")?;
                let method = self
                    .method
                    .take()
                    .ok_or_else(|| String::from("`.end method` without `.method`"))?;
                self.class(first)?.methods.push(method);
            }
            ".limit" => {
                let is_stack = match cursor.word("`stack` or `locals`")? {
                    "stack" => true,
                    "locals" => false,
                    other => return Err(format!("unknown limit `{}`", other)),
                };
                let value = cursor.number("limit")?;
                let method = self.method(first)?;
                if is_stack {
                    method.max_stack = Some(value);
                } else {
                    method.max_locals = Some(value);
                }
            }
            ".catch" => {
                let catch_type = match cursor.word("a class name or `all`")? {
                    "all" => None,
                    class => Some(class.to_owned()),
                };
                cursor.expect("from")?;
                let start = cursor.word("a label")?.to_owned();
                cursor.expect("to")?;
                let end = cursor.word("a label")?.to_owned();
                cursor.expect("using")?;
                let handler = cursor.word("a label")?.to_owned();
                self.method(first)?.body.push(Statement::Catch {
                    catch_type,
                    start,
                    end,
                    handler,
                });
            }
            ".line" => {
                let line = cursor.number("line number")?;
                self.method(first)?.body.push(Statement::Line(line));
            }
            ".var" => {
                let index = cursor.number("local variable index")?;
                cursor.expect("is")?;
                let name = cursor.word("a variable name")?.to_owned();
                let descriptor = cursor.word("a field descriptor")?.to_owned();
                let signature = if cursor.keyword("signature") {
                    Some(cursor.quoted("a signature")?.to_owned())
                } else {
                    None
                };
                cursor.expect("from")?;
                let start = cursor.word("a label")?.to_owned();
                cursor.expect("to")?;
                let end = cursor.word("a label")?.to_owned();
                self.method(first)?.body.push(Statement::Var {
                    index,
                    name,
                    descriptor,
                    signature,
                    start,
                    end,
                });
            }
            ".frame" => {
                let frame = match cursor.word("a frame kind")? {
                    "same" => FrameDecl::Same,
                    "same1" => FrameDecl::Same1(cursor.item()?),
                    "append" => FrameDecl::Append(cursor.items(None)?),
                    "chop" => FrameDecl::Chop(cursor.number("chopped local count")?),
                    "full" => {
                        let locals = cursor.items(Some("stack"))?;
                        let stack = if cursor.keyword("stack") {
                            cursor.items(None)?
                        } else {
                            vec![]
                        };
                        FrameDecl::Full { locals, stack }
                    }
                    other => return Err(format!("unknown frame kind `{}`", other)),
                };
                self.method(first)?.body.push(Statement::Frame(frame));
            }
            other => return Err(format!("unknown directive `{}`", other)),
        }
        cursor.finish()
    }
}

/// Parse a whole listing
pub fn parse(source: &str) -> Result<Listing, ParseError> {
    let mut parser = Parser {
        listing: Listing::default(),
        class: None,
        method: None,
    };

    let mut last_line = 0;
    for (idx, line) in source.lines().enumerate() {
        last_line = idx + 1;
        tokenize(line)
            .and_then(|tokens| parser.line(last_line, &tokens))
            .map_err(|message| ParseError {
                line: last_line,
                message,
            })?;
    }

    if let Some(method) = parser.method {
        return Err(ParseError {
            line: last_line,
            message: format!("method `{}` is missing `.end method`", method.name),
        });
    }
    parser.listing.classes.extend(parser.class);
    Ok(parser.listing)
}

#[cfg(test)]
mod test {
    use super::*;
    use classasm::jvm::opcodes::*;

    fn body(source: &str) -> Vec<Statement> {
        let listing = parse(&format!(".class A\n.method static m ()V\n{}\n.end method", source))
            .unwrap();
        listing.classes[0].methods[0].body.clone()
    }

    #[test]
    fn class_header() {
        let listing = parse(
            ".class public final Foo extends Bar implements Baz Qux\n\
             .source \"Foo.java\"\n\
             .field private static final X I = 5\n\
             .class Other",
        )
        .unwrap();
        let foo = &listing.classes[0];
        assert_eq!(foo.access_flags, ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL);
        assert_eq!(foo.super_class.as_deref(), Some("Bar"));
        assert_eq!(foo.interfaces, vec!["Baz", "Qux"]);
        assert_eq!(foo.source_file.as_deref(), Some("Foo.java"));
        assert_eq!(foo.fields[0].constant_value, Some(LoadableConstant::Integer(5)));
        assert_eq!(listing.classes[1].name, "Other");
        assert_eq!(
            listing.classes[1].super_class.as_deref(),
            Some("java/lang/Object")
        );
    }

    #[test]
    fn implicit_and_wide_variables() {
        assert_eq!(
            body("iload_2\nastore_0\nwide dload 300\nret 1"),
            vec![
                Statement::Insn(Insn::Var(ILOAD, 2)),
                Statement::Insn(Insn::Var(ASTORE, 0)),
                Statement::Insn(Insn::Var(DLOAD, 300)),
                Statement::Insn(Insn::Var(RET, 1)),
            ]
        );
    }

    #[test]
    fn constants() {
        assert_eq!(
            body("ldc \"a\\tb\\u00e9\" # comment\nldc2_w 10L\nldc 1.5f\nldc 2.0\nldc class java/lang/String"),
            vec![
                Statement::Insn(Insn::Ldc(LoadableConstant::String(String::from("a\tb\u{e9}")))),
                Statement::Insn(Insn::Ldc(LoadableConstant::Long(10))),
                Statement::Insn(Insn::Ldc(LoadableConstant::Float(1.5))),
                Statement::Insn(Insn::Ldc(LoadableConstant::Double(2.0))),
                Statement::Insn(Insn::Ldc(LoadableConstant::Class(String::from(
                    "java/lang/String"
                )))),
            ]
        );
        assert!(parse_number("12x").is_err());
    }

    #[test]
    fn switches_and_labels() {
        assert_eq!(
            body("tableswitch 1 A B default C\nA: lookupswitch -1:B 7:C default A\nB:\nC:"),
            vec![
                Statement::Insn(Insn::TableSwitch {
                    low: 1,
                    targets: vec![String::from("A"), String::from("B")],
                    default: String::from("C"),
                }),
                Statement::Label(String::from("A")),
                Statement::Insn(Insn::LookupSwitch {
                    keys: vec![-1, 7],
                    targets: vec![String::from("B"), String::from("C")],
                    default: String::from("A"),
                }),
                Statement::Label(String::from("B")),
                Statement::Label(String::from("C")),
            ]
        );
    }

    #[test]
    fn invokes() {
        assert_eq!(
            body(
                "invokestatic interface I m ()V\n\
                 invokedynamic run ()Ljava/lang/Runnable; invokestatic M boot ()V methodtype ()V 3"
            ),
            vec![
                Statement::Insn(Insn::Method {
                    opcode: INVOKESTATIC,
                    owner: String::from("I"),
                    name: String::from("m"),
                    descriptor: String::from("()V"),
                    is_interface: true,
                }),
                Statement::Insn(Insn::InvokeDynamic {
                    name: String::from("run"),
                    descriptor: String::from("()Ljava/lang/Runnable;"),
                    bootstrap: Handle {
                        kind: HandleKind::InvokeStatic,
                        owner: String::from("M"),
                        name: String::from("boot"),
                        descriptor: String::from("()V"),
                        is_interface: false,
                    },
                    arguments: vec![
                        LoadableConstant::MethodType(String::from("()V")),
                        LoadableConstant::Integer(3),
                    ],
                }),
            ]
        );
    }

    #[test]
    fn frames() {
        assert_eq!(
            body(".frame full int java/lang/String stack uninitialized L0\n.frame chop 2"),
            vec![
                Statement::Frame(FrameDecl::Full {
                    locals: vec![ItemDecl::Integer, ItemDecl::Object(String::from("java/lang/String"))],
                    stack: vec![ItemDecl::Uninitialized(String::from("L0"))],
                }),
                Statement::Frame(FrameDecl::Chop(2)),
            ]
        );
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse(".class A\n.method m ()V\n  bogus 1\n.end method").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("bogus"));

        let err = parse(".class A\n.method m ()V\n  return").unwrap_err();
        assert!(err.message.contains("missing `.end method`"));

        let err = parse("  iconst_0").unwrap_err();
        assert_eq!(err.line, 1);

        let err = parse(".class A\n.source \"oops").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }
}
