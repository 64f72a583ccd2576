use crate::jvm::Error;
use std::collections::{HashMap, HashSet};

/// Source of super type information, used when two reference types have to be merged while
/// computing frames
///
/// Frame computation needs the common super class of any two classes flowing into the same
/// location. Since the assembler never loads classes, it asks the caller instead.
pub trait ClassHierarchy {
    /// Look up a class or interface by internal name (eg. `java/lang/String`)
    fn lookup(&self, class: &str) -> Option<ClassInfo>;
}

/// What frame computation needs to know about a class
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ClassInfo {
    /// Internal name of the super class (`None` only for `java/lang/Object`)
    pub super_class: Option<String>,

    /// Internal names of directly implemented interfaces
    pub interfaces: Vec<String>,

    pub is_interface: bool,
}

impl ClassInfo {
    pub fn class(super_class: &str, interfaces: &[&str]) -> ClassInfo {
        ClassInfo {
            super_class: Some(super_class.to_owned()),
            interfaces: interfaces.iter().map(|name| String::from(*name)).collect(),
            is_interface: false,
        }
    }

    /// Interfaces all have `java/lang/Object` as their super class
    pub fn interface(super_interfaces: &[&str]) -> ClassInfo {
        ClassInfo {
            super_class: Some(String::from(OBJECT)),
            interfaces: super_interfaces
                .iter()
                .map(|name| String::from(*name))
                .collect(),
            is_interface: true,
        }
    }
}

const OBJECT: &str = "java/lang/Object";

/// Class hierarchy held in memory
#[derive(Clone, Default, Debug)]
pub struct StaticClassHierarchy {
    classes: HashMap<String, ClassInfo>,
}

/// Commonly used classes from `java.lang` (and the handful of other packages their super types
/// live in): name, super class, interfaces, and whether it is an interface
const JAVA_LANG: &[(&str, Option<&str>, &[&str], bool)] = &[
    ("java/lang/Object", None, &[], false),
    ("java/io/Serializable", Some(OBJECT), &[], true),
    ("java/lang/Cloneable", Some(OBJECT), &[], true),
    ("java/lang/Comparable", Some(OBJECT), &[], true),
    ("java/lang/CharSequence", Some(OBJECT), &[], true),
    ("java/lang/Runnable", Some(OBJECT), &[], true),
    ("java/lang/Iterable", Some(OBJECT), &[], true),
    ("java/lang/AutoCloseable", Some(OBJECT), &[], true),
    (
        "java/lang/String",
        Some(OBJECT),
        &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"],
        false,
    ),
    (
        "java/lang/StringBuilder",
        Some(OBJECT),
        &["java/io/Serializable", "java/lang/CharSequence"],
        false,
    ),
    ("java/lang/Class", Some(OBJECT), &["java/io/Serializable"], false),
    ("java/lang/Number", Some(OBJECT), &["java/io/Serializable"], false),
    ("java/lang/Byte", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Short", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Integer", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Long", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Float", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Double", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    (
        "java/lang/Boolean",
        Some(OBJECT),
        &["java/io/Serializable", "java/lang/Comparable"],
        false,
    ),
    (
        "java/lang/Character",
        Some(OBJECT),
        &["java/io/Serializable", "java/lang/Comparable"],
        false,
    ),
    ("java/lang/System", Some(OBJECT), &[], false),
    ("java/lang/Math", Some(OBJECT), &[], false),
    ("java/lang/Thread", Some(OBJECT), &["java/lang/Runnable"], false),
    ("java/lang/Throwable", Some(OBJECT), &["java/io/Serializable"], false),
    ("java/lang/Exception", Some("java/lang/Throwable"), &[], false),
    ("java/lang/Error", Some("java/lang/Throwable"), &[], false),
    ("java/lang/AssertionError", Some("java/lang/Error"), &[], false),
    ("java/lang/RuntimeException", Some("java/lang/Exception"), &[], false),
    ("java/lang/ArithmeticException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/ClassCastException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/NullPointerException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/IllegalStateException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/IllegalArgumentException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/IndexOutOfBoundsException", Some("java/lang/RuntimeException"), &[], false),
    (
        "java/lang/ArrayIndexOutOfBoundsException",
        Some("java/lang/IndexOutOfBoundsException"),
        &[],
        false,
    ),
    ("java/lang/invoke/MethodType", Some(OBJECT), &["java/io/Serializable"], false),
    ("java/lang/invoke/MethodHandle", Some(OBJECT), &[], false),
    ("java/lang/invoke/CallSite", Some(OBJECT), &[], false),
];

impl StaticClassHierarchy {
    /// Empty hierarchy (not even `java/lang/Object` is known)
    pub fn new() -> StaticClassHierarchy {
        StaticClassHierarchy::default()
    }

    /// Hierarchy pre-populated with the common `java.lang` classes
    pub fn with_java_lang() -> StaticClassHierarchy {
        let mut hierarchy = StaticClassHierarchy::new();
        for (name, super_class, interfaces, is_interface) in JAVA_LANG {
            let info = ClassInfo {
                super_class: super_class.map(String::from),
                interfaces: interfaces.iter().map(|name| String::from(*name)).collect(),
                is_interface: *is_interface,
            };
            hierarchy.insert(name, info);
        }
        hierarchy
    }

    /// Add (or replace) a class
    pub fn insert(&mut self, name: &str, info: ClassInfo) -> &mut Self {
        self.classes.insert(name.to_owned(), info);
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassHierarchy for StaticClassHierarchy {
    fn lookup(&self, class: &str) -> Option<ClassInfo> {
        self.classes.get(class).cloned()
    }
}

/// Hierarchy which also knows about one extra class (typically the one being assembled)
#[derive(Clone, Copy)]
pub struct WithClass<'a> {
    pub base: &'a dyn ClassHierarchy,
    pub name: &'a str,
    pub info: &'a ClassInfo,
}

impl<'a> ClassHierarchy for WithClass<'a> {
    fn lookup(&self, class: &str) -> Option<ClassInfo> {
        if class == self.name {
            Some(self.info.clone())
        } else {
            self.base.lookup(class)
        }
    }
}

fn lookup_or_missing(hierarchy: &dyn ClassHierarchy, class: &str) -> Result<ClassInfo, Error> {
    hierarchy
        .lookup(class)
        .ok_or_else(|| Error::MissingClass(class.to_owned()))
}

/// Is `sub_type` assignable to `super_type` (by super class and interface edges)?
///
/// This does a traversal of super types, skipping interfaces when the super type is a class.
pub fn is_assignable(
    hierarchy: &dyn ClassHierarchy,
    sub_type: &str,
    super_type: &str,
) -> Result<bool, Error> {
    if sub_type == super_type || super_type == OBJECT {
        return Ok(true);
    }
    let super_is_class = !lookup_or_missing(hierarchy, super_type)?.is_interface;

    let mut supertypes_to_visit: Vec<String> = vec![sub_type.to_owned()];
    let mut dont_revisit: HashSet<String> = HashSet::new();
    dont_revisit.insert(sub_type.to_owned());

    while let Some(class) = supertypes_to_visit.pop() {
        if class == super_type {
            return Ok(true);
        }
        let info = lookup_or_missing(hierarchy, &class)?;

        if let Some(super_class) = info.super_class {
            if dont_revisit.insert(super_class.clone()) {
                supertypes_to_visit.push(super_class);
            }
        }
        if !super_is_class {
            for interface in info.interfaces {
                if dont_revisit.insert(interface.clone()) {
                    supertypes_to_visit.push(interface);
                }
            }
        }
    }

    Ok(false)
}

/// Most specific common super class of two classes
///
/// If either one is assignable to the other, that one wins. Otherwise interfaces merge into
/// `java/lang/Object`, and classes merge into the first super class of `type1` which `type2` is
/// assignable to.
pub fn common_super_class(
    hierarchy: &dyn ClassHierarchy,
    type1: &str,
    type2: &str,
) -> Result<String, Error> {
    if is_assignable(hierarchy, type2, type1)? {
        return Ok(type1.to_owned());
    }
    if is_assignable(hierarchy, type1, type2)? {
        return Ok(type2.to_owned());
    }

    let info1 = lookup_or_missing(hierarchy, type1)?;
    let info2 = lookup_or_missing(hierarchy, type2)?;
    if info1.is_interface || info2.is_interface {
        return Ok(String::from(OBJECT));
    }

    let mut current = info1;
    loop {
        let super_class = match current.super_class {
            None => return Ok(String::from(OBJECT)),
            Some(super_class) => super_class,
        };
        if is_assignable(hierarchy, type2, &super_class)? {
            return Ok(super_class);
        }
        current = lookup_or_missing(hierarchy, &super_class)?;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assignable_through_classes_and_interfaces() {
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let check = |sub: &str, sup: &str| is_assignable(&hierarchy, sub, sup).unwrap();

        assert!(check("java/lang/Integer", "java/lang/Number"));
        assert!(check("java/lang/Integer", "java/lang/Object"));
        assert!(check("java/lang/Integer", "java/io/Serializable"));
        assert!(check("java/lang/String", "java/lang/CharSequence"));
        assert!(!check("java/lang/Number", "java/lang/Integer"));
        assert!(!check("java/lang/CharSequence", "java/lang/String"));
    }

    #[test]
    fn common_super_classes() {
        let hierarchy = StaticClassHierarchy::with_java_lang();
        let common = |a: &str, b: &str| common_super_class(&hierarchy, a, b).unwrap();

        assert_eq!(common("java/lang/Integer", "java/lang/Long"), "java/lang/Number");
        assert_eq!(common("java/lang/Number", "java/lang/Long"), "java/lang/Number");
        assert_eq!(common("java/lang/String", "java/lang/Integer"), "java/lang/Object");
        assert_eq!(
            common("java/lang/ArithmeticException", "java/lang/NullPointerException"),
            "java/lang/RuntimeException"
        );
        assert_eq!(
            common("java/lang/String", "java/lang/CharSequence"),
            "java/lang/CharSequence"
        );
        assert_eq!(
            common("java/lang/Comparable", "java/lang/CharSequence"),
            "java/lang/Object"
        );
    }

    #[test]
    fn extra_class_overlay() {
        let base = StaticClassHierarchy::with_java_lang();
        let info = ClassInfo::class("java/lang/RuntimeException", &[]);
        let hierarchy = WithClass {
            base: &base,
            name: "MyException",
            info: &info,
        };
        assert_eq!(
            common_super_class(&hierarchy, "MyException", "java/lang/IllegalStateException")
                .unwrap(),
            "java/lang/RuntimeException"
        );
    }

    #[test]
    fn unknown_classes_are_reported() {
        let hierarchy = StaticClassHierarchy::with_java_lang();
        assert!(matches!(
            common_super_class(&hierarchy, "Foo", "java/lang/String"),
            Err(Error::MissingClass(name)) if name == "Foo"
        ));
    }
}
