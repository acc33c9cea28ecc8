//! Read-only structural view of a candidate type.
//!
//! Built once per class from its raw bytes (or from a handle to an already
//! loaded type) and discarded after the match-and-weave pass. Building it
//! never resolves anything beyond the names the class file itself declares.

use std::collections::BTreeSet;
use std::fmt;

use crate::classfile::{access::*, AttributeInfo, ClassFile, ConstantPool, CpInfo};
use crate::descriptor::{to_java_name, JavaType, MethodDescriptor};
use crate::error::ClassFileError;

/// Java package prefix of the engine's own types.
pub const ENGINE_PACKAGE_PREFIX: &str = "jvmweaver.";

/// Which loading scope defined a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoadingBoundary {
    /// The root scope (the JVM bootstrap class loader).
    Bootstrap,
    /// An isolated scope owned by the engine itself.
    Engine { namespace: String },
    /// Any other scope, identified by the host's object id for its loader.
    Application { id: i32 },
}

impl LoadingBoundary {
    /// The id woven into BEFORE payloads.
    pub fn object_id(&self) -> i32 {
        match self {
            LoadingBoundary::Bootstrap => 0,
            LoadingBoundary::Engine { .. } => -1,
            LoadingBoundary::Application { id } => *id,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        matches!(self, LoadingBoundary::Bootstrap)
    }

    pub fn is_engine(&self) -> bool {
        matches!(self, LoadingBoundary::Engine { .. })
    }
}

impl fmt::Display for LoadingBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadingBoundary::Bootstrap => f.write_str("bootstrap"),
            LoadingBoundary::Engine { namespace } => write!(f, "engine:{namespace}"),
            LoadingBoundary::Application { id } => write!(f, "loader@{id:x}"),
        }
    }
}

/// One constructor or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralBehavior {
    /// Java name of the declaring type.
    pub declaring_type: String,
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    /// Java names, in declaration order.
    pub parameter_type_names: Vec<String>,
    pub return_type_name: String,
    pub exception_type_names: BTreeSet<String>,
    pub annotation_names: BTreeSet<String>,
}

impl StructuralBehavior {
    pub fn new(
        declaring_type: &str,
        name: &str,
        descriptor: &str,
        access_flags: u16,
    ) -> Result<Self, ClassFileError> {
        let parsed = MethodDescriptor::parse(descriptor)?;
        Ok(Self {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
            parameter_type_names: parsed.parameters.iter().map(JavaType::java_name).collect(),
            return_type_name: parsed.return_type.java_name(),
            exception_type_names: BTreeSet::new(),
            annotation_names: BTreeSet::new(),
        })
    }

    /// `Type#name(param1,param2)`, the overload identity used for matching.
    pub fn sign_code(&self) -> String {
        sign_code(&self.declaring_type, &self.name, &self.parameter_type_names)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }
}

pub fn sign_code<S: AsRef<str>>(declaring_type: &str, name: &str, parameter_type_names: &[S]) -> String {
    let params: Vec<&str> = parameter_type_names.iter().map(AsRef::as_ref).collect();
    format!("{declaring_type}#{name}({})", params.join(","))
}

/// An already loaded type, as exposed by the host.
pub trait TypeHandle {
    fn java_name(&self) -> String;
    fn super_name(&self) -> Option<String>;
    fn interface_names(&self) -> Vec<String>;
    fn access_flags(&self) -> u16;
    fn annotation_names(&self) -> Vec<String>;
    fn behaviors(&self) -> Result<Vec<StructuralBehavior>, ClassFileError>;
    fn boundary(&self) -> LoadingBoundary;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralType {
    pub java_name: String,
    pub super_name: Option<String>,
    /// Java names, in declaration order, without duplicates.
    pub interface_names: Vec<String>,
    pub access_flags: u16,
    pub annotation_names: BTreeSet<String>,
    /// Constructors and methods in declaration order; `<clinit>` excluded.
    pub behaviors: Vec<StructuralBehavior>,
    pub boundary: LoadingBoundary,
}

impl StructuralType {
    pub fn from_bytes(bytes: &[u8], boundary: LoadingBoundary) -> Result<Self, ClassFileError> {
        Self::from_class_file(&ClassFile::parse(bytes)?, boundary)
    }

    pub fn from_class_file(class: &ClassFile, boundary: LoadingBoundary) -> Result<Self, ClassFileError> {
        let cp = &class.constant_pool;
        let java_name = to_java_name(class.this_class_name()?);
        let super_name = class.super_class_name()?.map(to_java_name);
        let mut interface_names: Vec<String> = Vec::with_capacity(class.interfaces.len());
        for name in class.interface_names()? {
            let name = to_java_name(name);
            if !interface_names.contains(&name) {
                interface_names.push(name);
            }
        }

        let mut behaviors = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let name = method.name(cp)?;
            if name == "<clinit>" {
                continue;
            }
            let mut behavior = StructuralBehavior::new(&java_name, name, method.descriptor(cp)?, method.access_flags)?;
            for attr in &method.attributes {
                if let AttributeInfo::Exceptions { exception_index_table } = attr {
                    for index in exception_index_table {
                        behavior.exception_type_names.insert(to_java_name(cp.class_name(*index)?));
                    }
                }
            }
            behavior.annotation_names = annotation_names(&method.attributes, cp)?;
            behaviors.push(behavior);
        }

        Ok(Self {
            java_name,
            super_name,
            interface_names,
            access_flags: class.access_flags,
            annotation_names: annotation_names(&class.attributes, cp)?,
            behaviors,
            boundary,
        })
    }

    pub fn from_handle(handle: &dyn TypeHandle) -> Result<Self, ClassFileError> {
        let mut interface_names: Vec<String> = Vec::new();
        for name in handle.interface_names() {
            if !interface_names.contains(&name) {
                interface_names.push(name);
            }
        }
        Ok(Self {
            java_name: handle.java_name(),
            super_name: handle.super_name(),
            interface_names,
            access_flags: handle.access_flags(),
            annotation_names: handle.annotation_names().into_iter().collect(),
            behaviors: handle.behaviors()?,
            boundary: handle.boundary(),
        })
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn is_annotation(&self) -> bool {
        self.access_flags & ACC_ANNOTATION != 0
    }

    /// Belongs to the engine itself, by package or by loading scope.
    pub fn is_engine_type(&self) -> bool {
        self.boundary.is_engine() || self.java_name.starts_with(ENGINE_PACKAGE_PREFIX)
    }

    pub fn behavior(&self, sign_code: &str) -> Option<&StructuralBehavior> {
        self.behaviors.iter().find(|b| b.sign_code() == sign_code)
    }
}

/// Java names of the annotations present in `attrs`, visible or not.
fn annotation_names(attrs: &[AttributeInfo], cp: &ConstantPool) -> Result<BTreeSet<String>, ClassFileError> {
    let mut names = BTreeSet::new();
    for attr in attrs {
        let annotations = match attr {
            AttributeInfo::RuntimeVisibleAnnotations { annotations }
            | AttributeInfo::RuntimeInvisibleAnnotations { annotations } => annotations,
            _ => continue,
        };
        for annotation in annotations {
            let desc = match cp.get(annotation.type_index)? {
                CpInfo::Utf8(desc) => desc,
                _ => return Err(ClassFileError::InvalidConstantPoolIndex(annotation.type_index)),
            };
            let name = match JavaType::from_descriptor(desc) {
                Ok(ty) => ty.java_name(),
                Err(_) => to_java_name(desc),
            };
            names.insert(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_codes_follow_overload_identity() {
        let a = StructuralBehavior::new("demo.Sample", "compute", "(I)I", ACC_PUBLIC).unwrap();
        let b = StructuralBehavior::new("demo.Sample", "compute", "(J[Ljava/lang/String;)I", ACC_PUBLIC).unwrap();
        let c = StructuralBehavior::new("demo.Sample", "compute", "(I)J", ACC_PUBLIC).unwrap();
        assert_eq!(a.sign_code(), "demo.Sample#compute(int)");
        assert_eq!(b.sign_code(), "demo.Sample#compute(long,java.lang.String[])");
        assert_ne!(a.sign_code(), b.sign_code());
        // return type is not part of the identity
        assert_eq!(a.sign_code(), c.sign_code());
    }

    #[test]
    fn engine_types_are_recognised() {
        let t = StructuralType {
            java_name: "jvmweaver.spy.Spy".into(),
            super_name: Some("java.lang.Object".into()),
            interface_names: Vec::new(),
            access_flags: ACC_PUBLIC,
            annotation_names: BTreeSet::new(),
            behaviors: Vec::new(),
            boundary: LoadingBoundary::Bootstrap,
        };
        assert!(t.is_engine_type());
        let app = StructuralType { java_name: "demo.App".into(), ..t.clone() };
        assert!(!app.is_engine_type());
        let isolated = StructuralType { boundary: LoadingBoundary::Engine { namespace: "default".into() }, ..app };
        assert!(isolated.is_engine_type());
    }
}
