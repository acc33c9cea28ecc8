//! Field and method descriptors.

use std::fmt;

use crate::bytecode::opcodes::*;
use crate::error::ClassFileError;

/// A JVM field type, or `void` in return position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<JavaType>),
}

impl JavaType {
    pub fn object(internal_name: impl Into<String>) -> Self {
        JavaType::Object(internal_name.into())
    }

    /// Parse a single field descriptor, which must span the whole input.
    pub fn from_descriptor(desc: &str) -> Result<Self, ClassFileError> {
        let (ty, rest) = Self::parse_prefix(desc)?;
        if !rest.is_empty() {
            return Err(ClassFileError::InvalidDescriptor(desc.to_string()));
        }
        Ok(ty)
    }

    fn parse_prefix(desc: &str) -> Result<(Self, &str), ClassFileError> {
        let invalid = || ClassFileError::InvalidDescriptor(desc.to_string());
        let first = desc.chars().next().ok_or_else(invalid)?;
        let rest = &desc[first.len_utf8()..];
        let ty = match first {
            'Z' => JavaType::Boolean,
            'B' => JavaType::Byte,
            'C' => JavaType::Char,
            'S' => JavaType::Short,
            'I' => JavaType::Int,
            'J' => JavaType::Long,
            'F' => JavaType::Float,
            'D' => JavaType::Double,
            'V' => JavaType::Void,
            'L' => {
                let end = rest.find(';').ok_or_else(invalid)?;
                if end == 0 {
                    return Err(invalid());
                }
                return Ok((JavaType::Object(rest[..end].to_string()), &rest[end + 1..]));
            }
            '[' => {
                let (component, rest) = Self::parse_prefix(rest)?;
                if component == JavaType::Void {
                    return Err(invalid());
                }
                return Ok((JavaType::Array(Box::new(component)), rest));
            }
            _ => return Err(invalid()),
        };
        Ok((ty, rest))
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.write_descriptor(&mut out);
        out
    }

    fn write_descriptor(&self, out: &mut String) {
        match self {
            JavaType::Object(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            JavaType::Array(component) => {
                out.push('[');
                component.write_descriptor(out);
            }
            primitive => out.push(primitive.primitive_char().unwrap_or('V')),
        }
    }

    fn primitive_char(&self) -> Option<char> {
        Some(match self {
            JavaType::Boolean => 'Z',
            JavaType::Byte => 'B',
            JavaType::Char => 'C',
            JavaType::Short => 'S',
            JavaType::Int => 'I',
            JavaType::Long => 'J',
            JavaType::Float => 'F',
            JavaType::Double => 'D',
            JavaType::Void => 'V',
            _ => return None,
        })
    }

    /// Source-level name: `int`, `java.lang.String`, `long[][]`.
    pub fn java_name(&self) -> String {
        match self {
            JavaType::Boolean => "boolean".into(),
            JavaType::Byte => "byte".into(),
            JavaType::Char => "char".into(),
            JavaType::Short => "short".into(),
            JavaType::Int => "int".into(),
            JavaType::Long => "long".into(),
            JavaType::Float => "float".into(),
            JavaType::Double => "double".into(),
            JavaType::Void => "void".into(),
            JavaType::Object(name) => to_java_name(name),
            JavaType::Array(component) => format!("{}[]", component.java_name()),
        }
    }

    /// Name usable as a `CONSTANT_Class` operand (`checkcast`, `anewarray`).
    pub fn class_operand(&self) -> Option<String> {
        match self {
            JavaType::Object(name) => Some(name.clone()),
            JavaType::Array(_) => Some(self.descriptor()),
            _ => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JavaType::Object(_) | JavaType::Array(_))
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_reference() && *self != JavaType::Void
    }

    /// Local variable / operand stack slots taken by a value of this type.
    pub fn size(&self) -> usize {
        match self {
            JavaType::Long | JavaType::Double => 2,
            JavaType::Void => 0,
            _ => 1,
        }
    }

    pub fn load_opcode(&self) -> u8 {
        match self {
            JavaType::Long => LLOAD,
            JavaType::Float => FLOAD,
            JavaType::Double => DLOAD,
            JavaType::Object(_) | JavaType::Array(_) => ALOAD,
            _ => ILOAD,
        }
    }

    pub fn store_opcode(&self) -> u8 {
        match self {
            JavaType::Long => LSTORE,
            JavaType::Float => FSTORE,
            JavaType::Double => DSTORE,
            JavaType::Object(_) | JavaType::Array(_) => ASTORE,
            _ => ISTORE,
        }
    }

    pub fn return_opcode(&self) -> u8 {
        match self {
            JavaType::Void => RETURN,
            JavaType::Long => LRETURN,
            JavaType::Float => FRETURN,
            JavaType::Double => DRETURN,
            JavaType::Object(_) | JavaType::Array(_) => ARETURN,
            _ => IRETURN,
        }
    }

    /// Wrapper class of a primitive type.
    pub fn box_class(&self) -> Option<&'static str> {
        Some(match self {
            JavaType::Boolean => "java/lang/Boolean",
            JavaType::Byte => "java/lang/Byte",
            JavaType::Char => "java/lang/Character",
            JavaType::Short => "java/lang/Short",
            JavaType::Int => "java/lang/Integer",
            JavaType::Long => "java/lang/Long",
            JavaType::Float => "java/lang/Float",
            JavaType::Double => "java/lang/Double",
            _ => return None,
        })
    }
}

impl fmt::Display for JavaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.java_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub parameters: Vec<JavaType>,
    pub return_type: JavaType,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, ClassFileError> {
        let invalid = || ClassFileError::InvalidDescriptor(desc.to_string());
        let mut rest = desc.strip_prefix('(').ok_or_else(invalid)?;
        let mut parameters = Vec::new();
        loop {
            if let Some(after) = rest.strip_prefix(')') {
                rest = after;
                break;
            }
            let (ty, after) = JavaType::parse_prefix(rest).map_err(|_| invalid())?;
            if ty == JavaType::Void {
                return Err(invalid());
            }
            parameters.push(ty);
            rest = after;
        }
        let return_type = JavaType::from_descriptor(rest).map_err(|_| invalid())?;
        Ok(Self { parameters, return_type })
    }

    /// Slots taken by the parameters, excluding `this`.
    pub fn parameter_slots(&self) -> usize {
        self.parameters.iter().map(JavaType::size).sum()
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.parameters {
            p.write_descriptor(&mut out);
        }
        out.push(')');
        self.return_type.write_descriptor(&mut out);
        out
    }
}

/// `java/lang/String` to `java.lang.String`.
pub fn to_java_name(internal_name: &str) -> String {
    internal_name.replace('/', ".")
}

/// `java.lang.String` to `java/lang/String`.
pub fn to_internal_name(java_name: &str) -> String {
    java_name.replace('.', "/")
}
