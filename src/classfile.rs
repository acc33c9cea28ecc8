//! Class file reader and writer.
//!
//! Only the attributes the weaver needs to understand are decoded. Everything
//! else is carried as [`AttributeInfo::Unknown`] so that parsing a class and
//! writing it back without changes reproduces the input byte for byte.

use std::collections::HashMap;

pub use crate::error::ClassFileError;

pub const MAGIC: u32 = 0xCAFE_BABE;

/// First class file version that requires a `StackMapTable`.
pub const STACK_MAP_VERSION: u16 = 50;

/// Access flags shared by classes, fields and methods.
pub mod access {
    pub const ACC_PUBLIC: u16 = 0x0001;
    pub const ACC_PRIVATE: u16 = 0x0002;
    pub const ACC_PROTECTED: u16 = 0x0004;
    pub const ACC_STATIC: u16 = 0x0008;
    pub const ACC_FINAL: u16 = 0x0010;
    pub const ACC_SUPER: u16 = 0x0020;
    pub const ACC_SYNCHRONIZED: u16 = 0x0020;
    pub const ACC_BRIDGE: u16 = 0x0040;
    pub const ACC_VARARGS: u16 = 0x0080;
    pub const ACC_NATIVE: u16 = 0x0100;
    pub const ACC_INTERFACE: u16 = 0x0200;
    pub const ACC_ABSTRACT: u16 = 0x0400;
    pub const ACC_SYNTHETIC: u16 = 0x1000;
    pub const ACC_ANNOTATION: u16 = 0x2000;
    pub const ACC_ENUM: u16 = 0x4000;
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.descriptor_index)
    }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match a {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match a {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    /// The raw body of an unknown attribute with the given name.
    pub fn raw_attribute(&self, name: &str) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            AttributeInfo::Unknown { name: n, info } if n == name => Some(info.as_slice()),
            _ => None,
        })
    }

    /// Replace (or add) an unknown attribute with the given name.
    pub fn set_raw_attribute(&mut self, name: &str, info: Vec<u8>) {
        self.attributes
            .retain(|a| !matches!(a, AttributeInfo::Unknown { name: n, .. } if n == name));
        self.attributes.push(AttributeInfo::Unknown {
            name: name.to_string(),
            info,
        });
    }
}

/// Lookup key used to deduplicate constant pool entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CpKey {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    NameAndType(u16, u16),
    Other,
}

impl CpKey {
    fn of(info: &CpInfo) -> Self {
        match info {
            CpInfo::Utf8(s) => CpKey::Utf8(s.clone()),
            CpInfo::Integer(v) => CpKey::Integer(*v),
            CpInfo::Float(v) => CpKey::Float(v.to_bits()),
            CpInfo::Long(v) => CpKey::Long(*v),
            CpInfo::Double(v) => CpKey::Double(v.to_bits()),
            CpInfo::Class { name_index } => CpKey::Class(*name_index),
            CpInfo::String { string_index } => CpKey::String(*string_index),
            CpInfo::Fieldref { class_index, name_and_type_index } => {
                CpKey::Fieldref(*class_index, *name_and_type_index)
            }
            CpInfo::Methodref { class_index, name_and_type_index } => {
                CpKey::Methodref(*class_index, *name_and_type_index)
            }
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                CpKey::InterfaceMethodref(*class_index, *name_and_type_index)
            }
            CpInfo::NameAndType { name_index, descriptor_index } => {
                CpKey::NameAndType(*name_index, *descriptor_index)
            }
            _ => CpKey::Other,
        }
    }
}

/// The constant pool. Entries are appended with deduplication; the lookup
/// index is built lazily on the first append so read-only parses never pay
/// for it.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
    lookup: Option<HashMap<CpKey, u16>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![None],
            lookup: None,
        }
    }

    /// The `constant_pool_count` value: one more than the highest index.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &CpInfo)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as u16, e)))
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Internal name of a `CONSTANT_Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassFileError> {
        match self.get(index)? {
            CpInfo::NameAndType { name_index, descriptor_index } => {
                Ok((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?))
            }
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Owner, name and descriptor of a field, method or interface method ref.
    pub fn member_ref(&self, index: u16) -> Result<(&str, &str, &str), ClassFileError> {
        match self.get(index)? {
            CpInfo::Fieldref { class_index, name_and_type_index }
            | CpInfo::Methodref { class_index, name_and_type_index }
            | CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                let owner = self.class_name(*class_index)?;
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, desc))
            }
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Index of an existing `Utf8` entry, without adding one.
    pub fn find_utf8(&self, value: &str) -> Option<u16> {
        if let Some(lookup) = &self.lookup {
            return lookup.get(&CpKey::Utf8(value.to_string())).copied();
        }
        self.iter().find_map(|(i, e)| match e {
            CpInfo::Utf8(s) if s == value => Some(i),
            _ => None,
        })
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let encoded = encode_modified_utf8(value).len();
        if encoded > u16::MAX as usize {
            return Err(ClassFileError::Utf8TooLong(encoded));
        }
        self.intern(CpInfo::Utf8(value.to_string()))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(internal_name)?;
        self.intern(CpInfo::Class { name_index })
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.add_utf8(value)?;
        self.intern(CpInfo::String { string_index })
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.intern(CpInfo::Integer(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn add_fieldref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(CpInfo::Fieldref { class_index, name_and_type_index })
    }

    pub fn add_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(CpInfo::Methodref { class_index, name_and_type_index })
    }

    pub fn add_interface_methodref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(CpInfo::InterfaceMethodref { class_index, name_and_type_index })
    }

    fn intern(&mut self, info: CpInfo) -> Result<u16, ClassFileError> {
        let key = CpKey::of(&info);
        if self.lookup.is_none() {
            let mut lookup = HashMap::with_capacity(self.entries.len());
            for (i, entry) in self.iter() {
                let key = CpKey::of(entry);
                if key != CpKey::Other {
                    lookup.entry(key).or_insert(i);
                }
            }
            self.lookup = Some(lookup);
        }
        if let Some(index) = self.lookup.as_ref().and_then(|l| l.get(&key)) {
            return Ok(*index);
        }
        let wide = matches!(info, CpInfo::Long(_) | CpInfo::Double(_));
        let width = if wide { 2 } else { 1 };
        if self.entries.len() + width > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.entries.push(Some(info));
        if wide {
            self.entries.push(None);
        }
        if let Some(lookup) = self.lookup.as_mut() {
            lookup.insert(key, index);
        }
        Ok(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Debug, Clone)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    StackMapTable(StackMapTableAttribute),
    Exceptions { exception_index_table: Vec<u16> },
    SourceFile { sourcefile_index: u16 },
    LineNumberTable { entries: Vec<LineNumberEntry> },
    LocalVariableTable { entries: Vec<LocalVariableTableEntry> },
    LocalVariableTypeTable { entries: Vec<LocalVariableTypeTableEntry> },
    RuntimeVisibleAnnotations { annotations: Vec<Annotation> },
    RuntimeInvisibleAnnotations { annotations: Vec<Annotation> },
    Unknown { name: String, info: Vec<u8> },
}

impl AttributeInfo {
    pub fn name(&self) -> &str {
        match self {
            AttributeInfo::Code(_) => "Code",
            AttributeInfo::StackMapTable(_) => "StackMapTable",
            AttributeInfo::Exceptions { .. } => "Exceptions",
            AttributeInfo::SourceFile { .. } => "SourceFile",
            AttributeInfo::LineNumberTable { .. } => "LineNumberTable",
            AttributeInfo::LocalVariableTable { .. } => "LocalVariableTable",
            AttributeInfo::LocalVariableTypeTable { .. } => "LocalVariableTypeTable",
            AttributeInfo::RuntimeVisibleAnnotations { .. } => "RuntimeVisibleAnnotations",
            AttributeInfo::RuntimeInvisibleAnnotations { .. } => "RuntimeInvisibleAnnotations",
            AttributeInfo::Unknown { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct StackMapTableAttribute {
    pub entries: Vec<StackMapFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableTypeTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub signature_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone)]
pub struct Annotation {
    pub type_index: u16,
    pub element_value_pairs: Vec<ElementValuePair>,
}

#[derive(Debug, Clone)]
pub struct ElementValuePair {
    pub element_name_index: u16,
    pub value: ElementValue,
}

#[derive(Debug, Clone)]
pub enum ElementValue {
    Const { tag: u8, const_value_index: u16 },
    EnumConst { type_name_index: u16, const_name_index: u16 },
    ClassInfo { class_info_index: u16 },
    AnnotationValue(Annotation),
    ArrayValue(Vec<ElementValue>),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        let v = *self.data.get(self.pos).ok_or(ClassFileError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u2_list(&mut self) -> Result<Vec<u16>, ClassFileError> {
        let num = self.read_u2()? as usize;
        let mut out = Vec::with_capacity(num);
        for _ in 0..num {
            out.push(self.read_u2()?);
        }
        Ok(out)
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;
        let interfaces = r.read_u2_list()?;

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_attributes(&mut r, &constant_pool)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_attributes(&mut r, &constant_pool)?;
            methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let attributes = parse_attributes(&mut r, &constant_pool)?;

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn this_class_name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// `None` only for `java/lang/Object` and module descriptors.
    pub fn super_class_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces
            .iter()
            .map(|i| self.constant_pool.class_name(*i))
            .collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::ACC_INTERFACE != 0
    }

    /// Serialize the class. Every attribute name must already be present in
    /// the constant pool.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut names: HashMap<&str, u16> = HashMap::new();
        for (i, entry) in self.constant_pool.iter() {
            if let CpInfo::Utf8(s) = entry {
                names.entry(s.as_str()).or_insert(i);
            }
        }
        let mut w = Writer::default();
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        write_constant_pool(&mut w, &self.constant_pool)?;
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2_list(&self.interfaces);
        w.u2(self.fields.len() as u16);
        for field in &self.fields {
            w.u2(field.access_flags);
            w.u2(field.name_index);
            w.u2(field.descriptor_index);
            write_attributes(&mut w, &field.attributes, &names)?;
        }
        w.u2(self.methods.len() as u16);
        for method in &self.methods {
            w.u2(method.access_flags);
            w.u2(method.name_index);
            w.u2(method.descriptor_index);
            write_attributes(&mut w, &method.attributes, &names)?;
        }
        write_attributes(&mut w, &self.attributes, &names)?;
        Ok(w.buf)
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(decode_modified_utf8(r.read_bytes(len)?)?)
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                let value = if tag == 5 {
                    CpInfo::Long(bits as i64)
                } else {
                    CpInfo::Double(f64::from_bits(bits))
                };
                entries.push(Some(value));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        entries.push(Some(entry));
        i += 1;
    }

    Ok(ConstantPool { entries, lookup: None })
}

fn parse_attributes(r: &mut Reader, cp: &ConstantPool) -> Result<Vec<AttributeInfo>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let name = cp.get_utf8(name_index)?;
        let info_bytes = r.read_bytes(length)?;
        let mut sub = Reader::new(info_bytes);

        let attr = match name {
            "Code" => AttributeInfo::Code(parse_code_attribute(&mut sub, cp)?),
            "StackMapTable" => AttributeInfo::StackMapTable(parse_stack_map_table(&mut sub)?),
            "Exceptions" => AttributeInfo::Exceptions { exception_index_table: sub.read_u2_list()? },
            "SourceFile" => AttributeInfo::SourceFile { sourcefile_index: sub.read_u2()? },
            "LineNumberTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LineNumberEntry { start_pc: sub.read_u2()?, line_number: sub.read_u2()? });
                }
                AttributeInfo::LineNumberTable { entries }
            }
            "LocalVariableTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        descriptor_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                AttributeInfo::LocalVariableTable { entries }
            }
            "LocalVariableTypeTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTypeTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        signature_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                AttributeInfo::LocalVariableTypeTable { entries }
            }
            "RuntimeVisibleAnnotations" => {
                AttributeInfo::RuntimeVisibleAnnotations { annotations: parse_annotations(&mut sub)? }
            }
            "RuntimeInvisibleAnnotations" => {
                AttributeInfo::RuntimeInvisibleAnnotations { annotations: parse_annotations(&mut sub)? }
            }
            _ => {
                sub.read_bytes(sub.remaining())?;
                AttributeInfo::Unknown { name: name.to_string(), info: info_bytes.to_vec() }
            }
        };

        if sub.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute(name.to_string()));
        }

        attrs.push(attr);
    }
    Ok(attrs)
}

fn parse_code_attribute(r: &mut Reader, cp: &ConstantPool) -> Result<CodeAttribute, ClassFileError> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let exception_table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(exception_table_length);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }
    let attributes = parse_attributes(r, cp)?;
    Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
}

fn parse_stack_map_table(r: &mut Reader) -> Result<StackMapTableAttribute, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => StackMapFrame::Chop { offset_delta: r.read_u2()?, k: 251u8 - frame_type },
            251 => StackMapFrame::SameExtended { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(parse_verification_type_info(r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals {
                    locals.push(parse_verification_type_info(r)?);
                }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack {
                    stack.push(parse_verification_type_info(r)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }
    Ok(StackMapTableAttribute { entries })
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

fn parse_annotations(r: &mut Reader) -> Result<Vec<Annotation>, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut annotations = Vec::with_capacity(num);
    for _ in 0..num {
        annotations.push(parse_annotation(r)?);
    }
    Ok(annotations)
}

fn parse_annotation(r: &mut Reader) -> Result<Annotation, ClassFileError> {
    let type_index = r.read_u2()?;
    let num_pairs = r.read_u2()? as usize;
    let mut element_value_pairs = Vec::with_capacity(num_pairs);
    for _ in 0..num_pairs {
        let element_name_index = r.read_u2()?;
        let value = parse_element_value(r)?;
        element_value_pairs.push(ElementValuePair { element_name_index, value });
    }
    Ok(Annotation { type_index, element_value_pairs })
}

fn parse_element_value(r: &mut Reader) -> Result<ElementValue, ClassFileError> {
    let tag = r.read_u1()?;
    let value = match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => {
            ElementValue::Const { tag, const_value_index: r.read_u2()? }
        }
        b'e' => ElementValue::EnumConst { type_name_index: r.read_u2()?, const_name_index: r.read_u2()? },
        b'c' => ElementValue::ClassInfo { class_info_index: r.read_u2()? },
        b'@' => ElementValue::AnnotationValue(parse_annotation(r)?),
        b'[' => {
            let num_values = r.read_u2()? as usize;
            let mut values = Vec::with_capacity(num_values);
            for _ in 0..num_values {
                values.push(parse_element_value(r)?);
            }
            ElementValue::ArrayValue(values)
        }
        _ => return Err(ClassFileError::InvalidAttribute("annotation".to_string())),
    };
    Ok(value)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u1(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u4(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u2_list(&mut self, list: &[u16]) {
        self.u2(list.len() as u16);
        for v in list {
            self.u2(*v);
        }
    }
}

fn write_constant_pool(w: &mut Writer, cp: &ConstantPool) -> Result<(), ClassFileError> {
    w.u2(cp.count() as u16);
    for (_, entry) in cp.iter() {
        match entry {
            CpInfo::Utf8(s) => {
                let bytes = encode_modified_utf8(s);
                if bytes.len() > u16::MAX as usize {
                    return Err(ClassFileError::Utf8TooLong(bytes.len()));
                }
                w.u1(1);
                w.u2(bytes.len() as u16);
                w.bytes(&bytes);
            }
            CpInfo::Integer(v) => {
                w.u1(3);
                w.u4(*v as u32);
            }
            CpInfo::Float(v) => {
                w.u1(4);
                w.u4(v.to_bits());
            }
            CpInfo::Long(v) => {
                w.u1(5);
                w.bytes(&v.to_be_bytes());
            }
            CpInfo::Double(v) => {
                w.u1(6);
                w.bytes(&v.to_bits().to_be_bytes());
            }
            CpInfo::Class { name_index } => {
                w.u1(7);
                w.u2(*name_index);
            }
            CpInfo::String { string_index } => {
                w.u1(8);
                w.u2(*string_index);
            }
            CpInfo::Fieldref { class_index, name_and_type_index } => {
                w.u1(9);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::Methodref { class_index, name_and_type_index } => {
                w.u1(10);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                w.u1(11);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::NameAndType { name_index, descriptor_index } => {
                w.u1(12);
                w.u2(*name_index);
                w.u2(*descriptor_index);
            }
            CpInfo::MethodHandle { reference_kind, reference_index } => {
                w.u1(15);
                w.u1(*reference_kind);
                w.u2(*reference_index);
            }
            CpInfo::MethodType { descriptor_index } => {
                w.u1(16);
                w.u2(*descriptor_index);
            }
            CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(17);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(18);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::Module { name_index } => {
                w.u1(19);
                w.u2(*name_index);
            }
            CpInfo::Package { name_index } => {
                w.u1(20);
                w.u2(*name_index);
            }
        }
    }
    Ok(())
}

fn write_attributes(
    w: &mut Writer,
    attrs: &[AttributeInfo],
    names: &HashMap<&str, u16>,
) -> Result<(), ClassFileError> {
    w.u2(attrs.len() as u16);
    for attr in attrs {
        let name = attr.name();
        let name_index = *names
            .get(name)
            .ok_or_else(|| ClassFileError::MissingAttributeName(name.to_string()))?;
        let mut body = Writer::default();
        match attr {
            AttributeInfo::Code(code) => {
                body.u2(code.max_stack);
                body.u2(code.max_locals);
                body.u4(code.code.len() as u32);
                body.bytes(&code.code);
                body.u2(code.exception_table.len() as u16);
                for e in &code.exception_table {
                    body.u2(e.start_pc);
                    body.u2(e.end_pc);
                    body.u2(e.handler_pc);
                    body.u2(e.catch_type);
                }
                write_attributes(&mut body, &code.attributes, names)?;
            }
            AttributeInfo::StackMapTable(table) => {
                body.u2(table.entries.len() as u16);
                for frame in &table.entries {
                    write_stack_map_frame(&mut body, frame);
                }
            }
            AttributeInfo::Exceptions { exception_index_table } => body.u2_list(exception_index_table),
            AttributeInfo::SourceFile { sourcefile_index } => body.u2(*sourcefile_index),
            AttributeInfo::LineNumberTable { entries } => {
                body.u2(entries.len() as u16);
                for e in entries {
                    body.u2(e.start_pc);
                    body.u2(e.line_number);
                }
            }
            AttributeInfo::LocalVariableTable { entries } => {
                body.u2(entries.len() as u16);
                for e in entries {
                    body.u2(e.start_pc);
                    body.u2(e.length);
                    body.u2(e.name_index);
                    body.u2(e.descriptor_index);
                    body.u2(e.index);
                }
            }
            AttributeInfo::LocalVariableTypeTable { entries } => {
                body.u2(entries.len() as u16);
                for e in entries {
                    body.u2(e.start_pc);
                    body.u2(e.length);
                    body.u2(e.name_index);
                    body.u2(e.signature_index);
                    body.u2(e.index);
                }
            }
            AttributeInfo::RuntimeVisibleAnnotations { annotations }
            | AttributeInfo::RuntimeInvisibleAnnotations { annotations } => {
                body.u2(annotations.len() as u16);
                for a in annotations {
                    write_annotation(&mut body, a);
                }
            }
            AttributeInfo::Unknown { info, .. } => body.bytes(info),
        }
        w.u2(name_index);
        w.u4(body.buf.len() as u32);
        w.bytes(&body.buf);
    }
    Ok(())
}

fn write_stack_map_frame(w: &mut Writer, frame: &StackMapFrame) {
    match frame {
        StackMapFrame::Same { offset_delta } => w.u1(*offset_delta as u8),
        StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
            w.u1(64 + *offset_delta as u8);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
            w.u1(247);
            w.u2(*offset_delta);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::Chop { offset_delta, k } => {
            w.u1(251 - *k);
            w.u2(*offset_delta);
        }
        StackMapFrame::SameExtended { offset_delta } => {
            w.u1(251);
            w.u2(*offset_delta);
        }
        StackMapFrame::Append { offset_delta, locals } => {
            w.u1(251 + locals.len() as u8);
            w.u2(*offset_delta);
            for l in locals {
                write_verification_type_info(w, l);
            }
        }
        StackMapFrame::Full { offset_delta, locals, stack } => {
            w.u1(255);
            w.u2(*offset_delta);
            w.u2(locals.len() as u16);
            for l in locals {
                write_verification_type_info(w, l);
            }
            w.u2(stack.len() as u16);
            for s in stack {
                write_verification_type_info(w, s);
            }
        }
    }
}

fn write_verification_type_info(w: &mut Writer, info: &VerificationTypeInfo) {
    match info {
        VerificationTypeInfo::Top => w.u1(0),
        VerificationTypeInfo::Integer => w.u1(1),
        VerificationTypeInfo::Float => w.u1(2),
        VerificationTypeInfo::Double => w.u1(3),
        VerificationTypeInfo::Long => w.u1(4),
        VerificationTypeInfo::Null => w.u1(5),
        VerificationTypeInfo::UninitializedThis => w.u1(6),
        VerificationTypeInfo::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset);
        }
    }
}

fn write_annotation(w: &mut Writer, annotation: &Annotation) {
    w.u2(annotation.type_index);
    w.u2(annotation.element_value_pairs.len() as u16);
    for pair in &annotation.element_value_pairs {
        w.u2(pair.element_name_index);
        write_element_value(w, &pair.value);
    }
}

fn write_element_value(w: &mut Writer, value: &ElementValue) {
    match value {
        ElementValue::Const { tag, const_value_index } => {
            w.u1(*tag);
            w.u2(*const_value_index);
        }
        ElementValue::EnumConst { type_name_index, const_name_index } => {
            w.u1(b'e');
            w.u2(*type_name_index);
            w.u2(*const_name_index);
        }
        ElementValue::ClassInfo { class_info_index } => {
            w.u1(b'c');
            w.u2(*class_info_index);
        }
        ElementValue::AnnotationValue(a) => {
            w.u1(b'@');
            write_annotation(w, a);
        }
        ElementValue::ArrayValue(values) => {
            w.u1(b'[');
            w.u2(values.len() as u16);
            for v in values {
                write_element_value(w, v);
            }
        }
    }
}

/// Decode the JVM's modified UTF-8 (two-byte NUL, surrogate pairs encoded
/// as two three-byte sequences).
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassFileError> {
    if bytes.iter().all(|b| *b != 0 && *b < 0x80) {
        return std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ClassFileError::InvalidUtf8);
    }
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let cont = |at: usize| -> Result<u16, ClassFileError> {
            match bytes.get(at) {
                Some(c) if c & 0xC0 == 0x80 => Ok((c & 0x3F) as u16),
                _ => Err(ClassFileError::InvalidUtf8),
            }
        };
        if b != 0 && b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push(((b & 0x1F) as u16) << 6 | cont(i + 1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            units.push(((b & 0x0F) as u16) << 12 | cont(i + 1)? << 6 | cont(i + 2)?);
            i += 3;
        } else {
            return Err(ClassFileError::InvalidUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| ClassFileError::InvalidUtf8)
}

pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
