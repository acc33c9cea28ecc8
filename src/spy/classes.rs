//! Class files for `Spy` and `Spy$Ret`, defined once per process in the
//! root loading scope so woven code in every boundary can link against them.

use super::*;
use crate::bytecode::opcodes::*;
use crate::bytecode::{assemble, Insn, MethodBody, MethodContext, ObjectHierarchy};
use crate::classfile::{access::*, ClassFile, ConstantPool, FieldInfo, MethodInfo};
use crate::descriptor::MethodDescriptor;
use crate::error::BytecodeError;

const CLASS_VERSION: u16 = 52;
const OBJECT: &str = "java/lang/Object";

const DISPATCH_METHODS: [(&str, &str); 7] = [
    (ON_BEFORE, ON_BEFORE_DESC),
    (ON_RETURN, ON_RETURN_DESC),
    (ON_THROWS, ON_THROWS_DESC),
    (ON_LINE, ON_LINE_DESC),
    (ON_CALL_BEFORE, ON_CALL_BEFORE_DESC),
    (ON_CALL_RETURN, ON_CALL_RETURN_DESC),
    (ON_CALL_THROWS, ON_CALL_THROWS_DESC),
];

fn empty_class(name: &str, access_flags: u16) -> Result<ClassFile, BytecodeError> {
    let mut constant_pool = ConstantPool::new();
    let this_class = constant_pool.add_class(name)?;
    let super_class = constant_pool.add_class(OBJECT)?;
    Ok(ClassFile {
        minor_version: 0,
        major_version: CLASS_VERSION,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        attributes: Vec::new(),
    })
}

fn spy_class() -> Result<Vec<u8>, BytecodeError> {
    let mut class = empty_class(SPY_CLASS, ACC_PUBLIC | ACC_FINAL | ACC_SUPER)?;
    for (name, desc) in DISPATCH_METHODS {
        let name_index = class.constant_pool.add_utf8(name)?;
        let descriptor_index = class.constant_pool.add_utf8(desc)?;
        class.methods.push(MethodInfo {
            access_flags: ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
    }
    Ok(class.to_bytes()?)
}

fn ret_class() -> Result<Vec<u8>, BytecodeError> {
    let mut class = empty_class(RET_CLASS, ACC_PUBLIC | ACC_FINAL | ACC_SUPER)?;
    let cp = &mut class.constant_pool;
    for (name, desc) in [(RET_STATE_FIELD, "I"), (RET_RESPOND_FIELD, "Ljava/lang/Object;")] {
        let name_index = cp.add_utf8(name)?;
        let descriptor_index = cp.add_utf8(desc)?;
        class.fields.push(FieldInfo {
            access_flags: ACC_PUBLIC | ACC_FINAL,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
    }

    let init_desc = "(ILjava/lang/Object;)V";
    let mut body = MethodBody::new();
    body.insns = vec![
        Insn::Var { op: ALOAD, slot: 0 },
        Insn::Method { op: INVOKESPECIAL, index: cp.add_methodref(OBJECT, "<init>", "()V")? },
        Insn::Var { op: ALOAD, slot: 0 },
        Insn::Var { op: ILOAD, slot: 1 },
        Insn::Field { op: PUTFIELD, index: cp.add_fieldref(RET_CLASS, RET_STATE_FIELD, "I")? },
        Insn::Var { op: ALOAD, slot: 0 },
        Insn::Var { op: ALOAD, slot: 2 },
        Insn::Field {
            op: PUTFIELD,
            index: cp.add_fieldref(RET_CLASS, RET_RESPOND_FIELD, "Ljava/lang/Object;")?,
        },
        Insn::Simple(RETURN),
    ];
    let descriptor = MethodDescriptor::parse(init_desc)?;
    let ctx = MethodContext { owner: RET_CLASS, access_flags: ACC_PUBLIC, name: "<init>", descriptor: &descriptor };
    cp.add_utf8("Code")?;
    let code = assemble(&body, ctx, cp, &ObjectHierarchy, CLASS_VERSION)?;
    let name_index = cp.add_utf8("<init>")?;
    let descriptor_index = cp.add_utf8(init_desc)?;
    class.methods.push(MethodInfo {
        access_flags: ACC_PUBLIC,
        name_index,
        descriptor_index,
        attributes: vec![crate::classfile::AttributeInfo::Code(code)],
    });
    Ok(class.to_bytes()?)
}

/// `(internal name, class bytes)` for the dispatch shim classes, in
/// definition order.
pub fn spy_class_files() -> Result<Vec<(String, Vec<u8>)>, BytecodeError> {
    Ok(vec![(SPY_CLASS.to_string(), spy_class()?), (RET_CLASS.to_string(), ret_class()?)])
}
