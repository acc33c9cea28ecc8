//! Verdict interpretation after a dispatch call.
//!
//! Every dispatch leaves a `Spy$Ret` on top of the operand stack. The code
//! emitted here consumes it: on `RETURN` the carried value is coerced to the
//! method's return type and returned, on `THROWS` it is thrown, otherwise
//! execution continues with the stack exactly as it was below the `Ret`.

use crate::bytecode::opcodes::*;
use crate::descriptor::JavaType;
use crate::error::ClassFileError;
use crate::spy::{RET_CLASS, RET_RESPOND_FIELD, RET_STATE_FIELD, RET_STATE_RETURN, RET_STATE_THROWS};

use super::emit::{Emitter, OBJECT, THROWABLE};

/// Emit the verdict check for a method returning `return_type`.
pub(crate) fn process_control(e: &mut Emitter<'_>, return_type: &JavaType) -> Result<(), ClassFileError> {
    let not_return = e.new_label();
    let finish = e.new_label();

    // [.. ret] -> [.. ret state state]
    e.op(DUP);
    e.field(GETFIELD, RET_CLASS, RET_STATE_FIELD, "I")?;
    e.op(DUP);
    e.push_int(RET_STATE_RETURN)?;
    e.jump(IF_ICMPNE, not_return);

    // [.. ret state]
    e.op(POP);
    e.field(GETFIELD, RET_CLASS, RET_RESPOND_FIELD, &format!("L{OBJECT};"))?;
    e.unbox_value(return_type)?;
    e.op(return_type.return_opcode());

    e.place(not_return);
    e.push_int(RET_STATE_THROWS)?;
    e.jump(IF_ICMPNE, finish);
    e.field(GETFIELD, RET_CLASS, RET_RESPOND_FIELD, &format!("L{OBJECT};"))?;
    e.type_insn(CHECKCAST, THROWABLE)?;
    e.op(ATHROW);

    e.place(finish);
    e.op(POP);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{analyze, Insn, MethodBody, MethodContext, ObjectHierarchy};
    use crate::classfile::{access::*, ConstantPool};
    use crate::descriptor::MethodDescriptor;

    fn checked_body(desc: &str) -> Result<(), crate::error::BytecodeError> {
        let descriptor = MethodDescriptor::parse(desc).unwrap();
        let mut body = MethodBody::new();
        let mut cp = ConstantPool::new();
        {
            let mut e = Emitter::new(&mut body, &mut cp, 0);
            e.op(ICONST_1);
            e.op(ACONST_NULL);
            e.type_insn(CHECKCAST, RET_CLASS).unwrap();
            process_control(&mut e, &descriptor.return_type).unwrap();
            e.op(POP);
            match descriptor.return_type {
                JavaType::Void => {}
                JavaType::Long => e.op(LCONST_0),
                JavaType::Double => e.op(DCONST_0),
                JavaType::Float => e.op(FCONST_0),
                JavaType::Object(_) | JavaType::Array(_) => e.op(ACONST_NULL),
                _ => e.op(ICONST_0),
            }
            e.op(descriptor.return_type.return_opcode());
        }
        let ctx = MethodContext { owner: "demo/A", access_flags: ACC_STATIC, name: "f", descriptor: &descriptor };
        analyze(&body, ctx, &cp, &ObjectHierarchy).map(|_| ())
    }

    #[test]
    fn verdict_check_keeps_the_stack_balanced() {
        for desc in ["()V", "()I", "()J", "()D", "()Z", "()C", "()Ljava/lang/String;", "()[I"] {
            checked_body(desc).unwrap_or_else(|e| panic!("{desc}: {e}"));
        }
    }

    #[test]
    fn numeric_returns_go_through_number() {
        let descriptor = MethodDescriptor::parse("()S").unwrap();
        let mut body = MethodBody::new();
        let mut cp = ConstantPool::new();
        let mut e = Emitter::new(&mut body, &mut cp, 0);
        process_control(&mut e, &descriptor.return_type).unwrap();
        let short_value = cp.add_methodref("java/lang/Number", "shortValue", "()S").unwrap();
        assert!(body.insns.contains(&Insn::Method { op: INVOKEVIRTUAL, index: short_value }));
    }
}
