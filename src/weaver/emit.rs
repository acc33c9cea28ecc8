//! Instruction emission helpers used while rebuilding a method body.

use crate::bytecode::opcodes::*;
use crate::bytecode::{Insn, Label, MethodBody};
use crate::classfile::ConstantPool;
use crate::descriptor::JavaType;
use crate::error::ClassFileError;

use super::lock::{LOCK, UNLOCK};

pub(crate) const OBJECT: &str = "java/lang/Object";
pub(crate) const THROWABLE: &str = "java/lang/Throwable";
const NUMBER: &str = "java/lang/Number";

/// Appends instructions to `body`, interning constants in `cp` as needed.
pub(crate) struct Emitter<'a> {
    pub body: &'a mut MethodBody,
    pub cp: &'a mut ConstantPool,
    next_local: u16,
}

impl<'a> Emitter<'a> {
    pub fn new(body: &'a mut MethodBody, cp: &'a mut ConstantPool, first_free_local: u16) -> Self {
        Self { body, cp, next_local: first_free_local }
    }

    pub fn insn(&mut self, insn: Insn) {
        self.body.insns.push(insn);
    }

    pub fn op(&mut self, op: u8) {
        self.insn(Insn::Simple(op));
    }

    pub fn new_label(&mut self) -> Label {
        self.body.new_label()
    }

    pub fn place(&mut self, label: Label) {
        self.insn(Insn::Label(label));
    }

    pub fn jump(&mut self, op: u8, target: Label) {
        self.insn(Insn::Jump { op, target });
    }

    pub fn lock(&mut self) {
        self.body.insns.extend(LOCK);
    }

    pub fn unlock(&mut self) {
        self.body.insns.extend(UNLOCK);
    }

    /// Reserve a fresh local of `size` slots past every slot the original
    /// body uses.
    pub fn new_local(&mut self, size: u16) -> u16 {
        let slot = self.next_local;
        self.next_local += size;
        self.body.max_locals = self.body.max_locals.max(self.next_local);
        slot
    }

    pub fn push_int(&mut self, value: i32) -> Result<(), ClassFileError> {
        match value {
            -1..=5 => self.op((ICONST_0 as i32 + value) as u8),
            -128..=127 => self.insn(Insn::Int { op: BIPUSH, value }),
            -32768..=32767 => self.insn(Insn::Int { op: SIPUSH, value }),
            _ => {
                let index = self.cp.add_integer(value)?;
                self.insn(Insn::Ldc { index });
            }
        }
        Ok(())
    }

    pub fn push_string(&mut self, value: &str) -> Result<(), ClassFileError> {
        let index = self.cp.add_string(value)?;
        self.insn(Insn::Ldc { index });
        Ok(())
    }

    pub fn type_insn(&mut self, op: u8, class: &str) -> Result<(), ClassFileError> {
        let class = self.cp.add_class(class)?;
        self.insn(Insn::Type { op, class });
        Ok(())
    }

    pub fn field(&mut self, op: u8, owner: &str, name: &str, desc: &str) -> Result<(), ClassFileError> {
        let index = self.cp.add_fieldref(owner, name, desc)?;
        self.insn(Insn::Field { op, index });
        Ok(())
    }

    pub fn invoke(&mut self, op: u8, owner: &str, name: &str, desc: &str) -> Result<(), ClassFileError> {
        let index = self.cp.add_methodref(owner, name, desc)?;
        self.insn(Insn::Method { op, index });
        Ok(())
    }

    pub fn load(&mut self, ty: &JavaType, slot: u16) {
        self.insn(Insn::Var { op: ty.load_opcode(), slot });
    }

    pub fn store(&mut self, ty: &JavaType, slot: u16) {
        self.insn(Insn::Var { op: ty.store_opcode(), slot });
    }

    /// Duplicate a value of `ty` on top of the stack.
    pub fn dup_value(&mut self, ty: &JavaType) {
        match ty.size() {
            0 => {}
            1 => self.op(DUP),
            _ => self.op(DUP2),
        }
    }

    /// Turn the value of `ty` on top of the stack into an `Object`; `void`
    /// pushes `null`.
    pub fn box_value(&mut self, ty: &JavaType) -> Result<(), ClassFileError> {
        if *ty == JavaType::Void {
            self.op(ACONST_NULL);
            return Ok(());
        }
        if let Some(wrapper) = ty.box_class() {
            let desc = format!("({})L{wrapper};", ty.descriptor());
            self.invoke(INVOKESTATIC, wrapper, "valueOf", &desc)?;
        }
        Ok(())
    }

    /// Turn the `Object` on top of the stack into a value of `ty`.
    ///
    /// Numeric primitives go through `Number`, so a listener may hand back
    /// any numeric box; anything else fails with `ClassCastException`.
    pub fn unbox_value(&mut self, ty: &JavaType) -> Result<(), ClassFileError> {
        let (owner, name, desc) = match ty {
            JavaType::Void => {
                self.op(POP);
                return Ok(());
            }
            JavaType::Object(_) | JavaType::Array(_) => {
                if let Some(class) = ty.class_operand() {
                    if class != OBJECT {
                        self.type_insn(CHECKCAST, &class)?;
                    }
                }
                return Ok(());
            }
            JavaType::Boolean => ("java/lang/Boolean", "booleanValue", "()Z"),
            JavaType::Char => ("java/lang/Character", "charValue", "()C"),
            JavaType::Byte => (NUMBER, "byteValue", "()B"),
            JavaType::Short => (NUMBER, "shortValue", "()S"),
            JavaType::Int => (NUMBER, "intValue", "()I"),
            JavaType::Long => (NUMBER, "longValue", "()J"),
            JavaType::Float => (NUMBER, "floatValue", "()F"),
            JavaType::Double => (NUMBER, "doubleValue", "()D"),
        };
        self.type_insn(CHECKCAST, owner)?;
        self.invoke(INVOKEVIRTUAL, owner, name, desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_constants_use_the_shortest_form() {
        let mut body = MethodBody::new();
        let mut cp = ConstantPool::new();
        let mut e = Emitter::new(&mut body, &mut cp, 0);
        for v in [-1, 5, 100, -200, 70_000] {
            e.push_int(v).unwrap();
        }
        assert_eq!(
            body.insns[..4],
            [
                Insn::Simple(ICONST_M1),
                Insn::Simple(ICONST_5),
                Insn::Int { op: BIPUSH, value: 100 },
                Insn::Int { op: SIPUSH, value: -200 },
            ]
        );
        assert!(matches!(body.insns[4], Insn::Ldc { .. }));
    }

    #[test]
    fn fresh_locals_grow_max_locals() {
        let mut body = MethodBody::new();
        let mut cp = ConstantPool::new();
        let mut e = Emitter::new(&mut body, &mut cp, 3);
        assert_eq!(e.new_local(2), 3);
        assert_eq!(e.new_local(1), 5);
        assert_eq!(body.max_locals, 6);
    }
}
