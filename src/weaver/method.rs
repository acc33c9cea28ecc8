//! Rewriting of one method body.
//!
//! The rebuilt body has this shape:
//!
//! ```text
//!   <constructor prologue up to the super/this <init> call>
//!   BEFORE dispatch, verdict check, argument write-back
//! throws_start:
//!   original instructions, with LINE / RETURN / CALL_* dispatches spliced in
//! throws_end:
//!   THROWS dispatch, verdict check, rethrow
//! ```
//!
//! Exception table entries are buffered while traversing and written at the
//! end: per-call CALL_THROWS entries, then the original entries, then the
//! method-wide THROWS entry. The runtime searches the table in order, so the
//! original handlers keep precedence over the synthetic outer one.

use crate::bytecode::opcodes::*;
use crate::bytecode::{
    analyze, assemble, decode, Insn, MethodBody, MethodContext, TryCatch, TypeHierarchy, VType,
};
use crate::classfile::{CodeAttribute, ConstantPool};
use crate::descriptor::{to_java_name, JavaType, MethodDescriptor};
use crate::error::{BytecodeError, ClassFileError};
use crate::event::{EventType, EventTypes};
use crate::spy::*;

use super::control::process_control;
use super::emit::{Emitter, OBJECT, THROWABLE};
use super::lock::CodeLock;

/// What to weave into a method and where dispatches are addressed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WeavePlan<'a> {
    pub namespace: &'a str,
    pub listener_id: i32,
    pub loader_id: i32,
    pub event_types: EventTypes,
    /// Java name of the declaring class.
    pub class_name: &'a str,
}

impl WeavePlan<'_> {
    fn wants(&self, ty: EventType) -> bool {
        self.event_types.has(ty)
    }
}

/// Index of the first instruction after the constructor's own super/this
/// `<init>` call; `0` for everything that is not a constructor.
fn entry_point(
    body: &MethodBody,
    ctx: MethodContext<'_>,
    cp: &ConstantPool,
    hierarchy: &dyn TypeHierarchy,
) -> Result<usize, BytecodeError> {
    if !ctx.is_constructor() || ctx.owner == OBJECT {
        return Ok(0);
    }
    let analysis = analyze(body, ctx, cp, hierarchy)?;
    for (i, insn) in body.insns.iter().enumerate() {
        let Insn::Method { op: INVOKESPECIAL, index } = insn else { continue };
        let (_, name, desc) = cp.member_ref(*index)?;
        if name != "<init>" {
            continue;
        }
        let Some(frame) = &analysis.frames[i] else { continue };
        let args = MethodDescriptor::parse(desc)?.parameter_slots();
        let on_this = frame
            .stack
            .len()
            .checked_sub(args + 1)
            .map_or(false, |receiver| frame.stack[receiver] == VType::UninitializedThis);
        if on_this {
            return Ok(i + 1);
        }
    }
    Err(BytecodeError::MissingConstructorCall)
}

struct MethodWeaver<'p, 'e> {
    plan: &'p WeavePlan<'p>,
    ctx: MethodContext<'p>,
    e: Emitter<'e>,
    call_entries: Vec<TryCatch>,
}

impl MethodWeaver<'_, '_> {
    fn return_type(&self) -> &JavaType {
        &self.ctx.descriptor.return_type
    }

    fn dispatch(&mut self, name: &str, desc: &str) -> Result<(), ClassFileError> {
        self.e.push_string(self.plan.namespace)?;
        self.e.push_int(self.plan.listener_id)?;
        self.e.invoke(INVOKESTATIC, SPY_CLASS, name, desc)?;
        let return_type = self.ctx.descriptor.return_type.clone();
        process_control(&mut self.e, &return_type)
    }

    fn before(&mut self) -> Result<(), ClassFileError> {
        let params = self.ctx.descriptor.parameters.clone();
        let first_param: u16 = if self.ctx.is_static() { 0 } else { 1 };

        self.e.lock();
        self.e.push_int(params.len() as i32)?;
        self.e.type_insn(ANEWARRAY, OBJECT)?;
        let mut slot = first_param;
        for (i, ty) in params.iter().enumerate() {
            self.e.op(DUP);
            self.e.push_int(i as i32)?;
            self.e.load(ty, slot);
            self.e.box_value(ty)?;
            self.e.op(AASTORE);
            slot += ty.size() as u16;
        }
        let args = self.e.new_local(1);
        self.e.insn(Insn::Var { op: ASTORE, slot: args });

        // the namespace and listener id sit between the arguments and the rest
        self.e.insn(Insn::Var { op: ALOAD, slot: args });
        self.e.push_string(self.plan.namespace)?;
        self.e.push_int(self.plan.listener_id)?;
        self.e.push_int(self.plan.loader_id)?;
        self.e.push_string(self.plan.class_name)?;
        self.e.push_string(self.ctx.name)?;
        let desc = self.ctx.descriptor.descriptor();
        self.e.push_string(&desc)?;
        if self.ctx.is_static() {
            self.e.op(ACONST_NULL);
        } else {
            self.e.insn(Insn::Var { op: ALOAD, slot: 0 });
        }
        self.e.invoke(INVOKESTATIC, SPY_CLASS, ON_BEFORE, ON_BEFORE_DESC)?;
        let return_type = self.return_type().clone();
        process_control(&mut self.e, &return_type)?;

        let mut slot = first_param;
        for (i, ty) in params.iter().enumerate() {
            self.e.insn(Insn::Var { op: ALOAD, slot: args });
            self.e.push_int(i as i32)?;
            self.e.op(AALOAD);
            self.e.unbox_value(ty)?;
            self.e.store(ty, slot);
            slot += ty.size() as u16;
        }
        self.e.unlock();
        Ok(())
    }

    /// Value to be returned is on top of the stack.
    fn on_return(&mut self) -> Result<(), ClassFileError> {
        let return_type = self.return_type().clone();
        self.e.lock();
        self.e.dup_value(&return_type);
        self.e.box_value(&return_type)?;
        self.dispatch(ON_RETURN, ON_RETURN_DESC)?;
        self.e.unlock();
        Ok(())
    }

    fn on_line(&mut self, line: u16) -> Result<(), ClassFileError> {
        self.e.lock();
        self.e.push_int(line as i32)?;
        self.dispatch(ON_LINE, ON_LINE_DESC)?;
        self.e.unlock();
        Ok(())
    }

    fn on_call_return(&mut self) -> Result<(), ClassFileError> {
        self.e.lock();
        self.dispatch(ON_CALL_RETURN, ON_CALL_RETURN_DESC)?;
        self.e.unlock();
        Ok(())
    }

    /// Wrap one invocation with the requested call-boundary dispatches.
    fn call(&mut self, insn: Insn, index: u16, line: i32) -> Result<(), ClassFileError> {
        let (owner, name, desc) = {
            let (owner, name, desc) = self.e.cp.member_ref(index)?;
            (to_java_name(owner), name.to_string(), desc.to_string())
        };

        if self.plan.wants(EventType::CallBefore) {
            self.e.lock();
            self.e.push_int(line)?;
            self.e.push_string(&owner)?;
            self.e.push_string(&name)?;
            self.e.push_string(&desc)?;
            self.dispatch(ON_CALL_BEFORE, ON_CALL_BEFORE_DESC)?;
            self.e.unlock();
        }

        if !self.plan.wants(EventType::CallThrows) {
            self.e.insn(insn);
            if self.plan.wants(EventType::CallReturn) {
                self.on_call_return()?;
            }
            return Ok(());
        }

        let start = self.e.new_label();
        let end = self.e.new_label();
        let handler = self.e.new_label();
        let after = self.e.new_label();
        self.e.place(start);
        self.e.insn(insn);
        self.e.place(end);
        if self.plan.wants(EventType::CallReturn) {
            self.on_call_return()?;
        }
        self.e.jump(GOTO, after);

        self.e.place(handler);
        self.e.lock();
        self.e.op(DUP);
        self.e.invoke(INVOKEVIRTUAL, OBJECT, "getClass", "()Ljava/lang/Class;")?;
        self.e.invoke(INVOKEVIRTUAL, "java/lang/Class", "getName", "()Ljava/lang/String;")?;
        self.dispatch(ON_CALL_THROWS, ON_CALL_THROWS_DESC)?;
        self.e.unlock();
        self.e.op(ATHROW);
        self.e.place(after);

        let catch_type = self.e.cp.add_class(THROWABLE)?;
        self.call_entries.push(TryCatch { start, end, handler, catch_type });
        Ok(())
    }

    fn on_throws(&mut self) -> Result<(), ClassFileError> {
        self.e.lock();
        let throwable = self.e.new_local(1);
        self.e.insn(Insn::Var { op: ASTORE, slot: throwable });
        self.e.insn(Insn::Var { op: ALOAD, slot: throwable });
        self.dispatch(ON_THROWS, ON_THROWS_DESC)?;
        self.e.unlock();
        self.e.insn(Insn::Var { op: ALOAD, slot: throwable });
        self.e.op(ATHROW);
        Ok(())
    }

    /// Copy the original instructions from the entry point on, splicing in
    /// dispatches outside of previously injected code.
    fn traverse(&mut self, original: Vec<Insn>, mut line: i32) -> Result<(), ClassFileError> {
        let mut lock = CodeLock::new();
        let wants_calls = self.plan.event_types.intersects(EventTypes::CALLS);
        for insn in original {
            lock.observe(&insn);
            let locked = lock.is_locked();
            match insn {
                Insn::Line(n) => {
                    line = n as i32;
                    self.e.insn(insn);
                    if self.plan.wants(EventType::Line) && !locked {
                        self.on_line(n)?;
                    }
                }
                Insn::Simple(op) if is_return(op) && !locked && self.plan.wants(EventType::Return) => {
                    self.on_return()?;
                    self.e.insn(insn);
                }
                Insn::Method { index, .. } if wants_calls && !locked => {
                    self.call(insn, index, line)?;
                }
                other => self.e.insn(other),
            }
        }
        Ok(())
    }
}

/// Rewrite one `Code` attribute for `plan`.
pub(crate) fn weave_method(
    code: &CodeAttribute,
    ctx: MethodContext<'_>,
    cp: &mut ConstantPool,
    hierarchy: &dyn TypeHierarchy,
    major_version: u16,
    plan: &WeavePlan<'_>,
) -> Result<CodeAttribute, BytecodeError> {
    let mut body = decode(code)?;
    let entry = entry_point(&body, ctx, cp, hierarchy)?;

    let mut original = std::mem::take(&mut body.insns);
    let original_try_catch = std::mem::take(&mut body.try_catch);
    let after_entry = original.split_off(entry);
    let prologue = original;

    let argument_slots = ctx.descriptor.parameter_slots() as u16 + u16::from(!ctx.is_static());
    let first_free = body.max_locals.max(argument_slots);
    body.max_locals = first_free;

    let mut line = -1;
    let mut call_entries = Vec::new();
    let mut throws_entry = None;
    {
        let mut w = MethodWeaver {
            plan,
            ctx,
            e: Emitter::new(&mut body, cp, first_free),
            call_entries: Vec::new(),
        };
        for insn in prologue {
            if let Insn::Line(n) = insn {
                line = n as i32;
            }
            w.e.insn(insn);
        }
        if plan.wants(EventType::Before) {
            w.before()?;
        }

        let throws_start = w.e.new_label();
        let throws_end = w.e.new_label();
        w.e.place(throws_start);
        w.traverse(after_entry, line)?;
        w.e.place(throws_end);
        if plan.wants(EventType::Throws) {
            let handler = w.e.new_label();
            w.e.place(handler);
            w.on_throws()?;
            let catch_type = w.e.cp.add_class(THROWABLE)?;
            throws_entry = Some(TryCatch { start: throws_start, end: throws_end, handler, catch_type });
        }
        call_entries.append(&mut w.call_entries);
    }

    body.try_catch = call_entries;
    body.try_catch.extend(original_try_catch);
    body.try_catch.extend(throws_entry);

    assemble(&body, ctx, cp, hierarchy, major_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode, ObjectHierarchy};
    use crate::classfile::access::*;

    fn plan(event_types: EventTypes) -> WeavePlan<'static> {
        WeavePlan { namespace: "test", listener_id: 1001, loader_id: 7, event_types, class_name: "demo.Sample" }
    }

    /// `static int twice(int x) { return x * 2; }`
    fn twice(cp: &mut ConstantPool) -> CodeAttribute {
        let body = MethodBody::from_insns(vec![
            Insn::Var { op: ILOAD, slot: 0 },
            Insn::Simple(ICONST_2),
            Insn::Simple(IMUL),
            Insn::Simple(IRETURN),
        ]);
        let encoded = encode(&body, cp).unwrap();
        CodeAttribute { max_stack: 2, max_locals: 1, code: encoded.code, exception_table: Vec::new(), attributes: Vec::new() }
    }

    fn weave(code: &CodeAttribute, cp: &mut ConstantPool, types: EventTypes) -> CodeAttribute {
        let desc = MethodDescriptor::parse("(I)I").unwrap();
        let ctx = MethodContext { owner: "demo/Sample", access_flags: ACC_STATIC, name: "twice", descriptor: &desc };
        cp.add_utf8("Code").unwrap();
        weave_method(code, ctx, cp, &ObjectHierarchy, 52, &plan(types)).unwrap()
    }

    #[test]
    fn throws_entry_comes_last() {
        let mut cp = ConstantPool::new();
        let code = twice(&mut cp);
        let woven = weave(&code, &mut cp, EventTypes::BEFORE | EventTypes::RETURN | EventTypes::THROWS);
        assert_eq!(woven.exception_table.len(), 1);
        let entry = woven.exception_table[0];
        assert!(entry.start_pc > 0, "BEFORE dispatch stays outside the THROWS region");
        assert!(woven.code.len() > code.code.len());
        // the lock markers (iconst_2 / iconst_3 followed by pop) survive encoding
        assert!(woven.code.windows(2).any(|w| w == [ICONST_2, POP]));
        assert!(woven.code.windows(2).any(|w| w == [ICONST_3, POP]));
    }

    #[test]
    fn call_throws_entries_precede_the_method_wide_one() {
        let mut cp = ConstantPool::new();
        let abs = cp.add_methodref("java/lang/Math", "abs", "(I)I").unwrap();
        let body = MethodBody::from_insns(vec![
            Insn::Var { op: ILOAD, slot: 0 },
            Insn::Method { op: INVOKESTATIC, index: abs },
            Insn::Simple(IRETURN),
        ]);
        let encoded = encode(&body, &cp).unwrap();
        let code = CodeAttribute {
            max_stack: 1,
            max_locals: 1,
            code: encoded.code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        let woven = weave(&code, &mut cp, EventTypes::THROWS | EventTypes::CALLS);
        assert_eq!(woven.exception_table.len(), 2);
        let (call, method) = (woven.exception_table[0], woven.exception_table[1]);
        assert!(call.end_pc - call.start_pc <= 3, "call entry covers only the invocation");
        assert!(method.start_pc <= call.start_pc && call.end_pc <= method.end_pc);
    }

    #[test]
    fn rewoven_bodies_do_not_instrument_injected_calls() {
        let mut cp = ConstantPool::new();
        let code = twice(&mut cp);
        let once = weave(&code, &mut cp, EventTypes::BEFORE | EventTypes::RETURN);
        let again = weave(&once, &mut cp, EventTypes::CALLS);
        // no invocation outside injected code, so no per-call handler
        assert!(again.exception_table.is_empty());
    }

    #[test]
    fn constructors_enter_after_the_super_call() {
        let mut cp = ConstantPool::new();
        let super_init = cp.add_methodref("demo/Base", "<init>", "()V").unwrap();
        let body = MethodBody::from_insns(vec![
            Insn::Var { op: ALOAD, slot: 0 },
            Insn::Method { op: INVOKESPECIAL, index: super_init },
            Insn::Simple(RETURN),
        ]);
        let desc = MethodDescriptor::parse("()V").unwrap();
        let ctx = MethodContext { owner: "demo/Sample", access_flags: ACC_PUBLIC, name: "<init>", descriptor: &desc };
        assert_eq!(entry_point(&body, ctx, &cp, &ObjectHierarchy).unwrap(), 2);

        let missing = MethodBody::from_insns(vec![Insn::Simple(RETURN)]);
        assert_eq!(entry_point(&missing, ctx, &cp, &ObjectHierarchy), Err(BytecodeError::MissingConstructorCall));
    }
}
