//! Type inference over a method body.
//!
//! The analysis is a worklist fixpoint over instruction indices. Besides
//! producing `max_stack`, `max_locals` and the `StackMapTable`, it is the
//! legality gate for rewritten bodies: stack underflow, mismatched stack
//! shapes at merge points, unplaced labels and falling off the end of the
//! code are all reported as [`BytecodeError`]s. Unreachable instructions
//! are left without a frame; [`without_dead_code`] drops them.
//!
//! Where the decoded class already declared a frame, its reference types
//! win over the merged ones. The verifier accepted them for the original
//! code, and they carry supertypes no [`TypeHierarchy`] may know.
//!
//! Values are tracked per slot, so `long` and `double` occupy two entries
//! (the second one is [`VType::Top`]) both in locals and on the stack.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::opcodes::*;
use super::{Insn, Label, MethodBody, MethodContext};
use crate::classfile::{ConstantPool, CpInfo, StackMapFrame, StackMapTableAttribute, VerificationTypeInfo};
use crate::descriptor::{JavaType, MethodDescriptor};
use crate::error::BytecodeError;

use super::encode::Encoded;

const OBJECT: &str = "java/lang/Object";
const THROWABLE: &str = "java/lang/Throwable";

/// Verification type of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Result of the `new` at instruction `site`, not yet constructed.
    Uninitialized { site: usize, class: String },
    /// Internal class name or array descriptor.
    Object(String),
}

impl VType {
    fn from_java(ty: &JavaType) -> Self {
        match ty {
            JavaType::Long => VType::Long,
            JavaType::Float => VType::Float,
            JavaType::Double => VType::Double,
            JavaType::Object(name) => VType::Object(name.clone()),
            JavaType::Array(_) => VType::Object(ty.descriptor()),
            _ => VType::Int,
        }
    }

    fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            VType::Null | VType::UninitializedThis | VType::Uninitialized { .. } | VType::Object(_)
        )
    }
}

/// Resolves the common superclass of two reference types when control flow
/// merges them.
pub trait TypeHierarchy {
    fn common_super_class(&self, a: &str, b: &str) -> String;
}

/// Answers `java/lang/Object` for any two distinct types.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectHierarchy;

impl TypeHierarchy for ObjectHierarchy {
    fn common_super_class(&self, _a: &str, _b: &str) -> String {
        OBJECT.to_string()
    }
}

/// A hierarchy built from known `class -> superclass` links. Types outside
/// the map resolve to `java/lang/Object`.
#[derive(Debug, Clone, Default)]
pub struct SuperclassHierarchy {
    supers: HashMap<String, String>,
}

impl SuperclassHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>, super_class: impl Into<String>) {
        self.supers.insert(class.into(), super_class.into());
    }

    fn ancestry(&self, class: &str) -> Vec<String> {
        let mut chain = vec![class.to_string()];
        let mut current = class;
        while let Some(parent) = self.supers.get(current) {
            if chain.iter().any(|c| c == parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }
}

impl TypeHierarchy for SuperclassHierarchy {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        let left = self.ancestry(a);
        self.ancestry(b)
            .into_iter()
            .find(|c| left.contains(c))
            .unwrap_or_else(|| OBJECT.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    /// Entry state of each instruction; `None` where unreachable.
    pub frames: Vec<Option<Frame>>,
    /// Instruction indices control can jump to.
    pub branch_targets: BTreeSet<usize>,
    pub max_stack: u16,
    pub max_locals: u16,
}

impl Analysis {
    /// Indices of real instructions control never reaches.
    pub fn dead_code(&self, body: &MethodBody) -> Vec<usize> {
        (0..body.insns.len())
            .filter(|i| self.frames[*i].is_none() && !body.insns[*i].is_pseudo())
            .collect()
    }
}

/// `body` without the instructions `analysis` found unreachable, the line
/// markers that only led into them, and the exception ranges left empty.
pub fn without_dead_code(body: &MethodBody, analysis: &Analysis) -> MethodBody {
    let live = |i: usize| body.insns[i].is_pseudo() || analysis.frames[i].is_some();
    let mut pruned = body.clone();
    pruned.insns = Vec::with_capacity(body.insns.len());
    for (i, insn) in body.insns.iter().enumerate() {
        let keep = match insn {
            Insn::Line(_) => body.insns[i + 1..]
                .iter()
                .position(|next| !next.is_pseudo())
                .map_or(true, |offset| live(i + 1 + offset)),
            _ => live(i),
        };
        if keep {
            pruned.insns.push(insn.clone());
        }
    }

    let positions: HashMap<Label, usize> = pruned
        .insns
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| match insn {
            Insn::Label(label) => Some((*label, i)),
            _ => None,
        })
        .collect();
    pruned.try_catch.retain(|tc| match (positions.get(&tc.start), positions.get(&tc.end)) {
        (Some(start), Some(end)) if start < end => pruned.insns[*start..*end].iter().any(|i| !i.is_pseudo()),
        _ => false,
    });
    pruned
}

fn initial_frame(ctx: MethodContext<'_>) -> Frame {
    let mut locals = Vec::new();
    if !ctx.is_static() {
        if ctx.is_constructor() && ctx.owner != OBJECT {
            locals.push(VType::UninitializedThis);
        } else {
            locals.push(VType::Object(ctx.owner.to_string()));
        }
    }
    for p in &ctx.descriptor.parameters {
        let v = VType::from_java(p);
        let wide = v.is_wide();
        locals.push(v);
        if wide {
            locals.push(VType::Top);
        }
    }
    Frame { locals, stack: Vec::new() }
}

struct Exec<'a> {
    at: usize,
    frame: Frame,
    max_stack: usize,
    cp: &'a ConstantPool,
    owner: &'a str,
}

impl Exec<'_> {
    fn push(&mut self, v: VType) {
        let wide = v.is_wide();
        self.frame.stack.push(v);
        if wide {
            self.frame.stack.push(VType::Top);
        }
        self.max_stack = self.max_stack.max(self.frame.stack.len());
    }

    fn push_java(&mut self, ty: &JavaType) {
        if *ty != JavaType::Void {
            self.push(VType::from_java(ty));
        }
    }

    fn pop_slots(&mut self, n: usize) -> Result<Vec<VType>, BytecodeError> {
        let len = self.frame.stack.len();
        if len < n {
            return Err(BytecodeError::StackUnderflow(self.at));
        }
        Ok(self.frame.stack.split_off(len - n))
    }

    fn pop(&mut self) -> Result<VType, BytecodeError> {
        self.frame.stack.pop().ok_or(BytecodeError::StackUnderflow(self.at))
    }

    fn pop_java(&mut self, ty: &JavaType) -> Result<(), BytecodeError> {
        self.pop_slots(ty.size()).map(|_| ())
    }

    fn pop_reference(&mut self) -> Result<VType, BytecodeError> {
        let v = self.pop()?;
        if !v.is_reference() {
            return Err(BytecodeError::TypeMismatch(self.at));
        }
        Ok(v)
    }

    fn load(&mut self, slot: usize, op: u8) -> Result<(), BytecodeError> {
        let v = self
            .frame
            .locals
            .get(slot)
            .cloned()
            .ok_or(BytecodeError::BadLocal { slot, at: self.at })?;
        let v = match op {
            ILOAD => VType::Int,
            LLOAD => VType::Long,
            FLOAD => VType::Float,
            DLOAD => VType::Double,
            _ => {
                if !v.is_reference() {
                    return Err(BytecodeError::TypeMismatch(self.at));
                }
                v
            }
        };
        self.push(v);
        Ok(())
    }

    fn store(&mut self, slot: usize, v: VType) {
        let wide = v.is_wide();
        let needed = slot + if wide { 2 } else { 1 };
        if self.frame.locals.len() < needed {
            self.frame.locals.resize(needed, VType::Top);
        }
        if slot > 0 && self.frame.locals[slot - 1].is_wide() {
            self.frame.locals[slot - 1] = VType::Top;
        }
        self.frame.locals[slot] = v;
        if wide {
            self.frame.locals[slot + 1] = VType::Top;
        }
    }

    fn replace_uninitialized(&mut self, from: &VType, to: VType) {
        for v in self.frame.locals.iter_mut().chain(self.frame.stack.iter_mut()) {
            if v == from {
                *v = to.clone();
            }
        }
    }

    fn ldc_type(&self, index: u16) -> Result<VType, BytecodeError> {
        Ok(match self.cp.get(index)? {
            CpInfo::Integer(_) => VType::Int,
            CpInfo::Float(_) => VType::Float,
            CpInfo::Long(_) => VType::Long,
            CpInfo::Double(_) => VType::Double,
            CpInfo::String { .. } => VType::Object("java/lang/String".into()),
            CpInfo::Class { .. } => VType::Object("java/lang/Class".into()),
            CpInfo::MethodType { .. } => VType::Object("java/lang/invoke/MethodType".into()),
            CpInfo::MethodHandle { .. } => VType::Object("java/lang/invoke/MethodHandle".into()),
            CpInfo::Dynamic { name_and_type_index, .. } => {
                let (_, desc) = self.cp.name_and_type(*name_and_type_index)?;
                VType::from_java(&JavaType::from_descriptor(desc)?)
            }
            _ => return Err(BytecodeError::TypeMismatch(self.at)),
        })
    }

    fn execute(&mut self, insn: &Insn) -> Result<(), BytecodeError> {
        match insn {
            Insn::Label(_) | Insn::Line(_) => {}
            Insn::Simple(op) => self.simple(*op)?,
            Insn::Int { op, value } => {
                if *op == NEWARRAY {
                    self.pop()?;
                    let desc = match *value as u8 {
                        T_BOOLEAN => "[Z",
                        T_CHAR => "[C",
                        T_FLOAT => "[F",
                        T_DOUBLE => "[D",
                        T_BYTE => "[B",
                        T_SHORT => "[S",
                        T_INT => "[I",
                        T_LONG => "[J",
                        _ => return Err(BytecodeError::TypeMismatch(self.at)),
                    };
                    self.push(VType::Object(desc.into()));
                } else {
                    self.push(VType::Int);
                }
            }
            Insn::Var { op, slot } => {
                let slot = *slot as usize;
                if *op <= ALOAD {
                    self.load(slot, *op)?;
                } else {
                    let v = match *op {
                        LSTORE | DSTORE => {
                            let mut pair = self.pop_slots(2)?;
                            pair.swap_remove(0)
                        }
                        ASTORE => self.pop_reference()?,
                        _ => self.pop()?,
                    };
                    self.store(slot, v);
                }
            }
            Insn::Iinc { slot, .. } => {
                let slot = *slot as usize;
                if slot >= self.frame.locals.len() {
                    return Err(BytecodeError::BadLocal { slot, at: self.at });
                }
            }
            Insn::Type { op, class } => {
                let name = self.cp.class_name(*class)?.to_string();
                match *op {
                    NEW => self.push(VType::Uninitialized { site: self.at, class: name }),
                    ANEWARRAY => {
                        self.pop()?;
                        let desc = if name.starts_with('[') { format!("[{name}") } else { format!("[L{name};") };
                        self.push(VType::Object(desc));
                    }
                    CHECKCAST => {
                        self.pop_reference()?;
                        self.push(VType::Object(name));
                    }
                    _ => {
                        self.pop_reference()?;
                        self.push(VType::Int);
                    }
                }
            }
            Insn::Field { op, index } => {
                let (_, _, desc) = self.cp.member_ref(*index)?;
                let ty = JavaType::from_descriptor(desc)?;
                match *op {
                    GETSTATIC => self.push_java(&ty),
                    PUTSTATIC => self.pop_java(&ty)?,
                    GETFIELD => {
                        self.pop_reference()?;
                        self.push_java(&ty);
                    }
                    _ => {
                        self.pop_java(&ty)?;
                        self.pop_reference()?;
                    }
                }
            }
            Insn::Method { op, index } => {
                let (_, name, desc) = self.cp.member_ref(*index)?;
                let md = MethodDescriptor::parse(desc)?;
                self.pop_slots(md.parameter_slots())?;
                if *op != INVOKESTATIC {
                    let receiver = self.pop_reference()?;
                    if *op == INVOKESPECIAL && name == "<init>" {
                        match &receiver {
                            VType::UninitializedThis => {
                                let owner = VType::Object(self.owner.to_string());
                                self.replace_uninitialized(&receiver, owner);
                            }
                            VType::Uninitialized { class, .. } => {
                                let to = VType::Object(class.clone());
                                self.replace_uninitialized(&receiver, to);
                            }
                            _ => {}
                        }
                    }
                }
                self.push_java(&md.return_type);
            }
            Insn::Dynamic { index } => {
                let nat = match self.cp.get(*index)? {
                    CpInfo::InvokeDynamic { name_and_type_index, .. } => *name_and_type_index,
                    _ => return Err(BytecodeError::TypeMismatch(self.at)),
                };
                let (_, desc) = self.cp.name_and_type(nat)?;
                let md = MethodDescriptor::parse(desc)?;
                self.pop_slots(md.parameter_slots())?;
                self.push_java(&md.return_type);
            }
            Insn::Ldc { index } => {
                let v = self.ldc_type(*index)?;
                self.push(v);
            }
            Insn::Jump { op, .. } => match *op {
                GOTO => {}
                IF_ICMPEQ..=IF_ACMPNE => {
                    self.pop_slots(2)?;
                }
                _ => {
                    self.pop()?;
                }
            },
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                self.pop()?;
            }
            Insn::MultiANewArray { class, dims } => {
                self.pop_slots(*dims as usize)?;
                let name = self.cp.class_name(*class)?.to_string();
                self.push(VType::Object(name));
            }
        }
        Ok(())
    }

    fn simple(&mut self, op: u8) -> Result<(), BytecodeError> {
        match op {
            NOP => {}
            ACONST_NULL => self.push(VType::Null),
            ICONST_M1..=ICONST_5 => self.push(VType::Int),
            LCONST_0 | LCONST_1 => self.push(VType::Long),
            FCONST_0..=FCONST_2 => self.push(VType::Float),
            DCONST_0 | DCONST_1 => self.push(VType::Double),
            IALOAD..=SALOAD => {
                self.pop()?;
                let array = self.pop_reference()?;
                let v = match op {
                    LALOAD => VType::Long,
                    FALOAD => VType::Float,
                    DALOAD => VType::Double,
                    AALOAD => match array {
                        VType::Object(desc) if desc.starts_with('[') => {
                            let component = &desc[1..];
                            match component.strip_prefix('L').and_then(|c| c.strip_suffix(';')) {
                                Some(name) => VType::Object(name.to_string()),
                                None => VType::Object(component.to_string()),
                            }
                        }
                        VType::Null => VType::Null,
                        _ => VType::Object(OBJECT.into()),
                    },
                    _ => VType::Int,
                };
                self.push(v);
            }
            IASTORE..=SASTORE => {
                let value = if op == LASTORE || op == DASTORE { 2 } else { 1 };
                self.pop_slots(value + 2)?;
            }
            POP => {
                self.pop()?;
            }
            POP2 => {
                self.pop_slots(2)?;
            }
            DUP => {
                let v = self.pop()?;
                self.push_slots(vec![v.clone(), v]);
            }
            DUP_X1 => {
                let s = self.pop_slots(2)?;
                self.push_slots(vec![s[1].clone(), s[0].clone(), s[1].clone()]);
            }
            DUP_X2 => {
                let s = self.pop_slots(3)?;
                self.push_slots(vec![s[2].clone(), s[0].clone(), s[1].clone(), s[2].clone()]);
            }
            DUP2 => {
                let s = self.pop_slots(2)?;
                self.push_slots(vec![s[0].clone(), s[1].clone(), s[0].clone(), s[1].clone()]);
            }
            DUP2_X1 => {
                let s = self.pop_slots(3)?;
                self.push_slots(vec![
                    s[1].clone(),
                    s[2].clone(),
                    s[0].clone(),
                    s[1].clone(),
                    s[2].clone(),
                ]);
            }
            DUP2_X2 => {
                let s = self.pop_slots(4)?;
                self.push_slots(vec![
                    s[2].clone(),
                    s[3].clone(),
                    s[0].clone(),
                    s[1].clone(),
                    s[2].clone(),
                    s[3].clone(),
                ]);
            }
            SWAP => {
                let s = self.pop_slots(2)?;
                self.push_slots(vec![s[1].clone(), s[0].clone()]);
            }
            IADD..=DREM => {
                let (v, size) = arithmetic_kind(op - IADD);
                self.pop_slots(size * 2)?;
                self.push(v);
            }
            INEG..=DNEG => {
                let (v, size) = arithmetic_kind(op - INEG);
                self.pop_slots(size)?;
                self.push(v);
            }
            ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
                self.pop_slots(2)?;
                self.push(VType::Int);
            }
            LSHL | LSHR | LUSHR => {
                self.pop_slots(3)?;
                self.push(VType::Long);
            }
            LAND | LOR | LXOR => {
                self.pop_slots(4)?;
                self.push(VType::Long);
            }
            I2L..=D2F => {
                let (from, to) = match op {
                    I2L => (1, VType::Long),
                    I2F => (1, VType::Float),
                    I2D => (1, VType::Double),
                    L2I => (2, VType::Int),
                    L2F => (2, VType::Float),
                    L2D => (2, VType::Double),
                    F2I => (1, VType::Int),
                    F2L => (1, VType::Long),
                    F2D => (1, VType::Double),
                    D2I => (2, VType::Int),
                    D2L => (2, VType::Long),
                    _ => (2, VType::Float),
                };
                self.pop_slots(from)?;
                self.push(to);
            }
            I2B | I2C | I2S => {
                self.pop()?;
                self.push(VType::Int);
            }
            LCMP | DCMPL | DCMPG => {
                self.pop_slots(4)?;
                self.push(VType::Int);
            }
            FCMPL | FCMPG => {
                self.pop_slots(2)?;
                self.push(VType::Int);
            }
            IRETURN | FRETURN => {
                self.pop()?;
            }
            LRETURN | DRETURN => {
                self.pop_slots(2)?;
            }
            ARETURN | ATHROW | MONITORENTER | MONITOREXIT => {
                self.pop_reference()?;
            }
            RETURN => {}
            ARRAYLENGTH => {
                self.pop_reference()?;
                self.push(VType::Int);
            }
            _ => return Err(BytecodeError::InvalidOpcode { opcode: op, offset: self.at }),
        }
        Ok(())
    }

    fn push_slots(&mut self, slots: Vec<VType>) {
        self.frame.stack.extend(slots);
        self.max_stack = self.max_stack.max(self.frame.stack.len());
    }
}

/// Result type and operand size of the `iadd`..`drem` / `ineg`..`dneg` rows.
fn arithmetic_kind(row_offset: u8) -> (VType, usize) {
    match row_offset % 4 {
        0 => (VType::Int, 1),
        1 => (VType::Long, 2),
        2 => (VType::Float, 1),
        _ => (VType::Double, 2),
    }
}

fn merge_slot(
    a: &VType,
    b: &VType,
    hierarchy: &dyn TypeHierarchy,
) -> Option<VType> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (VType::Null, VType::Object(_)) => Some(b.clone()),
        (VType::Object(_), VType::Null) => Some(a.clone()),
        (VType::Object(x), VType::Object(y)) => {
            if x.starts_with('[') || y.starts_with('[') {
                Some(VType::Object(OBJECT.into()))
            } else {
                Some(VType::Object(hierarchy.common_super_class(x, y)))
            }
        }
        _ => None,
    }
}

/// Merge `incoming` into `existing`.
fn merge_into(
    existing: &mut Frame,
    incoming: &Frame,
    at: usize,
    hierarchy: &dyn TypeHierarchy,
) -> Result<(), BytecodeError> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(BytecodeError::StackMismatch(at));
    }
    for (slot, other) in existing.stack.iter_mut().zip(&incoming.stack) {
        *slot = merge_slot(slot, other, hierarchy).ok_or(BytecodeError::StackMismatch(at))?;
    }
    let len = existing.locals.len().min(incoming.locals.len());
    existing.locals.truncate(len);
    for i in 0..len {
        existing.locals[i] = merge_slot(&existing.locals[i], &incoming.locals[i], hierarchy).unwrap_or(VType::Top);
    }
    Ok(())
}

/// Replace inferred references with the ones a declared frame names.
fn apply_declared(frame: &mut Frame, declared: &Frame) {
    fn refine(slot: &mut VType, hint: &VType) {
        if matches!(hint, VType::Object(_)) && matches!(slot, VType::Object(_) | VType::Null) {
            *slot = hint.clone();
        }
    }
    for (slot, hint) in frame.locals.iter_mut().zip(&declared.locals) {
        refine(slot, hint);
    }
    if frame.stack.len() == declared.stack.len() {
        for (slot, hint) in frame.stack.iter_mut().zip(&declared.stack) {
            refine(slot, hint);
        }
    }
}

/// Slot form of verification types as a `StackMapTable` lists them.
/// Uninitialized entries become `Top`; they are never used as hints.
fn declared_slots(types: &[VerificationTypeInfo], cp: &ConstantPool) -> Result<Vec<VType>, BytecodeError> {
    let mut out = Vec::with_capacity(types.len());
    for ty in types {
        let v = match ty {
            VerificationTypeInfo::Top
            | VerificationTypeInfo::Uninitialized(_)
            | VerificationTypeInfo::UninitializedThis => VType::Top,
            VerificationTypeInfo::Integer => VType::Int,
            VerificationTypeInfo::Float => VType::Float,
            VerificationTypeInfo::Long => VType::Long,
            VerificationTypeInfo::Double => VType::Double,
            VerificationTypeInfo::Null => VType::Null,
            VerificationTypeInfo::Object(index) => VType::Object(cp.class_name(*index)?.to_string()),
        };
        let wide = v.is_wide();
        out.push(v);
        if wide {
            out.push(VType::Top);
        }
    }
    Ok(out)
}

/// Expand the frames decoded from the class file, keyed by the index of
/// the label each one sits on.
fn declared_frames(
    body: &MethodBody,
    ctx: MethodContext<'_>,
    cp: &ConstantPool,
    positions: &HashMap<Label, usize>,
) -> Result<HashMap<usize, Frame>, BytecodeError> {
    let mut out = HashMap::with_capacity(body.declared_frames.len());
    let mut locals = initial_frame(ctx).locals;
    for (label, frame) in &body.declared_frames {
        let stack = match frame {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => declared_slots(&[*stack], cp)?,
            StackMapFrame::Chop { k, .. } => {
                for _ in 0..*k {
                    let half = locals.len() >= 2 && locals[locals.len() - 2].is_wide();
                    let drop = if locals.last() == Some(&VType::Top) && half { 2 } else { 1 };
                    locals.truncate(locals.len().saturating_sub(drop));
                }
                Vec::new()
            }
            StackMapFrame::Append { locals: added, .. } => {
                locals.extend(declared_slots(added, cp)?);
                Vec::new()
            }
            StackMapFrame::Full { locals: all, stack, .. } => {
                locals = declared_slots(all, cp)?;
                declared_slots(stack, cp)?
            }
        };
        if let Some(at) = positions.get(label) {
            out.insert(*at, Frame { locals: locals.clone(), stack });
        }
    }
    Ok(out)
}

/// Run type inference over `body`.
pub fn analyze(
    body: &MethodBody,
    ctx: MethodContext<'_>,
    cp: &ConstantPool,
    hierarchy: &dyn TypeHierarchy,
) -> Result<Analysis, BytecodeError> {
    let n = body.insns.len();
    let mut positions: HashMap<Label, usize> = HashMap::new();
    for (i, insn) in body.insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            positions.insert(*label, i);
        }
    }
    let position = |label: &Label| positions.get(label).copied().ok_or(BytecodeError::UndefinedLabel(label.0));
    // frames of a class too malformed to resolve are ignored, not fatal
    let declared = declared_frames(body, ctx, cp, &positions).unwrap_or_default();

    // handlers covering each instruction, as (handler index, caught type)
    let mut handlers: Vec<Vec<(usize, String)>> = vec![Vec::new(); n];
    let mut branch_targets = BTreeSet::new();
    for tc in &body.try_catch {
        let start = position(&tc.start)?;
        let end = position(&tc.end)?;
        let handler = position(&tc.handler)?;
        if start >= end || !body.insns[start..end].iter().any(|i| !i.is_pseudo()) {
            return Err(BytecodeError::EmptyHandlerRange(tc.start.0));
        }
        let caught = if tc.catch_type == 0 {
            THROWABLE.to_string()
        } else {
            cp.class_name(tc.catch_type)?.to_string()
        };
        branch_targets.insert(handler);
        for covered in &mut handlers[start..end] {
            covered.push((handler, caught.clone()));
        }
    }
    for insn in &body.insns {
        for target in insn.targets() {
            branch_targets.insert(position(&target)?);
        }
    }

    let mut frames: Vec<Option<Frame>> = vec![None; n];
    let initial = initial_frame(ctx);
    let mut max_locals = initial.locals.len().max(body.max_locals as usize);
    let mut max_stack = 0;
    let mut worklist = VecDeque::new();
    if n == 0 {
        return Err(BytecodeError::FallOffEnd);
    }
    frames[0] = Some(initial);
    worklist.push_back(0);
    let mut queued = vec![false; n];
    queued[0] = true;

    while let Some(i) = worklist.pop_front() {
        queued[i] = false;
        let Some(state) = frames[i].clone() else { continue };
        let insn = &body.insns[i];

        let mut successors: Vec<(usize, Frame)> = Vec::new();
        for (handler, caught) in &handlers[i] {
            if insn.is_pseudo() {
                continue;
            }
            successors.push((
                *handler,
                Frame { locals: state.locals.clone(), stack: vec![VType::Object(caught.clone())] },
            ));
        }

        let mut exec = Exec { at: i, frame: state, max_stack, cp, owner: ctx.owner };
        exec.execute(insn)?;
        max_stack = exec.max_stack;
        let out = exec.frame;
        max_locals = max_locals.max(out.locals.len());

        for target in insn.targets() {
            successors.push((position(&target)?, out.clone()));
        }
        if !insn.is_terminal() {
            if i + 1 >= n {
                return Err(BytecodeError::FallOffEnd);
            }
            successors.push((i + 1, out));
        }

        for (to, incoming) in successors {
            let mut merged = match &frames[to] {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merge_into(&mut merged, &incoming, to, hierarchy)?;
                    merged
                }
                None => incoming,
            };
            if let Some(hint) = declared.get(&to) {
                apply_declared(&mut merged, hint);
            }
            let changed = frames[to].as_ref() != Some(&merged);
            frames[to] = Some(merged);
            if changed && !queued[to] {
                queued[to] = true;
                worklist.push_back(to);
            }
        }
    }

    if max_stack > u16::MAX as usize {
        return Err(BytecodeError::StackTooDeep(max_stack));
    }
    if max_locals > u16::MAX as usize {
        return Err(BytecodeError::BadLocal { slot: max_locals, at: 0 });
    }

    Ok(Analysis {
        frames,
        branch_targets,
        max_stack: max_stack as u16,
        max_locals: max_locals as u16,
    })
}

fn verification_type(
    v: &VType,
    encoded: &Encoded,
    cp: &mut ConstantPool,
) -> Result<VerificationTypeInfo, BytecodeError> {
    Ok(match v {
        VType::Top => VerificationTypeInfo::Top,
        VType::Int => VerificationTypeInfo::Integer,
        VType::Float => VerificationTypeInfo::Float,
        VType::Long => VerificationTypeInfo::Long,
        VType::Double => VerificationTypeInfo::Double,
        VType::Null => VerificationTypeInfo::Null,
        VType::UninitializedThis => VerificationTypeInfo::UninitializedThis,
        VType::Uninitialized { site, .. } => VerificationTypeInfo::Uninitialized(encoded.offsets[*site] as u16),
        VType::Object(name) => VerificationTypeInfo::Object(cp.add_class(name)?),
    })
}

/// Per-value verification types, skipping the second slot of wide values.
fn verification_list(
    slots: &[VType],
    encoded: &Encoded,
    cp: &mut ConstantPool,
) -> Result<Vec<VerificationTypeInfo>, BytecodeError> {
    let mut out = Vec::with_capacity(slots.len());
    let mut i = 0;
    while i < slots.len() {
        out.push(verification_type(&slots[i], encoded, cp)?);
        i += if slots[i].is_wide() { 2 } else { 1 };
    }
    Ok(out)
}

/// Build a `StackMapTable` of full frames at every branch target.
pub fn stack_map_table(
    body: &MethodBody,
    analysis: &Analysis,
    encoded: &Encoded,
    cp: &mut ConstantPool,
) -> Result<StackMapTableAttribute, BytecodeError> {
    let mut at_offset: BTreeMap<usize, usize> = BTreeMap::new();
    for index in analysis.branch_targets.iter().chain(&encoded.widened_fallthroughs) {
        // a label at the very end of the code can be a range end, never a target
        if *index >= body.insns.len() {
            continue;
        }
        at_offset.entry(encoded.offsets[*index]).or_insert(*index);
    }

    let mut entries = Vec::with_capacity(at_offset.len());
    let mut previous: Option<usize> = None;
    for (offset, index) in at_offset {
        let Some(frame) = &analysis.frames[index] else { continue };
        let mut locals = frame.locals.clone();
        while locals.last() == Some(&VType::Top) {
            locals.pop();
        }
        let offset_delta = match previous {
            None => offset,
            Some(prev) => offset - prev - 1,
        };
        previous = Some(offset);
        entries.push(StackMapFrame::Full {
            offset_delta: offset_delta as u16,
            locals: verification_list(&locals, encoded, cp)?,
            stack: verification_list(&frame.stack, encoded, cp)?,
        });
    }
    Ok(StackMapTableAttribute { entries })
}
