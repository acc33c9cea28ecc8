//! Symbolic instructions back to bytes.
//!
//! Layout is iterative: every branch starts short, and any branch whose
//! displacement does not fit 16 bits is widened (`goto_w`, or an inverted
//! conditional over a `goto_w`) before the next pass. Widening only grows the
//! code, so the loop terminates.

use std::collections::HashMap;

use super::opcodes::*;
use super::{Insn, Label, MethodBody};
use crate::classfile::{ConstantPool, CpInfo, ExceptionTableEntry};
use crate::descriptor::MethodDescriptor;
use crate::error::BytecodeError;

const MAX_CODE_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct Encoded {
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    /// `(pc, line)` pairs in instruction order.
    pub lines: Vec<(usize, u16)>,
    /// Byte offset of every entry of `MethodBody::insns`.
    pub offsets: Vec<usize>,
    pub labels: HashMap<Label, usize>,
    /// Instructions that became branch targets because the conditional
    /// before them was widened.
    pub widened_fallthroughs: Vec<usize>,
}

impl Encoded {
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// `(start_pc, length)` of a label range, if both labels are placed and
    /// in order.
    pub fn range(&self, start: Label, end: Label) -> Option<(u16, u16)> {
        let s = self.label_offset(start)?;
        let e = self.label_offset(end)?;
        (e >= s).then(|| (s as u16, (e - s) as u16))
    }
}

fn is_wide_constant(cp: &ConstantPool, index: u16) -> bool {
    matches!(cp.get(index), Ok(CpInfo::Long(_)) | Ok(CpInfo::Double(_)))
}

fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn size_of(insn: &Insn, pc: usize, wide: bool, cp: &ConstantPool) -> usize {
    match insn {
        Insn::Label(_) | Insn::Line(_) => 0,
        Insn::Simple(_) => 1,
        Insn::Int { op, .. } => {
            if *op == SIPUSH {
                3
            } else {
                2
            }
        }
        Insn::Var { slot, .. } => match *slot {
            0..=3 => 1,
            4..=255 => 2,
            _ => 4,
        },
        Insn::Iinc { slot, delta } => {
            if *slot <= 255 && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Type { .. } | Insn::Field { .. } => 3,
        Insn::Method { op, .. } => {
            if *op == INVOKEINTERFACE {
                5
            } else {
                3
            }
        }
        Insn::Dynamic { .. } => 5,
        Insn::Ldc { index } => {
            if !is_wide_constant(cp, *index) && *index <= 255 {
                2
            } else {
                3
            }
        }
        Insn::Jump { op, .. } => match (wide, *op == GOTO) {
            (false, _) => 3,
            (true, true) => 5,
            (true, false) => 8,
        },
        Insn::TableSwitch { targets, .. } => 1 + switch_padding(pc) + 12 + 4 * targets.len(),
        Insn::LookupSwitch { pairs, .. } => 1 + switch_padding(pc) + 8 + 8 * pairs.len(),
        Insn::MultiANewArray { .. } => 4,
    }
}

struct Layout {
    offsets: Vec<usize>,
    labels: HashMap<Label, usize>,
    length: usize,
}

fn layout(body: &MethodBody, cp: &ConstantPool, wide: &[bool]) -> Layout {
    let mut offsets = Vec::with_capacity(body.insns.len());
    let mut labels = HashMap::new();
    let mut pc = 0;
    for (i, insn) in body.insns.iter().enumerate() {
        offsets.push(pc);
        if let Insn::Label(label) = insn {
            labels.insert(*label, pc);
        }
        pc += size_of(insn, pc, wide[i], cp);
    }
    Layout { offsets, labels, length: pc }
}

pub fn encode(body: &MethodBody, cp: &ConstantPool) -> Result<Encoded, BytecodeError> {
    let mut wide = vec![false; body.insns.len()];
    let layout = loop {
        let layout = layout(body, cp, &wide);
        let mut changed = false;
        for (i, insn) in body.insns.iter().enumerate() {
            if let Insn::Jump { target, .. } = insn {
                if wide[i] {
                    continue;
                }
                let to = *layout.labels.get(target).ok_or(BytecodeError::UndefinedLabel(target.0))?;
                let delta = to as i64 - layout.offsets[i] as i64;
                if i16::try_from(delta).is_err() {
                    wide[i] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            break layout;
        }
    };
    if layout.length > MAX_CODE_LENGTH {
        return Err(BytecodeError::CodeTooLarge(layout.length));
    }

    let target = |label: &Label| -> Result<usize, BytecodeError> {
        layout.labels.get(label).copied().ok_or(BytecodeError::UndefinedLabel(label.0))
    };

    let mut code = Vec::with_capacity(layout.length);
    let mut lines = Vec::new();
    let mut widened_fallthroughs = Vec::new();
    for (i, insn) in body.insns.iter().enumerate() {
        let pc = layout.offsets[i];
        let rel = |label: &Label| -> Result<i64, BytecodeError> { Ok(target(label)? as i64 - pc as i64) };
        match insn {
            Insn::Label(_) => {}
            Insn::Line(line) => lines.push((pc, *line)),
            Insn::Simple(op) => code.push(*op),
            Insn::Int { op, value } => {
                code.push(*op);
                if *op == SIPUSH {
                    code.extend_from_slice(&(*value as i16).to_be_bytes());
                } else {
                    code.push(*value as u8);
                }
            }
            Insn::Var { op, slot } => {
                let short_base = if *op >= ISTORE { ISTORE_0 + (op - ISTORE) * 4 } else { ILOAD_0 + (op - ILOAD) * 4 };
                match *slot {
                    0..=3 => code.push(short_base + *slot as u8),
                    4..=255 => code.extend_from_slice(&[*op, *slot as u8]),
                    _ => {
                        code.extend_from_slice(&[WIDE, *op]);
                        code.extend_from_slice(&slot.to_be_bytes());
                    }
                }
            }
            Insn::Iinc { slot, delta } => {
                if *slot <= 255 && i8::try_from(*delta).is_ok() {
                    code.extend_from_slice(&[IINC, *slot as u8, *delta as i8 as u8]);
                } else {
                    code.extend_from_slice(&[WIDE, IINC]);
                    code.extend_from_slice(&slot.to_be_bytes());
                    code.extend_from_slice(&delta.to_be_bytes());
                }
            }
            Insn::Type { op, class: index } | Insn::Field { op, index } => {
                code.push(*op);
                code.extend_from_slice(&index.to_be_bytes());
            }
            Insn::Method { op, index } => {
                code.push(*op);
                code.extend_from_slice(&index.to_be_bytes());
                if *op == INVOKEINTERFACE {
                    let (_, _, desc) = cp.member_ref(*index)?;
                    let count = MethodDescriptor::parse(desc)?.parameter_slots() + 1;
                    code.extend_from_slice(&[count as u8, 0]);
                }
            }
            Insn::Dynamic { index } => {
                code.push(INVOKEDYNAMIC);
                code.extend_from_slice(&index.to_be_bytes());
                code.extend_from_slice(&[0, 0]);
            }
            Insn::Ldc { index } => {
                if is_wide_constant(cp, *index) {
                    code.push(LDC2_W);
                    code.extend_from_slice(&index.to_be_bytes());
                } else if *index <= 255 {
                    code.extend_from_slice(&[LDC, *index as u8]);
                } else {
                    code.push(LDC_W);
                    code.extend_from_slice(&index.to_be_bytes());
                }
            }
            Insn::Jump { op, target: label } => {
                let delta = rel(label)?;
                if !wide[i] {
                    code.push(*op);
                    code.extend_from_slice(&(delta as i16).to_be_bytes());
                } else if *op == GOTO {
                    code.push(GOTO_W);
                    code.extend_from_slice(&(delta as i32).to_be_bytes());
                } else {
                    let inverted = invert_branch(*op).ok_or(BytecodeError::InvalidOpcode { opcode: *op, offset: pc })?;
                    code.push(inverted);
                    code.extend_from_slice(&8i16.to_be_bytes());
                    code.push(GOTO_W);
                    code.extend_from_slice(&((delta - 3) as i32).to_be_bytes());
                    widened_fallthroughs.push(i + 1);
                }
            }
            Insn::TableSwitch { default, low, targets } => {
                code.push(TABLESWITCH);
                code.resize(code.len() + switch_padding(pc), 0);
                code.extend_from_slice(&(rel(default)? as i32).to_be_bytes());
                let high = *low as i64 + targets.len() as i64 - 1;
                code.extend_from_slice(&low.to_be_bytes());
                code.extend_from_slice(&(high as i32).to_be_bytes());
                for t in targets {
                    code.extend_from_slice(&(rel(t)? as i32).to_be_bytes());
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                code.push(LOOKUPSWITCH);
                code.resize(code.len() + switch_padding(pc), 0);
                code.extend_from_slice(&(rel(default)? as i32).to_be_bytes());
                code.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                let mut sorted = pairs.clone();
                sorted.sort_by_key(|(key, _)| *key);
                for (key, t) in &sorted {
                    code.extend_from_slice(&key.to_be_bytes());
                    code.extend_from_slice(&(rel(t)? as i32).to_be_bytes());
                }
            }
            Insn::MultiANewArray { class, dims } => {
                code.push(MULTIANEWARRAY);
                code.extend_from_slice(&class.to_be_bytes());
                code.push(*dims);
            }
        }
    }

    let mut exception_table = Vec::with_capacity(body.try_catch.len());
    for tc in &body.try_catch {
        let start = target(&tc.start)?;
        let end = target(&tc.end)?;
        if start >= end {
            return Err(BytecodeError::EmptyHandlerRange(tc.start.0));
        }
        exception_table.push(ExceptionTableEntry {
            start_pc: start as u16,
            end_pc: end as u16,
            handler_pc: target(&tc.handler)? as u16,
            catch_type: tc.catch_type,
        });
    }

    Ok(Encoded {
        code,
        exception_table,
        lines,
        offsets: layout.offsets,
        labels: layout.labels,
        widened_fallthroughs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(insns: Vec<Insn>) -> MethodBody {
        MethodBody { insns, ..MethodBody::default() }
    }

    #[test]
    fn picks_short_local_forms() {
        let b = body(vec![
            Insn::Var { op: ILOAD, slot: 1 },
            Insn::Var { op: ASTORE, slot: 3 },
            Insn::Var { op: LLOAD, slot: 200 },
            Insn::Var { op: DSTORE, slot: 300 },
            Insn::Simple(RETURN),
        ]);
        let enc = encode(&b, &ConstantPool::new()).unwrap();
        assert_eq!(enc.code, vec![0x1b, 0x4e, LLOAD, 200, WIDE, DSTORE, 0x01, 0x2c, RETURN]);
    }

    #[test]
    fn widens_far_branches() {
        let mut b = MethodBody::default();
        let far = b.new_label();
        b.insns.push(Insn::Simple(ICONST_0));
        b.insns.push(Insn::Jump { op: IFEQ, target: far });
        for _ in 0..40_000 {
            b.insns.push(Insn::Simple(NOP));
        }
        b.insns.push(Insn::Label(far));
        b.insns.push(Insn::Simple(RETURN));
        let enc = encode(&b, &ConstantPool::new()).unwrap();
        assert_eq!(&enc.code[1..4], &[IFNE, 0, 8]);
        assert_eq!(enc.code[4], GOTO_W);
        let delta = i32::from_be_bytes([enc.code[5], enc.code[6], enc.code[7], enc.code[8]]);
        assert_eq!(4 + delta as usize, enc.label_offset(far).unwrap());
        assert_eq!(enc.widened_fallthroughs, vec![2]);
    }

    #[test]
    fn aligns_switch_operands() {
        let mut b = MethodBody::default();
        let a = b.new_label();
        b.insns.push(Insn::Simple(ICONST_0));
        b.insns.push(Insn::TableSwitch { default: a, low: 0, targets: vec![a] });
        b.insns.push(Insn::Label(a));
        b.insns.push(Insn::Simple(RETURN));
        let enc = encode(&b, &ConstantPool::new()).unwrap();
        // opcode at 1, two padding bytes, operands start at 4
        assert_eq!(enc.code[1], TABLESWITCH);
        assert_eq!(&enc.code[2..4], &[0, 0]);
        assert_eq!(enc.label_offset(a), Some(20));
    }

    #[test]
    fn rejects_undefined_label() {
        let mut b = MethodBody::default();
        let missing = b.new_label();
        b.insns.push(Insn::Jump { op: GOTO, target: missing });
        assert_eq!(encode(&b, &ConstantPool::new()).unwrap_err(), BytecodeError::UndefinedLabel(missing.0));
    }
}
