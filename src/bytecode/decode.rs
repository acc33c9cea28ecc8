//! Byte offsets to symbolic instructions.

use std::collections::{BTreeMap, HashMap};

use super::opcodes::*;
use super::subroutine::{inline_subroutines, Item};
use super::{Insn, Label, LocalVar, MethodBody, TryCatch};
use crate::classfile::{AttributeInfo, CodeAttribute};
use crate::error::BytecodeError;

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> Cursor<'a> {
    fn u1(&mut self) -> Result<u8, BytecodeError> {
        let v = *self.code.get(self.pos).ok_or(BytecodeError::Truncated(self.start))?;
        self.pos += 1;
        Ok(v)
    }

    fn u2(&mut self) -> Result<u16, BytecodeError> {
        Ok(u16::from_be_bytes([self.u1()?, self.u1()?]))
    }

    fn i4(&mut self) -> Result<i32, BytecodeError> {
        Ok(i32::from_be_bytes([self.u1()?, self.u1()?, self.u1()?, self.u1()?]))
    }
}

/// Labels requested by offset while decoding, placed afterwards.
struct Labels {
    by_offset: BTreeMap<usize, Label>,
    next: u32,
}

impl Labels {
    fn at(&mut self, offset: i64) -> Result<Label, BytecodeError> {
        if offset < 0 {
            return Err(BytecodeError::BadBranchTarget(offset));
        }
        let next = &mut self.next;
        Ok(*self.by_offset.entry(offset as usize).or_insert_with(|| {
            let label = Label(*next);
            *next += 1;
            label
        }))
    }
}

/// Decode a `Code` attribute. Subroutines (`jsr`/`ret`) are inlined at
/// every call site.
pub fn decode(code: &CodeAttribute) -> Result<MethodBody, BytecodeError> {
    let bytes = code.code.as_slice();
    let mut labels = Labels { by_offset: BTreeMap::new(), next: 0 };
    let mut decoded: Vec<(usize, Item)> = Vec::new();

    let mut c = Cursor { code: bytes, pos: 0, start: 0 };
    while c.pos < bytes.len() {
        let pc = c.pos;
        c.start = pc;
        let op = c.u1()?;
        let rel = |delta: i64| pc as i64 + delta;
        let insn = match op {
            JSR => {
                decoded.push((pc, Item::Jsr(labels.at(rel(c.u2()? as i16 as i64))?)));
                continue;
            }
            JSR_W => {
                decoded.push((pc, Item::Jsr(labels.at(rel(c.i4()? as i64))?)));
                continue;
            }
            RET => {
                decoded.push((pc, Item::Ret(c.u1()? as u16)));
                continue;
            }
            WIDE if bytes.get(pc + 1) == Some(&RET) => {
                c.u1()?;
                decoded.push((pc, Item::Ret(c.u2()?)));
                continue;
            }
            NOP..=DCONST_1 => Insn::Simple(op),
            BIPUSH => Insn::Int { op, value: c.u1()? as i8 as i32 },
            SIPUSH => Insn::Int { op, value: c.u2()? as i16 as i32 },
            LDC => Insn::Ldc { index: c.u1()? as u16 },
            LDC_W | LDC2_W => Insn::Ldc { index: c.u2()? },
            ILOAD..=ALOAD | ISTORE..=ASTORE => Insn::Var { op, slot: c.u1()? as u16 },
            ILOAD_0..=ALOAD_3 => {
                let n = op - ILOAD_0;
                Insn::Var { op: ILOAD + n / 4, slot: (n % 4) as u16 }
            }
            ISTORE_0..=ASTORE_3 => {
                let n = op - ISTORE_0;
                Insn::Var { op: ISTORE + n / 4, slot: (n % 4) as u16 }
            }
            IALOAD..=SALOAD | IASTORE..=LXOR | I2L..=DCMPG => Insn::Simple(op),
            IINC => Insn::Iinc { slot: c.u1()? as u16, delta: c.u1()? as i8 as i16 },
            IFEQ..=GOTO | IFNULL | IFNONNULL => {
                let target = labels.at(rel(c.u2()? as i16 as i64))?;
                Insn::Jump { op, target }
            }
            GOTO_W => {
                let target = labels.at(rel(c.i4()? as i64))?;
                Insn::Jump { op: GOTO, target }
            }
            TABLESWITCH => {
                c.pos += (4 - c.pos % 4) % 4;
                let default = labels.at(rel(c.i4()? as i64))?;
                let low = c.i4()?;
                let high = c.i4()?;
                if high < low {
                    return Err(BytecodeError::Truncated(pc));
                }
                let mut targets = Vec::with_capacity((high as i64 - low as i64 + 1) as usize);
                for _ in low..=high {
                    targets.push(labels.at(rel(c.i4()? as i64))?);
                }
                Insn::TableSwitch { default, low, targets }
            }
            LOOKUPSWITCH => {
                c.pos += (4 - c.pos % 4) % 4;
                let default = labels.at(rel(c.i4()? as i64))?;
                let npairs = c.i4()?;
                if npairs < 0 {
                    return Err(BytecodeError::Truncated(pc));
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = c.i4()?;
                    pairs.push((key, labels.at(rel(c.i4()? as i64))?));
                }
                Insn::LookupSwitch { default, pairs }
            }
            IRETURN..=RETURN | ARRAYLENGTH | ATHROW | MONITORENTER | MONITOREXIT => Insn::Simple(op),
            GETSTATIC..=PUTFIELD => Insn::Field { op, index: c.u2()? },
            INVOKEVIRTUAL..=INVOKESTATIC => Insn::Method { op, index: c.u2()? },
            INVOKEINTERFACE => {
                let index = c.u2()?;
                c.u1()?;
                c.u1()?;
                Insn::Method { op, index }
            }
            INVOKEDYNAMIC => {
                let index = c.u2()?;
                c.u2()?;
                Insn::Dynamic { index }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Type { op, class: c.u2()? },
            NEWARRAY => Insn::Int { op, value: c.u1()? as i32 },
            WIDE => {
                let inner = c.u1()?;
                match inner {
                    IINC => Insn::Iinc { slot: c.u2()?, delta: c.u2()? as i16 },
                    ILOAD..=ALOAD | ISTORE..=ASTORE => Insn::Var { op: inner, slot: c.u2()? },
                    _ => return Err(BytecodeError::InvalidOpcode { opcode: inner, offset: pc + 1 }),
                }
            }
            MULTIANEWARRAY => Insn::MultiANewArray { class: c.u2()?, dims: c.u1()? },
            _ => return Err(BytecodeError::InvalidOpcode { opcode: op, offset: pc }),
        };
        decoded.push((pc, Item::Insn(insn)));
    }

    let mut try_catch = Vec::with_capacity(code.exception_table.len());
    for e in &code.exception_table {
        try_catch.push(TryCatch {
            start: labels.at(e.start_pc as i64)?,
            end: labels.at(e.end_pc as i64)?,
            handler: labels.at(e.handler_pc as i64)?,
            catch_type: e.catch_type,
        });
    }

    let mut lines: HashMap<usize, Vec<u16>> = HashMap::new();
    let mut locals = Vec::new();
    let mut local_types = Vec::new();
    let mut declared_frames = Vec::new();
    for attr in &code.attributes {
        match attr {
            AttributeInfo::StackMapTable(table) => {
                let mut offset: Option<usize> = None;
                for frame in &table.entries {
                    let delta = frame.offset_delta() as usize;
                    let at = offset.map_or(delta, |prev| prev + delta + 1);
                    offset = Some(at);
                    declared_frames.push((labels.at(at as i64)?, frame.clone()));
                }
            }
            AttributeInfo::LineNumberTable { entries } => {
                for e in entries {
                    lines.entry(e.start_pc as usize).or_default().push(e.line_number);
                }
            }
            AttributeInfo::LocalVariableTable { entries } => {
                for e in entries {
                    locals.push(LocalVar {
                        start: labels.at(e.start_pc as i64)?,
                        end: labels.at(e.start_pc as i64 + e.length as i64)?,
                        name_index: e.name_index,
                        type_index: e.descriptor_index,
                        slot: e.index,
                    });
                }
            }
            AttributeInfo::LocalVariableTypeTable { entries } => {
                for e in entries {
                    local_types.push(LocalVar {
                        start: labels.at(e.start_pc as i64)?,
                        end: labels.at(e.start_pc as i64 + e.length as i64)?,
                        name_index: e.name_index,
                        type_index: e.signature_index,
                        slot: e.index,
                    });
                }
            }
            _ => {}
        }
    }

    let mut items = Vec::with_capacity(decoded.len() + labels.by_offset.len() + lines.len());
    let mut pending = labels.by_offset.iter().peekable();
    for (pc, item) in decoded {
        while let Some((offset, label)) = pending.peek() {
            if **offset > pc {
                break;
            }
            if **offset < pc {
                return Err(BytecodeError::BadBranchTarget(**offset as i64));
            }
            items.push(Item::Insn(Insn::Label(**label)));
            pending.next();
        }
        if let Some(numbers) = lines.get(&pc) {
            items.extend(numbers.iter().map(|n| Item::Insn(Insn::Line(*n))));
        }
        items.push(item);
    }
    for (offset, label) in pending {
        if *offset != bytes.len() {
            return Err(BytecodeError::BadBranchTarget(*offset as i64));
        }
        items.push(Item::Insn(Insn::Label(*label)));
    }

    let mut next_label = labels.next;
    let insns = if items.iter().any(Item::is_subroutine) {
        let inlined = inline_subroutines(items, &try_catch, &mut next_label)?;
        try_catch = inlined.try_catch;
        // frames describing the return address no longer apply
        declared_frames.clear();
        inlined.insns
    } else {
        items.into_iter().filter_map(Item::into_insn).collect()
    };

    Ok(MethodBody {
        insns,
        try_catch,
        locals,
        local_types,
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        declared_frames,
        next_label,
    })
}
