//! Inlining of `jsr`/`ret` subroutines.
//!
//! Every `jsr L` becomes `aconst_null; goto L'` where `L'` starts a private
//! copy of the subroutine, and every `ret` in that copy jumps back to the
//! instruction after its own call site. Exception ranges covering copied
//! instructions are copied with them. Nested subroutines are expanded the
//! same way inside each copy.

use std::collections::{BTreeSet, HashMap};

use super::opcodes::*;
use super::{Insn, Label, TryCatch};
use crate::error::BytecodeError;

const MAX_NESTING: usize = 32;

/// A decoded instruction before subroutines are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Item {
    Insn(Insn),
    Jsr(Label),
    Ret(u16),
}

impl Item {
    pub(super) fn is_subroutine(&self) -> bool {
        matches!(self, Item::Jsr(_) | Item::Ret(_))
    }

    pub(super) fn into_insn(self) -> Option<Insn> {
        match self {
            Item::Insn(insn) => Some(insn),
            Item::Jsr(_) | Item::Ret(_) => None,
        }
    }

    fn is_pseudo(&self) -> bool {
        matches!(self, Item::Insn(insn) if insn.is_pseudo())
    }
}

pub(super) struct Inlined {
    pub insns: Vec<Insn>,
    pub try_catch: Vec<TryCatch>,
}

struct Region {
    start: usize,
    end: usize,
    handler: usize,
    entry: TryCatch,
}

struct Inliner<'a> {
    items: &'a [Item],
    positions: HashMap<Label, usize>,
    regions: Vec<Region>,
    next_label: &'a mut u32,
    insns: Vec<Insn>,
    /// Copied ranges, grouped by the original entry they came from.
    ranges: Vec<Vec<TryCatch>>,
}

/// Expand every subroutine of `items`. `try_catch` refers to labels placed
/// in `items`; `next_label` is advanced past every label created here.
pub(super) fn inline_subroutines(
    items: Vec<Item>,
    try_catch: &[TryCatch],
    next_label: &mut u32,
) -> Result<Inlined, BytecodeError> {
    let positions: HashMap<Label, usize> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match item {
            Item::Insn(Insn::Label(label)) => Some((*label, i)),
            _ => None,
        })
        .collect();
    let position = |label: &Label| positions.get(label).copied().ok_or(BytecodeError::UndefinedLabel(label.0));
    let mut regions = Vec::with_capacity(try_catch.len());
    for tc in try_catch {
        regions.push(Region {
            start: position(&tc.start)?,
            end: position(&tc.end)?,
            handler: position(&tc.handler)?,
            entry: *tc,
        });
    }

    let mut inliner = Inliner {
        items: &items,
        positions: positions.clone(),
        ranges: vec![Vec::new(); regions.len()],
        regions,
        next_label,
        insns: Vec::with_capacity(items.len() * 2),
    };
    let main = inliner.reach(0, None)?;
    inliner.instance(&main, &main, true, None, &mut Vec::new(), 0)?;

    let Inliner { insns, ranges, .. } = inliner;
    Ok(Inlined { insns, try_catch: ranges.into_iter().flatten().collect() })
}

impl Inliner<'_> {
    fn fresh(&mut self) -> Label {
        let label = Label(*self.next_label);
        *self.next_label += 1;
        label
    }

    fn position(&self, label: Label) -> Result<usize, BytecodeError> {
        self.positions.get(&label).copied().ok_or(BytecodeError::UndefinedLabel(label.0))
    }

    /// Indices reachable from `start` without entering a called subroutine.
    /// Handlers of covered instructions are followed unless `owned` (the
    /// main code) already contains them.
    fn reach(&self, start: usize, owned: Option<&BTreeSet<usize>>) -> Result<BTreeSet<usize>, BytecodeError> {
        let mut members = BTreeSet::new();
        let mut work = vec![start];
        while !work.is_empty() {
            while let Some(i) = work.pop() {
                if i >= self.items.len() || !members.insert(i) {
                    continue;
                }
                match &self.items[i] {
                    Item::Insn(insn) => {
                        for target in insn.targets() {
                            work.push(self.position(target)?);
                        }
                        if !insn.is_terminal() {
                            work.push(i + 1);
                        }
                    }
                    Item::Jsr(_) => work.push(i + 1),
                    Item::Ret(_) => {}
                }
            }
            for region in &self.regions {
                let covered = members.range(region.start..region.end).any(|i| !self.items[*i].is_pseudo());
                let foreign = owned.map_or(false, |main| main.contains(&region.handler));
                if covered && !foreign && !members.contains(&region.handler) {
                    work.push(region.handler);
                }
            }
        }
        Ok(members)
    }

    fn lookup(scopes: &[HashMap<Label, Label>], label: Label) -> Label {
        scopes.iter().rev().find_map(|scope| scope.get(&label).copied()).unwrap_or(label)
    }

    fn remap(insn: &Insn, scopes: &[HashMap<Label, Label>]) -> Insn {
        let map = |label: &Label| Self::lookup(scopes, *label);
        match insn {
            Insn::Jump { op, target } => Insn::Jump { op: *op, target: map(target) },
            Insn::TableSwitch { default, low, targets } => Insn::TableSwitch {
                default: map(default),
                low: *low,
                targets: targets.iter().map(map).collect(),
            },
            Insn::LookupSwitch { default, pairs } => Insn::LookupSwitch {
                default: map(default),
                pairs: pairs.iter().map(|(key, label)| (*key, map(label))).collect(),
            },
            other => other.clone(),
        }
    }

    fn close(&mut self, region: usize, start: Label, scopes: &[HashMap<Label, Label>]) {
        let end = self.fresh();
        self.insns.push(Insn::Label(end));
        let entry = self.regions[region].entry;
        self.ranges[region].push(TryCatch {
            start,
            end,
            handler: Self::lookup(scopes, entry.handler),
            catch_type: entry.catch_type,
        });
    }

    /// Emit one copy of `members`. The main code keeps its own labels and
    /// also places the labels of code it does not own; subroutine copies
    /// get fresh labels pushed on `scopes`.
    fn instance(
        &mut self,
        members: &BTreeSet<usize>,
        main: &BTreeSet<usize>,
        is_main: bool,
        ret_to: Option<Label>,
        scopes: &mut Vec<HashMap<Label, Label>>,
        depth: usize,
    ) -> Result<(), BytecodeError> {
        let items = self.items;
        let mut calls: Vec<(usize, Label, Label)> = Vec::new();
        let mut open: Vec<Option<Label>> = vec![None; self.regions.len()];
        let mut previous: Option<usize> = None;

        for (i, item) in items.iter().enumerate() {
            let member = members.contains(&i);
            if !member && !(is_main && matches!(item, Item::Insn(Insn::Label(_)))) {
                continue;
            }
            if !item.is_pseudo() {
                let gap = previous.map_or(false, |p| (p + 1..i).any(|j| !items[j].is_pseudo()));
                for region in 0..self.regions.len() {
                    let inside = self.regions[region].start <= i && i < self.regions[region].end;
                    if let Some(start) = open[region] {
                        if gap || !inside {
                            open[region] = None;
                            self.close(region, start, scopes);
                        }
                    }
                    if inside && open[region].is_none() {
                        let start = self.fresh();
                        self.insns.push(Insn::Label(start));
                        open[region] = Some(start);
                    }
                }
                previous = Some(i);
            }

            match item {
                Item::Insn(Insn::Label(label)) => {
                    let placed = Self::lookup(scopes, *label);
                    self.insns.push(Insn::Label(placed));
                }
                Item::Insn(insn) => {
                    let copied = Self::remap(insn, scopes);
                    self.insns.push(copied);
                }
                Item::Jsr(target) => {
                    let entry = self.fresh();
                    let back = self.fresh();
                    self.insns.push(Insn::Simple(ACONST_NULL));
                    self.insns.push(Insn::Jump { op: GOTO, target: entry });
                    self.insns.push(Insn::Label(back));
                    calls.push((self.position(*target)?, entry, back));
                }
                Item::Ret(_) => {
                    let back = ret_to.ok_or(BytecodeError::Subroutine(i))?;
                    self.insns.push(Insn::Jump { op: GOTO, target: back });
                }
            }
        }
        for region in 0..self.regions.len() {
            if let Some(start) = open[region] {
                self.close(region, start, scopes);
            }
        }

        for (entry_index, entry, back) in calls {
            if depth >= MAX_NESTING {
                return Err(BytecodeError::Subroutine(entry_index));
            }
            let body = self.reach(entry_index, Some(main))?;
            let mut scope = HashMap::new();
            for i in &body {
                if let Item::Insn(Insn::Label(label)) = &items[*i] {
                    let copy = self.fresh();
                    scope.insert(*label, copy);
                }
            }
            self.insns.push(Insn::Label(entry));
            scopes.push(scope);
            let result = self.instance(&body, main, false, Some(back), scopes, depth + 1);
            scopes.pop();
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{analyze, decode, MethodContext, ObjectHierarchy, VType};
    use crate::classfile::{AttributeInfo, CodeAttribute, ConstantPool, ExceptionTableEntry, LineNumberEntry};
    use crate::descriptor::MethodDescriptor;

    /// `static int ratio(int a, int b)` with a `finally` compiled to a
    /// subroutine, the way pre-1.6 compilers emitted it.
    fn ratio() -> CodeAttribute {
        CodeAttribute {
            max_stack: 2,
            max_locals: 5,
            code: vec![
                0x1a, 0x1b, 0x6c, 0x3d, // iload_0 iload_1 idiv istore_2
                JSR, 0x00, 0x0b, // 4: jsr 15
                0x1c, IRETURN, // 7: iload_2 ireturn
                0x4e, // 9: astore_3
                JSR, 0x00, 0x05, // 10: jsr 15
                0x2d, ATHROW, // 13: aload_3 athrow
                ASTORE, 0x04, // 15: astore 4
                RET, 0x04, // 17: ret 4
            ],
            exception_table: vec![ExceptionTableEntry { start_pc: 0, end_pc: 4, handler_pc: 9, catch_type: 0 }],
            attributes: vec![AttributeInfo::LineNumberTable {
                entries: vec![
                    LineNumberEntry { start_pc: 0, line_number: 60 },
                    LineNumberEntry { start_pc: 15, line_number: 61 },
                ],
            }],
        }
    }

    #[test]
    fn each_call_site_gets_its_own_copy() {
        let body = decode(&ratio()).unwrap();
        let copies = body.insns.iter().filter(|i| **i == Insn::Var { op: ASTORE, slot: 4 }).count();
        assert_eq!(copies, 2);
        assert_eq!(body.insns.iter().filter(|i| **i == Insn::Line(61)).count(), 2);
        assert_eq!(body.insns.iter().filter(|i| **i == Insn::Simple(ACONST_NULL)).count(), 2);
        assert!(body.insns.iter().all(|i| i.opcode() != Some(JSR) && i.opcode() != Some(RET)));

        // only the protected instructions of the main code stay covered
        assert_eq!(body.try_catch.len(), 1);
        let tc = body.try_catch[0];
        let start = body.label_position(tc.start).unwrap();
        let end = body.label_position(tc.end).unwrap();
        let covered: Vec<&Insn> = body.insns[start..end].iter().filter(|i| !i.is_pseudo()).collect();
        assert_eq!(covered.len(), 4);
    }

    #[test]
    fn inlined_code_passes_analysis() {
        let body = decode(&ratio()).unwrap();
        let desc = MethodDescriptor::parse("(II)I").unwrap();
        let ctx = MethodContext { owner: "demo/Legacy", access_flags: 0x0008, name: "ratio", descriptor: &desc };
        let analysis = analyze(&body, ctx, &ConstantPool::new(), &ObjectHierarchy).unwrap();
        assert!(analysis.dead_code(&body).is_empty());
        assert_eq!(analysis.max_locals, 5);

        let rets: Vec<usize> = body
            .insns
            .iter()
            .enumerate()
            .filter(|(_, i)| **i == Insn::Var { op: ASTORE, slot: 4 })
            .map(|(at, _)| at)
            .collect();
        for at in rets {
            let frame = analysis.frames[at].as_ref().unwrap();
            assert_eq!(frame.stack, [VType::Null]);
        }
    }

    #[test]
    fn ret_outside_a_subroutine_is_rejected() {
        let mut next = 0;
        let items = vec![Item::Ret(1)];
        assert!(matches!(inline_subroutines(items, &[], &mut next), Err(BytecodeError::Subroutine(0))));
    }
}
