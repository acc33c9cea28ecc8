//! Markers around injected code.
//!
//! Every block the weaver injects is bracketed by `iconst_2; pop` and
//! `iconst_3; pop`. Both pairs are stack-neutral no-ops at run time; they only
//! let a later weaving pass recognise code an earlier pass injected so its
//! dispatch calls and early exits are never instrumented again.

use crate::bytecode::opcodes::{ICONST_2, ICONST_3, POP};
use crate::bytecode::Insn;

pub(crate) const LOCK: [Insn; 2] = [Insn::Simple(ICONST_2), Insn::Simple(POP)];
pub(crate) const UNLOCK: [Insn; 2] = [Insn::Simple(ICONST_3), Insn::Simple(POP)];

/// Tracks whether a traversal is inside injected code.
#[derive(Debug, Default)]
pub(crate) struct CodeLock {
    locked: bool,
    pending: Option<u8>,
}

impl CodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next instruction of the body being traversed.
    pub fn observe(&mut self, insn: &Insn) {
        if insn.is_pseudo() {
            return;
        }
        match (self.pending.take(), insn) {
            (Some(ICONST_2), Insn::Simple(POP)) => self.locked = true,
            (Some(ICONST_3), Insn::Simple(POP)) => self.locked = false,
            (_, Insn::Simple(op @ (ICONST_2 | ICONST_3))) => self.pending = Some(*op),
            _ => {}
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcodes::*;
    use crate::bytecode::Label;

    #[test]
    fn markers_toggle_the_lock() {
        let mut lock = CodeLock::new();
        let states: Vec<bool> = [
            Insn::Simple(ICONST_2),
            Insn::Simple(POP),
            Insn::Method { op: INVOKESTATIC, index: 1 },
            Insn::Simple(ICONST_3),
            Insn::Simple(POP),
            Insn::Simple(IRETURN),
        ]
        .iter()
        .map(|insn| {
            lock.observe(insn);
            lock.is_locked()
        })
        .collect();
        assert_eq!(states, [false, true, true, true, false, false]);
    }

    #[test]
    fn unrelated_constants_do_not_lock() {
        let mut lock = CodeLock::new();
        for insn in [
            Insn::Simple(ICONST_2),
            Insn::Label(Label(0)),
            Insn::Var { op: ISTORE, slot: 1 },
            Insn::Simple(POP),
        ] {
            lock.observe(&insn);
        }
        assert!(!lock.is_locked());

        // labels between the pair do not break it
        lock.observe(&Insn::Simple(ICONST_2));
        lock.observe(&Insn::Line(4));
        lock.observe(&Insn::Simple(POP));
        assert!(lock.is_locked());
    }
}
