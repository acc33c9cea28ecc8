//! Symbolic instruction model for method bodies.
//!
//! A `Code` attribute is decoded into a [`MethodBody`] whose branch targets,
//! exception ranges, line numbers and local variable ranges all refer to
//! [`Label`]s instead of byte offsets. Rewriting happens on that list; the
//! body is then re-assembled with fresh offsets, `max_stack`, `max_locals`
//! and `StackMapTable`.

pub mod decode;
pub mod encode;
pub mod frames;
pub mod opcodes;
mod subroutine;

use crate::classfile::{
    AttributeInfo, CodeAttribute, ConstantPool, LineNumberEntry, LocalVariableTableEntry,
    LocalVariableTypeTableEntry, StackMapFrame, STACK_MAP_VERSION,
};
use crate::descriptor::MethodDescriptor;
use crate::error::BytecodeError;

pub use decode::decode;
pub use encode::{encode, Encoded};
pub use frames::{
    analyze, without_dead_code, Analysis, Frame, ObjectHierarchy, SuperclassHierarchy, TypeHierarchy, VType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Marks a position; emits no bytes.
    Label(Label),
    /// Source line for the following instructions; emits no bytes.
    Line(u16),
    /// Opcodes without operands.
    Simple(u8),
    /// `bipush`, `sipush` and `newarray`.
    Int { op: u8, value: i32 },
    /// Local variable loads and stores, always in their long form.
    Var { op: u8, slot: u16 },
    Iinc { slot: u16, delta: i16 },
    /// `new`, `anewarray`, `checkcast` and `instanceof` with a class index.
    Type { op: u8, class: u16 },
    Field { op: u8, index: u16 },
    /// Every `invoke*` except `invokedynamic`.
    Method { op: u8, index: u16 },
    Dynamic { index: u16 },
    /// `ldc`, `ldc_w` or `ldc2_w`, chosen at encoding time.
    Ldc { index: u16 },
    /// Branches, with `goto_w` folded into `goto`.
    Jump { op: u8, target: Label },
    TableSwitch { default: Label, low: i32, targets: Vec<Label> },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
    MultiANewArray { class: u16, dims: u8 },
}

impl Insn {
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Label(_) | Insn::Line(_))
    }

    pub fn opcode(&self) -> Option<u8> {
        match self {
            Insn::Label(_) | Insn::Line(_) => None,
            Insn::Simple(op)
            | Insn::Int { op, .. }
            | Insn::Var { op, .. }
            | Insn::Type { op, .. }
            | Insn::Field { op, .. }
            | Insn::Method { op, .. }
            | Insn::Jump { op, .. } => Some(*op),
            Insn::Iinc { .. } => Some(opcodes::IINC),
            Insn::Dynamic { .. } => Some(opcodes::INVOKEDYNAMIC),
            Insn::Ldc { .. } => Some(opcodes::LDC),
            Insn::TableSwitch { .. } => Some(opcodes::TABLESWITCH),
            Insn::LookupSwitch { .. } => Some(opcodes::LOOKUPSWITCH),
            Insn::MultiANewArray { .. } => Some(opcodes::MULTIANEWARRAY),
        }
    }

    /// Control never continues with the next instruction.
    pub fn is_terminal(&self) -> bool {
        match self {
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => true,
            _ => self.opcode().map_or(false, opcodes::is_terminal),
        }
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch { default, targets, .. } => {
                let mut out = targets.clone();
                out.push(*default);
                out
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut out: Vec<Label> = pairs.iter().map(|(_, l)| *l).collect();
                out.push(*default);
                out
            }
            _ => Vec::new(),
        }
    }
}

/// One exception table entry. `catch_type == 0` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryCatch {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    pub catch_type: u16,
}

/// An entry of `LocalVariableTable` or `LocalVariableTypeTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVar {
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    /// Descriptor index, or signature index for the type table.
    pub type_index: u16,
    pub slot: u16,
}

#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    pub insns: Vec<Insn>,
    pub try_catch: Vec<TryCatch>,
    pub locals: Vec<LocalVar>,
    pub local_types: Vec<LocalVar>,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Frames the decoded `StackMapTable` declared, in table order.
    pub declared_frames: Vec<(Label, StackMapFrame)>,
    next_label: u32,
}

impl MethodBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// A body over `insns`; fresh labels start past every label they use.
    pub fn from_insns(insns: Vec<Insn>) -> Self {
        let next_label = insns
            .iter()
            .flat_map(|insn| match insn {
                Insn::Label(label) => vec![*label],
                other => other.targets(),
            })
            .map(|label| label.0 + 1)
            .max()
            .unwrap_or(0);
        Self { insns, next_label, ..Self::default() }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Index of the `Insn::Label` that places `label`.
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.insns.iter().position(|i| *i == Insn::Label(label))
    }
}

/// The method a body belongs to.
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    pub owner: &'a str,
    pub access_flags: u16,
    pub name: &'a str,
    pub descriptor: &'a MethodDescriptor,
}

impl MethodContext<'_> {
    pub fn is_static(&self) -> bool {
        self.access_flags & crate::classfile::access::ACC_STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

/// Analyse and encode `body` into a complete `Code` attribute. Unreachable
/// instructions are left out.
pub fn assemble(
    body: &MethodBody,
    ctx: MethodContext<'_>,
    cp: &mut ConstantPool,
    hierarchy: &dyn TypeHierarchy,
    major_version: u16,
) -> Result<CodeAttribute, BytecodeError> {
    let mut analysis = analyze(body, ctx, cp, hierarchy)?;
    let pruned;
    let body = if analysis.dead_code(body).is_empty() {
        body
    } else {
        pruned = without_dead_code(body, &analysis);
        analysis = analyze(&pruned, ctx, cp, hierarchy)?;
        &pruned
    };
    let encoded = encode(body, cp)?;

    let mut attributes = Vec::new();
    if !encoded.lines.is_empty() {
        cp.add_utf8("LineNumberTable")?;
        let entries = encoded
            .lines
            .iter()
            .map(|(pc, line)| LineNumberEntry { start_pc: *pc as u16, line_number: *line })
            .collect();
        attributes.push(AttributeInfo::LineNumberTable { entries });
    }
    let locals: Vec<LocalVariableTableEntry> = body
        .locals
        .iter()
        .filter_map(|v| {
            let (start, length) = encoded.range(v.start, v.end)?;
            Some(LocalVariableTableEntry {
                start_pc: start,
                length,
                name_index: v.name_index,
                descriptor_index: v.type_index,
                index: v.slot,
            })
        })
        .collect();
    if !locals.is_empty() {
        cp.add_utf8("LocalVariableTable")?;
        attributes.push(AttributeInfo::LocalVariableTable { entries: locals });
    }
    let local_types: Vec<LocalVariableTypeTableEntry> = body
        .local_types
        .iter()
        .filter_map(|v| {
            let (start, length) = encoded.range(v.start, v.end)?;
            Some(LocalVariableTypeTableEntry {
                start_pc: start,
                length,
                name_index: v.name_index,
                signature_index: v.type_index,
                index: v.slot,
            })
        })
        .collect();
    if !local_types.is_empty() {
        cp.add_utf8("LocalVariableTypeTable")?;
        attributes.push(AttributeInfo::LocalVariableTypeTable { entries: local_types });
    }
    if major_version >= STACK_MAP_VERSION {
        let table = frames::stack_map_table(body, &analysis, &encoded, cp)?;
        if !table.entries.is_empty() {
            cp.add_utf8("StackMapTable")?;
            attributes.push(AttributeInfo::StackMapTable(table));
        }
    }

    Ok(CodeAttribute {
        max_stack: analysis.max_stack,
        max_locals: analysis.max_locals,
        code: encoded.code,
        exception_table: encoded.exception_table,
        attributes,
    })
}
