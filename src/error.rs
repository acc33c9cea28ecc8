//! Error types.
//!
//! Every failure that can happen while instrumenting one class is confined to
//! that class. The coordinator turns a [`TransformError`] into "no change" and
//! logs it; nothing here is ever fatal to the host.

use thiserror::Error;

use crate::event::Verdict;

/// A boxed error type for listener failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The raw bytes are not a well-formed class file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("string constant of {0} bytes exceeds 65535")]
    Utf8TooLong(usize),
    #[error("attribute name {0} is not in the constant pool")]
    MissingAttributeName(String),
}

/// Instruction-level legality violations found while decoding, analysing or
/// encoding a method body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("branch target {0} is not an instruction boundary")]
    BadBranchTarget(i64),
    #[error("subroutine at instruction {0} cannot be inlined")]
    Subroutine(usize),
    #[error("label {0} is used but never placed")]
    UndefinedLabel(u32),
    #[error("exception range starting at label {0} is empty")]
    EmptyHandlerRange(u32),
    #[error("operand stack underflow at instruction {0}")]
    StackUnderflow(usize),
    #[error("operand stack shape differs at merge point {0}")]
    StackMismatch(usize),
    #[error("incompatible operand type at instruction {0}")]
    TypeMismatch(usize),
    #[error("local variable {slot} out of range at instruction {at}")]
    BadLocal { slot: usize, at: usize },
    #[error("execution falls off the end of the code")]
    FallOffEnd,
    #[error("code length {0} exceeds 65535 bytes")]
    CodeTooLarge(usize),
    #[error("operand stack depth {0} exceeds 65535")]
    StackTooDeep(usize),
    #[error("constructor never invokes a superclass or sibling constructor")]
    MissingConstructorCall,
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
}

/// Rewriting could not produce a legal body. The caller keeps the original.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WeavingError {
    #[error("cannot rewrite {method}: {source}")]
    Method {
        method: String,
        #[source]
        source: BytecodeError,
    },
    #[error(transparent)]
    ConstantPool(#[from] ClassFileError),
}

/// A matcher failed while evaluating a structural type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatchEvaluationError {
    #[error("matcher failed: {0}")]
    Failed(String),
    #[error("matcher panicked: {0}")]
    Panicked(String),
}

/// Any per-class failure of the transform pipeline.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed class file: {0}")]
    Malformed(#[from] ClassFileError),
    #[error("weaving failed: {0}")]
    Weaving(#[from] WeavingError),
    #[error(transparent)]
    Match(#[from] MatchEvaluationError),
}

/// What a listener callback hands back besides success.
///
/// `Control` is the flow-control signal and never reaches the instrumented
/// method as an error; `Failed` does.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("process control: {0:?}")]
    Control(Verdict),
    #[error(transparent)]
    Failed(BoxError),
}

impl ListenerError {
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        ListenerError::Failed(error.into())
    }
}

/// A listener raised an ordinary error while handling an event.
#[derive(Debug, Error)]
#[error("listener {listener_id} failed: {source}")]
pub struct ListenerCallbackError {
    pub listener_id: i32,
    #[source]
    pub source: BoxError,
}

/// Failure reported by the host process collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("host rejected {operation}: {message}")]
pub struct HostError {
    pub operation: &'static str,
    pub message: String,
}

/// Install / uninstall / watch failures of an isolation boundary.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("namespace {0} is not installed")]
    NotInstalled(String),
    #[error("boundary for namespace {0} has been uninstalled")]
    Inactive(String),
    #[error("listener {0} is not registered")]
    UnknownListener(i32),
    #[error("failed to generate dispatch classes: {0}")]
    SpyClasses(#[from] BytecodeError),
    #[error(transparent)]
    Host(#[from] HostError),
}
