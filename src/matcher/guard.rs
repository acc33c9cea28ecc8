use super::{Matcher, MatchingResult};
use crate::error::MatchEvaluationError;
use crate::structure::StructuralType;

/// Refuses types the engine must never weave, before the wrapped matcher
/// runs: the engine's own types always, and bootstrap-loaded types unless
/// unsafe mode is on.
#[derive(Debug, Clone)]
pub struct UnsafeGuard<M> {
    inner: M,
    enable_unsafe: bool,
}

impl<M> UnsafeGuard<M> {
    pub fn new(inner: M, enable_unsafe: bool) -> Self {
        Self { inner, enable_unsafe }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    fn refuses(&self, ty: &StructuralType) -> bool {
        ty.is_engine_type() || (ty.boundary.is_bootstrap() && !self.enable_unsafe)
    }
}

impl<M: Matcher> Matcher for UnsafeGuard<M> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        if self.refuses(ty) {
            return Ok(MatchingResult::new());
        }
        self.inner.matching(ty)
    }
}
