//! Structural matchers.
//!
//! A [`Matcher`] is evaluated against one [`StructuralType`] and yields the
//! behaviors that qualify for weaving. Every matcher in this module answers
//! with a subset of the type's behaviors, which makes the boolean algebra
//! simple: `and` intersects, `or` unions and `not` complements against the
//! type's own behavior list.
//!
//! ```rust,ignore
//! use jvm_weaver::matcher::{MatcherBuilder, MatcherExt};
//!
//! let matcher = MatcherBuilder::new()
//!     .on_type("demo.Sample")
//!     .on_behavior("compute")
//!     .build();
//! ```

mod builder;
mod filters;
mod guard;
mod pattern;

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::MatchEvaluationError;
use crate::structure::{StructuralBehavior, StructuralType};

pub use builder::MatcherBuilder;
pub use filters::{AnnotationMatcher, AnnotationTarget, BehaviorNameMatcher, MatchAll, TypeNameMatcher};
pub use guard::UnsafeGuard;
pub use pattern::NamePattern;

/// Behaviors of one type that a matcher selected, in first-match order
/// without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchingResult {
    behaviors: Vec<StructuralBehavior>,
    codes: HashSet<String>,
}

impl MatchingResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every behavior of `ty`.
    pub fn all_of(ty: &StructuralType) -> Self {
        let mut result = Self::new();
        for b in &ty.behaviors {
            result.add(b.clone());
        }
        result
    }

    /// Adds `behavior` unless one with the same signature code is present.
    pub fn add(&mut self, behavior: StructuralBehavior) -> bool {
        if !self.codes.insert(behavior.sign_code()) {
            return false;
        }
        self.behaviors.push(behavior);
        true
    }

    pub fn contains(&self, sign_code: &str) -> bool {
        self.codes.contains(sign_code)
    }

    pub fn is_matched(&self) -> bool {
        !self.behaviors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub fn behaviors(&self) -> &[StructuralBehavior] {
        &self.behaviors
    }

    pub fn sign_codes(&self) -> Vec<String> {
        self.behaviors.iter().map(StructuralBehavior::sign_code).collect()
    }

    pub fn intersect(&self, other: &MatchingResult) -> MatchingResult {
        let mut result = MatchingResult::new();
        for b in &self.behaviors {
            if other.contains(&b.sign_code()) {
                result.add(b.clone());
            }
        }
        result
    }

    pub fn union(mut self, other: MatchingResult) -> MatchingResult {
        for b in other.behaviors {
            self.add(b);
        }
        self
    }
}

/// A predicate over the structure of a type.
pub trait Matcher: Send + Sync {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError>;
}

impl<M: Matcher + ?Sized> Matcher for Arc<M> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        (**self).matching(ty)
    }
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        (**self).matching(ty)
    }
}

#[derive(Debug, Clone)]
pub struct And<A, B>(pub A, pub B);

impl<A: Matcher, B: Matcher> Matcher for And<A, B> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        let left = self.0.matching(ty)?;
        if !left.is_matched() {
            return Ok(left);
        }
        Ok(left.intersect(&self.1.matching(ty)?))
    }
}

#[derive(Debug, Clone)]
pub struct Or<A, B>(pub A, pub B);

impl<A: Matcher, B: Matcher> Matcher for Or<A, B> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        Ok(self.0.matching(ty)?.union(self.1.matching(ty)?))
    }
}

#[derive(Debug, Clone)]
pub struct Not<M>(pub M);

impl<M: Matcher> Matcher for Not<M> {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        let excluded = self.0.matching(ty)?;
        let mut result = MatchingResult::new();
        for b in &ty.behaviors {
            if !excluded.contains(&b.sign_code()) {
                result.add(b.clone());
            }
        }
        Ok(result)
    }
}

pub trait MatcherExt: Matcher + Sized {
    fn and<M: Matcher>(self, other: M) -> And<Self, M> {
        And(self, other)
    }

    fn or<M: Matcher>(self, other: M) -> Or<Self, M> {
        Or(self, other)
    }

    fn not(self) -> Not<Self> {
        Not(self)
    }

    /// Refuse bootstrap and engine types before evaluating `self`.
    fn guarded(self, enable_unsafe: bool) -> UnsafeGuard<Self> {
        UnsafeGuard::new(self, enable_unsafe)
    }

    fn shared(self) -> Arc<dyn Matcher>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<M: Matcher + Sized> MatcherExt for M {}
