use std::sync::Arc;

use super::{
    AnnotationMatcher, BehaviorNameMatcher, MatchAll, Matcher, MatchingResult, NamePattern, TypeNameMatcher,
};
use crate::error::MatchEvaluationError;
use crate::structure::StructuralType;

/// Conjunction of every configured criterion.
struct AllOf(Vec<Arc<dyn Matcher>>);

impl Matcher for AllOf {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        let mut result = MatchingResult::all_of(ty);
        for m in &self.0 {
            if !result.is_matched() {
                break;
            }
            result = result.intersect(&m.matching(ty)?);
        }
        Ok(result)
    }
}

/// Builds the common "this type, these behaviors" matcher.
///
/// String arguments are wildcard patterns; pass a [`NamePattern`] for exact
/// or regex matching. With no criteria the result matches everything.
#[derive(Default)]
pub struct MatcherBuilder {
    type_pattern: Option<NamePattern>,
    include_subtypes: bool,
    behavior: Option<BehaviorNameMatcher>,
    extra: Vec<Arc<dyn Matcher>>,
}

impl MatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_type(mut self, pattern: impl Into<NamePattern>) -> Self {
        self.type_pattern = Some(pattern.into());
        self
    }

    pub fn include_subtypes(mut self) -> Self {
        self.include_subtypes = true;
        self
    }

    pub fn on_behavior(mut self, pattern: impl Into<NamePattern>) -> Self {
        self.behavior = Some(BehaviorNameMatcher::new(pattern));
        self
    }

    /// Restrict the behavior criterion to one parameter list. Without a
    /// preceding `on_behavior`, any name qualifies.
    pub fn with_parameters<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let behavior = self.behavior.take().unwrap_or_else(|| BehaviorNameMatcher::new("*"));
        self.behavior = Some(behavior.with_parameters(types));
        self
    }

    pub fn type_annotated(mut self, pattern: impl Into<NamePattern>) -> Self {
        self.extra.push(Arc::new(AnnotationMatcher::on_type(pattern)));
        self
    }

    pub fn behavior_annotated(mut self, pattern: impl Into<NamePattern>) -> Self {
        self.extra.push(Arc::new(AnnotationMatcher::on_behavior(pattern)));
        self
    }

    pub fn and_matching(mut self, matcher: impl Matcher + 'static) -> Self {
        self.extra.push(Arc::new(matcher));
        self
    }

    pub fn build(self) -> Arc<dyn Matcher> {
        let mut parts: Vec<Arc<dyn Matcher>> = Vec::new();
        if let Some(pattern) = self.type_pattern {
            parts.push(Arc::new(TypeNameMatcher::new(pattern).include_subtypes(self.include_subtypes)));
        }
        if let Some(behavior) = self.behavior {
            parts.push(Arc::new(behavior));
        }
        parts.extend(self.extra);
        if parts.is_empty() {
            return Arc::new(MatchAll);
        }
        Arc::new(AllOf(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::sample_type;
    use crate::structure::LoadingBoundary;

    #[test]
    fn type_and_behavior() {
        let ty = sample_type(LoadingBoundary::Application { id: 1 });
        let m = MatcherBuilder::new().on_type("demo.Sample").on_behavior("compute").build();
        assert_eq!(
            m.matching(&ty).unwrap().sign_codes(),
            ["demo.Sample#compute(int)", "demo.Sample#compute(long,long)"]
        );

        let other = MatcherBuilder::new().on_type("demo.Other").on_behavior("compute").build();
        assert!(!other.matching(&ty).unwrap().is_matched());
    }

    #[test]
    fn empty_builder_matches_everything() {
        let ty = sample_type(LoadingBoundary::Application { id: 1 });
        assert_eq!(MatcherBuilder::new().build().matching(&ty).unwrap().len(), 4);
        let only_int = MatcherBuilder::new().with_parameters(["int"]).build();
        assert_eq!(only_int.matching(&ty).unwrap().sign_codes(), ["demo.Sample#compute(int)"]);
    }
}
