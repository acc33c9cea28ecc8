use super::{Matcher, MatchingResult, NamePattern};
use crate::error::MatchEvaluationError;
use crate::structure::StructuralType;

/// Selects every behavior of types whose name matches.
///
/// With `include_subtypes`, a type also matches when its declared super type
/// or one of its declared interfaces does. Only names present in the class
/// file are consulted; ancestors further up are never loaded.
#[derive(Debug, Clone)]
pub struct TypeNameMatcher {
    pattern: NamePattern,
    include_subtypes: bool,
}

impl TypeNameMatcher {
    pub fn new(pattern: impl Into<NamePattern>) -> Self {
        Self { pattern: pattern.into(), include_subtypes: false }
    }

    pub fn include_subtypes(mut self, include: bool) -> Self {
        self.include_subtypes = include;
        self
    }

    fn accepts(&self, ty: &StructuralType) -> bool {
        if self.pattern.matches(&ty.java_name) {
            return true;
        }
        self.include_subtypes
            && (ty.super_name.as_deref().map_or(false, |s| self.pattern.matches(s))
                || ty.interface_names.iter().any(|i| self.pattern.matches(i)))
    }
}

impl Matcher for TypeNameMatcher {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        Ok(if self.accepts(ty) { MatchingResult::all_of(ty) } else { MatchingResult::new() })
    }
}

/// Selects behaviors by name and, optionally, by exact parameter list.
#[derive(Debug, Clone)]
pub struct BehaviorNameMatcher {
    pattern: NamePattern,
    parameter_types: Option<Vec<String>>,
}

impl BehaviorNameMatcher {
    pub fn new(pattern: impl Into<NamePattern>) -> Self {
        Self { pattern: pattern.into(), parameter_types: None }
    }

    /// Java names, e.g. `["int", "java.lang.String[]"]`.
    pub fn with_parameters<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = Some(types.into_iter().map(Into::into).collect());
        self
    }
}

impl Matcher for BehaviorNameMatcher {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        let mut result = MatchingResult::new();
        for b in &ty.behaviors {
            if !self.pattern.matches(&b.name) {
                continue;
            }
            if let Some(params) = &self.parameter_types {
                if *params != b.parameter_type_names {
                    continue;
                }
            }
            result.add(b.clone());
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationTarget {
    /// The annotation is on the type; all its behaviors qualify.
    Type,
    /// The annotation is on the behavior itself.
    Behavior,
}

#[derive(Debug, Clone)]
pub struct AnnotationMatcher {
    pattern: NamePattern,
    target: AnnotationTarget,
}

impl AnnotationMatcher {
    pub fn on_type(pattern: impl Into<NamePattern>) -> Self {
        Self { pattern: pattern.into(), target: AnnotationTarget::Type }
    }

    pub fn on_behavior(pattern: impl Into<NamePattern>) -> Self {
        Self { pattern: pattern.into(), target: AnnotationTarget::Behavior }
    }
}

impl Matcher for AnnotationMatcher {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        match self.target {
            AnnotationTarget::Type => {
                let present = ty.annotation_names.iter().any(|a| self.pattern.matches(a));
                Ok(if present { MatchingResult::all_of(ty) } else { MatchingResult::new() })
            }
            AnnotationTarget::Behavior => {
                let mut result = MatchingResult::new();
                for b in &ty.behaviors {
                    if b.annotation_names.iter().any(|a| self.pattern.matches(a)) {
                        result.add(b.clone());
                    }
                }
                Ok(result)
            }
        }
    }
}

/// Selects every behavior of every type.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Matcher for MatchAll {
    fn matching(&self, ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
        Ok(MatchingResult::all_of(ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::sample_type;
    use crate::structure::LoadingBoundary;

    #[test]
    fn type_names_and_declared_supertypes() {
        let ty = sample_type(LoadingBoundary::Application { id: 3 });
        assert!(TypeNameMatcher::new("demo.Sample").matching(&ty).unwrap().is_matched());
        assert!(!TypeNameMatcher::new("demo.Service").matching(&ty).unwrap().is_matched());
        let via_interface = TypeNameMatcher::new("demo.Service").include_subtypes(true);
        assert_eq!(via_interface.matching(&ty).unwrap().len(), 4);
        let via_super = TypeNameMatcher::new("demo.Ba*").include_subtypes(true);
        assert!(via_super.matching(&ty).unwrap().is_matched());
    }

    #[test]
    fn behavior_parameters_select_one_overload() {
        let ty = sample_type(LoadingBoundary::Application { id: 3 });
        let m = BehaviorNameMatcher::new("compute").with_parameters(["long", "long"]);
        assert_eq!(m.matching(&ty).unwrap().sign_codes(), ["demo.Sample#compute(long,long)"]);
    }

    #[test]
    fn annotations_on_types_and_behaviors() {
        let mut ty = sample_type(LoadingBoundary::Application { id: 3 });
        assert_eq!(AnnotationMatcher::on_type("demo.Traced").matching(&ty).unwrap().len(), 4);
        assert!(!AnnotationMatcher::on_behavior("demo.Traced").matching(&ty).unwrap().is_matched());
        ty.behaviors[3].annotation_names.insert("demo.Timed".into());
        let result = AnnotationMatcher::on_behavior("demo.*").matching(&ty).unwrap();
        assert_eq!(result.sign_codes(), ["demo.Sample#describe()"]);
    }
}
