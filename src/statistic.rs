//! Counts of what a transform session has rewritten.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::structure::LoadingBoundary;

/// Affected signature codes per `(loading boundary, class)`.
///
/// Written by the transform of one class at a time, read concurrently by
/// reporting.
#[derive(Debug, Default)]
pub struct AffectStatistic {
    affected: DashMap<(LoadingBoundary, String), BTreeSet<String>>,
}

impl AffectStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<I>(&self, boundary: &LoadingBoundary, class_name: &str, sign_codes: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.affected
            .entry((boundary.clone(), class_name.to_string()))
            .or_default()
            .extend(sign_codes);
    }

    /// Add everything `other` recorded.
    pub fn merge_from(&self, other: &AffectStatistic) {
        for entry in other.affected.iter() {
            let (boundary, class_name) = entry.key();
            self.record(boundary, class_name, entry.value().iter().cloned());
        }
    }

    pub fn classes_affected(&self) -> usize {
        self.affected.len()
    }

    pub fn methods_affected(&self) -> usize {
        self.affected.iter().map(|e| e.value().len()).sum()
    }

    pub fn clear(&self) {
        self.affected.clear();
    }

    pub fn snapshot(&self) -> AffectSnapshot {
        let mut classes: Vec<ClassAffect> = self
            .affected
            .iter()
            .map(|e| ClassAffect {
                loader: e.key().0.to_string(),
                class_name: e.key().1.clone(),
                behaviors: e.value().iter().cloned().collect(),
            })
            .collect();
        classes.sort_by(|a, b| (&a.loader, &a.class_name).cmp(&(&b.loader, &b.class_name)));

        let mut loaders: BTreeMap<String, LoaderAffect> = BTreeMap::new();
        for class in &classes {
            let loader = loaders.entry(class.loader.clone()).or_default();
            loader.classes_affected += 1;
            loader.methods_affected += class.behaviors.len();
        }
        AffectSnapshot {
            classes_affected: classes.len(),
            methods_affected: classes.iter().map(|c| c.behaviors.len()).sum(),
            loaders,
            classes,
        }
    }
}

/// Read-only view handed to reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectSnapshot {
    pub classes_affected: usize,
    pub methods_affected: usize,
    pub loaders: BTreeMap<String, LoaderAffect>,
    pub classes: Vec<ClassAffect>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderAffect {
    pub classes_affected: usize,
    pub methods_affected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAffect {
    pub loader: String,
    pub class_name: String,
    pub behaviors: Vec<String>,
}
