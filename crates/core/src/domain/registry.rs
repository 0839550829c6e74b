use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::error_record::Severity;
use super::stage::{StageDefinition, StageKind};
use crate::error::{CoreError, Result};

/// Declarative, read-only set of stages and their dependencies.
///
/// Declaration order is significant: the scheduler scans stages in this
/// order and the first runnable one wins.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl StageRegistry {
    /// Build and validate a registry. Rejects empty registries, duplicate
    /// ids, unknown or cyclic dependencies and malformed definitions.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (position, def) in stages.iter().enumerate() {
            if index.insert(def.id.clone(), position).is_some() {
                return Err(CoreError::DuplicateStage(def.id.clone()));
            }
        }

        let registry = Self { stages, index };
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(CoreError::EmptyRegistry);
        }
        if !self.stages.iter().any(|def| def.required) {
            return Err(CoreError::NoRequiredStages);
        }

        for def in &self.stages {
            def.validate()?;
            if let Some(dependency) = def
                .depends_on
                .iter()
                .find(|dep| !self.index.contains_key(dep.as_str()))
            {
                return Err(CoreError::UnknownDependency {
                    stage: def.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm, stable with respect to declaration order.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let mut emitted: HashSet<&str> = HashSet::with_capacity(self.stages.len());
        let mut order = Vec::with_capacity(self.stages.len());

        while order.len() < self.stages.len() {
            let next = self.stages.iter().find(|def| {
                !emitted.contains(def.id.as_str())
                    && def.depends_on.iter().all(|d| emitted.contains(d.as_str()))
            });

            match next {
                Some(def) => {
                    emitted.insert(def.id.as_str());
                    order.push(def.id.as_str());
                }
                None => {
                    let stuck = self
                        .stages
                        .iter()
                        .filter(|def| !emitted.contains(def.id.as_str()))
                        .map(|def| def.id.clone())
                        .collect();
                    return Err(CoreError::DependencyCycle(stuck));
                }
            }
        }

        Ok(order)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn get(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.index.get(stage_id).map(|&i| &self.stages[i])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn required_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter().filter(|def| def.required)
    }

    /// Capabilities the registry needs from the worker pool, deduplicated in
    /// declaration order.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.stages
            .iter()
            .map(|def| def.required_capability.as_str())
            .filter(|cap| seen.insert(*cap))
            .collect()
    }

    /// The restaurant market research pipeline used when no stages are configured.
    pub fn restaurant_default() -> Self {
        let stages = vec![
            StageDefinition::new("data_collection", StageKind::Collection, "scraping")
                .calls(["collect.listings", "collect.reviews"])
                .severity(Severity::Critical)
                .weight(2.0),
            StageDefinition::new("menu_analysis", StageKind::Analysis, "menu_analysis")
                .depends_on(["data_collection"])
                .calls(["menu.analyze"]),
            StageDefinition::new("pricing_analysis", StageKind::Analysis, "pricing")
                .depends_on(["data_collection"])
                .calls(["pricing.analyze"]),
            StageDefinition::new("sentiment_analysis", StageKind::Analysis, "sentiment")
                .depends_on(["data_collection"])
                .calls(["sentiment.analyze"])
                .severity(Severity::Medium),
            StageDefinition::new("competitor_report", StageKind::Report, "reporting")
                .depends_on(["menu_analysis", "pricing_analysis", "sentiment_analysis"])
                .calls(["report.compile"]),
        ];

        let mut index = HashMap::with_capacity(stages.len());
        for (position, def) in stages.iter().enumerate() {
            index.insert(def.id.clone(), position);
        }
        Self { stages, index }
    }
}
