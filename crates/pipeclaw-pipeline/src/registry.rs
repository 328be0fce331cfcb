//! Step registry — resolves pipeline step identifiers to invokable units.
//!
//! A closed map built once at startup: an identifier names either a leaf
//! step (an object implementing `Step`) or another task definition, whose
//! pipeline expands inline. The registry is passed by `Arc` into the runner
//! and the dispatcher — no global mutable state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pipeclaw_core::config::TaskDefinition;
use pipeclaw_core::{PipeclawError, Result};

use crate::step::Step;

/// What a step identifier resolves to.
#[derive(Clone)]
pub enum StepKind {
    /// A directly invokable step.
    Leaf(Arc<dyn Step>),
    /// Another task — its pipeline runs inline over the same DataStore.
    Nested(TaskDefinition),
}

/// Identifier → step resolution table.
#[derive(Default)]
pub struct StepRegistry {
    entries: HashMap<String, StepKind>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a leaf step under its own name.
    pub fn register(&mut self, step: Arc<dyn Step>) -> Result<()> {
        let id = step.name().to_string();
        if self.entries.contains_key(&id) {
            return Err(PipeclawError::Config(format!(
                "Step id '{id}' registered twice"
            )));
        }
        self.entries.insert(id, StepKind::Leaf(step));
        Ok(())
    }

    /// Register a task definition so other pipelines can reference it by
    /// name as a nested step.
    pub fn register_nested(&mut self, definition: TaskDefinition) -> Result<()> {
        if self.entries.contains_key(&definition.name) {
            return Err(PipeclawError::Config(format!(
                "Task '{}' collides with a registered step id",
                definition.name
            )));
        }
        self.entries
            .insert(definition.name.clone(), StepKind::Nested(definition));
        Ok(())
    }

    /// Resolve an identifier.
    pub fn resolve(&self, id: &str) -> Option<&StepKind> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Startup check for one task: every pipeline id resolves, and nested
    /// references do not form a cycle.
    pub fn validate_pipeline(&self, definition: &TaskDefinition) -> Result<()> {
        let mut trail = HashSet::new();
        trail.insert(definition.name.as_str());
        self.walk(&definition.name, &definition.pipeline, &mut trail)
    }

    fn walk<'a>(
        &'a self,
        task: &str,
        pipeline: &'a [String],
        trail: &mut HashSet<&'a str>,
    ) -> Result<()> {
        for id in pipeline {
            match self.entries.get(id.as_str()) {
                None => {
                    return Err(PipeclawError::Config(format!(
                        "Task '{task}': unknown step id '{id}'"
                    )));
                }
                Some(StepKind::Leaf(_)) => {}
                Some(StepKind::Nested(def)) => {
                    if !trail.insert(def.name.as_str()) {
                        return Err(PipeclawError::Config(format!(
                            "Task '{task}': nested task '{id}' forms a cycle"
                        )));
                    }
                    self.walk(&def.name, &def.pipeline, trail)?;
                    trail.remove(def.name.as_str());
                }
            }
        }
        Ok(())
    }
}
