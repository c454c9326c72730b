//! Dependency graph construction over stage declarations.
//!
//! Edges are inferred from shared file artifacts: a stage consuming a path
//! another stage declares as an output depends on that stage. Inputs with no
//! producer must be pre-supplied under the work directory (or be remote
//! URLs); otherwise graph construction fails. Cycles fail construction with
//! the offending path.

use crate::errors::{CycleDetectedError, LabflowError, MissingProducerError};
use crate::manifest::{InputSource, PipelineManifest};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A validated, acyclic dependency graph over pipeline stages.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Upstream dependencies per stage.
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Downstream dependents per stage.
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Pre-supplied source paths consumed per stage (no producing stage).
    source_inputs: BTreeMap<String, Vec<String>>,
    /// Deterministic topological execution order.
    execution_order: Vec<String>,
}

impl DependencyGraph {
    /// Builds the graph from a manifest.
    ///
    /// `presupplied` reports whether an unproduced input path is available
    /// without running any stage (typically: it exists under the work
    /// directory). Remote URL inputs are always considered acquirable.
    ///
    /// # Errors
    ///
    /// [`LabflowError::MissingProducer`] for an input that is neither
    /// produced, pre-supplied, nor remote; [`LabflowError::CycleDetected`]
    /// when the inferred edges contain a cycle.
    pub fn build(
        manifest: &PipelineManifest,
        presupplied: impl Fn(&str) -> bool,
    ) -> Result<Self, LabflowError> {
        let producers = manifest.producers();

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut source_inputs: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for stage in &manifest.stages {
            dependencies.entry(stage.name.clone()).or_default();
            dependents.entry(stage.name.clone()).or_default();
        }

        for stage in &manifest.stages {
            for source in stage.input_sources().values() {
                match source {
                    InputSource::Url(_) => {}
                    InputSource::Path(path) => {
                        if let Some(producer) = producers.get(path) {
                            dependencies
                                .entry(stage.name.clone())
                                .or_default()
                                .insert(producer.clone());
                            dependents
                                .entry(producer.clone())
                                .or_default()
                                .insert(stage.name.clone());
                        } else if presupplied(path) {
                            source_inputs
                                .entry(stage.name.clone())
                                .or_default()
                                .push(path.clone());
                        } else {
                            return Err(
                                MissingProducerError::new(stage.name.clone(), path.clone()).into()
                            );
                        }
                    }
                }
            }
        }

        let execution_order = topological_order(&manifest.stage_names(), &dependencies)?;

        Ok(Self {
            dependencies,
            dependents,
            source_inputs,
            execution_order,
        })
    }

    /// The topological execution order (every stage strictly after its
    /// dependencies).
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// The number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.execution_order.len()
    }

    /// Upstream dependencies of a stage.
    #[must_use]
    pub fn dependencies_of(&self, stage: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.dependencies.get(stage).unwrap_or(&EMPTY)
    }

    /// Direct dependents of a stage.
    #[must_use]
    pub fn dependents_of(&self, stage: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.dependents.get(stage).unwrap_or(&EMPTY)
    }

    /// Pre-supplied source paths a stage consumes directly.
    #[must_use]
    pub fn source_inputs_of(&self, stage: &str) -> &[String] {
        match self.source_inputs.get(stage) {
            Some(paths) => paths,
            None => &[],
        }
    }

    /// All stages transitively downstream of `stage` (excluding itself).
    ///
    /// Used to cascade a failure to every dependent.
    #[must_use]
    pub fn downstream_closure(&self, stage: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        let mut frontier = vec![stage.to_string()];
        while let Some(current) = frontier.pop() {
            for dependent in self.dependents_of(&current) {
                if closure.insert(dependent.clone()) {
                    frontier.push(dependent.clone());
                }
            }
        }
        closure
    }

    /// Initial in-degree (unsatisfied dependency count) per stage.
    #[must_use]
    pub fn in_degrees(&self) -> BTreeMap<String, usize> {
        self.dependencies
            .iter()
            .map(|(name, deps)| (name.clone(), deps.len()))
            .collect()
    }
}

/// Depth-first topological sort in declaration order, with cycle-path
/// extraction on failure.
fn topological_order(
    stage_order: &[String],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, CycleDetectedError> {
    let mut result = Vec::with_capacity(stage_order.len());
    let mut visited = HashSet::new();
    let mut path: Vec<String> = Vec::new();

    fn visit(
        node: &str,
        dependencies: &BTreeMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        result: &mut Vec<String>,
    ) -> Result<(), CycleDetectedError> {
        if visited.contains(node) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|n| n == node) {
            let mut cycle: Vec<String> = path[start..].to_vec();
            cycle.push(node.to_string());
            return Err(CycleDetectedError::new(cycle));
        }

        path.push(node.to_string());
        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                visit(dep, dependencies, visited, path, result)?;
            }
        }
        path.pop();

        visited.insert(node.to_string());
        result.push(node.to_string());
        Ok(())
    }

    for name in stage_order {
        visit(name, dependencies, &mut visited, &mut path, &mut result)?;
    }

    Ok(result)
}
