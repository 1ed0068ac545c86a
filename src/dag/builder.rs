//! Dependency analyzer.
//!
//! Builds the phase dependency graph of a cascade from three sources:
//! explicit `context.from` entries (with the `all`, `previous` and `first`
//! keywords), output references in the instruction template, and output
//! references in a templated candidate factor. Only phases defined earlier
//! can be dependencies, so the graph is acyclic by construction.

use crate::definition::{Cascade, FactorSpec, Phase};
use crate::errors::CascadeError;
use crate::template::referenced_outputs;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::warn;

/// Index into the phase list.
pub type PhaseIndex = usize;

/// Dependency graph over a cascade's phases.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    names: Vec<String>,
    index_map: HashMap<String, PhaseIndex>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
    has_handoffs: bool,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: PhaseIndex) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn get_index(&self, name: &str) -> Option<PhaseIndex> {
        self.index_map.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Phases that depend on the given phase.
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases the given phase depends on.
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases with no dependencies.
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        completed: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Parallel waves are used when there are at least two phases, no phase
    /// declares handoffs, and at least two phases have no dependencies.
    pub fn is_parallel_eligible(&self) -> bool {
        self.len() >= 2 && !self.has_handoffs && self.root_phases().len() >= 2
    }

    /// Phase name -> names of the phases it depends on.
    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let deps = self
                    .dependencies(i)
                    .iter()
                    .map(|&d| self.names[d].clone())
                    .collect();
                (name.clone(), deps)
            })
            .collect()
    }

    /// Kahn's algorithm over the edges.
    pub fn is_acyclic(&self) -> bool {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }
        processed == self.len()
    }
}

/// Builds a [`PhaseGraph`] from a cascade definition.
pub struct DagBuilder<'a> {
    cascade: &'a Cascade,
}

impl<'a> DagBuilder<'a> {
    pub fn new(cascade: &'a Cascade) -> Self {
        Self { cascade }
    }

    /// Build the graph. Phase names must be unique.
    pub fn build(self) -> Result<PhaseGraph, CascadeError> {
        let phases = &self.cascade.phases;

        let mut index_map = HashMap::new();
        for (i, phase) in phases.iter().enumerate() {
            if index_map.insert(phase.name.clone(), i).is_some() {
                return Err(CascadeError::DuplicatePhase(phase.name.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); phases.len()];

        for (to_idx, phase) in phases.iter().enumerate() {
            for from_idx in resolve_dependencies(to_idx, phase, &index_map) {
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        Ok(PhaseGraph {
            names: phases.iter().map(|p| p.name.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
            has_handoffs: phases.iter().any(|p| !p.handoffs.is_empty()),
        })
    }
}

/// Dependencies of the phase at `index`, all strictly earlier, in ascending order.
fn resolve_dependencies(
    index: PhaseIndex,
    phase: &Phase,
    index_map: &HashMap<String, PhaseIndex>,
) -> BTreeSet<PhaseIndex> {
    let mut deps = BTreeSet::new();
    let mut named: Vec<String> = Vec::new();

    if let Some(context) = &phase.context {
        if context.auto {
            deps.extend(0..index);
        }
        for source in &context.from {
            match source.as_str() {
                "all" => deps.extend(0..index),
                "previous" => deps.extend(index.checked_sub(1)),
                "first" if index > 0 => {
                    deps.insert(0);
                }
                "first" => {}
                name => named.push(name.to_string()),
            }
        }
    }

    named.extend(referenced_outputs(&phase.instructions));
    if let Some(candidates) = &phase.candidates
        && let FactorSpec::Template(template) = &candidates.factor
    {
        named.extend(referenced_outputs(template));
    }

    for name in named {
        match index_map.get(&name) {
            Some(&dep) if dep < index => {
                deps.insert(dep);
            }
            Some(_) => warn!(
                phase = %phase.name,
                reference = %name,
                "Ignoring reference to a phase that is not defined earlier"
            ),
            None => warn!(
                phase = %phase.name,
                reference = %name,
                "Ignoring reference to an unknown phase"
            ),
        }
    }

    deps
}
