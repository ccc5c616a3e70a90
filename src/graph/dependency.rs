//! The resource dependency graph.
//!
//! Edges point from a dependency to its dependent, so a topological order is
//! a valid creation order.

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{DeployError, GraphError, Result};

use super::resource::{ResourceDeclaration, ResourceRef};

/// A set of declarations linked by their references.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceDeclaration, ()>,
    node_indices: HashMap<String, NodeIndex>,
    /// References whose target has not been inserted yet.
    pending: Vec<(String, ResourceRef)>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a declaration.
    ///
    /// References to declarations not yet inserted are linked when their
    /// target arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken or a reference points at
    /// a declaration of the wrong kind.
    pub fn insert(&mut self, declaration: ResourceDeclaration) -> Result<()> {
        if self.node_indices.contains_key(&declaration.name) {
            return Err(DeployError::Graph(GraphError::DuplicateName {
                name: declaration.name,
            }));
        }

        let name = declaration.name.clone();
        let references: Vec<ResourceRef> =
            declaration.spec.references().into_iter().cloned().collect();

        let idx = self.graph.add_node(declaration);
        self.node_indices.insert(name.clone(), idx);

        for reference in references {
            self.pending.push((name.clone(), reference));
        }

        self.link_pending()
    }

    fn link_pending(&mut self) -> Result<()> {
        let mut still_pending = Vec::new();

        for (from, reference) in std::mem::take(&mut self.pending) {
            let (Some(&from_idx), Some(&to_idx)) = (
                self.node_indices.get(&from),
                self.node_indices.get(&reference.name),
            ) else {
                still_pending.push((from, reference));
                continue;
            };

            let found = self.graph[to_idx].kind();
            if found != reference.kind {
                return Err(DeployError::Graph(GraphError::KindMismatch {
                    from,
                    to: reference.name,
                    expected: reference.kind.to_string(),
                    found: found.to_string(),
                }));
            }

            if !self.graph.contains_edge(to_idx, from_idx) {
                self.graph.add_edge(to_idx, from_idx, ());
            }
        }

        self.pending = still_pending;
        Ok(())
    }

    /// Checks that every reference resolves and the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first dangling reference or cycle found.
    pub fn validate(&self) -> Result<()> {
        if let Some((from, reference)) = self.pending.first() {
            return Err(DeployError::Graph(GraphError::DanglingReference {
                from: from.clone(),
                to: reference.name.clone(),
            }));
        }

        if let Some(cycle) = self.cycles().into_iter().next() {
            return Err(DeployError::Graph(GraphError::CircularDependency {
                cycle: cycle.join(" -> "),
            }));
        }

        debug!("Resource graph valid: {} declarations", self.len());
        Ok(())
    }

    /// Returns every cycle, each as a list of names.
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<String>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.first().is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .map(|scc| scc.into_iter().map(|idx| self.graph[idx].name.clone()).collect())
            .collect()
    }

    /// Returns declaration names in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .map(|idx| self.graph[idx].name.clone())
                    .collect()
            })
            .map_err(|cycle| {
                DeployError::Graph(GraphError::CircularDependency {
                    cycle: self.graph[cycle.node_id()].name.clone(),
                })
            })
    }

    /// Returns declaration names in destruction order.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle.
    pub fn reverse_topological_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Returns the direct dependencies of `name`.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Returns the direct dependents of `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.node_indices.get(name) else {
            return Vec::new();
        };

        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].name.clone())
            .collect();
        names.sort();
        names
    }

    /// Looks up a declaration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDeclaration> {
        self.node_indices.get(name).map(|&idx| &self.graph[idx])
    }

    /// Returns true if `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.node_indices.contains_key(name)
    }

    /// Iterates over declarations in insertion order.
    pub fn declarations(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.graph.node_weights()
    }

    /// Number of declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
