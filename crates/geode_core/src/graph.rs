//! Dependency graph between entity types.
//!
//! An edge says that a dependent entity references a parent entity through a
//! payload field holding the parent's local id. The parent must have a
//! remote id before the dependent can be sent; at transmit time the parent's
//! remote id is written into the edge's `remote_field`.

use crate::entity::{EntityRef, EntityType, LocalId};
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One reference between entity types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Type holding the reference.
    pub dependent: EntityType,
    /// Referenced type.
    pub parent: EntityType,
    /// Payload field with the parent's local id.
    pub local_field: String,
    /// Field that receives the parent's remote id on the wire.
    pub remote_field: String,
}

impl DependencyEdge {
    /// Creates an edge.
    pub fn new(
        dependent: EntityType,
        parent: EntityType,
        local_field: impl Into<String>,
        remote_field: impl Into<String>,
    ) -> Self {
        Self {
            dependent,
            parent,
            local_field: local_field.into(),
            remote_field: remote_field.into(),
        }
    }
}

/// A concrete dependency of one entity on another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The parent entity.
    pub parent: EntityRef,
    /// Field that receives the parent's remote id.
    pub remote_field: String,
}

/// Acyclic set of dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Builds a graph, failing if the edges form a cycle.
    pub fn new(edges: Vec<DependencyEdge>) -> CoreResult<Self> {
        let graph = Self { edges };
        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<&str> = cycle.iter().map(EntityType::as_str).collect();
            return Err(CoreError::configuration(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }
        Ok(graph)
    }

    /// Returns all edges.
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Returns the edges leaving `dependent`.
    pub fn parents_of(&self, dependent: EntityType) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(move |e| e.dependent == dependent)
    }

    /// Extracts the entities a payload depends on.
    ///
    /// Absent or null reference fields mean no dependency. A reference that
    /// is not a local id is a validation error.
    pub fn dependencies_of(&self, entity_type: EntityType, payload: &Value) -> CoreResult<Vec<Dependency>> {
        let mut deps = Vec::new();
        for edge in self.parents_of(entity_type) {
            match payload.get(&edge.local_field) {
                None | Some(Value::Null) => {}
                Some(Value::String(raw)) => {
                    let local_id: LocalId = raw.parse().map_err(|_| {
                        CoreError::validation(
                            entity_type.as_str(),
                            format!("'{}' is not a valid local id", edge.local_field),
                        )
                    })?;
                    deps.push(Dependency {
                        parent: EntityRef::new(edge.parent, local_id),
                        remote_field: edge.remote_field.clone(),
                    });
                }
                Some(_) => {
                    return Err(CoreError::validation(
                        entity_type.as_str(),
                        format!("'{}' must be a string", edge.local_field),
                    ))
                }
            }
        }
        Ok(deps)
    }

    /// Returns entity types ordered parents first.
    pub fn topological_order(&self) -> Vec<EntityType> {
        let mut order = Vec::new();
        let mut placed = BTreeSet::new();
        while placed.len() < EntityType::ALL.len() {
            let before = placed.len();
            for t in EntityType::ALL {
                if placed.contains(&t) {
                    continue;
                }
                if self.parents_of(t).all(|e| placed.contains(&e.parent)) {
                    placed.insert(t);
                    order.push(t);
                }
            }
            if placed.len() == before {
                break;
            }
        }
        order
    }

    fn find_cycle(&self) -> Option<Vec<EntityType>> {
        let mut adjacency: BTreeMap<EntityType, Vec<EntityType>> = BTreeMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.dependent).or_default().push(edge.parent);
        }

        let mut done = BTreeSet::new();
        for start in adjacency.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(*start, &adjacency, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }
}

fn visit(
    node: EntityType,
    adjacency: &BTreeMap<EntityType, Vec<EntityType>>,
    path: &mut Vec<EntityType>,
    done: &mut BTreeSet<EntityType>,
) -> Option<Vec<EntityType>> {
    if let Some(pos) = path.iter().position(|t| *t == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node);
        return Some(cycle);
    }
    if done.contains(&node) {
        return None;
    }
    path.push(node);
    for next in adjacency.get(&node).into_iter().flatten() {
        if let Some(cycle) = visit(*next, adjacency, path, done) {
            return Some(cycle);
        }
    }
    path.pop();
    done.insert(node);
    None
}
