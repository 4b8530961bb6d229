//! Graph containers: uniquely named states and transitions grouped by source.
//!
//! States are interned on insertion; the rest of the core refers to them by
//! their index, which is stable for the lifetime of the collection.

use crate::error::CoreError;
use crate::state::State;
use crate::transition::Transition;
use std::collections::HashMap;

/// States indexed by name, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct StateMap {
    states: Vec<State>,
    index: HashMap<String, usize>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a state, rejecting duplicate names.
    pub fn insert(&mut self, state: State) -> Result<usize, CoreError> {
        if self.index.contains_key(state.name()) {
            return Err(CoreError::structure(format!(
                "duplicate state '{}'",
                state.name()
            )));
        }

        let id = self.states.len();
        self.index.insert(state.name().to_string(), id);
        self.states.push(state);
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|&id| &self.states[id])
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn by_id(&self, id: usize) -> &State {
        &self.states[id]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, State> {
        self.states.iter()
    }
}

impl<'a> IntoIterator for &'a StateMap {
    type Item = &'a State;
    type IntoIter = std::slice::Iter<'a, State>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.iter()
    }
}

/// An edge whose endpoints have been resolved against a [`StateMap`].
#[derive(Debug, Clone)]
pub struct Edge {
    pub transition: Transition,
    pub target: usize,
}

/// Outgoing transitions per source state, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TransitionIndex {
    outgoing: Vec<Vec<Edge>>,
}

impl TransitionIndex {
    /// Resolves every transition against `states`.
    ///
    /// Fails on unknown endpoints and on duplicate `(from, to)` pairs.
    pub fn resolve(states: &StateMap, transitions: Vec<Transition>) -> Result<Self, CoreError> {
        let mut outgoing: Vec<Vec<Edge>> = vec![Vec::new(); states.len()];

        for transition in transitions {
            let source = states.id_of(transition.from()).ok_or_else(|| {
                CoreError::structure(format!(
                    "transition '{}' references unknown state '{}'",
                    transition,
                    transition.from()
                ))
            })?;
            let target = states.id_of(transition.to()).ok_or_else(|| {
                CoreError::structure(format!(
                    "transition '{}' references unknown state '{}'",
                    transition,
                    transition.to()
                ))
            })?;

            let edges = &mut outgoing[source];
            if edges.iter().any(|e| e.target == target) {
                return Err(CoreError::structure(format!(
                    "duplicate transition from '{}' to '{}'",
                    transition.from(),
                    transition.to()
                )));
            }
            edges.push(Edge { transition, target });
        }

        Ok(Self { outgoing })
    }

    pub fn from_state(&self, id: usize) -> &[Edge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_outgoing(&self, id: usize) -> bool {
        !self.from_state(id).is_empty()
    }

    /// Total number of transitions.
    pub fn len(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.outgoing.iter().flatten()
    }

    /// Marks every state reachable from `start`, found by depth-first search.
    pub fn reachable_from(&self, start: usize) -> Vec<bool> {
        let mut visited = vec![false; self.outgoing.len()];
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            if visited[id] {
                continue;
            }
            visited[id] = true;
            for edge in self.from_state(id).iter().rev() {
                if !visited[edge.target] {
                    stack.push(edge.target);
                }
            }
        }

        visited
    }
}
