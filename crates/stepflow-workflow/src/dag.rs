//! State graph validation
//!
//! Builds a petgraph `DiGraph` over the definition's states and transitions
//! and checks the structural rules every execution relies on: the graph is
//! acyclic, terminals have no way out, and every state is reachable from the
//! start and can itself reach a terminal.

use crate::state::{StateId, StateKind, StateSpec, TransitionTable};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Dfs};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagValidationError {
    #[error("Cycle detected in state machine: {0}")]
    CycleDetected(String),

    #[error("Start state {0} is not defined")]
    MissingStart(StateId),

    #[error("Transition {from} -> {to} references an undefined state")]
    MissingState { from: StateId, to: StateId },

    #[error("Duplicate state name: {0}")]
    DuplicateStateName(String),

    #[error("Terminal state {0} has outgoing transitions")]
    TerminalHasTransitions(StateId),

    #[error("Task state {0} has no success transition")]
    MissingSuccessTransition(StateId),

    #[error("Catch rule {index} of {state} is shadowed by an earlier catch-all")]
    ShadowedCatch { state: StateId, index: usize },

    #[error("State {0} is not reachable from the start state")]
    Unreachable(StateId),

    #[error("State {0} cannot reach a terminal state")]
    DeadEnd(StateId),
}

/// Graph view of a state machine definition
#[derive(Debug, Clone)]
pub struct StateGraph {
    graph: DiGraph<StateId, ()>,
    state_to_node: HashMap<StateId, NodeIndex>,
    terminals: HashSet<StateId>,
}

impl StateGraph {
    /// Build and validate the graph
    pub fn new(
        start_at: StateId,
        states: &BTreeMap<StateId, StateSpec>,
        transitions: &TransitionTable,
    ) -> Result<Self, DagValidationError> {
        let mut graph = DiGraph::new();
        let mut state_to_node = HashMap::new();
        let mut terminals = HashSet::new();

        let mut seen_names = HashSet::new();
        for spec in states.values() {
            if !seen_names.insert(spec.name.as_str()) {
                return Err(DagValidationError::DuplicateStateName(spec.name.clone()));
            }
        }

        for (id, spec) in states {
            let node = graph.add_node(*id);
            state_to_node.insert(*id, node);
            if spec.kind.is_terminal() {
                terminals.insert(*id);
            }
        }

        if !state_to_node.contains_key(&start_at) {
            return Err(DagValidationError::MissingStart(start_at));
        }

        for (from, to) in transitions.edges() {
            let from_node = state_to_node
                .get(&from)
                .ok_or(DagValidationError::MissingState { from, to })?;
            let to_node = state_to_node
                .get(&to)
                .ok_or(DagValidationError::MissingState { from, to })?;

            graph.add_edge(*from_node, *to_node, ());
        }

        let dag = Self {
            graph,
            state_to_node,
            terminals,
        };

        dag.validate(start_at, states, transitions)?;

        Ok(dag)
    }

    fn validate(
        &self,
        start_at: StateId,
        states: &BTreeMap<StateId, StateSpec>,
        transitions: &TransitionTable,
    ) -> Result<(), DagValidationError> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(DagValidationError::CycleDetected(self.describe_cycle()));
        }

        for (id, spec) in states {
            let node = self.state_to_node[id];
            let outgoing = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .count();

            match spec.kind {
                StateKind::Succeed | StateKind::Fail { .. } => {
                    if outgoing > 0 {
                        return Err(DagValidationError::TerminalHasTransitions(*id));
                    }
                }
                StateKind::Task { .. } => {
                    if transitions.success_route(*id).is_none() {
                        return Err(DagValidationError::MissingSuccessTransition(*id));
                    }
                    let rules = transitions.catches(*id);
                    if let Some(first) = rules.iter().position(|r| r.is_catch_all()) {
                        if first + 1 < rules.len() {
                            return Err(DagValidationError::ShadowedCatch {
                                state: *id,
                                index: first + 1,
                            });
                        }
                    }
                }
            }
        }

        let reachable = self.reachable_from(start_at);
        for id in states.keys() {
            if !reachable.contains(id) {
                return Err(DagValidationError::Unreachable(*id));
            }
            if !self.reaches_terminal(*id) {
                return Err(DagValidationError::DeadEnd(*id));
            }
        }

        Ok(())
    }

    fn reachable_from(&self, start: StateId) -> HashSet<StateId> {
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, self.state_to_node[&start]);
        while let Some(node) = bfs.next(&self.graph) {
            reachable.insert(self.graph[node]);
        }
        reachable
    }

    fn reaches_terminal(&self, state: StateId) -> bool {
        let mut dfs = Dfs::new(&self.graph, self.state_to_node[&state]);
        while let Some(node) = dfs.next(&self.graph) {
            if self.terminals.contains(&self.graph[node]) {
                return true;
            }
        }
        false
    }

    fn describe_cycle(&self) -> String {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(_) => "unknown".to_string(),
            Err(cycle) => self.graph[cycle.node_id()].to_string(),
        }
    }

    /// Upper bound on the number of states one execution can enter
    pub fn depth(&self) -> usize {
        self.graph.node_count()
    }

    /// States in execution order
    pub fn topological_order(&self) -> Vec<StateId> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .unwrap_or_default()
    }

    pub fn successors(&self, state: StateId) -> Vec<StateId> {
        self.state_to_node
            .get(&state)
            .map(|node| {
                self.graph
                    .neighbors_directed(*node, Direction::Outgoing)
                    .map(|n| self.graph[n])
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PayloadShaping;
    use crate::state::{CatchRule, TaskResource};

    fn task(id: StateId, name: &str) -> StateSpec {
        StateSpec::new(
            id,
            name,
            StateKind::Task {
                resource: TaskResource::InvokeFunction {
                    function_name: "fn".to_string(),
                },
                retry: Default::default(),
            },
        )
    }

    fn states() -> BTreeMap<StateId, StateSpec> {
        BTreeMap::from([
            (StateId::SubmitJob, task(StateId::SubmitJob, "Submit")),
            (StateId::PublishMessage, task(StateId::PublishMessage, "Publish")),
            (
                StateId::Succeeded,
                StateSpec::new(StateId::Succeeded, "Done", StateKind::Succeed),
            ),
            (
                StateId::TaskFailed,
                StateSpec::new(
                    StateId::TaskFailed,
                    "Failed",
                    StateKind::Fail {
                        error: None,
                        cause: None,
                    },
                ),
            ),
        ])
    }

    fn valid_table() -> TransitionTable {
        TransitionTable::new()
            .with_success(StateId::SubmitJob, StateId::Succeeded, PayloadShaping::Result)
            .with_catch(
                StateId::SubmitJob,
                CatchRule::catch_all(StateId::PublishMessage, PayloadShaping::Result),
            )
            .with_success(StateId::PublishMessage, StateId::TaskFailed, PayloadShaping::PassThrough)
    }

    #[test]
    fn test_valid_graph() {
        let dag = StateGraph::new(StateId::SubmitJob, &states(), &valid_table()).unwrap();

        let order = dag.topological_order();
        assert_eq!(order.first(), Some(&StateId::SubmitJob));
        assert_eq!(dag.successors(StateId::SubmitJob).len(), 2);
        assert!(dag.successors(StateId::TaskFailed).is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let table = valid_table().with_catch(
            StateId::PublishMessage,
            CatchRule::catch_all(StateId::SubmitJob, PayloadShaping::Result),
        );

        let result = StateGraph::new(StateId::SubmitJob, &states(), &table);
        assert!(matches!(result, Err(DagValidationError::CycleDetected(_))));
    }

    #[test]
    fn test_terminal_with_transition() {
        let table = valid_table().with_success(
            StateId::TaskFailed,
            StateId::Succeeded,
            PayloadShaping::PassThrough,
        );

        let result = StateGraph::new(StateId::SubmitJob, &states(), &table);
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::TerminalHasTransitions(StateId::TaskFailed)
        );
    }

    #[test]
    fn test_missing_success_transition() {
        let table = TransitionTable::new()
            .with_success(StateId::SubmitJob, StateId::Succeeded, PayloadShaping::Result)
            .with_catch(
                StateId::SubmitJob,
                CatchRule::catch_all(StateId::PublishMessage, PayloadShaping::Result),
            );

        let result = StateGraph::new(StateId::SubmitJob, &states(), &table);
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::MissingSuccessTransition(StateId::PublishMessage)
        );
    }

    #[test]
    fn test_unreachable_state() {
        let table = TransitionTable::new()
            .with_success(StateId::SubmitJob, StateId::Succeeded, PayloadShaping::Result)
            .with_success(StateId::PublishMessage, StateId::TaskFailed, PayloadShaping::PassThrough);

        let result = StateGraph::new(StateId::SubmitJob, &states(), &table);
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::Unreachable(StateId::PublishMessage)
        );
    }

    #[test]
    fn test_shadowed_catch() {
        let table = valid_table().with_catch(
            StateId::SubmitJob,
            CatchRule::catch_all(StateId::TaskFailed, PayloadShaping::Result),
        );

        let result = StateGraph::new(StateId::SubmitJob, &states(), &table);
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::ShadowedCatch {
                state: StateId::SubmitJob,
                index: 1
            }
        );
    }

    #[test]
    fn test_duplicate_names() {
        let mut states = states();
        states.get_mut(&StateId::Succeeded).unwrap().name = "Failed".to_string();

        let result = StateGraph::new(StateId::SubmitJob, &states, &valid_table());
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::DuplicateStateName("Failed".to_string())
        );
    }

    #[test]
    fn test_missing_start() {
        let mut states = states();
        states.remove(&StateId::SubmitJob);

        let result = StateGraph::new(StateId::SubmitJob, &states, &valid_table());
        assert_eq!(
            result.unwrap_err(),
            DagValidationError::MissingStart(StateId::SubmitJob)
        );
    }
}
