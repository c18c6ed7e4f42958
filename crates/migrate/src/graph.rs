//! Migration dependency graph
//!
//! Nodes are keyed by identity; an edge runs from each dependency to its
//! dependent. The graph stays acyclic: every integration is staged on a copy
//! and only committed once dependencies resolve and no cycle exists.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::error::{MigrationError, MigrationResult};
use crate::node::{MigrationNode, NodeId};
use crate::schema::SchemaState;

#[derive(Debug, Clone)]
struct GraphEntry {
    node: MigrationNode,
    /// Insertion sequence, used to break ordering ties
    seq: usize,
    parents: BTreeSet<NodeId>,
    children: BTreeSet<NodeId>,
}

/// Directed acyclic graph of migration nodes
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    entries: HashMap<NodeId, GraphEntry>,
    next_seq: usize,
}

impl MigrationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&MigrationNode> {
        self.entries.get(id).map(|entry| &entry.node)
    }

    /// Nodes of one namespace in integration order
    pub fn nodes_in(&self, namespace: &str) -> Vec<&MigrationNode> {
        let mut entries: Vec<&GraphEntry> = self
            .entries
            .values()
            .filter(|entry| entry.node.namespace == namespace)
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.node).collect()
    }

    /// Direct dependents of a node
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.entries
            .get(id)
            .map(|entry| entry.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every namespace with at least one node, sorted
    pub fn namespaces(&self) -> Vec<String> {
        self.entries
            .keys()
            .map(|id| id.namespace.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Add one node
    pub fn integrate(&mut self, node: MigrationNode) -> MigrationResult<()> {
        self.integrate_all(vec![node])
    }

    /// Add a batch of nodes; on any failure the graph is left unchanged
    pub fn integrate_all(&mut self, nodes: Vec<MigrationNode>) -> MigrationResult<()> {
        let mut staged = self.clone();

        for node in nodes {
            let id = node.id();
            if staged.entries.contains_key(&id) {
                return Err(MigrationError::DuplicateNode(id));
            }
            if node.is_initial() {
                if let Some(dependency) = node.dependencies.iter().find(|d| d.namespace == node.namespace) {
                    return Err(MigrationError::InvalidNode {
                        node: id,
                        reason: format!("marked initial but depends on '{}' in its own namespace", dependency),
                    });
                }
            }
            let seq = staged.next_seq;
            staged.next_seq += 1;
            staged.entries.insert(
                id,
                GraphEntry {
                    node,
                    seq,
                    parents: BTreeSet::new(),
                    children: BTreeSet::new(),
                },
            );
        }

        let mut edges = Vec::new();
        for (id, entry) in &staged.entries {
            for dependency in &entry.node.dependencies {
                if !staged.entries.contains_key(dependency) {
                    return Err(MigrationError::UnknownDependency {
                        node: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                edges.push((dependency.clone(), id.clone()));
            }
        }
        for (parent, child) in edges {
            if let Some(entry) = staged.entries.get_mut(&child) {
                entry.parents.insert(parent.clone());
            }
            if let Some(entry) = staged.entries.get_mut(&parent) {
                entry.children.insert(child);
            }
        }

        staged.detect_cycle()?;
        *self = staged;
        Ok(())
    }

    /// Fail with the first cycle found, reported as a closed path
    pub fn detect_cycle(&self) -> MigrationResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&NodeId, Mark> = HashMap::new();

        for start in self.sorted_ids() {
            if marks.contains_key(start) {
                continue;
            }

            // (node, children still to visit)
            let mut stack: Vec<(&NodeId, Vec<&NodeId>)> = vec![(start, self.child_refs(start))];
            marks.insert(start, Mark::InProgress);

            while !stack.is_empty() {
                let next = match stack.last_mut() {
                    Some((_, pending)) => pending.pop(),
                    None => None,
                };

                match next {
                    Some(child) => match marks.get(child) {
                        Some(Mark::InProgress) => {
                            let position = stack.iter().position(|(id, _)| *id == child).unwrap_or(0);
                            let mut cycle: Vec<NodeId> =
                                stack[position..].iter().map(|(id, _)| (*id).clone()).collect();
                            cycle.push(child.clone());
                            return Err(MigrationError::CyclicDependency { cycle });
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::InProgress);
                            stack.push((child, self.child_refs(child)));
                        }
                    },
                    None => {
                        if let Some((done, _)) = stack.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn sorted_ids(&self) -> Vec<&NodeId> {
        let mut ids: Vec<&NodeId> = self.entries.keys().collect();
        ids.sort_by_key(|id| self.tie_key(id));
        ids
    }

    /// Children in reverse tie order so that popping visits them in order
    fn child_refs(&self, id: &NodeId) -> Vec<&NodeId> {
        let mut children: Vec<&NodeId> = self
            .entries
            .get(id)
            .map(|entry| entry.children.iter().collect())
            .unwrap_or_default();
        children.sort_by_key(|child| Reverse(self.tie_key(child)));
        children
    }

    fn tie_key(&self, id: &NodeId) -> (String, usize) {
        let seq = self.entries.get(id).map(|entry| entry.seq).unwrap_or(usize::MAX);
        (id.namespace.clone(), seq)
    }

    /// Every node, dependencies first.
    ///
    /// Kahn's algorithm; among ready nodes the smallest namespace wins, then
    /// the earliest integrated.
    pub fn topological_order(&self) -> Vec<NodeId> {
        self.order_of(&self.entries.keys().cloned().collect())
    }

    /// Topological order restricted to a subset of nodes
    fn order_of(&self, subset: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut in_degree: HashMap<&NodeId, usize> = HashMap::new();
        let mut ready = BinaryHeap::new();

        for id in subset {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let degree = entry.parents.iter().filter(|p| subset.contains(*p)).count();
            in_degree.insert(id, degree);
            if degree == 0 {
                ready.push(Reverse((id.namespace.clone(), entry.seq, id.clone())));
            }
        }

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse((_, _, id))) = ready.pop() {
            if let Some(entry) = self.entries.get(&id) {
                for child in &entry.children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            let seq = self.entries.get(child).map(|e| e.seq).unwrap_or(usize::MAX);
                            ready.push(Reverse((child.namespace.clone(), seq, child.clone())));
                        }
                    }
                }
            }
            order.push(id);
        }

        order
    }

    /// Nodes of `namespace` with no dependent inside that namespace
    pub fn leaf_candidates(&self, namespace: &str) -> Vec<NodeId> {
        let mut leaves: Vec<&GraphEntry> = self
            .entries
            .iter()
            .filter(|(id, _)| id.namespace == namespace)
            .filter(|(_, entry)| !entry.children.iter().any(|child| child.namespace == namespace))
            .map(|(_, entry)| entry)
            .collect();
        leaves.sort_by_key(|entry| entry.seq);
        leaves.into_iter().map(|entry| entry.node.id()).collect()
    }

    /// The leaf of `namespace`: empty for an unknown namespace, one node
    /// otherwise, `DivergentHistory` when history has forked
    pub fn leaves(&self, namespace: &str) -> MigrationResult<Vec<NodeId>> {
        let leaves = self.leaf_candidates(namespace);
        if leaves.len() > 1 {
            return Err(MigrationError::DivergentHistory {
                namespace: namespace.to_string(),
                leaves,
            });
        }
        Ok(leaves)
    }

    /// Every namespace has at most one leaf
    pub fn check_consistency(&self) -> MigrationResult<()> {
        for namespace in self.namespaces() {
            self.leaves(&namespace)?;
        }
        Ok(())
    }

    /// `target` and all its ancestors, dependencies first
    pub fn forwards_plan(&self, target: &NodeId) -> MigrationResult<Vec<NodeId>> {
        let ancestors = self.closure(target, |entry| &entry.parents)?;
        Ok(self.order_of(&ancestors))
    }

    /// `target` and all its descendants, dependents first
    pub fn backwards_plan(&self, target: &NodeId) -> MigrationResult<Vec<NodeId>> {
        let descendants = self.closure(target, |entry| &entry.children)?;
        let mut order = self.order_of(&descendants);
        order.reverse();
        Ok(order)
    }

    fn closure<F>(&self, start: &NodeId, next: F) -> MigrationResult<HashSet<NodeId>>
    where
        F: Fn(&GraphEntry) -> &BTreeSet<NodeId>,
    {
        if !self.entries.contains_key(start) {
            return Err(MigrationError::UnknownTarget(start.to_string()));
        }

        let mut seen = HashSet::new();
        let mut pending = vec![start.clone()];
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&id) {
                pending.extend(next(entry).iter().cloned());
            }
        }
        Ok(seen)
    }

    /// Replay the operations of `nodes` in topological order
    pub fn state_for(&self, nodes: &BTreeSet<NodeId>) -> MigrationResult<SchemaState> {
        let subset: HashSet<NodeId> = nodes.iter().filter(|id| self.contains(id)).cloned().collect();
        let mut state = SchemaState::new();
        for id in self.order_of(&subset) {
            if let Some(node) = self.node(&id) {
                for operation in &node.operations {
                    operation.state_forwards(&mut state)?;
                }
            }
        }
        Ok(state)
    }

    /// Schema after every node in the graph
    pub fn project_state(&self) -> MigrationResult<SchemaState> {
        self.state_for(&self.entries.keys().cloned().collect())
    }

    /// Schema once `target` and its ancestors are applied
    pub fn state_at(&self, target: &NodeId) -> MigrationResult<SchemaState> {
        let ancestors = self.closure(target, |entry| &entry.parents)?;
        self.state_for(&ancestors.into_iter().collect())
    }

    /// Tables currently owned by `namespace`: created by its nodes and not
    /// dropped since
    pub fn tables_owned_by(&self, namespace: &str) -> BTreeSet<String> {
        self.table_owners()
            .into_iter()
            .filter(|(_, owner)| owner == namespace)
            .map(|(table, _)| table)
            .collect()
    }

    /// Owning namespace of each live table
    pub fn table_owners(&self) -> BTreeMap<String, String> {
        use crate::operation::Operation;

        let mut owners = BTreeMap::new();
        for id in self.topological_order() {
            let Some(node) = self.node(&id) else {
                continue;
            };
            for operation in &node.operations {
                match operation {
                    Operation::CreateTable { table } => {
                        owners.insert(table.name.clone(), id.namespace.clone());
                    }
                    Operation::DropTable { table, .. } => {
                        owners.remove(table);
                    }
                    _ => {}
                }
            }
        }
        owners
    }
}
