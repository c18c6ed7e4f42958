//! Migration runner
//!
//! Plans against the applied markers of one target database and executes the
//! plan node by node. Each node runs in its own transaction together with its
//! marker write; a failure aborts that node and halts the plan while nodes
//! committed before it stay committed. The run holds the target's advisory
//! lock throughout.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::SchemaConnection;
use crate::config::LockMode;
use crate::error::{MigrationError, MigrationResult};
use crate::executor::Executor;
use crate::graph::MigrationGraph;
use crate::node::{MigrationNode, NodeId};
use crate::state::{AppliedMigration, StateStore, TargetDatabase};

/// Where a run should leave the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationTarget {
    /// Every node applied
    Latest,
    /// Exactly `id` and its ancestors applied
    Node(NodeId),
    /// Nothing applied
    Zero,
}

impl FromStr for MigrationTarget {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "latest" | "head" => Ok(MigrationTarget::Latest),
            "zero" => Ok(MigrationTarget::Zero),
            other => other
                .parse()
                .map(MigrationTarget::Node)
                .map_err(|_| MigrationError::UnknownTarget(other.to_string())),
        }
    }
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTarget::Latest => write!(f, "latest"),
            MigrationTarget::Node(id) => write!(f, "{}", id),
            MigrationTarget::Zero => write!(f, "zero"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDirection {
    Forwards,
    Backwards,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub node: NodeId,
    pub direction: PlanDirection,
}

/// Ordered steps towards a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub target: MigrationTarget,
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn nodes(&self) -> Vec<&NodeId> {
        self.steps.iter().map(|step| &step.node).collect()
    }
}

/// Lifecycle of a node on one target database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unapplied,
    Applying,
    Applied,
    Reverting,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            NodeState::Unapplied => "unapplied",
            NodeState::Applying => "applying",
            NodeState::Applied => "applied",
            NodeState::Reverting => "reverting",
        };
        write!(f, "{}", state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node: NodeId,
    pub state: NodeState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub target: MigrationTarget,
    pub applied: Vec<NodeId>,
    pub unapplied: Vec<NodeId>,
    /// Stopped at a node boundary because cancellation was requested
    pub cancelled: bool,
    pub execution_time_ms: u128,
}

/// Cooperative cancellation, checked between nodes
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerOptions {
    pub lock_mode: LockMode,
    /// Upper bound on one node's transaction
    pub node_timeout: Option<Duration>,
}

/// Executes plans over a migration graph
pub struct MigrationRunner<S> {
    graph: MigrationGraph,
    store: S,
    executor: Executor,
    options: RunnerOptions,
}

impl<S> MigrationRunner<S> {
    pub fn new(graph: MigrationGraph, store: S) -> Self {
        Self {
            graph,
            store,
            executor: Executor::new(),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &MigrationGraph {
        &self.graph
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Plan for `target` given the applied markers. A forked namespace
    /// blocks every target until a merge node joins its leaves.
    pub fn plan_from(
        &self,
        target: &MigrationTarget,
        applied: &BTreeMap<NodeId, AppliedMigration>,
    ) -> MigrationResult<MigrationPlan> {
        self.graph.check_consistency()?;

        let (nodes, direction): (Vec<NodeId>, PlanDirection) = match target {
            MigrationTarget::Latest => {
                let nodes = self
                    .graph
                    .topological_order()
                    .into_iter()
                    .filter(|id| !applied.contains_key(id))
                    .collect();
                (nodes, PlanDirection::Forwards)
            }
            MigrationTarget::Node(id) => {
                if !self.graph.contains(id) {
                    return Err(MigrationError::UnknownTarget(id.to_string()));
                }
                if applied.contains_key(id) {
                    let nodes = self
                        .graph
                        .backwards_plan(id)?
                        .into_iter()
                        .filter(|node| node != id && applied.contains_key(node))
                        .collect();
                    (nodes, PlanDirection::Backwards)
                } else {
                    let nodes = self
                        .graph
                        .forwards_plan(id)?
                        .into_iter()
                        .filter(|node| !applied.contains_key(node))
                        .collect();
                    (nodes, PlanDirection::Forwards)
                }
            }
            MigrationTarget::Zero => {
                let mut nodes: Vec<NodeId> = self
                    .graph
                    .topological_order()
                    .into_iter()
                    .filter(|id| applied.contains_key(id))
                    .collect();
                nodes.reverse();
                (nodes, PlanDirection::Backwards)
            }
        };

        Ok(MigrationPlan {
            target: target.clone(),
            steps: nodes
                .into_iter()
                .map(|node| PlanStep { node, direction })
                .collect(),
        })
    }

    fn check_target(&self, target: &MigrationTarget) -> MigrationResult<()> {
        match target {
            MigrationTarget::Node(id) if !self.graph.contains(id) => {
                Err(MigrationError::UnknownTarget(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn node(&self, id: &NodeId) -> MigrationResult<&MigrationNode> {
        self.graph
            .node(id)
            .ok_or_else(|| MigrationError::UnknownTarget(id.to_string()))
    }

    /// Applied markers, verified against the graph
    async fn load_applied<C>(
        &self,
        conn: &mut C,
        database: &TargetDatabase,
    ) -> MigrationResult<BTreeMap<NodeId, AppliedMigration>>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        let mut applied = BTreeMap::new();
        for record in self.store.list_applied(conn, database).await? {
            match self.graph.node(&record.node) {
                Some(node) => {
                    let current = node.checksum()?;
                    if current != record.checksum {
                        return Err(MigrationError::ChecksumMismatch {
                            node: record.node.clone(),
                            recorded: record.checksum.clone(),
                            current,
                        });
                    }
                }
                None => warn!(
                    "Migration {} is recorded as applied on {} but is not part of the graph",
                    record.node, database
                ),
            }
            applied.insert(record.node.clone(), record);
        }

        for id in applied.keys() {
            if let Some(node) = self.graph.node(id) {
                if let Some(missing) = node.dependencies.iter().find(|dep| !applied.contains_key(*dep)) {
                    return Err(MigrationError::InconsistentHistory {
                        node: id.clone(),
                        dependency: missing.clone(),
                    });
                }
            }
        }

        Ok(applied)
    }

    /// Compute the plan for `target` without changing anything
    pub async fn plan<C>(
        &self,
        conn: &mut C,
        database: &TargetDatabase,
        target: &MigrationTarget,
    ) -> MigrationResult<MigrationPlan>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        self.check_target(target)?;
        self.store.ensure_store(conn).await?;
        let applied = self.load_applied(conn, database).await?;
        self.plan_from(target, &applied)
    }

    /// Every node with its state on `database`, in topological order
    pub async fn status<C>(&self, conn: &mut C, database: &TargetDatabase) -> MigrationResult<Vec<NodeStatus>>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        self.store.ensure_store(conn).await?;
        let applied: BTreeMap<NodeId, AppliedMigration> = self
            .store
            .list_applied(conn, database)
            .await?
            .into_iter()
            .map(|record| (record.node.clone(), record))
            .collect();

        Ok(self
            .graph
            .topological_order()
            .into_iter()
            .map(|node| {
                let applied_at = applied.get(&node).map(|record| record.applied_at);
                NodeStatus {
                    state: if applied_at.is_some() {
                        NodeState::Applied
                    } else {
                        NodeState::Unapplied
                    },
                    node,
                    applied_at,
                }
            })
            .collect())
    }

    /// Move `database` to `target`
    pub async fn migrate<C>(
        &self,
        conn: &mut C,
        database: &TargetDatabase,
        target: &MigrationTarget,
        cancel: &CancellationFlag,
    ) -> MigrationResult<MigrationReport>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        self.check_target(target)?;

        let run_id = Uuid::new_v4();
        let key = database.lock_key();
        info!("Migration run {} towards {} on {}", run_id, target, database);

        self.acquire_lock(conn, database, key).await?;
        let result = self.migrate_locked(conn, database, target, cancel, run_id).await;
        if let Err(e) = conn.unlock(key).await {
            warn!("Failed to release migration lock on {}: {}", database, e);
        }
        result
    }

    async fn acquire_lock<C>(&self, conn: &mut C, database: &TargetDatabase, key: i64) -> MigrationResult<()>
    where
        C: SchemaConnection + ?Sized,
    {
        let in_progress = || MigrationError::MigrationInProgress {
            target: database.to_string(),
        };

        match self.options.lock_mode {
            LockMode::FailFast => {
                if conn.try_lock(key).await? {
                    Ok(())
                } else {
                    Err(in_progress())
                }
            }
            LockMode::Wait { timeout, poll_interval } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if conn.try_lock(key).await? {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(in_progress());
                    }
                    debug!("Waiting for the migration lock on {}", database);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn migrate_locked<C>(
        &self,
        conn: &mut C,
        database: &TargetDatabase,
        target: &MigrationTarget,
        cancel: &CancellationFlag,
        run_id: Uuid,
    ) -> MigrationResult<MigrationReport>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        let start_time = Instant::now();

        self.store.ensure_store(conn).await?;
        let applied = self.load_applied(conn, database).await?;
        let plan = self.plan_from(target, &applied)?;
        info!("Planned {} migration(s) for {}", plan.len(), database);

        let mut report = MigrationReport {
            run_id,
            target: target.clone(),
            applied: Vec::new(),
            unapplied: Vec::new(),
            cancelled: false,
            execution_time_ms: 0,
        };

        for step in &plan.steps {
            if cancel.is_cancelled() {
                info!("Cancellation requested, stopping before {}", step.node);
                report.cancelled = true;
                break;
            }

            self.run_step(conn, database, step).await?;
            match step.direction {
                PlanDirection::Forwards => report.applied.push(step.node.clone()),
                PlanDirection::Backwards => report.unapplied.push(step.node.clone()),
            }
        }

        report.execution_time_ms = start_time.elapsed().as_millis();
        Ok(report)
    }

    async fn run_step<C>(&self, conn: &mut C, database: &TargetDatabase, step: &PlanStep) -> MigrationResult<()>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        let node = self.node(&step.node)?;
        let (from, during, to) = match step.direction {
            PlanDirection::Forwards => (NodeState::Unapplied, NodeState::Applying, NodeState::Applied),
            PlanDirection::Backwards => {
                if let Some(operation) = node.irreversible_operation() {
                    return Err(MigrationError::NotReversible {
                        operation: format!("{} in {}", operation.describe(), step.node),
                    });
                }
                (NodeState::Applied, NodeState::Reverting, NodeState::Unapplied)
            }
        };

        conn.begin().await?;
        debug!("{}: {} -> {}", step.node, from, during);

        let work = self.run_node(conn, database, node, step.direction);
        let outcome = match self.options.node_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(MigrationError::Timeout {
                    node: step.node.clone(),
                    timeout: limit,
                }),
            },
            None => work.await,
        };

        match outcome {
            Ok(()) => {
                conn.commit().await?;
                info!("{}: {}", step.node, to);
                Ok(())
            }
            Err(e) => {
                error!("{} failed, rolling back: {}", step.node, e);
                if let Err(abort_err) = conn.abort().await {
                    warn!("Rollback of {} failed: {}", step.node, abort_err);
                }
                debug!("{}: {} -> {}", step.node, during, from);
                Err(e)
            }
        }
    }

    async fn run_node<C>(
        &self,
        conn: &mut C,
        database: &TargetDatabase,
        node: &MigrationNode,
        direction: PlanDirection,
    ) -> MigrationResult<()>
    where
        C: SchemaConnection + ?Sized,
        S: StateStore<C>,
    {
        match direction {
            PlanDirection::Forwards => {
                for operation in &node.operations {
                    self.executor.apply(operation, conn).await?;
                }
                let record = AppliedMigration::new(node.id(), node.checksum()?);
                self.store.mark_applied(conn, database, &record).await
            }
            PlanDirection::Backwards => {
                for operation in node.operations.iter().rev() {
                    self.executor.reverse(operation, conn).await?;
                }
                self.store.mark_unapplied(conn, database, &node.id()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn runner() -> MigrationRunner<MemoryStateStore> {
        let mut graph = MigrationGraph::new();
        graph
            .integrate_all(vec![
                MigrationNode::new("people", "0001_initial"),
                MigrationNode::new("people", "0002_age").add_dependency(id("people.0001_initial")),
                MigrationNode::new("blog", "0001_initial").add_dependency(id("people.0001_initial")),
            ])
            .unwrap();
        MigrationRunner::new(graph, MemoryStateStore::new())
    }

    fn applied(ids: &[&str]) -> BTreeMap<NodeId, AppliedMigration> {
        ids.iter()
            .map(|s| (id(s), AppliedMigration::new(id(s), "x")))
            .collect()
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("latest".parse::<MigrationTarget>().unwrap(), MigrationTarget::Latest);
        assert_eq!("zero".parse::<MigrationTarget>().unwrap(), MigrationTarget::Zero);
        assert_eq!(
            "people.0002_age".parse::<MigrationTarget>().unwrap(),
            MigrationTarget::Node(id("people.0002_age"))
        );
        assert!(matches!(
            "garbage".parse::<MigrationTarget>(),
            Err(MigrationError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_plan_latest_and_zero() {
        let runner = runner();

        let plan = runner.plan_from(&MigrationTarget::Latest, &applied(&[])).unwrap();
        assert_eq!(
            plan.nodes(),
            vec![&id("people.0001_initial"), &id("blog.0001_initial"), &id("people.0002_age")]
        );
        assert!(plan.steps.iter().all(|s| s.direction == PlanDirection::Forwards));

        let plan = runner
            .plan_from(&MigrationTarget::Zero, &applied(&["people.0001_initial", "people.0002_age"]))
            .unwrap();
        assert_eq!(plan.nodes(), vec![&id("people.0002_age"), &id("people.0001_initial")]);
        assert!(plan.steps.iter().all(|s| s.direction == PlanDirection::Backwards));
    }

    #[test]
    fn test_plan_to_node_in_both_directions() {
        let runner = runner();

        let plan = runner
            .plan_from(&MigrationTarget::Node(id("people.0002_age")), &applied(&[]))
            .unwrap();
        assert_eq!(plan.nodes(), vec![&id("people.0001_initial"), &id("people.0002_age")]);

        let everything = applied(&["people.0001_initial", "people.0002_age", "blog.0001_initial"]);
        let plan = runner
            .plan_from(&MigrationTarget::Node(id("people.0001_initial")), &everything)
            .unwrap();
        assert_eq!(plan.nodes(), vec![&id("people.0002_age"), &id("blog.0001_initial")]);
        assert!(plan.steps.iter().all(|s| s.direction == PlanDirection::Backwards));

        let err = runner
            .plan_from(&MigrationTarget::Node(id("people.0009_missing")), &everything)
            .unwrap_err();
        assert!(matches!(err, MigrationError::UnknownTarget(_)));
    }

    #[test]
    fn test_forked_namespace_blocks_every_target() {
        let mut graph = MigrationGraph::new();
        graph
            .integrate_all(vec![
                MigrationNode::new("people", "0001_initial"),
                MigrationNode::new("people", "0002_b").add_dependency(id("people.0001_initial")),
                MigrationNode::new("people", "0002_c").add_dependency(id("people.0001_initial")),
            ])
            .unwrap();
        let runner = MigrationRunner::new(graph, MemoryStateStore::new());

        for target in [
            MigrationTarget::Latest,
            MigrationTarget::Node(id("people.0002_b")),
            MigrationTarget::Zero,
        ] {
            let err = runner
                .plan_from(&target, &applied(&["people.0001_initial"]))
                .unwrap_err();
            assert!(matches!(err, MigrationError::DivergentHistory { .. }), "{target}");
        }
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
