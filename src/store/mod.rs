//! In-memory store façade with transactional access and event subscription
//!
//! This is the process-local face of the replicated store: typed accessors
//! for [`Node`] and [`Cluster`] objects behind serializable transactions.
//! `view` takes a consistent read snapshot; `update` applies a closure to a
//! private copy of the state and commits (or discards) it atomically;
//! `batch` runs many small updates while bounding the size of each commit.
//!
//! Every committed mutation is published, in commit order, on a broadcast
//! channel. Consumers pull [`StoreEvent`]s instead of registering callbacks,
//! so cancellation falls out of dropping the receiver.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::model::{Cluster, Membership, Node};

/// Upper bound on the number of changes committed in one batch transaction.
/// Larger batches are split so other writers and event consumers are not
/// starved by a single huge commit.
pub const MAX_CHANGES_PER_TRANSACTION: usize = 200;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced by store transactions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The object being created already exists.
    #[error("object already exists: {0}")]
    Exists(String),

    /// The object being updated or fetched does not exist.
    #[error("object does not exist: {0}")]
    NotExist(String),

    /// The update carried a stale object version.
    #[error("update out of sequence: {0}")]
    Sequence(String),
}

/// A change committed to the store, delivered to subscribers in commit
/// order.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// A node was created.
    CreateNode(Node),
    /// A node was updated.
    UpdateNode(Node),
    /// A node was deleted.
    DeleteNode(Node),
    /// The cluster object was created.
    CreateCluster(Cluster),
    /// The cluster object was updated.
    UpdateCluster(Cluster),
}

/// Node selection predicate for `find_nodes`.
#[derive(Clone, Copy, Debug)]
pub enum NodeFilter {
    /// Every node in the store.
    All,
    /// Nodes with the given membership.
    ByMembership(Membership),
}

#[derive(Clone, Default)]
struct StoreState {
    nodes: HashMap<String, Node>,
    cluster: Option<Cluster>,
    /// Monotonic commit counter; touched objects take its value as their
    /// version.
    commit_index: u64,
}

/// Read transaction: a consistent snapshot of the store.
pub struct ReadTx<'a> {
    state: &'a StoreState,
}

impl ReadTx<'_> {
    /// Look up a node by ID.
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.state.nodes.get(id).cloned()
    }

    /// Select nodes matching the filter.
    pub fn find_nodes(&self, filter: NodeFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .state
            .nodes
            .values()
            .filter(|n| match filter {
                NodeFilter::All => true,
                NodeFilter::ByMembership(m) => n.spec.membership == m,
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// The cluster object, if the store has been seeded.
    pub fn get_cluster(&self) -> Option<Cluster> {
        self.state.cluster.clone()
    }
}

/// Write transaction. Mutations apply to a private copy of the state and
/// become visible (and their events delivered) only when the enclosing
/// `update` closure returns `Ok`.
pub struct Tx {
    state: StoreState,
    events: Vec<StoreEvent>,
    commit_index: u64,
}

impl Tx {
    /// Look up a node by ID.
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.state.nodes.get(id).cloned()
    }

    /// Select nodes matching the filter.
    pub fn find_nodes(&self, filter: NodeFilter) -> Vec<Node> {
        ReadTx { state: &self.state }.find_nodes(filter)
    }

    /// The cluster object, if the store has been seeded.
    pub fn get_cluster(&self) -> Option<Cluster> {
        self.state.cluster.clone()
    }

    /// Add a new node. Fails with [`StoreError::Exists`] if the ID is taken.
    pub fn create_node(&mut self, mut node: Node) -> Result<(), StoreError> {
        if self.state.nodes.contains_key(&node.id) {
            return Err(StoreError::Exists(format!("node {}", node.id)));
        }
        node.meta.version = self.commit_index;
        self.state.nodes.insert(node.id.clone(), node.clone());
        self.events.push(StoreEvent::CreateNode(node));
        Ok(())
    }

    /// Replace an existing node. The incoming object must carry the version
    /// it was read at; a stale version fails with [`StoreError::Sequence`].
    pub fn update_node(&mut self, mut node: Node) -> Result<(), StoreError> {
        let current = self
            .state
            .nodes
            .get(&node.id)
            .ok_or_else(|| StoreError::NotExist(format!("node {}", node.id)))?;
        if current.meta.version != node.meta.version {
            return Err(StoreError::Sequence(format!("node {}", node.id)));
        }
        node.meta.version = self.commit_index;
        self.state.nodes.insert(node.id.clone(), node.clone());
        self.events.push(StoreEvent::UpdateNode(node));
        Ok(())
    }

    /// Remove a node by ID.
    pub fn delete_node(&mut self, id: &str) -> Result<(), StoreError> {
        let node = self
            .state
            .nodes
            .remove(id)
            .ok_or_else(|| StoreError::NotExist(format!("node {id}")))?;
        self.events.push(StoreEvent::DeleteNode(node));
        Ok(())
    }

    /// Seed the cluster object. Fails if one is already present.
    pub fn create_cluster(&mut self, mut cluster: Cluster) -> Result<(), StoreError> {
        if self.state.cluster.is_some() {
            return Err(StoreError::Exists(format!("cluster {}", cluster.id)));
        }
        cluster.meta.version = self.commit_index;
        self.state.cluster = Some(cluster.clone());
        self.events.push(StoreEvent::CreateCluster(cluster));
        Ok(())
    }

    /// Replace the cluster object, with the same version discipline as
    /// [`Tx::update_node`].
    pub fn update_cluster(&mut self, mut cluster: Cluster) -> Result<(), StoreError> {
        let current = self
            .state
            .cluster
            .as_ref()
            .ok_or_else(|| StoreError::NotExist(format!("cluster {}", cluster.id)))?;
        if current.meta.version != cluster.meta.version {
            return Err(StoreError::Sequence(format!("cluster {}", cluster.id)));
        }
        cluster.meta.version = self.commit_index;
        self.state.cluster = Some(cluster.clone());
        self.events.push(StoreEvent::UpdateCluster(cluster));
        Ok(())
    }
}

/// Collects update closures for a bounded-commit batch. See
/// [`MemoryStore::batch`].
#[derive(Default)]
pub struct Batch {
    #[allow(clippy::type_complexity)]
    ops: Vec<Box<dyn FnOnce(&mut Tx) -> Result<(), StoreError> + Send>>,
}

impl Batch {
    /// Queue one update. The closure runs inside a write transaction when
    /// the batch commits.
    pub fn update(
        &mut self,
        op: impl FnOnce(&mut Tx) -> Result<(), StoreError> + Send + 'static,
    ) {
        self.ops.push(Box::new(op));
    }
}

/// The in-memory store handle. Cheap to clone; all clones share state and
/// the event channel.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemoryStore {
            state: Arc::new(RwLock::new(StoreState::default())),
            events,
        }
    }

    /// Run a closure against a consistent read snapshot.
    pub async fn view<R>(&self, f: impl FnOnce(&ReadTx<'_>) -> R) -> R {
        let guard = self.state.read().await;
        f(&ReadTx { state: &guard })
    }

    /// Run a closure inside a serializable write transaction. The closure's
    /// mutations commit atomically when it returns `Ok`; on `Err` the store
    /// is untouched. Events are published after commit, in order.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut Tx) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.state.write().await;
        let mut tx = Tx {
            state: guard.clone(),
            events: Vec::new(),
            commit_index: guard.commit_index + 1,
        };
        let result = f(&mut tx)?;
        if !tx.events.is_empty() {
            tx.state.commit_index = tx.commit_index;
            *guard = tx.state;
        }
        // Publish before releasing the lock so subscribers observe events
        // in commit order. Send fails only when nobody is subscribed.
        for event in tx.events {
            let _ = self.events.send(event);
        }
        drop(guard);
        Ok(result)
    }

    /// Run many updates, committing them in transactions of at most
    /// [`MAX_CHANGES_PER_TRANSACTION`] changes. Queued operations that fail
    /// are skipped (logged by the caller via the returned count); the rest
    /// still commit.
    ///
    /// Returns the number of operations that applied cleanly.
    pub async fn batch(&self, f: impl FnOnce(&mut Batch)) -> Result<usize, StoreError> {
        let mut batch = Batch::default();
        f(&mut batch);

        let mut applied = 0;
        let mut ops = batch.ops.into_iter().peekable();
        while ops.peek().is_some() {
            let chunk: Vec<_> = ops.by_ref().take(MAX_CHANGES_PER_TRANSACTION).collect();
            applied += self
                .update(move |tx| {
                    let mut ok = 0;
                    for op in chunk {
                        if op(tx).is_ok() {
                            ok += 1;
                        }
                    }
                    Ok(ok)
                })
                .await?;
        }
        Ok(applied)
    }

    /// Subscribe to committed changes. Events committed before this call are
    /// not replayed; snapshot first, then subscribe, or the other way
    /// around, depending on whether missing or double-processing is cheaper.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
