//! A deterministic dataflow variable store
//!
//! This crate implements the runtime of a single assignment variable
//! store whose values form a lattice and whose reads can block on
//! thresholds. Producers bind variables monotonically; consumers read
//! at a chosen observation point and are suspended until the value has
//! advanced past it. Binding a cell to another cell's id links the two;
//! the target's value is forwarded to every linked cell once it binds.
//!
//! Cells are sharded over a set of partition tasks. A [`StoreHandle`]
//! routes each operation to the partition owning the target id and
//! carries the reply back on a oneshot channel; a suspended read is
//! just a reply token parked on the cell. Drop every handle to shut
//! the partitions down.
use anyhow::{anyhow, Result};
use arcstr::ArcStr;
use derive_builder::Builder;
use std::{hash::Hash, sync};
use tokio::{
    sync::{mpsc as tmpsc, oneshot},
    task,
};
use triomphe::Arc;

mod cell;
mod exec;
mod programs;


pub use cell::CellSnapshot;
pub use lvar_core::{
    GCounter, GSet, LatticeRegistry, LatticeType, StoreError, TaskId,
    Threshold, Value, VarId,
};
pub use programs::{NoPrograms, ProgramHost};

/// What a read observes: the value, and the successor cell that
/// continues the stream if one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub value: Value,
    pub next: Option<VarId>,
}

pub(crate) type ReadTx = oneshot::Sender<Result<ReadReply>>;
pub(crate) type BindTx = oneshot::Sender<Result<Option<VarId>>>;

pub(crate) enum ToExec {
    Declare {
        id: VarId,
        typ: Option<ArcStr>,
        /// None when the declare is a successor materialization, which
        /// nobody waits for.
        res: Option<oneshot::Sender<Result<VarId>>>,
    },
    Bind {
        id: VarId,
        payload: Value,
        res: BindTx,
    },
    Read {
        id: VarId,
        threshold: Option<Threshold>,
        res: ReadTx,
    },
    IsDet {
        id: VarId,
        res: oneshot::Sender<bool>,
    },
    Next {
        id: VarId,
        res: oneshot::Sender<Result<VarId>>,
    },
    WaitNeeded {
        id: VarId,
        res: oneshot::Sender<Result<()>>,
    },
    Thread {
        module: ArcStr,
        function: ArcStr,
        args: Vec<Value>,
        res: oneshot::Sender<Result<TaskId>>,
    },
    Fetch {
        target: VarId,
        from: VarId,
        res: BindTx,
    },
    ReplyFetch {
        from: VarId,
        snap: CellSnapshot,
        res: BindTx,
    },
    NotifyValue {
        id: VarId,
        value: Value,
    },
}

/// Pure routing: an id's owner is a function of its bytes and the
/// partition count, stable for the life of the store.
#[derive(Clone)]
pub(crate) struct Router(Arc<[tmpsc::UnboundedSender<ToExec>]>);

impl Router {
    pub(crate) fn owner<K: Hash>(&self, key: &K) -> usize {
        fxhash::hash64(key) as usize % self.0.len()
    }

    pub(crate) fn send(&self, partition: usize, m: ToExec) -> Result<()> {
        match self.0.get(partition) {
            Some(tx) => {
                tx.send(m).map_err(|_| anyhow!(StoreError::RoutingUnavailable))
            }
            None => Err(anyhow!(StoreError::RoutingUnavailable)),
        }
    }

    fn downgrade(&self) -> WeakRouter {
        let weak = self.0.iter().map(|tx| tx.downgrade()).collect::<Vec<_>>();
        WeakRouter(Arc::from(weak))
    }
}

/// The partitions' view of the router. Partitions send to each other
/// through weak senders so that dropping the last handle shuts the
/// store down instead of leaving the tasks pinned by their own
/// channels.
#[derive(Clone)]
pub(crate) struct WeakRouter(Arc<[tmpsc::WeakUnboundedSender<ToExec>]>);

impl WeakRouter {
    pub(crate) fn owner<K: Hash>(&self, key: &K) -> usize {
        fxhash::hash64(key) as usize % self.0.len()
    }

    pub(crate) fn send_to(&self, id: &VarId, m: ToExec) -> Result<()> {
        match self.0.get(self.owner(id)).and_then(|w| w.upgrade()) {
            Some(tx) => {
                tx.send(m).map_err(|_| anyhow!(StoreError::RoutingUnavailable))
            }
            None => Err(anyhow!(StoreError::RoutingUnavailable)),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Router> {
        let mut up = Vec::with_capacity(self.0.len());
        for w in self.0.iter() {
            up.push(w.upgrade()?);
        }
        Some(Router(Arc::from(up)))
    }
}

/// A handle to a running variable store.
///
/// Handles are cheap to clone. All methods route to the partition
/// owning the target id; `read`, `read_threshold` and `wait_needed`
/// may suspend until the cell's state satisfies them, everything else
/// completes in one round trip. Cancel a suspended call by dropping
/// its future.
#[derive(Clone)]
pub struct StoreHandle(pub(crate) Router);

impl StoreHandle {
    async fn exec<R, F: FnOnce(oneshot::Sender<R>) -> ToExec>(
        &self,
        partition: usize,
        f: F,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.0.send(partition, f(tx))?;
        Ok(rx.await.map_err(|_| anyhow!("store is dead"))?)
    }

    /// Create the cell named by `id`, or a fresh cell if `id` is None.
    ///
    /// A lattice type creates the cell bound to the lattice's bottom;
    /// anything else creates it unbound. Declaring an id that already
    /// exists is insert if absent.
    pub async fn declare(
        &self,
        id: Option<VarId>,
        typ: Option<ArcStr>,
    ) -> Result<VarId> {
        let id = id.unwrap_or_else(VarId::new);
        Ok(self
            .exec(self.0.owner(&id), |res| ToExec::Declare {
                id,
                typ,
                res: Some(res),
            })
            .await??)
    }

    /// Assign a value to the cell, or link it to another cell by
    /// passing `Value::Alias`.
    ///
    /// Returns the successor cell that continues the stream, except
    /// after binding the end of stream sentinel `Value::Nil`. Binding
    /// a bound non lattice cell to a different value fails with
    /// [`StoreError::ConflictingBind`]; binding a lattice cell joins
    /// the offered value into the stored one and always returns a
    /// fresh successor.
    pub async fn bind(
        &self,
        id: VarId,
        payload: Value,
    ) -> Result<Option<VarId>> {
        Ok(self
            .exec(self.0.owner(&id), |res| ToExec::Bind { id, payload, res })
            .await??)
    }

    /// Observe the cell's value, suspending until it is bound.
    pub async fn read(&self, id: VarId) -> Result<ReadReply> {
        Ok(self
            .exec(self.0.owner(&id), |res| ToExec::Read {
                id,
                threshold: None,
                res,
            })
            .await??)
    }

    /// Observe the cell once its value has advanced past `threshold`
    /// in the lattice order, suspending until then.
    pub async fn read_threshold(
        &self,
        id: VarId,
        threshold: Threshold,
    ) -> Result<ReadReply> {
        Ok(self
            .exec(self.0.owner(&id), |res| ToExec::Read {
                id,
                threshold: Some(threshold),
                res,
            })
            .await??)
    }

    /// Whether the cell is bound. Never blocks.
    pub async fn is_det(&self, id: VarId) -> Result<bool> {
        self.exec(self.0.owner(&id), |res| ToExec::IsDet { id, res }).await
    }

    /// The successor cell continuing the stream after `id`, allocated
    /// on first use. Idempotent after the first success.
    pub async fn next(&self, id: VarId) -> Result<VarId> {
        Ok(self.exec(self.0.owner(&id), |res| ToExec::Next { id, res }).await??)
    }

    /// Suspend until somebody wants the cell's value.
    ///
    /// The dual of `read`, used by lazy producers: returns immediately
    /// when the cell is bound or already has waiters, otherwise parks
    /// the caller until the first read arrives.
    pub async fn wait_needed(&self, id: VarId) -> Result<()> {
        Ok(self
            .exec(self.0.owner(&id), |res| ToExec::WaitNeeded { id, res })
            .await??)
    }

    /// Spawn the named user computation on the partition that hashes
    /// from the call tuple. Fire and forget: the returned handle is
    /// opaque and completion is only logged.
    pub async fn thread(
        &self,
        module: ArcStr,
        function: ArcStr,
        args: Vec<Value>,
    ) -> Result<TaskId> {
        let partition = self.0.owner(&(&module, &function, &args));
        Ok(self
            .exec(partition, |res| ToExec::Thread { module, function, args, res })
            .await??)
    }
}

/// Configuration for a store instance.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct StoreConfig {
    /// The lattice registry all partitions consult. Defaults to the
    /// built in lattice library.
    #[builder(default)]
    registry: LatticeRegistry,
    /// How many partition tasks share the id space.
    #[builder(default = "8")]
    partitions: usize,
    /// The host that runs computations spawned with `thread`.
    #[builder(default = "sync::Arc::new(NoPrograms)")]
    programs: sync::Arc<dyn ProgramHost>,
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Start the partition tasks and return a handle to them. Must be
    /// called from within a tokio runtime.
    pub fn start(self) -> StoreHandle {
        let n = self.partitions.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = tmpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let router = Router(Arc::from(senders));
        let registry = Arc::new(self.registry);
        for (i, rx) in receivers.into_iter().enumerate() {
            let p = exec::Partition::new(
                i,
                Arc::clone(&registry),
                router.downgrade(),
                sync::Arc::clone(&self.programs),
            );
            task::spawn(p.run(rx));
        }
        StoreHandle(router)
    }
}
