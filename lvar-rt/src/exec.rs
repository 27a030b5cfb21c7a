use crate::{
    cell::{Cell, CellSnapshot, Waiter},
    programs::ProgramHost,
    BindTx, ReadReply, ReadTx, StoreHandle, ToExec, WeakRouter,
};
use anyhow::{anyhow, bail, Result};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use log::{debug, error, warn};
use lvar_core::{LatticeRegistry, StoreError, TaskId, Threshold, Value, VarId};
use std::{collections::hash_map::Entry, future, mem, result, sync};
use tokio::{
    select,
    sync::{mpsc as tmpsc, oneshot},
    task::{JoinError, JoinSet},
};
use triomphe::Arc;

async fn join_or_wait(
    js: &mut JoinSet<(TaskId, Result<()>)>,
) -> result::Result<(TaskId, Result<()>), JoinError> {
    match js.join_next().await {
        None => future::pending().await,
        Some(r) => r,
    }
}

/// One shard of the id space. The partition task is the single owner
/// of its cells; every mutation of a cell happens here, in arrival
/// order, which is all the serialization the store needs.
pub(crate) struct Partition {
    id: usize,
    cells: FxHashMap<VarId, Cell>,
    registry: Arc<LatticeRegistry>,
    router: WeakRouter,
    programs: sync::Arc<dyn ProgramHost>,
    tasks: JoinSet<(TaskId, Result<()>)>,
}

impl Partition {
    pub(crate) fn new(
        id: usize,
        registry: Arc<LatticeRegistry>,
        router: WeakRouter,
        programs: sync::Arc<dyn ProgramHost>,
    ) -> Self {
        Self {
            id,
            cells: FxHashMap::default(),
            registry,
            router,
            programs,
            tasks: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: tmpsc::UnboundedReceiver<ToExec>) {
        let mut input = Vec::new();
        loop {
            select! {
                n = rx.recv_many(&mut input, 100_000) => {
                    if n == 0 {
                        break;
                    }
                    self.process_batch(&mut input);
                }
                r = join_or_wait(&mut self.tasks) => match r {
                    Ok((tid, Ok(()))) => debug!("program task {tid:?} finished"),
                    Ok((tid, Err(e))) => {
                        error!("program task {tid:?} failed: {e:?}")
                    }
                    Err(e) => error!("program task panicked: {e:?}"),
                },
            }
        }
        debug!("partition {} stopped", self.id)
    }

    fn process_batch(&mut self, input: &mut Vec<ToExec>) {
        for m in input.drain(..) {
            match m {
                ToExec::Declare { id, typ, res } => {
                    let r = self.declare(id, typ);
                    match res {
                        Some(res) => {
                            let _ = res.send(r);
                        }
                        None => {
                            if let Err(e) = r {
                                error!(
                                    "successor declare failed on partition {}: {e:?}",
                                    self.id
                                )
                            }
                        }
                    }
                }
                ToExec::Bind { id, payload, res } => self.bind(id, payload, res),
                ToExec::Read { id, threshold, res } => {
                    self.read(id, threshold, res)
                }
                ToExec::IsDet { id, res } => {
                    let bound =
                        self.cells.get(&id).map(|c| c.bound).unwrap_or(false);
                    let _ = res.send(bound);
                }
                ToExec::Next { id, res } => {
                    let _ = res.send(Ok(self.next(id)));
                }
                ToExec::WaitNeeded { id, res } => self.wait_needed(id, res),
                ToExec::Thread { module, function, args, res } => {
                    let _ = res.send(self.thread(module, function, args));
                }
                ToExec::Fetch { target, from, res } => {
                    self.fetch(target, from, res)
                }
                ToExec::ReplyFetch { from, snap, res } => {
                    let _ = res.send(self.reply_fetch(from, snap));
                }
                ToExec::NotifyValue { id, value } => {
                    if let Err(e) = self.notify_value(id, value) {
                        error!("alias notification failed for {id}: {e:?}")
                    }
                }
            }
        }
    }

    /// Mint a successor id and ask its owner to materialize the cell.
    /// The link is recorded by the caller before anyone can observe the
    /// id, so a reader racing the declare finds a placeholder at worst.
    fn alloc_successor(router: &WeakRouter, typ: &Option<ArcStr>) -> VarId {
        let id = VarId::new();
        let m = ToExec::Declare { id, typ: typ.clone(), res: None };
        if let Err(e) = router.send_to(&id, m) {
            warn!("could not materialize successor {id}: {e}")
        }
        id
    }

    fn declare(&mut self, id: VarId, typ: Option<ArcStr>) -> Result<VarId> {
        let upgrade = match self.cells.entry(id) {
            Entry::Vacant(e) => {
                let cell = match &typ {
                    Some(t) if self.registry.is_lattice(t) => {
                        Cell::lattice(t.clone(), self.registry.bottom(t)?)
                    }
                    _ => Cell::unbound(typ),
                };
                e.insert(cell);
                None
            }
            Entry::Occupied(mut e) => {
                let c = e.get_mut();
                match (&c.typ, typ) {
                    (None, Some(t)) => {
                        // an operation got here before this declare and
                        // auto created a placeholder; upgrade it
                        c.typ = Some(t.clone());
                        (self.registry.is_lattice(&t)
                            && !c.bound
                            && c.value == Value::Bottom)
                            .then_some(t)
                    }
                    // insert if absent: redeclaring is idempotent
                    _ => None,
                }
            }
        };
        if let Some(t) = upgrade {
            // a placeholder that turns out to be a lattice cell is
            // bound to bottom like one declared with the type up front
            let bottom = self.registry.bottom(&t)?;
            self.write(id, bottom, None)?;
        }
        Ok(id)
    }

    fn bind(&mut self, id: VarId, payload: Value, res: BindTx) {
        match payload {
            Value::Alias(target) => {
                let cell =
                    self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
                if cell.bound {
                    let _ = res.send(Err(anyhow!(StoreError::ConflictingBind)));
                    return;
                }
                cell.value = Value::Alias(target);
                // the reply token travels with the fetch and is acked
                // when the snapshot comes back
                let m = ToExec::Fetch { target, from: id, res };
                if let Err(e) = self.router.send_to(&target, m) {
                    warn!("could not fetch {target} for alias {id}: {e}")
                }
            }
            v => {
                let r = self.write(id, v, None);
                let _ = res.send(r);
            }
        }
    }

    /// The local write path, shared by direct binds, bound fetch
    /// replies and alias notifications. Stores the value, wakes every
    /// waiter whose condition now holds, and forwards the value to the
    /// cells bound to this one. Returns the successor.
    fn write(
        &mut self,
        id: VarId,
        value: Value,
        snap_next: Option<VarId>,
    ) -> Result<Option<VarId>> {
        let next = {
            let cell =
                self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
            if cell.bound {
                match cell.typ.as_ref().and_then(|t| self.registry.get(t)) {
                    None => {
                        if cell.value == value {
                            // idempotent rebind
                            return Ok(cell.next);
                        }
                        bail!(StoreError::ConflictingBind)
                    }
                    Some(l) => {
                        cell.value = l.join(&cell.value, &value)?;
                        // every bind on a lattice cell advances the stream
                        let nid =
                            Self::alloc_successor(&self.router, &cell.typ);
                        cell.next = Some(nid);
                        Some(nid)
                    }
                }
            } else {
                if let Some(n) = snap_next {
                    cell.next.get_or_insert(n);
                }
                if cell.next.is_none() && value != Value::Nil {
                    cell.next =
                        Some(Self::alloc_successor(&self.router, &cell.typ));
                }
                cell.value = value;
                cell.bound = true;
                cell.lazy = false;
                cell.next
            }
        };
        self.wake_waiters(id);
        self.notify_aliases(id);
        Ok(next)
    }

    fn read(&mut self, id: VarId, threshold: Option<Threshold>, res: ReadTx) {
        let cell = self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
        if !cell.bound {
            if cell.lazy {
                // the first demand wakes the parked producer
                if let Some(tx) = cell.creator.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            match threshold {
                None => cell.waiters.push(Waiter::Plain(res)),
                Some(t) => cell.waiters.push(Waiter::Threshold(res, t)),
            }
            return;
        }
        let reply = ReadReply { value: cell.value.clone(), next: cell.next };
        let is_lattice = match &cell.typ {
            Some(t) => self.registry.is_lattice(t),
            None => false,
        };
        match threshold {
            // thresholds only gate lattice cells
            None => {
                let _ = res.send(Ok(reply));
            }
            Some(_) if !is_lattice => {
                let _ = res.send(Ok(reply));
            }
            Some(t) => {
                let typ = cell.typ.as_ref().unwrap();
                match self.registry.threshold_met(typ, &cell.value, &t) {
                    Ok(true) => {
                        let _ = res.send(Ok(reply));
                    }
                    Ok(false) => cell.waiters.push(Waiter::Threshold(res, t)),
                    Err(e) => {
                        let _ = res.send(Err(e));
                    }
                }
            }
        }
    }

    fn next(&mut self, id: VarId) -> VarId {
        let cell = self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
        match cell.next {
            Some(n) => n,
            None => {
                let nid = Self::alloc_successor(&self.router, &cell.typ);
                cell.next = Some(nid);
                nid
            }
        }
    }

    fn wait_needed(&mut self, id: VarId, res: oneshot::Sender<Result<()>>) {
        let cell = self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
        if cell.bound {
            let _ = res.send(Ok(()));
            return;
        }
        cell.waiters.retain(|w| !w.is_closed());
        if !cell.waiters.is_empty() {
            // demand is already present
            let _ = res.send(Ok(()));
            return;
        }
        match &cell.creator {
            Some(tx) if !tx.is_closed() => {
                // another producer is already parked here
                let _ = res.send(Ok(()));
            }
            _ => {
                cell.lazy = true;
                cell.creator = Some(res);
            }
        }
    }

    fn thread(
        &mut self,
        module: ArcStr,
        function: ArcStr,
        args: Vec<Value>,
    ) -> Result<TaskId> {
        let store = match self.router.upgrade() {
            Some(r) => StoreHandle(r),
            None => bail!(StoreError::RoutingUnavailable),
        };
        let tid = TaskId::new();
        let host = sync::Arc::clone(&self.programs);
        self.tasks.spawn(async move {
            (tid, host.run(store, module, function, args).await)
        });
        Ok(tid)
    }

    fn fetch(&mut self, target: VarId, from: VarId, res: BindTx) {
        let cell =
            self.cells.entry(target).or_insert_with(|| Cell::unbound(None));
        if cell.bound {
            let snap = cell.snapshot();
            let m = ToExec::ReplyFetch { from, snap, res };
            if let Err(e) = self.router.send_to(&from, m) {
                warn!("could not reply to fetch of {target}: {e}")
            }
        } else if let Value::Alias(tail) = cell.value {
            // transitive chase toward the end of the chain
            let m = ToExec::Fetch { target: tail, from, res };
            if let Err(e) = self.router.send_to(&tail, m) {
                warn!("could not forward fetch of {target} to {tail}: {e}")
            }
        } else {
            // pending: remember the alias and hand back the current
            // snapshot, successor included, so the chain shares one
            // stream
            if cell.next.is_none() {
                cell.next = Some(Self::alloc_successor(&self.router, &cell.typ));
            }
            cell.aliases.push(from);
            let snap = cell.snapshot();
            let m = ToExec::ReplyFetch { from, snap, res };
            if let Err(e) = self.router.send_to(&from, m) {
                warn!("could not reply to fetch of {target}: {e}")
            }
        }
    }

    fn reply_fetch(
        &mut self,
        from: VarId,
        snap: CellSnapshot,
    ) -> Result<Option<VarId>> {
        let cell = self.cells.entry(from).or_insert_with(|| Cell::unbound(None));
        if cell.typ.is_none() {
            cell.typ = snap.typ.clone();
        }
        if matches!(cell.value, Value::Alias(_)) {
            // the marker is resolved by the snapshot
            cell.value = Value::Bottom;
        }
        if snap.bound {
            self.write(from, snap.value, snap.next)
        } else {
            if cell.next.is_none() {
                cell.next = snap.next;
            }
            Ok(cell.next)
        }
    }

    fn notify_value(&mut self, id: VarId, value: Value) -> Result<()> {
        let cell = self.cells.entry(id).or_insert_with(|| Cell::unbound(None));
        if matches!(cell.value, Value::Alias(_)) {
            cell.value = Value::Bottom;
        }
        self.write(id, value, None)?;
        Ok(())
    }

    fn wake_waiters(&mut self, id: VarId) {
        let Some(cell) = self.cells.get_mut(&id) else { return };
        if !cell.bound {
            return;
        }
        if let Some(tx) = cell.creator.take() {
            // wait_needed returns immediately on a bound cell, so a
            // parked producer must not stay parked past the bind
            let _ = tx.send(Ok(()));
        }
        if cell.waiters.is_empty() {
            return;
        }
        let value = cell.value.clone();
        let next = cell.next;
        let typ = cell.typ.clone();
        let waiters = mem::take(&mut cell.waiters);
        let mut kept = Vec::new();
        for w in waiters {
            match w {
                w if w.is_closed() => (), // the reader was cancelled
                Waiter::Plain(tx) => {
                    let _ =
                        tx.send(Ok(ReadReply { value: value.clone(), next }));
                }
                Waiter::Threshold(tx, t) => {
                    let met = match &typ {
                        Some(ty) if self.registry.is_lattice(ty) => {
                            self.registry.threshold_met(ty, &value, &t)
                        }
                        // thresholds only gate lattice cells
                        Some(_) | None => Ok(true),
                    };
                    match met {
                        Ok(true) => {
                            let _ = tx.send(Ok(ReadReply {
                                value: value.clone(),
                                next,
                            }));
                        }
                        Ok(false) => kept.push(Waiter::Threshold(tx, t)),
                        Err(e) => {
                            error!(
                                "threshold on {id} cannot be evaluated: {e:?}"
                            );
                            kept.push(Waiter::Threshold(tx, t))
                        }
                    }
                }
            }
        }
        if let Some(cell) = self.cells.get_mut(&id) {
            cell.waiters = kept;
        }
    }

    fn notify_aliases(&mut self, id: VarId) {
        let Some(cell) = self.cells.get_mut(&id) else { return };
        if !cell.bound || cell.aliases.is_empty() {
            return;
        }
        let value = cell.value.clone();
        let aliases = mem::take(&mut cell.aliases);
        for a in aliases {
            let m = ToExec::NotifyValue { id: a, value: value.clone() };
            if let Err(e) = self.router.send_to(&a, m) {
                error!("could not forward the value of {id} to alias {a}: {e}")
            }
        }
    }
}
