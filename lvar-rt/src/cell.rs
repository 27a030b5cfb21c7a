use crate::ReadTx;
use anyhow::Result;
use arcstr::ArcStr;
use lvar_core::{Threshold, Value, VarId};
use serde_derive::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::oneshot;

/// A suspended read parked on a cell.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// Wake with the cell's value as soon as it is bound.
    Plain(ReadTx),
    /// Wake only once the value has advanced past the threshold;
    /// re-evaluated on every bind.
    Threshold(ReadTx, Threshold),
}

impl Waiter {
    /// True when the reading future was dropped; the waiter can be
    /// discarded without ever waking.
    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Waiter::Plain(tx) | Waiter::Threshold(tx, _) => tx.is_closed(),
        }
    }
}

/// The record stored at each VarId. Owned and mutated only by the
/// partition the id hashes to.
#[derive(Debug)]
pub(crate) struct Cell {
    pub(crate) typ: Option<ArcStr>,
    pub(crate) value: Value,
    pub(crate) bound: bool,
    pub(crate) next: Option<VarId>,
    pub(crate) waiters: Vec<Waiter>,
    /// Cells bound to this one, notified when the value arrives.
    pub(crate) aliases: SmallVec<[VarId; 2]>,
    pub(crate) lazy: bool,
    /// A producer parked in wait_needed, woken by the first read.
    pub(crate) creator: Option<oneshot::Sender<Result<()>>>,
}

impl Cell {
    pub(crate) fn unbound(typ: Option<ArcStr>) -> Self {
        Cell {
            typ,
            value: Value::Bottom,
            bound: false,
            next: None,
            waiters: Vec::new(),
            aliases: SmallVec::new(),
            lazy: false,
            creator: None,
        }
    }

    /// Lattice cells are bound from creation; their value only ever
    /// moves up from bottom.
    pub(crate) fn lattice(typ: ArcStr, bottom: Value) -> Self {
        Cell {
            typ: Some(typ),
            value: bottom,
            bound: true,
            ..Self::unbound(None)
        }
    }

    pub(crate) fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            typ: self.typ.clone(),
            value: self.value.clone(),
            bound: self.bound,
            next: self.next,
        }
    }
}

/// The view of a cell that travels in a fetch reply. Also the unit a
/// transport would ship when handing a partition's cells to another
/// node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub typ: Option<ArcStr>,
    pub value: Value,
    pub bound: bool,
    pub next: Option<VarId>,
}
