//! Core types for the lvar dataflow variable store
//!
//! This crate defines the identifiers, the value model, the threshold
//! forms, and the lattice registry shared by every component of the
//! store. Values are treated opaquely everywhere except the registry,
//! which is the single place lattice polymorphism lives.
#[macro_use]
extern crate serde_derive;

pub mod lattice;
pub mod registry;

#[cfg(test)]
mod test;

use arcstr::ArcStr;
use bytes::Bytes;
use core::fmt;
use uuid::Uuid;

pub use lattice::{GCounter, GSet};
pub use registry::{LatticeRegistry, LatticeType};

/// Ids that are only meaningful within one process, allocated from an
/// atomic counter.
#[macro_export]
macro_rules! atomic_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn new() -> Self {
                use std::sync::atomic::{AtomicU64, Ordering};
                static NEXT: AtomicU64 = AtomicU64::new(0);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            pub fn inner(&self) -> u64 {
                self.0
            }
        }
    };
}

atomic_id!(TaskId);

/// A globally unique, routable variable identifier.
///
/// Any node may mint one; the partition that owns the cell it names is
/// a pure function of its bytes.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct VarId(Uuid);

impl VarId {
    pub fn new() -> Self {
        VarId(Uuid::new_v4())
    }
}

impl Default for VarId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarId({})", self.0.simple())
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The value stored in a cell.
///
/// `Bottom` is the unbound placeholder, `Nil` is the end of stream
/// sentinel, and `Alias` marks a cell whose value will arrive from
/// another cell. Everything else is a concrete value; `Set` and
/// `Counter` are the payloads of the built in lattices.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Value {
    Bottom,
    Nil,
    Bool(bool),
    I64(i64),
    U64(u64),
    String(ArcStr),
    Bytes(Bytes),
    Set(GSet),
    Counter(GCounter),
    Alias(VarId),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bottom => write!(f, "bottom"),
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(i) => write!(f, "{i}"),
            Value::U64(u) => write!(f, "{u}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Set(s) => write!(f, "{s}"),
            Value::Counter(c) => write!(f, "{c}"),
            Value::Alias(id) => write!(f, "alias({id})"),
        }
    }
}

/// The observation point of a threshold read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Threshold {
    /// Met once the threshold is at or below the cell's value in the
    /// lattice order.
    AtLeast(Value),
    /// Met once the cell's value is strictly above the threshold.
    StrictlyGreater(Value),
}

/// Errors surfaced to callers of store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A bound single assignment cell was offered a different value.
    ConflictingBind,
    /// The requested feature is not supported by this store.
    NotImplemented,
    /// No partition owns the target id, or its channel is gone.
    RoutingUnavailable,
    /// The type tag is not in the lattice registry.
    UnknownLattice(ArcStr),
    /// A lattice was offered a payload of the wrong shape.
    TypeMismatch,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConflictingBind => {
                write!(f, "cell is already bound to a different value")
            }
            StoreError::NotImplemented => write!(f, "not implemented"),
            StoreError::RoutingUnavailable => {
                write!(f, "could not route to an owning partition")
            }
            StoreError::UnknownLattice(t) => {
                write!(f, "unknown lattice type {t}")
            }
            StoreError::TypeMismatch => {
                write!(f, "value does not fit the lattice type")
            }
        }
    }
}

impl std::error::Error for StoreError {}
