//! The built in lattice library.
//!
//! Each lattice is a named implementation of [`LatticeType`] plus,
//! where the payload is structured, the payload type itself. The
//! partial order and the join live here; everything outside the
//! registry treats the payloads as opaque [`Value`]s.
use crate::{registry::LatticeType, StoreError, Value};
use anyhow::Result;
use arcstr::{literal, ArcStr};
use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

/// A grow only counter keyed by actor.
///
/// Each actor advances only its own slot, so concurrent increments
/// never conflict and the join is the pointwise max.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct GCounter(BTreeMap<ArcStr, u64>);

impl GCounter {
    pub fn new() -> Self {
        GCounter(BTreeMap::new())
    }

    /// Add `n` to this actor's slot.
    pub fn incr(&mut self, actor: &ArcStr, n: u64) {
        *self.0.entry(actor.clone()).or_insert(0) += n;
    }

    pub fn get(&self, actor: &ArcStr) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// The observed total across all actors.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    fn leq(&self, other: &Self) -> bool {
        self.0.iter().all(|(k, v)| other.get(k) >= *v)
    }

    fn join(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        for (k, v) in other.0.iter() {
            let e = out.entry(k.clone()).or_insert(0);
            *e = (*e).max(*v);
        }
        GCounter(out)
    }
}

impl fmt::Display for GCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter{{total: {}}}", self.total())
    }
}

/// A grow only set ordered by inclusion.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct GSet(BTreeSet<Value>);

impl GSet {
    pub fn new() -> Self {
        GSet(BTreeSet::new())
    }

    pub fn insert(&mut self, v: Value) {
        self.0.insert(v);
    }

    pub fn contains(&self, v: &Value) -> bool {
        self.0.contains(v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }
}

impl FromIterator<Value> for GSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        GSet(BTreeSet::from_iter(iter))
    }
}

impl fmt::Display for GSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set[{}]", self.0.len())
    }
}

macro_rules! payload {
    ($v:expr, $variant:ident) => {
        match $v {
            Value::$variant(x) => Ok(x),
            _ => Err(StoreError::TypeMismatch),
        }
    };
}

#[derive(Debug)]
pub(crate) struct GCounterType;

impl LatticeType for GCounterType {
    fn name(&self) -> ArcStr {
        literal!("gcounter")
    }

    fn bottom(&self) -> Value {
        Value::Counter(GCounter::new())
    }

    fn leq(&self, a: &Value, b: &Value) -> Result<bool> {
        let a = payload!(a, Counter)?;
        let b = payload!(b, Counter)?;
        Ok(a.leq(b))
    }

    fn join(&self, a: &Value, b: &Value) -> Result<Value> {
        let a = payload!(a, Counter)?;
        let b = payload!(b, Counter)?;
        Ok(Value::Counter(a.join(b)))
    }
}

#[derive(Debug)]
pub(crate) struct GSetType;

impl LatticeType for GSetType {
    fn name(&self) -> ArcStr {
        literal!("gset")
    }

    fn bottom(&self) -> Value {
        Value::Set(GSet::new())
    }

    fn leq(&self, a: &Value, b: &Value) -> Result<bool> {
        let a = payload!(a, Set)?;
        let b = payload!(b, Set)?;
        Ok(a.0.is_subset(&b.0))
    }

    fn join(&self, a: &Value, b: &Value) -> Result<Value> {
        let a = payload!(a, Set)?;
        let b = payload!(b, Set)?;
        Ok(Value::Set(GSet(a.0.union(&b.0).cloned().collect())))
    }
}

/// Max register over unsigned integers.
#[derive(Debug)]
pub(crate) struct MaxU64Type;

impl LatticeType for MaxU64Type {
    fn name(&self) -> ArcStr {
        literal!("maxu64")
    }

    fn bottom(&self) -> Value {
        Value::U64(0)
    }

    fn leq(&self, a: &Value, b: &Value) -> Result<bool> {
        let a = payload!(a, U64)?;
        let b = payload!(b, U64)?;
        Ok(a <= b)
    }

    fn join(&self, a: &Value, b: &Value) -> Result<Value> {
        let a = payload!(a, U64)?;
        let b = payload!(b, U64)?;
        Ok(Value::U64(*a.max(b)))
    }
}

/// Once true, always true.
#[derive(Debug)]
pub(crate) struct OrBoolType;

impl LatticeType for OrBoolType {
    fn name(&self) -> ArcStr {
        literal!("orbool")
    }

    fn bottom(&self) -> Value {
        Value::Bool(false)
    }

    fn leq(&self, a: &Value, b: &Value) -> Result<bool> {
        let a = payload!(a, Bool)?;
        let b = payload!(b, Bool)?;
        Ok(!a || *b)
    }

    fn join(&self, a: &Value, b: &Value) -> Result<Value> {
        let a = payload!(a, Bool)?;
        let b = payload!(b, Bool)?;
        Ok(Value::Bool(*a || *b))
    }
}
