//! The lattice registry.
//!
//! The registry classifies type tags, constructs bottoms, computes
//! joins, and decides thresholds. It is built once before the store
//! starts and is read only afterwards.
use crate::{
    lattice::{GCounterType, GSetType, MaxU64Type, OrBoolType},
    StoreError, Threshold, Value,
};
use anyhow::{bail, Result};
use arcstr::ArcStr;
use core::fmt;
use fxhash::FxHashMap;
use std::{collections::HashMap, sync::Arc};

/// One registered lattice: a least element, a partial order, and a
/// join. `join` must be the least upper bound with respect to `leq`,
/// and `bottom` must be below everything the lattice accepts.
pub trait LatticeType: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> ArcStr;
    fn bottom(&self) -> Value;
    fn leq(&self, a: &Value, b: &Value) -> Result<bool>;
    fn join(&self, a: &Value, b: &Value) -> Result<Value>;
}

#[derive(Debug)]
pub struct LatticeRegistry(FxHashMap<ArcStr, Arc<dyn LatticeType>>);

impl Default for LatticeRegistry {
    fn default() -> Self {
        let mut t = Self::empty();
        t.register(Arc::new(GCounterType)).expect("fresh registry");
        t.register(Arc::new(GSetType)).expect("fresh registry");
        t.register(Arc::new(MaxU64Type)).expect("fresh registry");
        t.register(Arc::new(OrBoolType)).expect("fresh registry");
        t
    }
}

impl LatticeRegistry {
    /// A registry with no lattices at all, not even the built ins.
    pub fn empty() -> Self {
        LatticeRegistry(HashMap::default())
    }

    /// Add a lattice under its own name. Fails if the name is taken.
    pub fn register(&mut self, t: Arc<dyn LatticeType>) -> Result<()> {
        let name = t.name();
        if self.0.contains_key(&name) {
            bail!("lattice {name} is already registered")
        }
        self.0.insert(name, t);
        Ok(())
    }

    pub fn is_lattice(&self, typ: &ArcStr) -> bool {
        self.0.contains_key(typ)
    }

    pub fn get(&self, typ: &ArcStr) -> Option<&Arc<dyn LatticeType>> {
        self.0.get(typ)
    }

    pub fn bottom(&self, typ: &ArcStr) -> Result<Value> {
        match self.0.get(typ) {
            Some(l) => Ok(l.bottom()),
            None => bail!(StoreError::UnknownLattice(typ.clone())),
        }
    }

    pub fn join(&self, typ: &ArcStr, a: &Value, b: &Value) -> Result<Value> {
        match self.0.get(typ) {
            Some(l) => l.join(a, b),
            None => bail!(StoreError::UnknownLattice(typ.clone())),
        }
    }

    /// Decide whether `value` has advanced past the observation point.
    pub fn threshold_met(
        &self,
        typ: &ArcStr,
        value: &Value,
        threshold: &Threshold,
    ) -> Result<bool> {
        let l = match self.0.get(typ) {
            Some(l) => l,
            None => bail!(StoreError::UnknownLattice(typ.clone())),
        };
        match threshold {
            Threshold::AtLeast(t) => l.leq(t, value),
            Threshold::StrictlyGreater(t) => {
                Ok(l.leq(t, value)? && !l.leq(value, t)?)
            }
        }
    }
}
