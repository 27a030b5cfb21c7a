//! The seam between the store and user computations.
use crate::StoreHandle;
use anyhow::Result;
use arcstr::ArcStr;
use async_trait::async_trait;
use core::fmt;
use lvar_core::{StoreError, Value};

/// Runs the computations spawned with `thread`.
///
/// The store does not constrain what a computation does beyond its use
/// of the handle it is given. Completion and failure are logged by the
/// partition that spawned the task, never surfaced to the spawner.
#[async_trait]
pub trait ProgramHost: fmt::Debug + Send + Sync + 'static {
    async fn run(
        &self,
        store: StoreHandle,
        module: ArcStr,
        function: ArcStr,
        args: Vec<Value>,
    ) -> Result<()>;
}

/// A host with no programs at all. Every spawn fails with
/// [`StoreError::NotImplemented`].
#[derive(Debug, Default)]
pub struct NoPrograms;

#[async_trait]
impl ProgramHost for NoPrograms {
    async fn run(
        &self,
        _store: StoreHandle,
        _module: ArcStr,
        _function: ArcStr,
        _args: Vec<Value>,
    ) -> Result<()> {
        Err(StoreError::NotImplemented.into())
    }
}
