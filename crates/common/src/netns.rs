//! Scoped network namespace entry
//!
//! Switching network namespace affects the calling thread only. Every
//! switch is expressed as a guard that restores the previous namespace when
//! dropped, on every exit path, and all work inside one namespace is
//! serialized through a per-namespace lock.

use crate::backend::NamespaceOps;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

type Restore<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Restores the previous namespace of the current thread on drop
pub struct NamespaceGuard<'a> {
    name: String,
    restore: Option<Restore<'a>>,
}

impl<'a> NamespaceGuard<'a> {
    pub fn new(name: impl Into<String>, restore: impl FnOnce() -> Result<()> + 'a) -> Self {
        Self {
            name: name.into(),
            restore: Some(Box::new(restore)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restore now, reporting failure instead of only logging it
    pub fn leave(mut self) -> Result<()> {
        match self.restore.take() {
            Some(restore) => restore(),
            None => Ok(()),
        }
    }
}

impl Drop for NamespaceGuard<'_> {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            if let Err(e) = restore() {
                error!(namespace = %self.name, "Failed to restore previous namespace: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for NamespaceGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceGuard").field("name", &self.name).finish()
    }
}

/// One lock per namespace name
#[derive(Default)]
pub struct NamespaceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Enter `name`, run `f`, and restore the previous namespace.
///
/// Holds the namespace's lock for the whole sequence. When `f` succeeds but
/// restoring fails, the restore error is returned; when `f` fails, its error
/// wins and the restore failure is only logged. Either way the calling
/// thread may still be inside `name` and must not run further namespace
/// work, which is why the host backend aborts instead of reporting.
pub fn with_namespace<O, T, F>(
    ops: &O,
    locks: &NamespaceLocks,
    name: &str,
    f: F,
) -> Result<T>
where
    O: NamespaceOps + ?Sized,
    F: FnOnce() -> Result<T>,
{
    let lock = locks.lock_for(name);
    let _held = lock.lock();

    debug!(namespace = %name, "Entering namespace");
    let guard = ops.enter(name)?;
    match f() {
        Ok(value) => {
            guard.leave()?;
            Ok(value)
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}
