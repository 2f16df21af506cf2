//! Transfer Registry
//!
//! Maps transfer keys to their pending pipes. A pipe is created by whichever
//! side references the key first and removed by whichever side settles last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::TransferError;
use super::pipe::{PipeEndpoint, Role, TransferPipe};

#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    // std Mutex: no critical section awaits, and `release` runs from `Drop`
    pipes: Mutex<HashMap<String, Arc<TransferPipe>>>,
    pipe_capacity: usize,
}

impl TransferRegistry {
    /// `pipe_capacity` bounds how many bytes a writer may run ahead of its reader.
    pub fn new(pipe_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipes: Mutex::new(HashMap::new()),
                pipe_capacity,
            }),
        }
    }

    fn pipes(&self) -> MutexGuard<'_, HashMap<String, Arc<TransferPipe>>> {
        self.inner
            .pipes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the pipe for `key`, creating it if absent.
    pub fn get_or_create(&self, key: &str) -> Arc<TransferPipe> {
        let mut pipes = self.pipes();
        get_or_create_locked(&mut pipes, key, self.inner.pipe_capacity)
    }

    /// Remove `key`. Absent keys are a no-op.
    pub fn delete(&self, key: &str) -> bool {
        self.pipes().remove(key).is_some()
    }

    /// Resolve or create the pipe for `key` and bind `role` to it, in one step.
    pub fn attach(&self, key: &str, role: Role) -> Result<PipeEndpoint, TransferError> {
        let (pipe, stream) = {
            let mut pipes = self.pipes();
            let pipe = get_or_create_locked(&mut pipes, key, self.inner.pipe_capacity);
            let stream = pipe.take_end(role).ok_or_else(|| TransferError::Conflict {
                key: key.to_string(),
                role,
            })?;
            (pipe, stream)
        };
        debug!(key, ?role, "Attached to pipe");
        Ok(PipeEndpoint::new(pipe, role, stream, self.clone()))
    }

    /// Drop the entry for `pipe` once both of its ends are settled. An entry
    /// that has since been replaced by a newer pipe under the same key is left
    /// alone. Returns whether this call removed it.
    pub(crate) fn release(&self, pipe: &Arc<TransferPipe>) -> bool {
        let mut pipes = self.pipes();
        let current = match pipes.get(pipe.key()) {
            Some(current) if Arc::ptr_eq(current, pipe) => current,
            _ => return false,
        };
        if !current.status().is_settled() {
            return false;
        }
        pipes.remove(pipe.key());
        debug!(key = %pipe.key(), "Pipe removed from registry");
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pipes().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pipes().len()
    }
}

fn get_or_create_locked(
    pipes: &mut HashMap<String, Arc<TransferPipe>>,
    key: &str,
    capacity: usize,
) -> Arc<TransferPipe> {
    pipes
        .entry(key.to_string())
        .or_insert_with(|| {
            debug!(key, "Creating pipe");
            Arc::new(TransferPipe::new(key, capacity))
        })
        .clone()
}
