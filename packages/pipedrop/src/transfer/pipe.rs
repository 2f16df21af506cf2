//! Transfer Pipe
//!
//! A single-use in-memory byte stream with one writer end and one reader end.
//! The underlying `tokio::io::duplex` buffer is bounded, so a writer blocks as
//! soon as the reader falls behind. Each end publishes its lifecycle through a
//! `watch` channel so the counterpart can wait for it to show up and can tell
//! a clean end-of-stream from an aborted one.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tracing::debug;

use super::TransferError;
use super::registry::TransferRegistry;

/// Which end of a pipe a request is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Uploader, owns the writer end
    Sender,
    /// Downloader, owns the reader end
    Receiver,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    /// Nobody has bound this end yet
    Waiting,
    Attached,
    Closed(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStatus {
    pub writer: EndState,
    pub reader: EndState,
}

impl PipeStatus {
    pub fn end(&self, role: Role) -> EndState {
        match role {
            Role::Sender => self.writer,
            Role::Receiver => self.reader,
        }
    }

    fn end_mut(&mut self, role: Role) -> &mut EndState {
        match role {
            Role::Sender => &mut self.writer,
            Role::Receiver => &mut self.reader,
        }
    }

    /// True once neither end can make further progress: every end is closed,
    /// or still unbound while its counterpart has already closed.
    pub fn is_settled(&self) -> bool {
        fn settled(end: EndState, peer: EndState) -> bool {
            match end {
                EndState::Closed(_) => true,
                EndState::Waiting => matches!(peer, EndState::Closed(_)),
                EndState::Attached => false,
            }
        }
        settled(self.writer, self.reader) && settled(self.reader, self.writer)
    }
}

pub struct TransferPipe {
    key: String,
    writer: Mutex<Option<DuplexStream>>,
    reader: Mutex<Option<DuplexStream>>,
    status: watch::Sender<PipeStatus>,
}

impl TransferPipe {
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        let (writer, reader) = tokio::io::duplex(capacity);
        let (status, _) = watch::channel(PipeStatus {
            writer: EndState::Waiting,
            reader: EndState::Waiting,
        });
        Self {
            key: key.into(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            status,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> PipeStatus {
        *self.status.borrow()
    }

    /// How the writer finished, once it has.
    pub fn writer_outcome(&self) -> Option<Outcome> {
        match self.status().writer {
            EndState::Closed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Hand out the stream for `role`. Each end can be taken exactly once.
    pub(crate) fn take_end(&self, role: Role) -> Option<DuplexStream> {
        let slot = match role {
            Role::Sender => &self.writer,
            Role::Receiver => &self.reader,
        };
        let stream = slot.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        self.status.send_modify(|s| *s.end_mut(role) = EndState::Attached);
        Some(stream)
    }

    pub(crate) fn close(&self, role: Role, outcome: Outcome) {
        self.status
            .send_modify(|s| *s.end_mut(role) = EndState::Closed(outcome));
    }

    /// Wait until the end opposite `role` is no longer `Waiting` and return its state.
    pub async fn wait_for_peer(&self, role: Role) -> EndState {
        let mut rx = self.status.subscribe();
        let peer = role.peer();
        match rx.wait_for(|s| s.end(peer) != EndState::Waiting).await {
            Ok(status) => status.end(peer),
            // the sender lives in `self`, so the channel cannot close under us
            Err(_) => self.status().end(peer),
        }
    }
}

/// One bound end of a pipe.
///
/// Dropping the endpoint closes its end: the pipe status is updated first,
/// then the stream is dropped, so a reader that hits end-of-stream can always
/// tell whether the writer finished cleanly. The registry entry is released
/// on the same path, which makes cleanup unconditional on every exit.
pub struct PipeEndpoint {
    pipe: Arc<TransferPipe>,
    role: Role,
    outcome: Outcome,
    registry: TransferRegistry,
    // declared last: dropped after `Drop::drop` has published the outcome
    stream: DuplexStream,
}

impl PipeEndpoint {
    pub(crate) fn new(
        pipe: Arc<TransferPipe>,
        role: Role,
        stream: DuplexStream,
        registry: TransferRegistry,
    ) -> Self {
        Self {
            pipe,
            role,
            outcome: Outcome::Failed,
            registry,
            stream,
        }
    }

    pub fn key(&self) -> &str {
        self.pipe.key()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pipe(&self) -> &Arc<TransferPipe> {
        &self.pipe
    }

    pub fn stream_mut(&mut self) -> &mut DuplexStream {
        &mut self.stream
    }

    /// Wait for the counterpart to attach, bounded by `limit` when set.
    pub async fn wait_for_peer(&self, limit: Option<Duration>) -> Result<(), TransferError> {
        let wait = self.pipe.wait_for_peer(self.role);
        let peer = match limit {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TransferError::Expired {
                    key: self.key().to_string(),
                    waited: limit,
                }
            })?,
            None => wait.await,
        };

        match peer {
            EndState::Closed(Outcome::Failed) => Err(TransferError::PeerFailed {
                key: self.key().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Close this end with `outcome`.
    pub fn finish(mut self, outcome: Outcome) {
        self.outcome = outcome;
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.pipe.close(self.role, self.outcome);
        let released = self.registry.release(&self.pipe);
        debug!(
            key = %self.pipe.key(),
            role = ?self.role,
            outcome = ?self.outcome,
            released,
            "Pipe endpoint closed"
        );
    }
}
