//! In-memory transfer pipes keyed by transfer key.

mod pipe;
mod registry;

use std::time::Duration;

pub use pipe::{Outcome, PipeEndpoint, Role};
pub use registry::TransferRegistry;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer {key}: {role:?} end is already bound")]
    Conflict { key: String, role: Role },

    #[error("transfer {key}: counterpart did not attach within {waited:?}")]
    Expired { key: String, waited: Duration },

    #[error("transfer {key}: counterpart aborted")]
    PeerFailed { key: String },

    #[error("transfer {key}: copy failed: {source}")]
    Copy {
        key: String,
        #[source]
        source: std::io::Error,
    },
}
