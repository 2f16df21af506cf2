//! Stream endpoints
//!
//! `POST /stream?to=<key>` feeds the request body into the writer end of the
//! pipe for `key`; `GET /stream?to=<key>` drains the reader end into the
//! response. Neither side touches disk; the bounded pipe paces the uploader
//! to the downloader.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

use crate::AppState;
use crate::history::{NewTransfer, TransferHistory};
use crate::metrics::ServerMetrics;
use crate::signaling::{ConnectionRegistry, ControlMessage};
use crate::transfer::{Outcome, PipeEndpoint, Role, TransferError};

const DEFAULT_FILE_NAME: &str = "download";
const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
pub struct StreamParams {
    /// Transfer key: the receiver's identity
    pub to: String,
    /// Sender identity, supplied by the downloader for completion notices
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Size declared in the offer
    #[serde(default)]
    pub size: Option<u64>,
}

impl StreamParams {
    fn key(&self) -> Result<&str, StreamError> {
        let key = self.to.trim();
        if key.is_empty() {
            return Err(StreamError::BadRequest("missing transfer key".to_string()));
        }
        Ok(key)
    }

    fn file_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub key: String,
    pub bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            StreamError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::Transfer(TransferError::Conflict { .. }) => StatusCode::CONFLICT,
            StreamError::Transfer(TransferError::Expired { .. }) => StatusCode::REQUEST_TIMEOUT,
            StreamError::Transfer(TransferError::PeerFailed { .. }) => StatusCode::GONE,
            StreamError::Transfer(TransferError::Copy { .. }) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Sender side: copy the request body into the pipe.
pub async fn upload_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    body: Body,
) -> Result<Json<UploadReceipt>, StreamError> {
    let key = params.key()?;
    let transfer_config = &state.server_config.transfer;

    let mut endpoint = state.transfers.attach(key, Role::Sender)?;
    state.metrics.upload_started();
    info!(
        key,
        name = params.file_name(),
        size = ?params.size,
        "Upload attached, waiting for receiver"
    );

    await_peer(&endpoint, transfer_config.attach_timeout, &state.metrics).await?;

    let body_stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let mut reader = BufReader::with_capacity(
        transfer_config.copy_buffer_bytes,
        StreamReader::new(body_stream),
    );

    match tokio::io::copy_buf(&mut reader, endpoint.stream_mut()).await {
        Ok(bytes) => {
            info!(key, bytes, "Upload finished");
            endpoint.finish(Outcome::Completed);
            Ok(Json(UploadReceipt {
                key: key.to_string(),
                bytes,
            }))
        }
        Err(source) => {
            warn!(key, "Upload copy failed: {}", source);
            state.metrics.stream_failed();
            // dropping the endpoint closes the writer so the reader is not left hanging
            endpoint.finish(Outcome::Failed);
            Err(TransferError::Copy {
                key: key.to_string(),
                source,
            }
            .into())
        }
    }
}

/// Receiver side: stream the pipe into the response.
pub async fn download_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Response, StreamError> {
    let key = params.key()?;
    let transfer_config = &state.server_config.transfer;

    let endpoint = state.transfers.attach(key, Role::Receiver)?;
    state.metrics.download_started();
    info!(key, name = params.file_name(), "Download attached, waiting for sender");

    await_peer(&endpoint, transfer_config.attach_timeout, &state.metrics).await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(params.file_name()),
        );
    // Trusted as declared; a mismatch is only logged once the copy ends.
    if let Some(size) = params.size {
        response = response.header(header::CONTENT_LENGTH, size);
    }

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    let completion = Completion {
        sender: params.from.clone(),
        receiver: key.to_string(),
        file_name: params.file_name().to_string(),
        declared_size: params.size,
        connections: state.connections.clone(),
        history: state.history.clone(),
        metrics: state.metrics.clone(),
    };
    tokio::spawn(pump_download(
        endpoint,
        tx,
        transfer_config.copy_buffer_bytes,
        completion,
    ));

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }));

    response
        .body(body)
        .map_err(|e| StreamError::BadRequest(format!("invalid response headers: {e}")))
}

async fn await_peer(
    endpoint: &PipeEndpoint,
    limit: Option<std::time::Duration>,
    metrics: &ServerMetrics,
) -> Result<(), TransferError> {
    endpoint.wait_for_peer(limit).await.inspect_err(|e| {
        warn!(key = %endpoint.key(), role = ?endpoint.role(), "{}", e);
        match e {
            TransferError::Expired { .. } => metrics.stream_expired(),
            _ => metrics.stream_failed(),
        }
    })
}

/// What to do once a download drains cleanly.
struct Completion {
    sender: Option<String>,
    receiver: String,
    file_name: String,
    declared_size: Option<u64>,
    connections: ConnectionRegistry,
    history: Option<TransferHistory>,
    metrics: Arc<ServerMetrics>,
}

impl Completion {
    /// Best-effort notices and history row; neither can fail the transfer.
    async fn announce(self, bytes: u64) {
        self.metrics.transfer_completed(bytes);

        if let Some(declared) = self.declared_size.filter(|&d| d != bytes) {
            warn!(
                key = %self.receiver,
                declared,
                bytes,
                "Streamed byte count differs from declared size"
            );
        }

        if let Some(sender) = &self.sender {
            self.connections
                .send_to(sender, ControlMessage::Complete)
                .await;
        }
        self.connections
            .send_to(&self.receiver, ControlMessage::Complete)
            .await;

        if let Some(history) = &self.history {
            history.record_detached(NewTransfer {
                sender: self
                    .sender
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
                receiver: self.receiver.clone(),
                file_name: self.file_name.clone(),
                file_size: self.declared_size.unwrap_or(bytes),
                bytes_streamed: bytes,
            });
        }
    }
}

/// Copy the reader end into the response body channel until end-of-stream.
async fn pump_download(
    mut endpoint: PipeEndpoint,
    tx: mpsc::Sender<io::Result<Bytes>>,
    copy_buffer: usize,
    completion: Completion,
) {
    let key = endpoint.key().to_string();
    let mut bytes: u64 = 0;

    let drained = {
        let mut chunks = ReaderStream::with_capacity(endpoint.stream_mut(), copy_buffer);
        loop {
            // a dropped response must release the reader even while the writer stalls
            let next = tokio::select! {
                next = chunks.next() => next,
                _ = tx.closed() => {
                    warn!(key = %key, bytes, "Receiver disconnected mid-stream");
                    break false;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    bytes += chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        warn!(key = %key, bytes, "Receiver disconnected mid-stream");
                        break false;
                    }
                }
                Some(Err(e)) => {
                    warn!(key = %key, bytes, "Pipe read failed: {}", e);
                    let _ = tx.send(Err(e)).await;
                    break false;
                }
                None => break true,
            }
        }
    };

    // End-of-stream only counts if the writer closed cleanly.
    let writer_completed = endpoint.pipe().writer_outcome() == Some(Outcome::Completed);
    if drained && writer_completed {
        endpoint.finish(Outcome::Completed);
        info!(key = %key, bytes, "Download complete");
        completion.announce(bytes).await;
        return;
    }

    if drained {
        debug!(key = %key, bytes, "Writer aborted before end of upload");
        let _ = tx
            .send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sender aborted the upload",
            )))
            .await;
    }
    completion.metrics.stream_failed();
    endpoint.finish(Outcome::Failed);
}

/// `attachment; filename=<name>`, quoted when the name is not a plain token.
pub(crate) fn content_disposition(name: &str) -> HeaderValue {
    let is_token = |c: char| c.is_ascii_alphanumeric() || "!#$&+-.^_`|~".contains(c);
    let value = if !name.is_empty() && name.chars().all(is_token) {
        format!("attachment; filename={name}")
    } else {
        let escaped: String = name
            .chars()
            .map(|c| match c {
                '"' | '\\' => '_',
                c if c.is_ascii_graphic() || c == ' ' => c,
                _ => '_',
            })
            .collect();
        format!("attachment; filename=\"{escaped}\"")
    };
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
