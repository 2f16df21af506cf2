use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::config::{FileConfig, ServerConfig};
use crate::db::Database;
use crate::history::TransferHistory;
use crate::metrics::ServerMetrics;
use crate::signaling::ConnectionRegistry;
use crate::transfer::TransferRegistry;

/// Small pipe so multi-chunk payloads exercise writer backpressure.
pub const TEST_PIPE_BYTES: usize = 16 * 1024;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
/// Suitable for handler tests that exercise real SQL queries without I/O.
pub async fn test_app_state() -> AppState {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    let mut server_config = ServerConfig::from_file(&FileConfig::default());
    server_config.transfer.pipe_buffer_bytes = TEST_PIPE_BYTES;
    server_config.transfer.copy_buffer_bytes = 8 * 1024;
    server_config.transfer.attach_timeout = Some(Duration::from_secs(10));

    AppState {
        connections: ConnectionRegistry::new(),
        transfers: TransferRegistry::new(TEST_PIPE_BYTES),
        server_config: Arc::new(server_config),
        metrics: Arc::new(ServerMetrics::new()),
        db: Arc::new(Database { pool: pool.clone() }),
        history: Some(TransferHistory::new(pool)),
        shutdown: CancellationToken::new(),
    }
}

/// Shorten how long either stream side waits for its counterpart.
pub fn set_attach_timeout(state: &mut AppState, timeout: Duration) {
    let mut config = (*state.server_config).clone();
    config.transfer.attach_timeout = Some(timeout);
    state.server_config = Arc::new(config);
}
