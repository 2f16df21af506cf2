pub mod health;
pub mod history;
pub mod signaling;
pub mod stream;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use history::history_handler;
pub use signaling::signaling_handler;
pub use stream::{download_handler, upload_handler};
