//! swe-swe server: axum HTTP + WebSocket on one listener, the preview proxy
//! with its debug hub on another. Session mechanics live in `common`.

pub mod pages;
pub mod proxy;
pub mod web_server;
pub mod ws;

pub use proxy::run_preview_proxy;
pub use web_server::run_web_server;
