//! Proxy-facing surfaces of the discovery daemon
//!
//! - `push`: delivers snapshot diffs to a proxy's config endpoint
//! - `admin`: HTTP endpoints for health, versions, endpoint queries and metrics
pub mod admin;
pub mod push;

pub use admin::AdminServer;
pub use push::HttpPushSink;
