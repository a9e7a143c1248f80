//! HTTP front end: router, rate limit middleware and server.

mod handlers;
mod middleware;
mod server;

pub use handlers::{router, AppState};
pub use middleware::{rate_limit, reject_unsupported_methods, request_id, RATE_LIMITED_MESSAGE};
pub use server::HttpServer;
