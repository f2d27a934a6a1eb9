//! # Observability Module
//!
//! - **Structured Logging**: pretty or JSON output filtered by level
//! - **Request Tracing**: request ID propagation and a log line for every
//!   request before its handler runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use sluice_node::observability::{init_logging, request_id_middleware, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty);
//!
//! let app: Router<()> = Router::new()
//!     .layer(axum::middleware::from_fn(request_id_middleware));
//! ```

mod logging;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
