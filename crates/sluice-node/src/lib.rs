//! # Sluice Node
//!
//! Git smart HTTP server. Serves the reference advertisement, fetches and
//! pushes for one repository over three routes, delegating the repository
//! work to a [`sluice_git::SessionProvider`].
//!
//! ## Modules
//!
//! - [`api`]: router, handlers and HTTP error mapping
//! - [`bridge`]: session lifecycle, cancellation and deadlines
//! - [`config`]: YAML configuration
//! - [`observability`]: logging and request tracing

pub mod api;
pub mod bridge;
pub mod config;
pub mod observability;

pub use api::{create_router, ApiError, AppState};
pub use config::{Config, ConfigError};
