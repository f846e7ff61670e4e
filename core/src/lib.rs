/// Relay routing core
///
/// Pairwise relay stats, multi-hop route optimization and per-session route
/// selection, plus the backend service that ties them together.

pub mod error;
pub mod config;
pub mod matrix;
pub mod stats;
pub mod optimizer;
pub mod route_matrix;
pub mod selector;
pub mod optimize_log;
pub mod api;
pub mod backend;

pub use error::{CoreError, Result};
pub use config::Config;
pub use backend::Backend;
pub use matrix::{tri_index, tri_len, CostMatrix, UNROUTABLE};
pub use route_matrix::{RouteMatrix, ROUTE_MATRIX_VERSION};
pub use selector::{RouteSelector, RouteShader, RouteState};
