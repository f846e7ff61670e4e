/// Route matrix optimization
pub mod optimize;
pub mod route_manager;

pub use optimize::{optimize, optimize_matrix, OptimizeOptions};
pub use route_manager::{
    route_hash, Route, RouteEntry, RouteManager, MAX_ROUTE_RELAYS, UNCOSTABLE_THRESHOLD,
};
