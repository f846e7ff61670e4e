/// Session route selection: should a session accelerate, and over which route
pub mod best_route;
pub mod decision;
pub mod shader;
pub mod state;

pub use best_route::{
    best_route_cost, current_route_cost, random_best_route, route_exists, update_best_route,
    Endpoints, RouteUpdate, SelectedRoute, MAX_BEST_ROUTES, NO_ROUTE_COST,
};
pub use decision::{early_out_direct, RouteSelector, SliceInput, StayDecision, TakeDecision};
pub use shader::{RouteShader, DEFAULT_COST_BIAS};
pub use state::RouteState;
