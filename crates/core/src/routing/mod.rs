//! Per-node tunnel routing state.

mod table;

pub use table::{Route, RouteUpdate, RoutingError, RoutingTable};
