/// onionmesh daemon library
///
/// Runs a tunnel node and exposes it to local applications over HTTP.

pub mod api;

pub use api::ApiServer;
