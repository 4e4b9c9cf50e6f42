/// Local HTTP control API
///
/// Lets local applications build and destroy tunnels, send data and cover
/// traffic, and poll the events their tunnels raise.

pub mod handlers;
pub mod inbox;
pub mod responses;
pub mod server;

pub use inbox::EventInbox;
pub use responses::*;
pub use server::ApiServer;
