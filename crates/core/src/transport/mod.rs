//! Hop-to-hop transport: QUIC endpoints carrying framed, ordered links.

mod connection;
mod dialer;
mod endpoint;
mod link;

pub use connection::{Connection, ConnectionError, ConnectionStats};
pub use dialer::{accept_links, Dialer, QuicDialer};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError};
pub use link::{FrameHandler, Link, LinkError, LinkId};

#[cfg(test)]
pub(crate) use link::tests::linked_pair;
