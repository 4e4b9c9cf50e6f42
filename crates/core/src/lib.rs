pub mod identity;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use identity::{HostKey, HostKeyError};
pub use node::Node;
pub use protocol::*;

// Re-export session types
pub use session::{SessionAuthority, SessionError, X25519SessionAuthority};

// Re-export routing types
pub use routing::{Route, RouteUpdate, RoutingError, RoutingTable};

// Re-export transport types
pub use transport::{Dialer, Endpoint, EndpointConfig, FrameHandler, Link, LinkError, LinkId, QuicDialer};

// Re-export tunnel types
pub use tunnel::{
    ControllerConfig, ControllerStats, EventBus, EventKind, Exclusions, PeerSampler, SamplerError,
    StaticPeerSampler, Subscription, SubscriptionId, TunnelController, TunnelEngine, TunnelEvent,
    TunnelInfo,
};
