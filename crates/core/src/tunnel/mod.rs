//! Tunnel construction, forwarding and lifecycle.

mod controller;
mod engine;
mod events;
mod forwarding;
mod handshake;
mod sampler;

pub use controller::{ControllerConfig, ControllerStats, TunnelController, TunnelInfo};
pub use engine::TunnelEngine;
pub use events::{EventBus, EventKind, Subscription, SubscriptionId, TunnelEvent};
pub use sampler::{Exclusions, PeerSampler, SamplerError, StaticPeerSampler};

#[cfg(test)]
mod tests;
