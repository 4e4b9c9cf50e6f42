use crate::protocol::{SessionId, TunnelId};
use crate::transport::{Link, LinkError, LinkId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use onionmesh_common::OnionError;
use tracing::debug;

/// One node's view of a tunnel: where it came from, where it goes, and the
/// session shared with the originator for this hop.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub prev: Option<Link>,
    pub next: Option<Link>,
    pub session: Option<SessionId>,
    /// Key announced by whoever asked this node to join the tunnel
    pub source_key: Option<Vec<u8>>,
    /// Set once the first real datum has been delivered here
    pub announced: bool,
}

impl Route {
    fn links(&self) -> impl Iterator<Item = &Link> {
        self.prev.iter().chain(self.next.iter())
    }

    fn uses(&self, link: LinkId) -> bool {
        self.links().any(|l| l.id() == link)
    }
}

/// Partial update applied by [`RoutingTable::upsert`]; `None` fields are left alone
#[derive(Debug, Clone, Default)]
pub struct RouteUpdate {
    pub prev: Option<Link>,
    pub next: Option<Link>,
    pub session: Option<SessionId>,
    pub source_key: Option<Vec<u8>>,
}

/// Concurrent TunnelId → Route map.
///
/// Updates to unrelated tunnels never contend on a global lock; only the
/// first registration of a TunnelId is exclusive.
#[derive(Default)]
pub struct RoutingTable {
    routes: DashMap<TunnelId, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a TunnelId. A second registration is a programming error.
    pub fn register(&self, tunnel: TunnelId) -> Result<(), RoutingError> {
        match self.routes.entry(tunnel) {
            Entry::Occupied(_) => Err(RoutingError::AlreadyRegistered(tunnel)),
            Entry::Vacant(slot) => {
                slot.insert(Route::default());
                Ok(())
            }
        }
    }

    /// Claim a TunnelId with its initial bindings in one step
    pub fn register_with(&self, tunnel: TunnelId, update: RouteUpdate) -> Result<(), RoutingError> {
        match self.routes.entry(tunnel) {
            Entry::Occupied(_) => Err(RoutingError::AlreadyRegistered(tunnel)),
            Entry::Vacant(slot) => {
                let mut route = Route::default();
                apply(&mut route, update);
                slot.insert(route);
                Ok(())
            }
        }
    }

    /// Set any subset of the bindings, creating the route if needed
    pub fn upsert(&self, tunnel: TunnelId, update: RouteUpdate) {
        let mut route = self.routes.entry(tunnel).or_default();
        apply(&mut route, update);
    }

    pub fn set_prev(&self, tunnel: TunnelId, link: Link) {
        self.upsert(
            tunnel,
            RouteUpdate {
                prev: Some(link),
                ..Default::default()
            },
        );
    }

    pub fn set_next(&self, tunnel: TunnelId, link: Link) {
        self.upsert(
            tunnel,
            RouteUpdate {
                next: Some(link),
                ..Default::default()
            },
        );
    }

    pub fn set_session(&self, tunnel: TunnelId, session: SessionId) {
        self.upsert(
            tunnel,
            RouteUpdate {
                session: Some(session),
                ..Default::default()
            },
        );
    }

    pub fn contains(&self, tunnel: TunnelId) -> bool {
        self.routes.contains_key(&tunnel)
    }

    pub fn has_prev(&self, tunnel: TunnelId) -> bool {
        self.routes
            .get(&tunnel)
            .map_or(false, |route| route.prev.is_some())
    }

    pub fn has_next(&self, tunnel: TunnelId) -> bool {
        self.routes
            .get(&tunnel)
            .map_or(false, |route| route.next.is_some())
    }

    pub fn has_session(&self, tunnel: TunnelId) -> bool {
        self.routes
            .get(&tunnel)
            .map_or(false, |route| route.session.is_some())
    }

    pub fn prev(&self, tunnel: TunnelId) -> Option<Link> {
        self.routes.get(&tunnel).and_then(|route| route.prev.clone())
    }

    pub fn next(&self, tunnel: TunnelId) -> Option<Link> {
        self.routes.get(&tunnel).and_then(|route| route.next.clone())
    }

    pub fn session(&self, tunnel: TunnelId) -> Option<SessionId> {
        self.routes.get(&tunnel).and_then(|route| route.session)
    }

    /// Snapshot of the whole route
    pub fn get(&self, tunnel: TunnelId) -> Option<Route> {
        self.routes.get(&tunnel).map(|route| route.clone())
    }

    /// Flag the route as announced. True only for the first caller.
    pub fn mark_announced(&self, tunnel: TunnelId) -> bool {
        match self.routes.get_mut(&tunnel) {
            Some(mut route) if !route.announced => {
                route.announced = true;
                true
            }
            _ => false,
        }
    }

    /// Tunnels whose prev or next binding is `link`
    pub fn tunnels_using(&self, link: LinkId) -> Vec<TunnelId> {
        self.routes
            .iter()
            .filter(|entry| entry.value().uses(link))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn tunnels(&self) -> Vec<TunnelId> {
        self.routes.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Remove the route and close its links.
    ///
    /// The entry is gone even when closing a link fails; the first failure is
    /// returned with its cause. Returns the removed route, if there was one.
    pub fn forget(&self, tunnel: TunnelId) -> Result<Option<Route>, RoutingError> {
        let Some((_, route)) = self.routes.remove(&tunnel) else {
            return Ok(None);
        };

        let mut failure = None;
        for link in route.links() {
            if let Err(e) = link.close() {
                failure.get_or_insert(e);
            }
        }
        debug!("Forgot {}", tunnel);

        match failure {
            Some(source) => Err(RoutingError::Disconnect { tunnel, source }),
            None => Ok(Some(route)),
        }
    }

    /// Close every held link and clear the table. Returns the routes dropped.
    pub fn shutdown(&self) -> Vec<(TunnelId, Route)> {
        let tunnels = self.tunnels();
        let mut dropped = Vec::with_capacity(tunnels.len());

        for tunnel in tunnels {
            if let Some((tunnel, route)) = self.routes.remove(&tunnel) {
                for link in route.links() {
                    if let Err(e) = link.close() {
                        debug!("Closing link of {} during shutdown: {}", tunnel, e);
                    }
                }
                dropped.push((tunnel, route));
            }
        }
        dropped
    }
}

fn apply(route: &mut Route, update: RouteUpdate) {
    if let Some(prev) = update.prev {
        route.prev = Some(prev);
    }
    if let Some(next) = update.next {
        route.next = Some(next);
    }
    if let Some(session) = update.session {
        route.session = Some(session);
    }
    if let Some(key) = update.source_key {
        route.source_key = Some(key);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("{0} is already registered")]
    AlreadyRegistered(TunnelId),

    #[error("Failed to disconnect {tunnel}: {source}")]
    Disconnect {
        tunnel: TunnelId,
        #[source]
        source: LinkError,
    },
}

impl From<RoutingError> for OnionError {
    fn from(err: RoutingError) -> Self {
        OnionError::tunneling_caused_by("routing table", err)
    }
}
