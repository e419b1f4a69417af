//! Endpoint discovery.
//!
//! The connection asks an [`EndpointDiscoverer`] for a node every time it
//! (re)connects. Discovery never caches: a cluster discoverer re-resolves its
//! DNS name and re-reads gossip on every call, so a failover is always decided
//! on fresh member lists.
//!
//! # Node Selection
//!
//! [`select_best_node`] keeps alive members in connectable states and orders
//! them by how well their role matches the [`NodePreference`]. Members of equal
//! rank keep the order gossip returned them in, except for
//! [`NodePreference::Random`] which picks uniformly.

mod gossip;

pub use gossip::{ClusterMember, GossipClient, HttpGossipClient, VNodeState, parse_gossip};

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::with_discovery_policy;
use crate::settings::{ClusterSettings, ConnectionTarget};
use crate::types::NodePreference;

/// Where to open the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndpoints {
    pub tcp: SocketAddr,
    pub secure_tcp: Option<SocketAddr>,
}

impl NodeEndpoints {
    pub fn new(tcp: SocketAddr) -> Self {
        NodeEndpoints {
            tcp,
            secure_tcp: None,
        }
    }
}

impl std::fmt::Display for NodeEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.secure_tcp {
            Some(secure) => write!(f, "{} (secure {})", self.tcp, secure),
            None => write!(f, "{}", self.tcp),
        }
    }
}

#[async_trait]
pub trait EndpointDiscoverer: Send + Sync {
    /// Pick a node. `failed_endpoint` is the node the last connection went to.
    async fn discover(&self, failed_endpoint: Option<SocketAddr>) -> Result<NodeEndpoints>;
}

/// Build the discoverer for a connection target.
pub fn discoverer_for(target: &ConnectionTarget) -> Result<Box<dyn EndpointDiscoverer>> {
    Ok(match target {
        ConnectionTarget::SingleNode(endpoint) => {
            Box::new(StaticEndpointDiscoverer::new(NodeEndpoints::new(*endpoint)))
        }
        ConnectionTarget::Cluster(cluster) => Box::new(ClusterDnsEndpointDiscoverer::new(
            cluster.clone(),
            HttpGossipClient::new()?,
        )),
    })
}

/// Always returns the same node.
#[derive(Debug, Clone)]
pub struct StaticEndpointDiscoverer {
    endpoints: NodeEndpoints,
}

impl StaticEndpointDiscoverer {
    pub fn new(endpoints: NodeEndpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl EndpointDiscoverer for StaticEndpointDiscoverer {
    async fn discover(&self, _failed_endpoint: Option<SocketAddr>) -> Result<NodeEndpoints> {
        Ok(self.endpoints)
    }
}

/// Gossip-based discovery over seeds or a DNS name.
pub struct ClusterDnsEndpointDiscoverer<G: GossipClient> {
    settings: ClusterSettings,
    gossip: G,
}

impl<G: GossipClient> ClusterDnsEndpointDiscoverer<G> {
    pub fn new(settings: ClusterSettings, gossip: G) -> Self {
        Self { settings, gossip }
    }

    /// Gossip endpoints to query on this attempt, in order.
    async fn candidates(&self) -> Result<Vec<SocketAddr>> {
        if !self.settings.gossip_seeds.is_empty() {
            return Ok(self.settings.gossip_seeds.clone());
        }
        let dns = self.settings.cluster_dns.as_deref().ok_or_else(|| {
            Error::Config("cluster discovery needs gossip seeds or a DNS name".to_string())
        })?;
        let resolved: Vec<SocketAddr> =
            tokio::net::lookup_host((dns, self.settings.external_gossip_port))
                .await?
                .collect();
        debug!(dns, addresses = resolved.len(), "Resolved cluster DNS");
        Ok(resolved)
    }

    async fn discover_once(&self) -> Result<NodeEndpoints> {
        let candidates = self.candidates().await?;
        for candidate in candidates {
            match self
                .gossip
                .fetch_members(candidate, self.settings.gossip_timeout)
                .await
            {
                Ok(members) => {
                    if let Some(node) = select_best_node(&members, self.settings.node_preference)
                    {
                        return Ok(node);
                    }
                    debug!(%candidate, "Gossip had no suitable member");
                }
                Err(e) => {
                    debug!(%candidate, error = %e, "Gossip fetch failed");
                }
            }
        }
        Err(Error::CannotEstablishConnection(
            "no gossip candidate returned a suitable node".to_string(),
        ))
    }
}

#[async_trait]
impl<G: GossipClient> EndpointDiscoverer for ClusterDnsEndpointDiscoverer<G> {
    async fn discover(&self, failed_endpoint: Option<SocketAddr>) -> Result<NodeEndpoints> {
        debug!(?failed_endpoint, "Starting cluster discovery");
        let result = with_discovery_policy(
            || self.discover_once(),
            self.settings.discover_delay,
            self.settings.max_discover_attempts,
            |e: &Error| e.is_retriable() || matches!(e, Error::CannotEstablishConnection(_)),
        )
        .await;

        match result {
            Ok(node) => {
                info!(%node, preference = ?self.settings.node_preference, "Discovered node");
                Ok(node)
            }
            Err(e) => {
                warn!(error = %e, "Cluster discovery failed");
                Err(Error::CannotEstablishConnection(format!(
                    "failed to discover a node after {:?} attempts: {}",
                    self.settings.max_discover_attempts, e
                )))
            }
        }
    }
}

fn leader_rank(state: VNodeState) -> u8 {
    match state {
        VNodeState::Leader => 0,
        VNodeState::PreLeader => 1,
        VNodeState::Follower => 2,
        VNodeState::ResigningLeader => 3,
        VNodeState::Clone | VNodeState::CatchingUp | VNodeState::PreReplica => 4,
        VNodeState::ReadOnlyReplica
        | VNodeState::PreReadOnlyReplica
        | VNodeState::ReadOnlyLeaderless => 5,
        _ => 6,
    }
}

fn rank(state: VNodeState, preference: NodePreference) -> u8 {
    match preference {
        NodePreference::Leader | NodePreference::Random => leader_rank(state),
        NodePreference::Follower => {
            if state == VNodeState::Follower {
                0
            } else {
                1 + leader_rank(state)
            }
        }
        NodePreference::ReadOnlyReplica => {
            if state.is_read_only_replica() {
                0
            } else {
                1 + leader_rank(state)
            }
        }
    }
}

/// Choose the node to connect to, or `None` when no member qualifies.
pub fn select_best_node(
    members: &[ClusterMember],
    preference: NodePreference,
) -> Option<NodeEndpoints> {
    let mut candidates: Vec<&ClusterMember> = members
        .iter()
        .filter(|m| m.is_alive && m.state.is_connectable() && m.tcp_endpoint().is_some())
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let chosen = if preference == NodePreference::Random {
        candidates[fastrand::usize(..candidates.len())]
    } else {
        // Stable sort keeps gossip order among equal ranks.
        candidates.sort_by_key(|m| rank(m.state, preference));
        candidates[0]
    };

    let tcp = chosen.tcp_endpoint()?;
    Some(NodeEndpoints {
        tcp,
        secure_tcp: chosen.secure_tcp_endpoint(),
    })
}
