//! Gossip model and the HTTP client that fetches it.
//!
//! Nodes publish their view of the cluster on `GET /gossip` as JSON:
//!
//! ```json
//! { "members": [ { "instanceId": "...", "state": "Leader", "isAlive": true,
//!                  "externalTcpIp": "10.0.0.1", "externalTcpPort": 1113,
//!                  "externalSecureTcpPort": 0, "timeStamp": "..." } ] }
//! ```
//!
//! Unknown fields are ignored and unknown states map to [`VNodeState::Unknown`].

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::constants::MAX_GOSSIP_RESPONSE_SIZE;
use crate::error::{Error, Result};
use crate::retry::gossip_read_policy;

/// Role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum VNodeState {
    Initializing,
    DiscoverLeader,
    PreReplica,
    CatchingUp,
    Clone,
    #[serde(alias = "Slave")]
    Follower,
    #[serde(alias = "PreMaster")]
    PreLeader,
    #[serde(alias = "Master")]
    Leader,
    Manager,
    ShuttingDown,
    Shutdown,
    ReadOnlyLeaderless,
    PreReadOnlyReplica,
    ReadOnlyReplica,
    ResigningLeader,
    #[serde(other)]
    Unknown,
}

impl VNodeState {
    /// States a client must never connect to.
    pub fn is_connectable(self) -> bool {
        !matches!(
            self,
            VNodeState::Manager | VNodeState::ShuttingDown | VNodeState::Shutdown
        )
    }

    pub fn is_read_only_replica(self) -> bool {
        matches!(
            self,
            VNodeState::ReadOnlyLeaderless
                | VNodeState::PreReadOnlyReplica
                | VNodeState::ReadOnlyReplica
        )
    }
}

/// One member as reported by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    pub state: VNodeState,
    pub is_alive: bool,
    pub external_tcp_ip: String,
    pub external_tcp_port: u16,
    #[serde(default)]
    pub external_secure_tcp_port: u16,
    /// Last time the reporting node heard from this member.
    #[serde(default)]
    pub time_stamp: Option<String>,
}

impl ClusterMember {
    /// Plain TCP endpoint, if the advertised address is an IP.
    pub fn tcp_endpoint(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.external_tcp_ip, self.external_tcp_port)
            .parse()
            .ok()
    }

    pub fn secure_tcp_endpoint(&self) -> Option<SocketAddr> {
        if self.external_secure_tcp_port == 0 {
            return None;
        }
        format!("{}:{}", self.external_tcp_ip, self.external_secure_tcp_port)
            .parse()
            .ok()
    }
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    members: Vec<ClusterMember>,
}

/// Parse a gossip JSON document.
pub fn parse_gossip(body: &[u8]) -> Result<Vec<ClusterMember>> {
    let info: ClusterInfo = serde_json::from_slice(body)?;
    Ok(info.members)
}

/// Source of cluster member lists.
#[async_trait]
pub trait GossipClient: Send + Sync {
    async fn fetch_members(
        &self,
        endpoint: SocketAddr,
        deadline: Duration,
    ) -> Result<Vec<ClusterMember>>;
}

/// Reads `GET /gossip` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpGossipClient {
    client: Client,
}

impl HttpGossipClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("cannot build gossip HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn fetch_once(
        &self,
        endpoint: SocketAddr,
        deadline: Duration,
    ) -> Result<Vec<ClusterMember>> {
        let url = format!("http://{}/gossip?format=json", endpoint);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(deadline)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ServerError(format!(
                "gossip endpoint {} answered {}",
                endpoint, status
            )));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_GOSSIP_RESPONSE_SIZE as u64)
        {
            return Err(oversized(endpoint));
        }

        let body = response.bytes().await.map_err(http_error)?;
        if body.len() > MAX_GOSSIP_RESPONSE_SIZE {
            return Err(oversized(endpoint));
        }
        parse_gossip(&body)
    }
}

#[async_trait]
impl GossipClient for HttpGossipClient {
    async fn fetch_members(
        &self,
        endpoint: SocketAddr,
        deadline: Duration,
    ) -> Result<Vec<ClusterMember>> {
        let attempt = (|| self.fetch_once(endpoint, deadline))
            .retry(gossip_read_policy())
            .when(|e: &Error| matches!(e, Error::IoError(std::io::ErrorKind::ConnectionReset)));

        match timeout(deadline, attempt).await {
            Ok(Ok(members)) => {
                debug!(%endpoint, members = members.len(), "Fetched gossip");
                Ok(members)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::IoError(std::io::ErrorKind::TimedOut)),
        }
    }
}

/// Map a transport-level HTTP failure. Broken exchanges count as resets.
fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::IoError(std::io::ErrorKind::TimedOut)
    } else if e.is_connect() {
        Error::IoError(std::io::ErrorKind::ConnectionRefused)
    } else {
        Error::IoError(std::io::ErrorKind::ConnectionReset)
    }
}

fn oversized(endpoint: SocketAddr) -> Error {
    Error::MissingData(format!(
        "gossip response from {} exceeds {} bytes",
        endpoint, MAX_GOSSIP_RESPONSE_SIZE
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with a canned response.
    async fn serve_once(response: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /gossip"));
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        addr
    }

    const GOSSIP: &str = r#"{
        "members": [
            {"instanceId": "5f2a3c4e-0000-4000-8000-000000000001", "state": "Leader",
             "isAlive": true, "externalTcpIp": "127.0.0.1", "externalTcpPort": 1113,
             "externalSecureTcpPort": 0, "timeStamp": "2024-01-01T00:00:00Z",
             "lastCommitPosition": 42},
            {"state": "Slave", "isAlive": false, "externalTcpIp": "127.0.0.2",
             "externalTcpPort": 1113},
            {"state": "SomethingNew", "isAlive": true, "externalTcpIp": "127.0.0.3",
             "externalTcpPort": 1113, "externalSecureTcpPort": 1114}
        ],
        "serverIp": "127.0.0.1",
        "serverPort": 2113
    }"#;

    #[test]
    fn test_parse_gossip() {
        let members = parse_gossip(GOSSIP.as_bytes()).unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].state, VNodeState::Leader);
        assert_eq!(members[1].state, VNodeState::Follower);
        assert!(!members[1].is_alive);
        assert_eq!(members[2].state, VNodeState::Unknown);
        assert_eq!(
            members[2].secure_tcp_endpoint(),
            Some("127.0.0.3:1114".parse().unwrap())
        );
        assert_eq!(members[0].secure_tcp_endpoint(), None);
    }

    #[test]
    fn test_parse_gossip_garbage() {
        assert!(parse_gossip(b"not json").is_err());
    }

    #[test]
    fn test_connectable_states() {
        assert!(VNodeState::Leader.is_connectable());
        assert!(VNodeState::Follower.is_connectable());
        assert!(!VNodeState::Manager.is_connectable());
        assert!(!VNodeState::ShuttingDown.is_connectable());
        assert!(!VNodeState::Shutdown.is_connectable());
    }

    #[tokio::test]
    async fn test_http_gossip_client() {
        let addr = serve_once(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            GOSSIP.len(),
            GOSSIP
        ))
        .await;

        let members = HttpGossipClient::new()
            .unwrap()
            .fetch_members(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].state, VNodeState::Leader);
    }

    #[tokio::test]
    async fn test_http_gossip_client_chunked_body() {
        let (head, tail) = GOSSIP.split_at(GOSSIP.len() / 2);
        let addr = serve_once(format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
            head.len(),
            head,
            tail.len(),
            tail
        ))
        .await;

        let members = HttpGossipClient::new()
            .unwrap()
            .fetch_members(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
    }

    #[tokio::test]
    async fn test_http_gossip_client_error_status() {
        let addr = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
        )
        .await;

        let result = HttpGossipClient::new()
            .unwrap()
            .fetch_members(addr, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::ServerError(m)) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_http_gossip_client_rejects_oversized_body() {
        let addr = serve_once(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            MAX_GOSSIP_RESPONSE_SIZE + 1
        ))
        .await;

        let result = HttpGossipClient::new()
            .unwrap()
            .fetch_members(addr, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::MissingData(_))));
    }

    #[tokio::test]
    async fn test_http_gossip_client_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and never answer.
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = HttpGossipClient::new()
            .unwrap()
            .fetch_members(addr, Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(Error::IoError(std::io::ErrorKind::TimedOut)));
    }
}
