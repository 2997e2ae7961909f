use crate::error::MonitorError;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause between enumerations that found nobody to register with.
pub const REGISTRATION_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub host_name: String,
    pub ip_address: String,
    pub os: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_name: String,
    pub host_name: String,
    pub ip_address: String,
    pub port_no: u16,
}

impl DeviceInfo {
    pub fn create_service(&self, service_name: &str, port_no: u16) -> ServiceInfo {
        ServiceInfo {
            service_name: service_name.to_string(),
            host_name: self.host_name.clone(),
            ip_address: self.ip_address.clone(),
            port_no,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerDevice {
    pub base_url: String,
    pub info: DeviceInfo,
}

/// Discovery collaborator: who am I, who is out there, tell them about me.
#[async_trait]
pub trait PeerFinder: Send + Sync {
    async fn device_info(&self) -> anyhow::Result<DeviceInfo>;

    async fn find_peers(&self) -> anyhow::Result<Vec<PeerDevice>>;

    async fn register(&self, peers: &[PeerDevice], services: &[ServiceInfo]) -> anyhow::Result<()>;
}

/// [`PeerFinder`] that probes a fixed list of peer base URLs over HTTP.
pub struct HttpFinder {
    peers: Vec<String>,
    client: reqwest::Client,
}

impl HttpFinder {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn probe(&self, base_url: &str) -> anyhow::Result<Option<PeerDevice>> {
        let response = self
            .client
            .get(format!("{base_url}/device/info"))
            .send()
            .await?;
        if !response.status().is_success() {
            debug!(peer = base_url, status = %response.status(), "Peer did not answer device info");
            return Ok(None);
        }
        let info: DeviceInfo = response.json().await?;
        Ok(Some(PeerDevice {
            base_url: base_url.to_string(),
            info,
        }))
    }
}

#[async_trait]
impl PeerFinder for HttpFinder {
    async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
        Ok(DeviceInfo {
            host_name: local_host_name(),
            ip_address: local_ip_address().await?,
            os: std::env::consts::OS.to_string(),
        })
    }

    async fn find_peers(&self) -> anyhow::Result<Vec<PeerDevice>> {
        let mut found = Vec::new();
        let mut last_error = None;
        for base_url in &self.peers {
            match self.probe(base_url).await {
                Ok(Some(peer)) => found.push(peer),
                Ok(None) => {}
                Err(e) => {
                    debug!(peer = %base_url, error = %e, "Peer unreachable");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if found.is_empty() => {
                Err(MonitorError::Discovery(format!("no peer reachable: {e}")).into())
            }
            _ => Ok(found),
        }
    }

    async fn register(&self, peers: &[PeerDevice], services: &[ServiceInfo]) -> anyhow::Result<()> {
        let mut failures = 0;
        for peer in peers {
            let result = self
                .client
                .post(format!("{}/service/add", peer.base_url))
                .json(services)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                warn!(peer = %peer.base_url, error = %e, "Service registration rejected");
                failures += 1;
            }
        }
        if failures > 0 && failures == peers.len() {
            return Err(MonitorError::Discovery("every peer rejected the registration".to_string()).into());
        }
        Ok(())
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_default()
}

/// Address of the interface that routes outward. Connecting a UDP socket
/// sends nothing, it only picks the route.
async fn local_ip_address() -> anyhow::Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    Registering,
}

/// Advertises this service to peer devices, retrying until at least one peer
/// has been asked to register it. Only one registration runs at a time.
pub struct ServiceRegistrar {
    finder: Arc<dyn PeerFinder>,
    service_name: String,
    port: u16,
    registering: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ServiceRegistrar {
    pub fn new(finder: Arc<dyn PeerFinder>, service_name: impl Into<String>, port: u16) -> Self {
        Self {
            finder,
            service_name: service_name.into(),
            port,
            registering: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RegistrationState {
        if self.registering.load(Ordering::Acquire) {
            RegistrationState::Registering
        } else {
            RegistrationState::Idle
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<bool> {
        tokio::spawn(async move { self.register_service().await })
    }

    /// Returns `false` without doing anything when a registration is already
    /// in flight, `true` once registration has been sent to a non-empty peer set.
    pub async fn register_service(&self) -> bool {
        if self
            .registering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Service registration already in progress");
            return false;
        }
        let _in_flight = InFlight(&self.registering);

        debug!("Starting service registration");
        loop {
            let device = match self.finder.device_info().await {
                Ok(device) => device,
                Err(e) => {
                    error!(error = %e, "Error getting device info");
                    DeviceInfo::default()
                }
            };
            let service = device.create_service(&self.service_name, self.port);
            if service.ip_address.is_empty() {
                debug!("No IP address found for the service");
            } else {
                debug!(ip = %service.ip_address, "Using IP address");
            }

            match self.finder.find_peers().await {
                Err(e) => error!(error = %e, "Error getting list of devices"),
                Ok(peers) if peers.is_empty() => debug!("No peers found"),
                Ok(peers) => {
                    debug!(peers = peers.len(), "Registering the service");
                    if let Err(e) = self.finder.register(&peers, &[service]).await {
                        warn!(error = %e, "Service registration reported an error");
                    }
                    break;
                }
            }
            tokio::time::sleep(REGISTRATION_BACKOFF).await;
        }
        info!(service = %self.service_name, port = self.port, "Completed service registration");
        true
    }
}
