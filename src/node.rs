// src/node.rs
//
// One running share node: discovery plus the transfer server, behind the
// small surface a front-end needs (device list, send, refresh).

use anyhow::Result;
use log::{info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::networking::{
    AuthorizeCallback, Device, DeviceRegistry, DiscoveryService, FileTransferManager, ShareError,
    StatusCallback,
};

pub struct LocalNode {
    config: Arc<SessionConfig>,
    discovery: DiscoveryService,
    transfers: FileTransferManager,
}

impl LocalNode {
    /// Create a node. `authorize` is only consulted for peers in the device
    /// registry, unless `accept_unknown_peers` is set.
    pub fn new(config: SessionConfig, authorize: AuthorizeCallback) -> Self {
        let config = Arc::new(config);
        let discovery = DiscoveryService::new(config.clone());

        let registry = discovery.registry();
        let accept_unknown_peers = config.accept_unknown_peers;
        let gated: AuthorizeCallback = Arc::new(move |peer: IpAddr, file_name: &str| {
            if !accept_unknown_peers && !registry.contains(&peer) {
                warn!("Refusing {} from unknown peer {}", file_name, peer);
                return false;
            }
            authorize(peer, file_name)
        });

        Self {
            transfers: FileTransferManager::new(config.clone(), gated),
            config,
            discovery,
        }
    }

    /// Report incoming transfer events to `callback`
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.transfers = self.transfers.with_status_callback(callback);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> DeviceRegistry {
        self.discovery.registry()
    }

    /// Start discovery and the transfer server
    pub async fn start(&self) -> Result<()> {
        self.discovery.start().await?;

        if let Err(e) = self.transfers.start_server().await {
            self.discovery.stop().await;
            return Err(e);
        }

        info!("Node '{}' is up", self.config.local_name);
        Ok(())
    }

    /// Stop every service; returns once all sockets are released
    pub async fn stop(&self) {
        self.transfers.stop_server().await;
        self.discovery.stop().await;
        info!("Node '{}' stopped", self.config.local_name);
    }

    pub fn transfer_address(&self) -> Option<SocketAddr> {
        self.transfers.server_address()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.discovery.registry().list()
    }

    pub fn device_by_ip(&self, ip: IpAddr) -> Option<Device> {
        self.discovery.registry().get(&ip)
    }

    /// First device (in list order) announcing `name`
    pub fn device_by_name(&self, name: &str) -> Option<Device> {
        self.list_devices().into_iter().find(|device| device.name == name)
    }

    /// Announce again, restart dead listeners and prune unreachable devices
    pub async fn refresh(&self) -> Result<()> {
        self.discovery.reload().await
    }

    /// Send `path` to `ip` and describe the outcome for display
    pub async fn send_file<P: AsRef<Path>>(&self, path: P, ip: IpAddr) -> String {
        match self.transfers.send_file(path, ip).await {
            Ok(receipt) => {
                info!(
                    "Sent {} ({} bytes) to {} as transfer {}",
                    receipt.file_name, receipt.bytes_sent, ip, receipt.transfer_id
                );
                "File sent successfully".to_string()
            }
            Err(ShareError::FileIo { source, .. }) => format!("Failed to get file: {}", source),
            Err(ShareError::AuthorizationDenied) => {
                "Failed to send file: Authorization denied".to_string()
            }
            Err(e) => format!("Failed to send file: {}", e),
        }
    }
}
