use futures_util::future::join_all;
use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

use super::error::{ShareError, ShareResult};
use super::protocol::{self, LIVENESS_PROBE};
use super::registry::{Device, DeviceRegistry};

/// Probe one peer: connect, send the probe, expect any non-empty reply in time
pub async fn probe(bind: IpAddr, target: SocketAddr, limit: Duration) -> ShareResult<()> {
    let attempt = async {
        let mut stream = protocol::connect(bind, target, limit).await?;
        protocol::write_message(&mut stream, LIVENESS_PROBE).await?;
        let reply = protocol::read_message(&mut stream, limit).await?;
        debug!("Liveness reply from {}: {:?}", target, reply);
        Ok::<(), ShareError>(())
    };

    timeout(limit, attempt)
        .await
        .map_err(|_| ShareError::Timeout(limit))?
}

/// Probe every registered device concurrently and drop the unreachable ones.
///
/// Completes once every probe has resolved; returns the removed devices.
pub async fn prune_unreachable(
    registry: &DeviceRegistry,
    port: u16,
    bind: IpAddr,
    limit: Duration,
) -> Vec<Device> {
    let devices = registry.list();
    if devices.is_empty() {
        return Vec::new();
    }

    debug!("Checking liveness of {} device(s)", devices.len());
    let probes = devices.into_iter().map(|device| async move {
        let result = probe(bind, SocketAddr::new(device.ip, port), limit).await;
        (device, result)
    });

    let mut removed = Vec::new();
    for (device, result) in join_all(probes).await {
        if let Err(e) = result {
            info!("Device {} ({}) is unreachable: {}", device.name, device.ip, e);
            if registry.remove(&device.ip).is_some() {
                removed.push(device);
            }
        }
    }
    removed
}
