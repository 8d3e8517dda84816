use log::debug;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::{ShareError, ShareResult};
use super::protocol::{self, RESPONSE_TOKEN};
use super::registry::{Device, DeviceRegistry};

/// Run the side that heard the announcement and opened the connection.
///
/// Sends the response token, reads the peer's name, then sends ours.
pub async fn initiate<S>(
    stream: &mut S,
    peer: IpAddr,
    local_name: &str,
    registry: &DeviceRegistry,
    limit: Duration,
) -> ShareResult<Device>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_message(stream, RESPONSE_TOKEN).await?;
    let name = read_peer_name(stream, peer, limit).await?;
    protocol::write_message(stream, &protocol::name_message(local_name)).await?;

    Ok(register(registry, peer, name))
}

/// Run the side that accepted the connection after the response token arrived.
///
/// Sends our name first, then reads the peer's.
pub async fn respond<S>(
    stream: &mut S,
    peer: IpAddr,
    local_name: &str,
    registry: &DeviceRegistry,
    limit: Duration,
) -> ShareResult<Device>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_message(stream, &protocol::name_message(local_name)).await?;
    let name = read_peer_name(stream, peer, limit).await?;

    Ok(register(registry, peer, name))
}

async fn read_peer_name<S>(stream: &mut S, peer: IpAddr, limit: Duration) -> ShareResult<String>
where
    S: AsyncRead + Unpin,
{
    let message = protocol::read_message(stream, limit).await?;
    match protocol::parse_name_message(&message) {
        Some(name) => Ok(name.to_string()),
        None => {
            debug!("Malformed name message from {}: {:?}", peer, message);
            Err(ShareError::protocol(format!("expected a name message, got {:?}", message)))
        }
    }
}

fn register(registry: &DeviceRegistry, peer: IpAddr, name: String) -> Device {
    let device = Device::new(peer, name);
    registry.insert(device.clone());
    device
}
