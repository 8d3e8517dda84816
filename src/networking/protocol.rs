use log::debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use super::error::{ShareError, ShareResult};

// Discovery and handshake literals
pub const ANNOUNCEMENT: &str = "Discovery: Who is out there?";
pub const RESPONSE_TOKEN: &str = "I am here!";
pub const NAME_PREFIX: &str = "My name is ";
pub const LIVENESS_PROBE: &str = "Are you still there?";
pub const LIVENESS_REPLY: &str = "Still here!";

// Transfer literals
pub const SEND_PREFIX: &str = "SEND ";
pub const AUTHORIZED: &str = "OK";
pub const DENIED: &str = "NO";
pub const END_OF_STREAM: &[u8] = b"End of file";

/// Every control message must fit in a single read of this size
pub const MESSAGE_BUFFER_SIZE: usize = 1024;

pub fn name_message(name: &str) -> String {
    format!("{}{}", NAME_PREFIX, name)
}

/// Extract the name from a `My name is <name>` message
pub fn parse_name_message(message: &str) -> Option<&str> {
    let name = message.strip_prefix(NAME_PREFIX)?.trim_end();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

pub fn send_request(file_name: &str) -> String {
    format!("{}{}", SEND_PREFIX, file_name)
}

/// Extract the raw (unsanitized) file name from a `SEND <fileName>` request
pub fn parse_send_request(message: &str) -> Option<&str> {
    message.strip_prefix(SEND_PREFIX).map(str::trim_end)
}

/// Read one control message with a single bounded read.
///
/// Fragmented delivery is not reassembled: whatever the first read returns is
/// the message. A closed connection is reported as a protocol error.
pub async fn read_message<S>(stream: &mut S, limit: Duration) -> ShareResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = [0u8; MESSAGE_BUFFER_SIZE];
    let n = timeout(limit, stream.read(&mut buffer))
        .await
        .map_err(|_| ShareError::Timeout(limit))??;

    if n == 0 {
        return Err(ShareError::protocol("connection closed before a message arrived"));
    }

    String::from_utf8(buffer[..n].to_vec())
        .map_err(|_| ShareError::protocol("message is not valid UTF-8"))
}

/// Write one control message as a single write
pub async fn write_message<S>(stream: &mut S, message: &str) -> ShareResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(message.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a transfer payload: 8-byte big-endian length, the bytes, then the trailer
pub async fn write_payload<S>(stream: &mut S, data: &[u8]) -> ShareResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&(data.len() as u64).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.write_all(END_OF_STREAM).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the length header that precedes a transfer payload
pub async fn read_payload_len<S>(stream: &mut S, limit: Duration) -> ShareResult<u64>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    timeout(limit, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| ShareError::Timeout(limit))??;
    Ok(u64::from_be_bytes(len_buf))
}

/// Consume the end-of-stream trailer. Returns false if it is missing or wrong.
pub async fn read_trailer<S>(stream: &mut S, limit: Duration) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut trailer = [0u8; END_OF_STREAM.len()];
    match timeout(limit, stream.read_exact(&mut trailer)).await {
        Ok(Ok(_)) => &trailer[..] == END_OF_STREAM,
        Ok(Err(e)) => {
            debug!("Failed to read end-of-stream trailer: {}", e);
            false
        }
        Err(_) => false,
    }
}

/// Open a TCP connection, using `bind` as the source address when it is set
pub async fn connect(bind: IpAddr, target: SocketAddr, limit: Duration) -> ShareResult<TcpStream> {
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if !bind.is_unspecified() && bind.is_ipv4() == target.is_ipv4() {
        socket.bind(SocketAddr::new(bind, 0))?;
    }

    let stream = timeout(limit, socket.connect(target))
        .await
        .map_err(|_| ShareError::Timeout(limit))??;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_name_message_parsing() {
        assert_eq!(name_message("alice:laptop"), "My name is alice:laptop");
        assert_eq!(parse_name_message("My name is alice:laptop"), Some("alice:laptop"));
        assert_eq!(parse_name_message("My name is bob\n"), Some("bob"));
        assert_eq!(parse_name_message("My name is "), None);
        assert_eq!(parse_name_message("my name is bob"), None);
        assert_eq!(parse_name_message("I am here!"), None);
    }

    #[test]
    fn test_send_request_parsing() {
        assert_eq!(send_request("notes.txt"), "SEND notes.txt");
        assert_eq!(parse_send_request("SEND notes.txt"), Some("notes.txt"));
        assert_eq!(parse_send_request("SEND my file.pdf"), Some("my file.pdf"));
        assert_eq!(parse_send_request("GET notes.txt"), None);
    }

    #[tokio::test]
    async fn test_read_message_reports_closed_connection() {
        let (mut client, server) = duplex(64);
        drop(server);

        let result = read_message(&mut client, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ShareError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_message_times_out() {
        let (mut client, _server) = duplex(64);

        let result = read_message(&mut client, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ShareError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_payload_containing_marker_is_not_truncated() -> ShareResult<()> {
        let (mut writer, mut reader) = duplex(1024);
        let data = b"before End of file after".to_vec();

        let expected = data.clone();
        let sender = tokio::spawn(async move { write_payload(&mut writer, &data).await });

        let len = read_payload_len(&mut reader, Duration::from_secs(1)).await?;
        assert_eq!(len, expected.len() as u64);

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        assert_eq!(body, expected);
        assert!(read_trailer(&mut reader, Duration::from_secs(1)).await);

        sender.await.expect("sender task panicked")?;
        Ok(())
    }
}
