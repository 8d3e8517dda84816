use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::error::{ShareError, ShareResult};
use super::protocol::{self, AUTHORIZED, DENIED, END_OF_STREAM};
use crate::config::SessionConfig;

// Constants for file transfer
const CHUNK_SIZE: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Decides whether a peer may send us a file: `(peer_ip, file_name) -> accepted`.
///
/// Called on a blocking thread, so it may wait for a human.
pub type AuthorizeCallback = Arc<dyn Fn(IpAddr, &str) -> bool + Send + Sync>;

/// Receives status updates about incoming transfers
pub type StatusCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Status of an incoming transfer, reported via the status callback
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    /// A peer asked to send a file
    Requested {
        transfer_id: String,
        peer: IpAddr,
        file_name: String,
    },
    /// The request was refused
    Rejected {
        transfer_id: String,
        peer: IpAddr,
        file_name: String,
    },
    /// The file arrived and was saved
    Completed {
        transfer_id: String,
        peer: IpAddr,
        path: PathBuf,
        bytes_received: u64,
        elapsed_seconds: f32,
    },
    /// The request was accepted but nothing usable arrived
    Failed {
        transfer_id: String,
        peer: IpAddr,
        error: String,
    },
}

/// Outcome of a successful outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub file_name: String,
    pub bytes_sent: u64,
}

/// Sends files to peers and serves authorized incoming transfers
pub struct FileTransferManager {
    config: Arc<SessionConfig>,
    authorize: AuthorizeCallback,
    status_callback: Option<StatusCallback>,
    running: Arc<AtomicBool>,
    server: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

/// State shared with the connection handlers
#[derive(Clone)]
struct Receiver {
    config: Arc<SessionConfig>,
    authorize: AuthorizeCallback,
    status_callback: Option<StatusCallback>,
}

impl FileTransferManager {
    /// Create a new file transfer manager
    pub fn new(config: Arc<SessionConfig>, authorize: AuthorizeCallback) -> Self {
        Self {
            config,
            authorize,
            status_callback: None,
            running: Arc::new(AtomicBool::new(false)),
            server: Mutex::new(None),
        }
    }

    /// Report incoming transfer events to `callback`
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.status_callback = Some(callback);
        self
    }

    fn server(&self) -> MutexGuard<'_, Option<(SocketAddr, JoinHandle<()>)>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start listening for transfer requests. Returns the bound address.
    pub async fn start_server(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.server_address() {
            debug!("File transfer server already running on {}", addr);
            return Ok(addr);
        }

        let listener = TcpListener::bind((self.config.bind_address, self.config.transfer_port))
            .await
            .with_context(|| format!("Failed to bind transfer port {}", self.config.transfer_port))?;
        let server_addr = listener.local_addr()?;

        fs::create_dir_all(&self.config.receive_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create receive directory {}",
                    self.config.receive_dir.display()
                )
            })?;

        self.running.store(true, Ordering::SeqCst);
        let receiver = Receiver {
            config: self.config.clone(),
            authorize: self.authorize.clone(),
            status_callback: self.status_callback.clone(),
        };
        let task = tokio::spawn(listen_for_transfer_requests(
            listener,
            receiver,
            self.running.clone(),
        ));

        *self.server() = Some((server_addr, task));
        info!("File transfer server started on {}", server_addr);
        Ok(server_addr)
    }

    /// Stop the server and wait for its accept loop to exit
    pub async fn stop_server(&self) {
        self.running.store(false, Ordering::SeqCst);

        let server = self.server().take();
        if let Some((addr, task)) = server {
            if let Err(e) = task.await {
                error!("File transfer server task failed: {}", e);
            }
            info!("File transfer server on {} stopped", addr);
        }
    }

    /// Get the address of the file transfer server
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server().as_ref().map(|(addr, _)| *addr)
    }

    /// Send a file to a peer's transfer port.
    ///
    /// The file is read fully before any connection is made. The payload is
    /// only streamed once the receiver has answered `OK`.
    pub async fn send_file<P: AsRef<Path>>(
        &self,
        path: P,
        destination: IpAddr,
    ) -> ShareResult<TransferReceipt> {
        let path = path.as_ref();
        let data = fs::read(path)
            .await
            .map_err(|e| ShareError::file_io(path, e))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                let reason = io::Error::new(io::ErrorKind::InvalidInput, "path has no file name");
                ShareError::file_io(path, reason)
            })?;

        let transfer_id = Uuid::new_v4().to_string();
        let target = SocketAddr::new(destination, self.config.transfer_port);
        info!(
            "Requesting transfer {} of {} ({} bytes) to {}",
            transfer_id,
            file_name,
            data.len(),
            target
        );

        let mut stream =
            protocol::connect(self.config.bind_address, target, self.config.connect_timeout).await?;
        protocol::write_message(&mut stream, &protocol::send_request(&file_name)).await?;

        let reply = protocol::read_message(&mut stream, self.config.authorization_timeout).await?;
        match reply.trim_end() {
            AUTHORIZED => {}
            DENIED => {
                info!("Transfer {} refused by {}", transfer_id, destination);
                return Err(ShareError::AuthorizationDenied);
            }
            other => {
                return Err(ShareError::protocol(format!(
                    "unexpected reply to transfer request: {:?}",
                    other
                )))
            }
        }

        let start_time = Instant::now();
        protocol::write_payload(&mut stream, &data).await?;
        stream.shutdown().await?;

        // The receiver closes once the file is on disk
        let mut scratch = [0u8; 16];
        if timeout(self.config.receive_timeout, stream.read(&mut scratch)).await.is_err() {
            debug!("Receiver of transfer {} did not close the connection", transfer_id);
        }

        let elapsed = start_time.elapsed().as_secs_f32();
        let throughput = if elapsed > 0.0 {
            (data.len() as f32 / elapsed) / (1024.0 * 1024.0)
        } else {
            0.0
        };
        info!(
            "File transfer complete: {} ({:.2} MB/s)",
            path.display(),
            throughput
        );

        Ok(TransferReceipt {
            transfer_id,
            file_name,
            bytes_sent: data.len() as u64,
        })
    }
}

impl Drop for FileTransferManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn listen_for_transfer_requests(
    listener: TcpListener,
    receiver: Receiver,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match timeout(POLL_INTERVAL, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!("Error accepting connection: {}", e);
                sleep(ERROR_BACKOFF).await;
            }
            Ok(Ok((socket, addr))) => {
                debug!("New file transfer connection from {}", addr);
                let handler = receiver.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_request(socket, addr.ip()).await {
                        warn!("Error handling file transfer from {}: {}", addr, e);
                    }
                });
            }
        }
    }

    debug!("Shutting down file transfer server");
}

impl Receiver {
    fn notify(&self, status: TransferStatus) {
        if let Some(callback) = &self.status_callback {
            callback(status);
        }
    }

    /// Serve one connection on the transfer port
    async fn handle_request(&self, mut socket: TcpStream, peer: IpAddr) -> ShareResult<()> {
        let request = protocol::read_message(&mut socket, self.config.handshake_timeout).await?;
        let Some(raw_name) = protocol::parse_send_request(&request) else {
            debug!("Ignoring non-transfer request from {}: {:?}", peer, request);
            return Ok(());
        };

        let transfer_id = Uuid::new_v4().to_string();
        let Some(file_name) = sanitize_file_name(raw_name) else {
            warn!("Refusing transfer from {} with unusable file name {:?}", peer, raw_name);
            protocol::write_message(&mut socket, DENIED).await?;
            return Err(ShareError::protocol(format!("unusable file name {:?}", raw_name)));
        };

        self.notify(TransferStatus::Requested {
            transfer_id: transfer_id.clone(),
            peer,
            file_name: file_name.clone(),
        });

        let authorize = self.authorize.clone();
        let asked_name = file_name.clone();
        let accepted = tokio::task::spawn_blocking(move || authorize(peer, &asked_name))
            .await
            .unwrap_or_else(|e| {
                error!("Authorization callback failed: {}", e);
                false
            });

        if !accepted {
            info!("Refused {} from {}", file_name, peer);
            protocol::write_message(&mut socket, DENIED).await?;
            self.notify(TransferStatus::Rejected {
                transfer_id,
                peer,
                file_name,
            });
            return Ok(());
        }

        protocol::write_message(&mut socket, AUTHORIZED).await?;
        let start_time = Instant::now();

        let received = receive_and_save_file(
            &mut socket,
            &file_name,
            &self.config.receive_dir,
            self.config.receive_timeout,
        )
        .await;

        match received {
            Ok(Some((path, bytes_received))) => {
                self.notify(TransferStatus::Completed {
                    transfer_id,
                    peer,
                    path,
                    bytes_received,
                    elapsed_seconds: start_time.elapsed().as_secs_f32(),
                });
                Ok(())
            }
            Ok(None) => {
                self.notify(TransferStatus::Failed {
                    transfer_id,
                    peer,
                    error: "empty payload".to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.notify(TransferStatus::Failed {
                    transfer_id,
                    peer,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// Receive one payload and write it under `receive_dir`.
///
/// Returns the saved path and size, or `None` when the payload was empty (in
/// which case nothing is written). A partial file is removed on failure.
pub async fn receive_and_save_file<S>(
    stream: &mut S,
    file_name: &str,
    receive_dir: &Path,
    read_timeout: Duration,
) -> ShareResult<Option<(PathBuf, u64)>>
where
    S: AsyncRead + Unpin,
{
    let file_name = sanitize_file_name(file_name)
        .ok_or_else(|| ShareError::protocol(format!("unusable file name {:?}", file_name)))?;

    let declared = protocol::read_payload_len(stream, read_timeout).await?;
    if declared == 0 {
        protocol::read_trailer(stream, read_timeout).await;
        error!("Received an empty payload for {}, nothing saved", file_name);
        return Ok(None);
    }

    fs::create_dir_all(receive_dir)
        .await
        .map_err(|e| ShareError::file_io(receive_dir, e))?;
    let (destination, mut file) = open_unique_file(receive_dir, &file_name)
        .await
        .map_err(|e| ShareError::file_io(receive_dir.join(&file_name), e))?;

    let copied = copy_payload(stream, &mut file, &destination, declared, read_timeout).await;
    drop(file);

    if let Err(e) = copied {
        if let Err(cleanup) = fs::remove_file(&destination).await {
            warn!("Failed to remove partial file {}: {}", destination.display(), cleanup);
        }
        return Err(e);
    }

    if !protocol::read_trailer(stream, read_timeout).await {
        warn!(
            "Payload for {} was not followed by {:?}",
            file_name,
            String::from_utf8_lossy(END_OF_STREAM)
        );
    }

    info!("File received: {} ({} bytes)", destination.display(), declared);
    Ok(Some((destination, declared)))
}

async fn copy_payload<S>(
    stream: &mut S,
    file: &mut File,
    destination: &Path,
    declared: u64,
    read_timeout: Duration,
) -> ShareResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE.min(declared as usize)];
    let mut received = 0u64;

    while received < declared {
        let max_bytes = std::cmp::min(buffer.len() as u64, declared - received) as usize;
        let n = timeout(read_timeout, stream.read(&mut buffer[..max_bytes]))
            .await
            .map_err(|_| ShareError::Timeout(read_timeout))??;

        if n == 0 {
            return Err(ShareError::protocol(format!(
                "connection closed after {} of {} bytes",
                received, declared
            )));
        }

        file.write_all(&buffer[..n])
            .await
            .map_err(|e| ShareError::file_io(destination, e))?;
        received += n as u64;
    }

    file.flush()
        .await
        .map_err(|e| ShareError::file_io(destination, e))
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let candidate = raw.trim().rsplit(|c| c == '/' || c == '\\').next()?.trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." || candidate.contains('\0') {
        None
    } else {
        Some(candidate.to_string())
    }
}

const MAX_NAME_ATTEMPTS: usize = 1000;

/// Create `dir/name`, or `dir/stem (n).ext` for the first free `n`.
///
/// Each candidate is opened with `create_new`, so an existing file is never
/// truncated, even by a concurrent receive of the same name.
async fn open_unique_file(dir: &Path, file_name: &str) -> io::Result<(PathBuf, File)> {
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = name.extension().map(|e| e.to_string_lossy().into_owned());

    for index in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (index, &extension) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };

        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("too many files named like {}", file_name),
    ))
}
