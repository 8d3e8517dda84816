use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use super::error::ShareResult;
use super::protocol::{self, ANNOUNCEMENT, LIVENESS_PROBE, LIVENESS_REPLY, RESPONSE_TOKEN};
use super::registry::{Device, DeviceRegistry, PendingDiscoveries};
use super::{handshake, interface, liveness};
use crate::config::SessionConfig;

/// Longest a listener blocks before it re-checks the run flag
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ANNOUNCEMENT_GAP: Duration = Duration::from_millis(50);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a discovery service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Created, nothing running yet
    Idle,
    /// Listeners are running
    Discovering,
    /// Listeners were cancelled and joined
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
struct BoundSockets {
    announcement: Option<SocketAddr>,
    handshake: Option<SocketAddr>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Announces this device, listens for peers and keeps the device registry current
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<SessionConfig>,
    local_address: IpAddr,
    registry: DeviceRegistry,
    pending: PendingDiscoveries,
    running: AtomicBool,
    initiating: AtomicBool,
    state: Mutex<DiscoveryState>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    liveness_task: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<BoundSockets>,
}

impl DiscoveryService {
    /// Create a new discovery service. Nothing runs until `start` is called.
    pub fn new(config: Arc<SessionConfig>) -> Self {
        let local_address = if config.bind_address.is_unspecified() {
            interface::local_address()
        } else {
            config.bind_address
        };

        info!(
            "Initializing discovery for '{}' on {}",
            config.local_name, local_address
        );

        Self {
            inner: Arc::new(Inner {
                config,
                local_address,
                registry: DeviceRegistry::new(),
                pending: PendingDiscoveries::new(),
                running: AtomicBool::new(false),
                initiating: AtomicBool::new(false),
                state: Mutex::new(DiscoveryState::Idle),
                listeners: Mutex::new(Vec::new()),
                liveness_task: Mutex::new(None),
                bound: Mutex::new(BoundSockets::default()),
            }),
        }
    }

    pub fn registry(&self) -> DeviceRegistry {
        self.inner.registry.clone()
    }

    pub fn pending(&self) -> PendingDiscoveries {
        self.inner.pending.clone()
    }

    /// Address used to recognise our own announcements
    pub fn local_address(&self) -> IpAddr {
        self.inner.local_address
    }

    pub fn state(&self) -> DiscoveryState {
        self.inner.state()
    }

    /// Address the announcement listener is bound to, while running
    pub fn announcement_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).announcement
    }

    /// Address the handshake listener is bound to, while running
    pub fn handshake_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).handshake
    }

    /// Start the listeners and announce ourselves once
    pub async fn start(&self) -> Result<()> {
        if self.state() == DiscoveryState::Discovering {
            debug!("Discovery already running");
            return Ok(());
        }

        self.start_listeners().await?;

        if let Err(e) = self.broadcast_announcement().await {
            warn!("Failed to send announcement: {}", e);
        }
        Ok(())
    }

    /// Cancel every background task and wait for all of them to exit
    pub async fn stop(&self) {
        self.stop_listeners().await;

        let liveness_task = lock(&self.inner.liveness_task).take();
        if let Some(task) = liveness_task {
            if let Err(e) = task.await {
                error!("Liveness check task failed: {}", e);
            }
        }

        *lock(&self.inner.state) = DiscoveryState::Stopped;
        info!("Discovery stopped");
    }

    /// Restart any listener that is not running, announce again and
    /// kick off a liveness check unless one is already in flight.
    pub async fn reload(&self) -> Result<()> {
        if !self.listeners_active() {
            info!("Restarting discovery listeners");
            self.stop_listeners().await;
            self.start_listeners().await?;
        }

        if let Err(e) = self.broadcast_announcement().await {
            warn!("Failed to send announcement: {}", e);
        }

        self.spawn_liveness_check();
        Ok(())
    }

    /// Broadcast the announcement datagram `announcement_repeats` times
    pub async fn broadcast_announcement(&self) -> ShareResult<()> {
        let config = &self.inner.config;
        let destination = config
            .broadcast_address
            .unwrap_or_else(|| IpAddr::V4(interface::broadcast_address(self.inner.local_address)));
        let target = SocketAddr::new(destination, config.discovery_port);

        let socket = UdpSocket::bind((config.bind_address, 0)).await?;
        socket.set_broadcast(true)?;

        for attempt in 0..config.announcement_repeats {
            if attempt > 0 {
                sleep(ANNOUNCEMENT_GAP).await;
            }
            socket.send_to(ANNOUNCEMENT.as_bytes(), target).await?;
        }

        debug!(
            "Sent {} announcement(s) to {}",
            config.announcement_repeats, target
        );
        Ok(())
    }

    /// Handle one received datagram. Returns true if the sender was newly queued.
    pub fn record_announcement(&self, payload: &[u8], from: IpAddr) -> bool {
        self.inner.record_announcement(payload, from)
    }

    /// Handshake with every queued address, unless a handshake flow is already active
    pub async fn initiate_handshakes(&self) {
        if !self.inner.try_claim_initiator() {
            debug!("Handshake flow already active");
            return;
        }
        self.inner.drain_pending().await;
    }

    /// Probe every registered device and drop the unreachable ones
    pub async fn check_liveness(&self) -> Vec<Device> {
        self.inner.check_liveness().await
    }

    async fn start_listeners(&self) -> Result<()> {
        let config = &self.inner.config;

        let udp = UdpSocket::bind((config.bind_address, config.discovery_port))
            .await
            .with_context(|| format!("Failed to bind discovery port {}", config.discovery_port))?;
        let tcp = TcpListener::bind((config.bind_address, config.communication_port))
            .await
            .with_context(|| {
                format!("Failed to bind communication port {}", config.communication_port)
            })?;

        let bound = BoundSockets {
            announcement: Some(udp.local_addr()?),
            handshake: Some(tcp.local_addr()?),
        };
        *lock(&self.inner.bound) = bound;

        self.inner.running.store(true, Ordering::SeqCst);

        let mut tasks = vec![
            tokio::spawn(self.inner.clone().listen_for_announcements(udp)),
            tokio::spawn(self.inner.clone().listen_for_handshake_connections(tcp)),
        ];
        if !config.liveness_interval.is_zero() {
            tasks.push(tokio::spawn(self.inner.clone().run_periodic_liveness()));
        }
        lock(&self.inner.listeners).extend(tasks);

        *lock(&self.inner.state) = DiscoveryState::Discovering;
        info!(
            "Node '{}' listening for announcements on {:?} and handshakes on {:?}",
            config.local_name, bound.announcement, bound.handshake
        );
        Ok(())
    }

    async fn stop_listeners(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.listeners).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Discovery task failed: {}", e);
            }
        }

        *lock(&self.inner.bound) = BoundSockets::default();
    }

    fn listeners_active(&self) -> bool {
        self.state() == DiscoveryState::Discovering
            && lock(&self.inner.listeners).iter().all(|task| !task.is_finished())
    }

    fn spawn_liveness_check(&self) {
        let mut slot = lock(&self.inner.liveness_task);
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            debug!("Liveness check already in flight");
            return;
        }

        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            let removed = inner.check_liveness().await;
            if !removed.is_empty() {
                info!("Liveness check removed {} device(s)", removed.len());
            }
        }));
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        // Let detached tasks wind down if the owner never called stop()
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn state(&self) -> DiscoveryState {
        *lock(&self.state)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn record_announcement(&self, payload: &[u8], from: IpAddr) -> bool {
        if payload != ANNOUNCEMENT.as_bytes() {
            debug!("Ignoring unexpected datagram from {}", from);
            return false;
        }
        if from == self.local_address {
            debug!("Ignoring our own announcement");
            return false;
        }

        let queued = self.pending.push(from);
        if queued {
            info!("Heard announcement from {}", from);
        } else {
            debug!("Announcement from {} is already queued", from);
        }
        queued
    }

    fn try_claim_initiator(&self) -> bool {
        self.initiating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn spawn_initiator(self: &Arc<Self>) {
        if self.try_claim_initiator() {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.drain_pending().await });
        }
    }

    /// Consume the pending queue. The caller must hold the initiator claim.
    async fn drain_pending(&self) {
        loop {
            while let Some(ip) = self.pending.pop() {
                if self.state() == DiscoveryState::Stopped {
                    debug!("Discovery stopped, abandoning handshake queue");
                    break;
                }
                if ip == self.local_address || self.registry.contains(&ip) {
                    debug!("Skipping handshake with {}", ip);
                    continue;
                }

                match self.handshake_with(ip).await {
                    Ok(device) => info!("✅ Handshake with {} complete: {}", ip, device.name),
                    Err(e) => warn!("Handshake with {} failed: {}", ip, e),
                }
            }

            self.initiating.store(false, Ordering::SeqCst);

            // An announcement may have been queued after the last pop
            if self.pending.is_empty()
                || self.state() == DiscoveryState::Stopped
                || !self.try_claim_initiator()
            {
                break;
            }
        }
    }

    async fn handshake_with(&self, ip: IpAddr) -> ShareResult<Device> {
        let config = &self.config;
        let target = SocketAddr::new(ip, config.communication_port);
        let mut stream = protocol::connect(config.bind_address, target, config.connect_timeout).await?;

        handshake::initiate(
            &mut stream,
            ip,
            &config.local_name,
            &self.registry,
            config.handshake_timeout,
        )
        .await
    }

    async fn listen_for_announcements(self: Arc<Self>, socket: UdpSocket) {
        let mut buffer = [0u8; protocol::MESSAGE_BUFFER_SIZE];

        while self.is_running() {
            match timeout(POLL_INTERVAL, socket.recv_from(&mut buffer)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("Error receiving announcement: {}", e);
                    sleep(ERROR_BACKOFF).await;
                }
                Ok(Ok((n, from))) => {
                    if self.record_announcement(&buffer[..n], from.ip()) {
                        self.spawn_initiator();
                    }
                }
            }
        }

        debug!("Announcement listener stopped");
    }

    async fn listen_for_handshake_connections(self: Arc<Self>, listener: TcpListener) {
        while self.is_running() {
            match timeout(POLL_INTERVAL, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("Error accepting handshake connection: {}", e);
                    sleep(ERROR_BACKOFF).await;
                }
                Ok(Ok((stream, addr))) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.handle_connection(stream, addr.ip()).await {
                            debug!("Connection from {} ended: {}", addr, e);
                        }
                    });
                }
            }
        }

        debug!("Handshake listener stopped");
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: IpAddr) -> ShareResult<()> {
        let config = &self.config;
        let greeting = protocol::read_message(&mut stream, config.handshake_timeout).await?;

        match greeting.trim_end() {
            RESPONSE_TOKEN => {
                let device = handshake::respond(
                    &mut stream,
                    peer,
                    &config.local_name,
                    &self.registry,
                    config.handshake_timeout,
                )
                .await?;
                info!("✅ Handshake with {} complete: {}", peer, device.name);
            }
            LIVENESS_PROBE => protocol::write_message(&mut stream, LIVENESS_REPLY).await?,
            other => debug!("Dropping connection from {}: unexpected greeting {:?}", peer, other),
        }
        Ok(())
    }

    async fn check_liveness(&self) -> Vec<Device> {
        liveness::prune_unreachable(
            &self.registry,
            self.config.communication_port,
            self.config.bind_address,
            self.config.liveness_timeout,
        )
        .await
    }

    async fn run_periodic_liveness(self: Arc<Self>) {
        while self.sleep_while_running(self.config.liveness_interval).await {
            self.check_liveness().await;
        }
        debug!("Periodic liveness check stopped");
    }

    /// Sleep in short slices; returns false as soon as the run flag is cleared
    async fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    const FIRST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    const SECOND: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    const WAIT: Duration = Duration::from_secs(10);

    fn test_config(name: &str, bind: IpAddr) -> SessionConfig {
        SessionConfig {
            local_name: name.to_string(),
            discovery_port: 0,
            communication_port: 0,
            transfer_port: 0,
            bind_address: bind,
            broadcast_address: Some(bind),
            announcement_repeats: 1,
            handshake_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(1),
            liveness_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((FIRST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn names(registry: &DeviceRegistry) -> Vec<String> {
        registry.list().into_iter().map(|d| d.name).collect()
    }

    #[tokio::test]
    async fn test_broadcast_sends_exact_payload() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let receiver = UdpSocket::bind((FIRST, 0)).await?;
        let mut config = test_config("Test", FIRST);
        config.discovery_port = receiver.local_addr()?.port();

        let discovery = DiscoveryService::new(Arc::new(config));
        discovery.broadcast_announcement().await?;

        let mut buffer = [0u8; 1024];
        let (n, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buffer)).await??;
        assert_eq!(&buffer[..n], b"Discovery: Who is out there?");
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_announcements_are_queued_once() {
        let discovery = DiscoveryService::new(Arc::new(test_config("Test", FIRST)));
        let peer: IpAddr = "192.168.0.20".parse().unwrap();

        assert!(discovery.record_announcement(ANNOUNCEMENT.as_bytes(), peer));
        assert!(!discovery.record_announcement(ANNOUNCEMENT.as_bytes(), peer));
        assert!(!discovery.record_announcement(b"discovery: who is out there?", peer));
        assert!(!discovery.record_announcement(ANNOUNCEMENT.as_bytes(), FIRST));

        assert_eq!(discovery.pending().snapshot(), vec![peer]);
    }

    #[tokio::test]
    async fn test_initiate_handshakes_skips_self_and_known_devices() {
        let discovery = DiscoveryService::new(Arc::new(test_config("Test", FIRST)));
        let known: IpAddr = "192.168.0.30".parse().unwrap();
        discovery.registry().insert(Device::new(known, "known"));

        discovery.pending().push(FIRST);
        discovery.pending().push(known);
        discovery.initiate_handshakes().await;

        assert!(discovery.pending().is_empty());
        assert_eq!(names(&discovery.registry()), vec!["known"]);
    }

    #[tokio::test]
    async fn test_handshake_listener_answers_token_and_probe() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let discovery = DiscoveryService::new(Arc::new(test_config("Test", FIRST)));
        discovery.start().await?;
        assert_eq!(discovery.state(), DiscoveryState::Discovering);
        let addr = discovery.handshake_addr().expect("handshake listener not bound");

        let limit = Duration::from_secs(2);
        let mut stream = TcpStream::connect(addr).await?;
        protocol::write_message(&mut stream, RESPONSE_TOKEN).await?;
        assert_eq!(protocol::read_message(&mut stream, limit).await?, "My name is Test");
        protocol::write_message(&mut stream, "My name is TestToo").await?;

        let registry = discovery.registry();
        assert!(wait_for(|| registry.contains(&FIRST)).await);
        assert_eq!(names(&registry), vec!["TestToo"]);

        let mut probe = TcpStream::connect(addr).await?;
        protocol::write_message(&mut probe, LIVENESS_PROBE).await?;
        assert_eq!(protocol::read_message(&mut probe, limit).await?, LIVENESS_REPLY);

        discovery.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_unexpected_greeting_is_dropped() -> Result<()> {
        let discovery = DiscoveryService::new(Arc::new(test_config("Test", FIRST)));
        discovery.start().await?;
        let addr = discovery.handshake_addr().expect("handshake listener not bound");

        let mut stream = TcpStream::connect(addr).await?;
        protocol::write_message(&mut stream, "My name is Mallory").await?;

        // No reply, just a closed connection
        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut reply)).await??;
        assert!(reply.is_empty());
        assert!(discovery.registry().is_empty());

        discovery.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_announcement_triggers_handshake() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        // A hand-driven peer on 127.0.0.1 plays the responder role
        let peer = TcpListener::bind((FIRST, 0)).await?;
        let mut config = test_config("TestToo", SECOND);
        config.communication_port = peer.local_addr()?.port();

        let discovery = DiscoveryService::new(Arc::new(config));
        discovery.start().await?;
        let announce_to = discovery.announcement_addr().expect("announcement listener not bound");

        let sender = UdpSocket::bind((FIRST, 0)).await?;
        sender.send_to(ANNOUNCEMENT.as_bytes(), announce_to).await?;

        let limit = Duration::from_secs(5);
        let (mut conn, _) = timeout(limit, peer.accept()).await??;
        assert_eq!(protocol::read_message(&mut conn, limit).await?, RESPONSE_TOKEN);
        protocol::write_message(&mut conn, "My name is Test").await?;
        assert_eq!(protocol::read_message(&mut conn, limit).await?, "My name is TestToo");

        let registry = discovery.registry();
        assert!(wait_for(|| registry.contains(&FIRST)).await);
        assert_eq!(names(&registry), vec!["Test"]);
        assert!(discovery.pending().is_empty());

        discovery.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_two_instances_discover_each_other() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let discovery_port = {
            let probe = UdpSocket::bind((FIRST, 0)).await?;
            probe.local_addr()?.port()
        };
        let communication_port = free_port().await;

        let config_for = |name: &str, bind: IpAddr, peer: IpAddr| {
            let mut config = test_config(name, bind);
            config.discovery_port = discovery_port;
            config.communication_port = communication_port;
            config.broadcast_address = Some(peer);
            config.announcement_repeats = 3;
            Arc::new(config)
        };

        let first = DiscoveryService::new(config_for("Test", FIRST, SECOND));
        let second = DiscoveryService::new(config_for("TestToo", SECOND, FIRST));
        let (a, b) = tokio::join!(first.start(), second.start());
        a?;
        b?;

        // Whichever announcement was sent before the other side was listening is lost
        first.broadcast_announcement().await?;

        let first_registry = first.registry();
        let second_registry = second.registry();
        assert!(wait_for(|| first_registry.contains(&SECOND) && second_registry.contains(&FIRST)).await);

        // Repeated announcements never duplicate entries
        second.broadcast_announcement().await?;
        first.broadcast_announcement().await?;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(names(&first_registry), vec!["TestToo"]);
        assert_eq!(names(&second_registry), vec!["Test"]);

        tokio::join!(first.stop(), second.stop());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_releases_sockets_and_restart_works() -> Result<()> {
        let mut config = test_config("Test", FIRST);
        config.communication_port = free_port().await;
        let discovery = DiscoveryService::new(Arc::new(config));

        discovery.start().await?;
        let addr = discovery.handshake_addr().expect("handshake listener not bound");

        discovery.stop().await;
        assert_eq!(discovery.state(), DiscoveryState::Stopped);
        assert!(discovery.handshake_addr().is_none());

        // The port is free again once stop() has returned
        drop(TcpListener::bind(addr).await?);

        discovery.start().await?;
        assert_eq!(discovery.state(), DiscoveryState::Discovering);
        discovery.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_reload_prunes_unreachable_devices() -> Result<()> {
        let mut config = test_config("Test", FIRST);
        // Nothing listens here, so every probe is refused
        config.communication_port = free_port().await;
        let discovery = DiscoveryService::new(Arc::new(config));

        let stale: IpAddr = "127.0.0.9".parse().unwrap();
        discovery.registry().insert(Device::new(stale, "stale"));

        discovery.reload().await?;
        assert_eq!(discovery.state(), DiscoveryState::Discovering);

        let registry = discovery.registry();
        assert!(wait_for(|| registry.is_empty()).await);

        discovery.stop().await;
        Ok(())
    }
}
