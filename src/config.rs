// src/config.rs
//
// Session configuration shared by the discovery and transfer services.
// Values come from the environment (a .env file is loaded by the binary),
// and anything missing or unparsable falls back to the defaults below.

use log::warn;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DISCOVERY_PORT: u16 = 14810;
pub const DEFAULT_COMMUNICATION_PORT: u16 = 7736;
pub const DEFAULT_TRANSFER_PORT: u16 = 23009;

/// Head start a refusal gets over the sender's authorization timeout
const PROMPT_MARGIN: Duration = Duration::from_secs(2);

/// Immutable settings for one running node
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Human-readable name announced to peers
    pub local_name: String,

    /// UDP port for announcements
    pub discovery_port: u16,

    /// TCP port for the name handshake and liveness probes
    pub communication_port: u16,

    /// TCP port for file transfers
    pub transfer_port: u16,

    /// Address every socket binds to; also used as the source of outgoing connections
    pub bind_address: IpAddr,

    /// Destination for announcements; the subnet broadcast address when unset
    pub broadcast_address: Option<IpAddr>,

    /// How many times each announcement is sent
    pub announcement_repeats: u32,

    pub handshake_timeout: Duration,
    pub liveness_timeout: Duration,

    /// Period of the background liveness check (zero disables it)
    pub liveness_interval: Duration,

    pub connect_timeout: Duration,

    /// How long a sender waits for the receiver to accept or refuse
    pub authorization_timeout: Duration,

    /// Maximum silence while receiving a payload
    pub receive_timeout: Duration,

    /// Directory received files are written to
    pub receive_dir: PathBuf,

    /// Accept transfers from known peers without asking
    pub auto_accept: bool,

    /// Ask about transfers from peers that never completed a handshake
    pub accept_unknown_peers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            communication_port: DEFAULT_COMMUNICATION_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: None,
            announcement_repeats: 3,
            handshake_timeout: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            authorization_timeout: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(10),
            receive_dir: default_receive_dir(),
            auto_accept: false,
            accept_unknown_peers: false,
        }
    }
}

impl SessionConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };

        Self {
            local_name: lookup("LOCAL_NAME")
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.local_name),
            discovery_port: parse_or(&lookup, "DISCOVERY_PORT", defaults.discovery_port),
            communication_port: parse_or(&lookup, "COMMUNICATION_PORT", defaults.communication_port),
            transfer_port: parse_or(&lookup, "TRANSFER_PORT", defaults.transfer_port),
            bind_address: parse_or(&lookup, "BIND_ADDRESS", defaults.bind_address),
            broadcast_address: parse_optional(&lookup, "BROADCAST_ADDRESS"),
            announcement_repeats: parse_or(&lookup, "ANNOUNCEMENT_REPEATS", defaults.announcement_repeats)
                .max(1),
            handshake_timeout: secs("HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout),
            liveness_timeout: secs("LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout),
            liveness_interval: secs("LIVENESS_INTERVAL_SECS", defaults.liveness_interval),
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            authorization_timeout: secs("AUTHORIZATION_TIMEOUT_SECS", defaults.authorization_timeout),
            receive_timeout: secs("RECEIVE_TIMEOUT_SECS", defaults.receive_timeout),
            receive_dir: lookup("RECEIVE_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.receive_dir),
            auto_accept: parse_or(&lookup, "AUTO_ACCEPT", defaults.auto_accept),
            accept_unknown_peers: parse_or(&lookup, "ACCEPT_UNKNOWN_PEERS", defaults.accept_unknown_peers),
        }
    }
}

impl SessionConfig {
    /// How long a receiver waits for a human before refusing.
    ///
    /// Shorter than `authorization_timeout`, so the `NO` reaches the sender
    /// before it gives up waiting.
    pub fn prompt_timeout(&self) -> Duration {
        let wait = self.authorization_timeout;
        if wait > PROMPT_MARGIN * 2 {
            wait - PROMPT_MARGIN
        } else {
            wait / 2
        }
    }
}

fn parse_optional<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    parse_optional(lookup, key).unwrap_or(default)
}

/// `<user>:<hostname>`, the name shown to peers when none is configured
fn default_local_name() -> String {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", user, host)
}

fn default_receive_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::from_lookup(|_| None);
        assert_eq!(config.discovery_port, 14810);
        assert_eq!(config.communication_port, 7736);
        assert_eq!(config.transfer_port, 23009);
        assert_eq!(config.authorization_timeout, Duration::from_secs(60));
        assert_eq!(config.announcement_repeats, 3);
        assert!(config.bind_address.is_unspecified());
        assert!(config.broadcast_address.is_none());
        assert!(config.local_name.contains(':'));
    }

    #[test]
    fn test_overrides() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("LOCAL_NAME", "  desk  "),
            ("DISCOVERY_PORT", "9992"),
            ("TRANSFER_PORT", "40000"),
            ("BIND_ADDRESS", "127.0.0.2"),
            ("BROADCAST_ADDRESS", "127.0.0.1"),
            ("LIVENESS_INTERVAL_SECS", "0"),
            ("RECEIVE_DIR", "/tmp/inbox"),
            ("AUTO_ACCEPT", "true"),
        ]));

        assert_eq!(config.local_name, "desk");
        assert_eq!(config.discovery_port, 9992);
        assert_eq!(config.transfer_port, 40000);
        assert_eq!(config.bind_address, "127.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(config.broadcast_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.liveness_interval, Duration::ZERO);
        assert_eq!(config.receive_dir, PathBuf::from("/tmp/inbox"));
        assert!(config.auto_accept);
    }

    #[test]
    fn test_prompt_gives_up_before_the_sender() {
        let config = SessionConfig::default();
        assert_eq!(config.prompt_timeout(), Duration::from_secs(58));

        let short = SessionConfig {
            authorization_timeout: Duration::from_secs(3),
            ..SessionConfig::default()
        };
        assert_eq!(short.prompt_timeout(), Duration::from_millis(1500));
        assert!(short.prompt_timeout() < short.authorization_timeout);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        // 230009 does not fit in a port number
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("TRANSFER_PORT", "230009"),
            ("BROADCAST_ADDRESS", "everyone"),
            ("ANNOUNCEMENT_REPEATS", "0"),
            ("AUTO_ACCEPT", "sure"),
        ]));

        assert_eq!(config.transfer_port, DEFAULT_TRANSFER_PORT);
        assert!(config.broadcast_address.is_none());
        assert_eq!(config.announcement_repeats, 1);
        assert!(!config.auto_accept);
    }
}
