//! Configuration for the sync engine.
//!
//! [`SyncConfiguration`] holds the persisted, user-editable settings and is
//! owned by the orchestrator. [`NetworkConfig`] holds the process-level
//! constants (ports, timeouts) chosen by the embedding application.

use crate::central::CentralEndpoint;
use crate::config_store::ConfigStore;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use peersync_protocol::{ConflictStrategy, TransportFlags};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Live configuration shared between the orchestrator and its services.
pub type SharedConfig = Arc<RwLock<SyncConfiguration>>;

/// Persisted configuration keys.
pub mod keys {
    /// Sync role (`SERVER`, `CLIENT`, `BOTH`).
    pub const ROLE: &str = "sync.role";
    /// Hybrid mode (`P2P_ONLY`, `CENTRAL_API_ONLY`, `HYBRID`).
    pub const HYBRID_MODE: &str = "sync.hybrid_mode";
    /// Minutes between scheduled cycles.
    pub const INTERVAL_MINUTES: &str = "sync.interval_minutes";
    /// Conflict resolution strategy.
    pub const CONFLICT_STRATEGY: &str = "sync.conflict_strategy";
    /// Days synced changelog entries are retained.
    pub const CHANGELOG_RETENTION_DAYS: &str = "sync.changelog_retention_days";
    /// Whether scheduled cycles run.
    pub const AUTO_SYNC_ENABLED: &str = "sync.auto_sync_enabled";
    /// Transport compression policy flag.
    pub const COMPRESSION_ENABLED: &str = "sync.compression_enabled";
    /// Transport encryption policy flag.
    pub const ENCRYPTION_ENABLED: &str = "sync.encryption_enabled";
    /// Central store URL.
    pub const CENTRAL_API_URL: &str = "sync.central_api_url";
    /// Central store auth token.
    pub const CENTRAL_AUTH_TOKEN: &str = "sync.central_auth_token";
    /// Completion time of the last central pull.
    pub const LAST_CENTRAL_PULL_TIMESTAMP: &str = "sync.last_central_pull_timestamp";
    /// Whether a pull prunes local rows absent centrally.
    pub const DELETE_LOCAL_ON_CENTRAL_PULL: &str = "sync.delete_local_on_central_pull";

    /// All keys, in display order.
    pub const ALL: [&str; 12] = [
        ROLE,
        HYBRID_MODE,
        INTERVAL_MINUTES,
        CONFLICT_STRATEGY,
        CHANGELOG_RETENTION_DAYS,
        AUTO_SYNC_ENABLED,
        COMPRESSION_ENABLED,
        ENCRYPTION_ENABLED,
        CENTRAL_API_URL,
        CENTRAL_AUTH_TOKEN,
        LAST_CENTRAL_PULL_TIMESTAMP,
        DELETE_LOCAL_ON_CENTRAL_PULL,
    ];
}

/// Which side of peer replication this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Accepts exchanges from peers.
    Server,
    /// Initiates exchanges with trusted peers.
    Client,
    /// Both of the above.
    Both,
}

impl SyncRole {
    /// Returns true if this role runs the listeners.
    pub fn serves(&self) -> bool {
        matches!(self, SyncRole::Server | SyncRole::Both)
    }

    /// Returns true if this role initiates exchanges.
    pub fn connects(&self) -> bool {
        matches!(self, SyncRole::Client | SyncRole::Both)
    }

    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRole::Server => "SERVER",
            SyncRole::Client => "CLIENT",
            SyncRole::Both => "BOTH",
        }
    }
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRole {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SERVER" => Ok(SyncRole::Server),
            "CLIENT" => Ok(SyncRole::Client),
            "BOTH" => Ok(SyncRole::Both),
            _ => Err(SyncError::Configuration(format!("unknown sync role: {s}"))),
        }
    }
}

/// Which replication paths are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridMode {
    /// Peers only.
    P2pOnly,
    /// Central store only.
    CentralApiOnly,
    /// Peers and central store.
    Hybrid,
}

impl HybridMode {
    /// Returns true if peer replication is active.
    pub fn uses_p2p(&self) -> bool {
        matches!(self, HybridMode::P2pOnly | HybridMode::Hybrid)
    }

    /// Returns true if central replication is active.
    pub fn uses_central(&self) -> bool {
        matches!(self, HybridMode::CentralApiOnly | HybridMode::Hybrid)
    }

    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HybridMode::P2pOnly => "P2P_ONLY",
            HybridMode::CentralApiOnly => "CENTRAL_API_ONLY",
            HybridMode::Hybrid => "HYBRID",
        }
    }
}

impl fmt::Display for HybridMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HybridMode {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "P2P_ONLY" | "P2P" => Ok(HybridMode::P2pOnly),
            "CENTRAL_API_ONLY" | "CENTRAL" => Ok(HybridMode::CentralApiOnly),
            "HYBRID" => Ok(HybridMode::Hybrid),
            _ => Err(SyncError::Configuration(format!("unknown hybrid mode: {s}"))),
        }
    }
}

/// Persisted sync settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfiguration {
    /// Replication role.
    pub role: SyncRole,
    /// Active replication paths.
    pub hybrid_mode: HybridMode,
    /// Minutes between scheduled cycles (> 0).
    pub interval_minutes: u32,
    /// Conflict policy.
    pub conflict_strategy: ConflictStrategy,
    /// Days synced changelog entries are retained.
    pub changelog_retention_days: u32,
    /// Whether scheduled cycles run.
    pub auto_sync_enabled: bool,
    /// Transport compression flag.
    pub compression_enabled: bool,
    /// Transport encryption flag.
    pub encryption_enabled: bool,
    /// Whether a pull prunes local rows absent centrally.
    pub delete_local_on_central_pull: bool,
    /// Central store URL.
    pub central_api_url: Option<String>,
    /// Central store auth token.
    pub auth_token: Option<String>,
    /// Completion time (Unix millis) of the last full central pull.
    pub last_central_pull_timestamp: Option<u64>,
    /// Keys whose persisted value could not be parsed.
    pub invalid_keys: Vec<&'static str>,
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            role: SyncRole::Both,
            hybrid_mode: HybridMode::P2pOnly,
            interval_minutes: 5,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            changelog_retention_days: 30,
            auto_sync_enabled: true,
            compression_enabled: false,
            encryption_enabled: false,
            delete_local_on_central_pull: false,
            central_api_url: None,
            auth_token: None,
            last_central_pull_timestamp: None,
            invalid_keys: Vec::new(),
        }
    }
}

impl SyncConfiguration {
    /// Loads settings from a config store.
    ///
    /// Missing keys take their defaults. Unparseable values take their
    /// defaults too and are listed in `invalid_keys`.
    pub fn load(store: &dyn ConfigStore) -> SyncResult<Self> {
        let mut config = Self::default();
        let mut invalid = Vec::new();

        read_parsed(store, keys::ROLE, &mut config.role, &mut invalid)?;
        read_parsed(store, keys::HYBRID_MODE, &mut config.hybrid_mode, &mut invalid)?;
        read_parsed(
            store,
            keys::INTERVAL_MINUTES,
            &mut config.interval_minutes,
            &mut invalid,
        )?;
        if config.interval_minutes == 0 {
            config.interval_minutes = Self::default().interval_minutes;
            invalid.push(keys::INTERVAL_MINUTES);
        }
        read_parsed(
            store,
            keys::CONFLICT_STRATEGY,
            &mut config.conflict_strategy,
            &mut invalid,
        )?;
        read_parsed(
            store,
            keys::CHANGELOG_RETENTION_DAYS,
            &mut config.changelog_retention_days,
            &mut invalid,
        )?;
        read_flag(store, keys::AUTO_SYNC_ENABLED, &mut config.auto_sync_enabled, &mut invalid)?;
        read_flag(
            store,
            keys::COMPRESSION_ENABLED,
            &mut config.compression_enabled,
            &mut invalid,
        )?;
        read_flag(
            store,
            keys::ENCRYPTION_ENABLED,
            &mut config.encryption_enabled,
            &mut invalid,
        )?;
        read_flag(
            store,
            keys::DELETE_LOCAL_ON_CENTRAL_PULL,
            &mut config.delete_local_on_central_pull,
            &mut invalid,
        )?;

        config.central_api_url = read_text(store, keys::CENTRAL_API_URL)?;
        config.auth_token = read_text(store, keys::CENTRAL_AUTH_TOKEN)?;

        let mut last_pull = 0u64;
        if read_parsed(store, keys::LAST_CENTRAL_PULL_TIMESTAMP, &mut last_pull, &mut invalid)? {
            config.last_central_pull_timestamp = Some(last_pull);
        }

        config.invalid_keys = invalid;
        Ok(config)
    }

    /// Writes every setting to a config store.
    pub fn save(&self, store: &dyn ConfigStore) -> SyncResult<()> {
        for key in keys::ALL {
            store.set(key, &self.value_of(key))?;
        }
        Ok(())
    }

    /// Returns the persisted textual form of a setting.
    pub fn value_of(&self, key: &str) -> String {
        match key {
            keys::ROLE => self.role.to_string(),
            keys::HYBRID_MODE => self.hybrid_mode.to_string(),
            keys::INTERVAL_MINUTES => self.interval_minutes.to_string(),
            keys::CONFLICT_STRATEGY => self.conflict_strategy.to_string(),
            keys::CHANGELOG_RETENTION_DAYS => self.changelog_retention_days.to_string(),
            keys::AUTO_SYNC_ENABLED => self.auto_sync_enabled.to_string(),
            keys::COMPRESSION_ENABLED => self.compression_enabled.to_string(),
            keys::ENCRYPTION_ENABLED => self.encryption_enabled.to_string(),
            keys::DELETE_LOCAL_ON_CENTRAL_PULL => self.delete_local_on_central_pull.to_string(),
            keys::CENTRAL_API_URL => self.central_api_url.clone().unwrap_or_default(),
            keys::CENTRAL_AUTH_TOKEN => self.auth_token.clone().unwrap_or_default(),
            keys::LAST_CENTRAL_PULL_TIMESTAMP => self
                .last_central_pull_timestamp
                .map(|t| t.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Returns the conflict strategy, or an error if its persisted value was invalid.
    pub fn strategy(&self) -> SyncResult<ConflictStrategy> {
        if self.invalid_keys.contains(&keys::CONFLICT_STRATEGY) {
            return Err(SyncError::Configuration(
                "invalid conflict strategy; fix the setting to resume sync".into(),
            ));
        }
        Ok(self.conflict_strategy)
    }

    /// Builds the central endpoint, or an error if no URL is configured.
    pub fn central_endpoint(&self, timeout: Duration) -> SyncResult<CentralEndpoint> {
        let url = self
            .central_api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SyncError::Configuration("central API URL is not set".into()))?;

        Ok(CentralEndpoint {
            url: url.to_string(),
            auth_token: self.auth_token.clone(),
            timeout,
        })
    }

    /// Transport policy advertised in peer exchanges.
    pub fn transport_flags(&self) -> TransportFlags {
        TransportFlags {
            compression: self.compression_enabled,
            encryption: self.encryption_enabled,
        }
    }

    /// Interval between scheduled cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes.max(1)) * 60)
    }

    /// Returns true if switching to `other` changes which services run or how.
    pub fn requires_restart(&self, other: &SyncConfiguration) -> bool {
        self.role != other.role
            || self.hybrid_mode != other.hybrid_mode
            || self.interval_minutes != other.interval_minutes
            || self.central_api_url != other.central_api_url
            || self.auto_sync_enabled != other.auto_sync_enabled
    }
}

fn read_text(store: &dyn ConfigStore, key: &'static str) -> SyncResult<Option<String>> {
    Ok(store
        .get(key)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

fn read_parsed<T: FromStr>(
    store: &dyn ConfigStore,
    key: &'static str,
    slot: &mut T,
    invalid: &mut Vec<&'static str>,
) -> SyncResult<bool> {
    let Some(raw) = read_text(store, key)? else {
        return Ok(false);
    };
    match raw.parse::<T>() {
        Ok(value) => {
            *slot = value;
            Ok(true)
        }
        Err(_) => {
            invalid.push(key);
            Ok(false)
        }
    }
}

fn read_flag(
    store: &dyn ConfigStore,
    key: &'static str,
    slot: &mut bool,
    invalid: &mut Vec<&'static str>,
) -> SyncResult<()> {
    let Some(raw) = read_text(store, key)? else {
        return Ok(());
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => *slot = true,
        "false" | "0" | "no" | "off" => *slot = false,
        _ => invalid.push(key),
    }
    Ok(())
}

/// Process-level network settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface the listeners bind to.
    pub bind_ip: IpAddr,
    /// Replication listener port (0 picks an ephemeral port).
    pub tcp_port: u16,
    /// Discovery listener port.
    pub discovery_port: u16,
    /// Where discovery requests are sent.
    pub broadcast_target: SocketAddr,
    /// How long a discovery round listens for answers.
    pub discovery_window: Duration,
    /// Connect timeout for peer exchanges.
    pub connect_timeout: Duration,
    /// Read/write timeout for peer exchanges.
    pub io_timeout: Duration,
    /// Timeout for central store calls and health probes.
    pub central_timeout: Duration,
    /// Pause after closing sockets so the OS releases the ports.
    pub shutdown_grace: Duration,
    /// Longest `stop()` waits for a worker before detaching it.
    pub join_deadline: Duration,
}

impl NetworkConfig {
    /// Default replication listener port.
    pub const DEFAULT_TCP_PORT: u16 = 8080;
    /// Default discovery port.
    pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: Self::DEFAULT_TCP_PORT,
            discovery_port: Self::DEFAULT_DISCOVERY_PORT,
            broadcast_target: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                Self::DEFAULT_DISCOVERY_PORT,
            ),
            discovery_window: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            central_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(100),
            join_deadline: Duration::from_secs(5),
        }
    }

    /// Sets the bind interface.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Sets the replication listener port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Sets the discovery port; the broadcast target follows it.
    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self.broadcast_target.set_port(port);
        self
    }

    /// Sets where discovery requests are sent.
    pub fn with_broadcast_target(mut self, target: SocketAddr) -> Self {
        self.broadcast_target = target;
        self
    }

    /// Sets the discovery window.
    pub fn with_discovery_window(mut self, window: Duration) -> Self {
        self.discovery_window = window;
        self
    }

    /// Sets the peer exchange I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the peer connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}
