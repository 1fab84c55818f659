//! The sync orchestrator.
//!
//! [`SyncOrchestrator`] owns the configuration, the background services and
//! the lifecycle. It is the only engine type the application talks to, and
//! no error crosses its public methods: failures are logged and reported as
//! booleans, counts or empty values.

use crate::apply::{ChangeApplier, WriteGate};
use crate::central::{CentralConnector, CentralEndpoint, CentralSyncBridge};
use crate::changelog::ChangelogTracker;
use crate::config::{keys, HybridMode, NetworkConfig, SharedConfig, SyncConfiguration, SyncRole};
use crate::config_store::ConfigStore;
use crate::discovery::{DiscoveryListener, DiscoveryService};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Lifecycle, LifecycleState, StateTransition};
use crate::log::{now_millis, LogSink, SyncLog};
use crate::peers::PeerRegistry;
use crate::scheduler::{CancelToken, Scheduler};
use crate::store::LocalStore;
use crate::transport::{ExchangeHandler, PeerExchanger, PeerListener, PeerTransport, TcpPeerTransport};
use parking_lot::{Mutex, RwLock};
use peersync_protocol::{default_entities, ConflictStrategy, EntityKind, NewPeer, Peer, PeerStatus};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

const WORKER_CAPACITY: usize = 2;
const SYNC_WORKER: &str = "sync";
const DISCOVERY_WORKER: &str = "discovery";

/// Outcome of one P2P cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct P2pReport {
    /// Trusted peers attempted.
    pub peers: usize,
    /// Exchanges that completed.
    pub succeeded: usize,
    /// Exchanges that failed.
    pub failed: usize,
}

#[derive(Default)]
struct Services {
    scheduler: Option<Scheduler>,
    tcp: Option<PeerListener>,
    discovery: Option<DiscoveryListener>,
}

struct Runtime {
    lifecycle: Lifecycle,
    services: Services,
}

struct Inner {
    store: Arc<dyn LocalStore>,
    config_store: Arc<dyn ConfigStore>,
    config: SharedConfig,
    net: NetworkConfig,
    log: SyncLog,
    gate: WriteGate,
    tracker: ChangelogTracker,
    registry: PeerRegistry,
    applier: ChangeApplier,
    transport: Arc<dyn PeerTransport>,
    central: Option<Arc<dyn CentralConnector>>,
    entities: Vec<EntityKind>,
    runtime: Mutex<Runtime>,
    cycle: Mutex<()>,
    // 0 while no replication listener runs
    listen_port: AtomicU16,
}

/// Builds a [`SyncOrchestrator`].
pub struct OrchestratorBuilder {
    store: Arc<dyn LocalStore>,
    config_store: Arc<dyn ConfigStore>,
    net: NetworkConfig,
    log: SyncLog,
    transport: Option<Arc<dyn PeerTransport>>,
    central: Option<Arc<dyn CentralConnector>>,
    entities: Vec<EntityKind>,
}

impl OrchestratorBuilder {
    /// Sets the network configuration.
    pub fn with_network(mut self, net: NetworkConfig) -> Self {
        self.net = net;
        self
    }

    /// Sets the progress sink.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log = SyncLog::new(sink);
        self
    }

    /// Sets the central store connector.
    pub fn with_central(mut self, connector: Arc<dyn CentralConnector>) -> Self {
        self.central = Some(connector);
        self
    }

    /// Replaces the TCP peer transport.
    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the replicated entities, parents first.
    pub fn with_entities(mut self, entities: Vec<EntityKind>) -> Self {
        self.entities = entities;
        self
    }

    /// Loads the persisted configuration and builds the orchestrator.
    pub fn build(self) -> SyncOrchestrator {
        let config = match SyncConfiguration::load(self.config_store.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                self.log
                    .error(format_args!("Cannot load sync configuration, using defaults: {e}"));
                SyncConfiguration::default()
            }
        };
        report_invalid_keys(&self.log, &config);

        let gate = WriteGate::default();
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpPeerTransport::new(
                self.net.connect_timeout,
                self.net.io_timeout,
            ))
        });

        SyncOrchestrator {
            inner: Arc::new(Inner {
                tracker: ChangelogTracker::new(Arc::clone(&self.store)),
                registry: PeerRegistry::new(Arc::clone(&self.store)),
                applier: ChangeApplier::new(Arc::clone(&self.store), Arc::clone(&gate)),
                store: self.store,
                config_store: self.config_store,
                config: Arc::new(RwLock::new(config)),
                net: self.net,
                log: self.log,
                gate,
                transport,
                central: self.central,
                entities: self.entities,
                runtime: Mutex::new(Runtime {
                    lifecycle: Lifecycle::new(),
                    services: Services::default(),
                }),
                cycle: Mutex::new(()),
                listen_port: AtomicU16::new(0),
            }),
        }
    }
}

/// Drives discovery, peer replication and central sync.
///
/// Dropping the orchestrator stops every service.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Starts building an orchestrator over a local store and a config store.
    pub fn builder(
        store: Arc<dyn LocalStore>,
        config_store: Arc<dyn ConfigStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            config_store,
            net: NetworkConfig::default(),
            log: SyncLog::disabled(),
            transport: None,
            central: None,
            entities: default_entities(),
        }
    }

    /// Creates an orchestrator with the given network settings.
    pub fn new(
        store: Arc<dyn LocalStore>,
        config_store: Arc<dyn ConfigStore>,
        net: NetworkConfig,
    ) -> Self {
        Self::builder(store, config_store).with_network(net).build()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the services selected by role and mode, stopping any running ones first.
    pub fn start(&self) {
        let mut runtime = self.inner.runtime.lock();
        self.inner.stop_locked(&mut runtime);
        Inner::start_locked(&self.inner, &mut runtime);
    }

    /// Stops every service. Does nothing when idle.
    pub fn stop(&self) {
        let mut runtime = self.inner.runtime.lock();
        self.inner.stop_locked(&mut runtime);
    }

    /// Stops then starts, but only if the service is running.
    pub fn restart(&self) {
        let mut runtime = self.inner.runtime.lock();
        if runtime.lifecycle.state() != LifecycleState::Running {
            return;
        }
        self.inner.log.info("Restarting sync service");
        self.inner.stop_locked(&mut runtime);
        Inner::start_locked(&self.inner, &mut runtime);
    }

    /// Current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.runtime.lock().lifecycle.state()
    }

    /// Recent lifecycle transitions, oldest first.
    pub fn state_transitions(&self) -> Vec<StateTransition> {
        self.inner.runtime.lock().lifecycle.history()
    }

    /// Address of the running replication listener.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.inner
            .runtime
            .lock()
            .services
            .tcp
            .as_ref()
            .map(PeerListener::local_addr)
    }

    /// Address of the running discovery listener.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.inner
            .runtime
            .lock()
            .services
            .discovery
            .as_ref()
            .map(DiscoveryListener::local_addr)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Runs the cycles the current mode calls for, right now.
    ///
    /// Returns false if any cycle failed or was skipped for a configuration error.
    pub fn force_sync_now(&self) -> bool {
        self.inner.log.info("Manual sync requested");
        self.inner.run_cycles(None)
    }

    /// Runs one discovery round. Returns the number of newly registered peers.
    pub fn discover_peers(&self) -> usize {
        self.inner.discovery_round()
    }

    /// Probes the central store.
    pub fn test_central_connection(&self) -> bool {
        let config = self.inner.config.read().clone();
        let result = self
            .inner
            .central_bridge(&config)
            .and_then(|(bridge, endpoint)| bridge.test_connection(&endpoint));
        match result {
            Ok(()) => {
                self.inner.log.info("Central store connection OK");
                true
            }
            Err(e) => {
                self.inner
                    .log
                    .warn(format_args!("Central store connection failed: {e}"));
                false
            }
        }
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Registers a peer by address.
    pub fn add_peer(&self, ip: &str, port: u16, trusted: bool) -> bool {
        let ip: IpAddr = match ip.trim().parse() {
            Ok(ip) => ip,
            Err(_) => {
                self.inner.log.warn(format_args!("Invalid peer address: {ip}"));
                return false;
            }
        };
        if port == 0 {
            self.inner.log.warn("Invalid peer port: 0");
            return false;
        }
        match self.inner.registry.register(NewPeer::new(ip, port, trusted)) {
            Ok(Some(peer)) => {
                self.inner.log.info(format_args!("Added peer {peer}"));
                true
            }
            Ok(None) => {
                self.inner
                    .log
                    .warn(format_args!("Peer {ip}:{port} is already registered"));
                false
            }
            Err(e) => {
                self.inner.log.error(format_args!("Cannot add peer: {e}"));
                false
            }
        }
    }

    /// Removes a peer.
    pub fn remove_peer(&self, id: u64) -> bool {
        self.inner
            .report_peer_change(self.inner.registry.remove(id), id, "removed")
    }

    /// Changes whether a peer is replicated with.
    pub fn set_peer_trusted(&self, id: u64, trusted: bool) -> bool {
        let action = if trusted { "trusted" } else { "untrusted" };
        self.inner
            .report_peer_change(self.inner.registry.set_trusted(id, trusted), id, action)
    }

    /// Every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.registry.all().unwrap_or_else(|e| {
            self.inner.log.error(format_args!("Cannot list peers: {e}"));
            Vec::new()
        })
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Copy of the current configuration.
    pub fn configuration(&self) -> SyncConfiguration {
        self.inner.config.read().clone()
    }

    /// Re-reads the config store, restarting if a network setting changed while running.
    pub fn reload_configuration(&self) -> bool {
        let fresh = match SyncConfiguration::load(self.inner.config_store.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                self.inner
                    .log
                    .error(format_args!("Cannot reload sync configuration: {e}"));
                return false;
            }
        };
        report_invalid_keys(&self.inner.log, &fresh);
        let restart = {
            let mut current = self.inner.config.write();
            let restart = current.requires_restart(&fresh);
            *current = fresh;
            restart
        };
        self.inner.log.info("Sync configuration reloaded");
        if restart {
            self.restart();
        }
        true
    }

    /// Replication role.
    pub fn role(&self) -> SyncRole {
        self.inner.config.read().role
    }

    /// Sets the replication role.
    pub fn set_role(&self, role: SyncRole) -> bool {
        self.update(&[keys::ROLE], |c| c.role = role)
    }

    /// Active replication paths.
    pub fn hybrid_mode(&self) -> HybridMode {
        self.inner.config.read().hybrid_mode
    }

    /// Sets the active replication paths.
    pub fn set_hybrid_mode(&self, mode: HybridMode) -> bool {
        self.update(&[keys::HYBRID_MODE], |c| c.hybrid_mode = mode)
    }

    /// Minutes between scheduled cycles.
    pub fn interval_minutes(&self) -> u32 {
        self.inner.config.read().interval_minutes
    }

    /// Sets the minutes between scheduled cycles. Zero is rejected.
    pub fn set_interval_minutes(&self, minutes: u32) -> bool {
        if minutes == 0 {
            self.inner.log.warn("Sync interval must be at least one minute");
            return false;
        }
        self.update(&[keys::INTERVAL_MINUTES], |c| c.interval_minutes = minutes)
    }

    /// Conflict policy.
    pub fn conflict_strategy(&self) -> ConflictStrategy {
        self.inner.config.read().conflict_strategy
    }

    /// Sets the conflict policy.
    pub fn set_conflict_strategy(&self, strategy: ConflictStrategy) -> bool {
        self.update(&[keys::CONFLICT_STRATEGY], |c| c.conflict_strategy = strategy)
    }

    /// Days synced changelog entries are kept.
    pub fn changelog_retention_days(&self) -> u32 {
        self.inner.config.read().changelog_retention_days
    }

    /// Sets the changelog retention.
    pub fn set_changelog_retention_days(&self, days: u32) -> bool {
        self.update(&[keys::CHANGELOG_RETENTION_DAYS], |c| {
            c.changelog_retention_days = days
        })
    }

    /// Whether scheduled cycles run.
    pub fn auto_sync_enabled(&self) -> bool {
        self.inner.config.read().auto_sync_enabled
    }

    /// Enables or disables scheduled cycles.
    pub fn set_auto_sync_enabled(&self, enabled: bool) -> bool {
        self.update(&[keys::AUTO_SYNC_ENABLED], |c| c.auto_sync_enabled = enabled)
    }

    /// Transport compression flag.
    pub fn compression_enabled(&self) -> bool {
        self.inner.config.read().compression_enabled
    }

    /// Sets the transport compression flag.
    pub fn set_compression_enabled(&self, enabled: bool) -> bool {
        self.update(&[keys::COMPRESSION_ENABLED], |c| c.compression_enabled = enabled)
    }

    /// Transport encryption flag.
    pub fn encryption_enabled(&self) -> bool {
        self.inner.config.read().encryption_enabled
    }

    /// Sets the transport encryption flag.
    pub fn set_encryption_enabled(&self, enabled: bool) -> bool {
        self.update(&[keys::ENCRYPTION_ENABLED], |c| c.encryption_enabled = enabled)
    }

    /// Whether pulls delete local rows absent centrally.
    pub fn delete_local_on_central_pull(&self) -> bool {
        self.inner.config.read().delete_local_on_central_pull
    }

    /// Sets whether pulls delete local rows absent centrally.
    pub fn set_delete_local_on_central_pull(&self, enabled: bool) -> bool {
        self.update(&[keys::DELETE_LOCAL_ON_CENTRAL_PULL], |c| {
            c.delete_local_on_central_pull = enabled
        })
    }

    /// Central store URL.
    pub fn central_api_url(&self) -> Option<String> {
        self.inner.config.read().central_api_url.clone()
    }

    /// Sets the central store URL; an empty string clears it.
    pub fn set_central_api_url(&self, url: &str) -> bool {
        let url = Some(url.trim().to_string()).filter(|u| !u.is_empty());
        self.update(&[keys::CENTRAL_API_URL], |c| c.central_api_url = url)
    }

    /// Whether a central auth token is set.
    pub fn has_auth_token(&self) -> bool {
        self.inner.config.read().auth_token.is_some()
    }

    /// Sets the central auth token; an empty string clears it.
    pub fn set_auth_token(&self, token: &str) -> bool {
        let token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        self.update(&[keys::CENTRAL_AUTH_TOKEN], |c| c.auth_token = token)
    }

    /// Completion time of the last full central pull.
    pub fn last_central_pull_timestamp(&self) -> Option<u64> {
        self.inner.config.read().last_central_pull_timestamp
    }

    /// Applies `change`, persists `changed` keys, and restarts if a network
    /// setting changed while running.
    fn update(&self, changed: &[&'static str], change: impl FnOnce(&mut SyncConfiguration)) -> bool {
        let restart = match self.inner.update_config(changed, change) {
            Ok(restart) => restart,
            Err(e) => {
                self.inner
                    .log
                    .error(format_args!("Cannot save sync configuration: {e}"));
                return false;
            }
        };
        if restart {
            self.restart();
        }
        true
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn start_locked(this: &Arc<Self>, runtime: &mut Runtime) {
        this.transition(runtime, LifecycleState::Starting);
        let config = this.config.read().clone();
        this.log.info(format_args!(
            "Starting sync service (role {}, mode {}, every {} min)",
            config.role, config.hybrid_mode, config.interval_minutes
        ));

        let services = &mut runtime.services;
        let p2p = config.hybrid_mode.uses_p2p();

        if config.role.serves() && p2p {
            let addr = SocketAddr::new(this.net.bind_ip, this.net.tcp_port);
            match PeerListener::spawn(addr, this.exchange_handler(), this.net.join_deadline) {
                Ok(listener) => {
                    this.log
                        .info(format_args!("Replication listener on TCP {}", listener.local_addr()));
                    this.listen_port
                        .store(listener.local_addr().port(), Ordering::SeqCst);
                    services.tcp = Some(listener);
                }
                Err(e) => this
                    .log
                    .error(format_args!("Cannot start replication listener on {addr}: {e}")),
            }

            match this.discovery().spawn_listener(this.advertised_port()) {
                Ok(listener) => services.discovery = Some(listener),
                Err(e) => this.log.error(format_args!(
                    "Cannot start discovery listener on UDP {}: {e}",
                    this.net.discovery_port
                )),
            }
        }

        if config.auto_sync_enabled {
            let mut scheduler = Scheduler::new(WORKER_CAPACITY);
            let interval = config.interval();
            let runs_p2p = config.role.connects() && p2p;

            if runs_p2p || config.hybrid_mode.uses_central() {
                let weak = Arc::downgrade(this);
                if let Err(e) =
                    scheduler.schedule_fixed_delay(SYNC_WORKER, interval, interval, move |token| {
                        with_inner(&weak, |inner| inner.scheduled_tick(token));
                    })
                {
                    this.log.error(format_args!("Cannot schedule sync: {e}"));
                }
            }
            if runs_p2p {
                let weak = Arc::downgrade(this);
                if let Err(e) =
                    scheduler.schedule_fixed_delay(DISCOVERY_WORKER, interval, interval, move |_| {
                        with_inner(&weak, |inner| {
                            inner.discovery_round();
                        });
                    })
                {
                    this.log.error(format_args!("Cannot schedule discovery: {e}"));
                }
            }
            services.scheduler = Some(scheduler);
        } else {
            this.log.info("Automatic sync is disabled");
        }

        this.transition(runtime, LifecycleState::Running);
    }

    fn stop_locked(&self, runtime: &mut Runtime) {
        if runtime.lifecycle.state() != LifecycleState::Running {
            return;
        }
        self.transition(runtime, LifecycleState::Stopping);

        let services = std::mem::take(&mut runtime.services);
        if let Some(scheduler) = services.scheduler {
            let detached = scheduler.shutdown(self.net.join_deadline);
            if !detached.is_empty() {
                self.log.warn(format_args!(
                    "Workers still finishing after stop: {}",
                    detached.join(", ")
                ));
            }
        }
        if let Some(mut listener) = services.tcp {
            listener.stop();
        }
        if let Some(mut listener) = services.discovery {
            listener.stop();
        }
        self.listen_port.store(0, Ordering::SeqCst);
        thread::sleep(self.net.shutdown_grace);

        self.transition(runtime, LifecycleState::Idle);
        self.log.info("Sync service stopped");
    }

    fn transition(&self, runtime: &mut Runtime, next: LifecycleState) {
        match runtime.lifecycle.transition(next) {
            Ok(t) => self.log.info(format_args!("Sync state: {} -> {}", t.from, t.to)),
            Err(e) => self.log.error(e),
        }
    }

    fn scheduled_tick(&self, token: &CancelToken) {
        self.run_cycles(Some(token));

        let retention = self.config.read().changelog_retention_days;
        match self.tracker.prune(retention, now_millis()) {
            Ok(0) => {}
            Ok(pruned) => self
                .log
                .info(format_args!("Pruned {pruned} synced changelog entries")),
            Err(e) => self.log.warn(format_args!("Changelog pruning failed: {e}")),
        }
    }

    /// Runs the P2P and/or central cycle. Returns false if any failed.
    fn run_cycles(&self, token: Option<&CancelToken>) -> bool {
        let _cycle = self.cycle.lock();
        let config = self.config.read().clone();
        let mut ok = true;

        if config.role.connects() && config.hybrid_mode.uses_p2p() {
            match self.run_p2p_cycle(&config, token) {
                Ok(report) => ok &= report.failed == 0,
                Err(e) => {
                    self.log.warn(format_args!("P2P sync skipped: {e}"));
                    ok = false;
                }
            }
        }

        if config.hybrid_mode.uses_central() {
            match self.run_central_cycle(&config) {
                Ok(()) => {}
                Err(e @ SyncError::Configuration(_)) => {
                    self.log.warn(format_args!("Central sync skipped: {e}"));
                    ok = false;
                }
                Err(e) => {
                    self.log.warn(format_args!("Central sync failed: {e}"));
                    ok = false;
                }
            }
        }
        ok
    }

    fn run_p2p_cycle(
        &self,
        config: &SyncConfiguration,
        token: Option<&CancelToken>,
    ) -> SyncResult<P2pReport> {
        let strategy = config.strategy()?;
        let peers = self.registry.trusted()?;
        let exchanger = PeerExchanger::new(
            Arc::clone(&self.transport),
            self.tracker.clone(),
            self.applier.clone(),
        );
        let listen_port = Some(self.listen_port.load(Ordering::SeqCst)).filter(|p| *p != 0);
        let flags = config.transport_flags();
        let mut report = P2pReport {
            peers: peers.len(),
            ..P2pReport::default()
        };

        self.log
            .info(format_args!("P2P sync started with {} trusted peers", peers.len()));
        for peer in peers {
            if token.is_some_and(CancelToken::is_cancelled) {
                return Err(SyncError::Cancelled);
            }

            let started = now_millis();
            self.registry.set_status(peer.id, PeerStatus::Syncing)?;
            match exchanger.exchange_with(&peer, listen_port, strategy, flags) {
                Ok(summary) => {
                    self.registry.record_sync(peer.id, started)?;
                    self.log.info(format_args!(
                        "Synced with {peer}: sent {}, received {} (applied {}, kept local {})",
                        summary.sent,
                        summary.received.applied + summary.received.kept_local + summary.received.skipped,
                        summary.received.applied,
                        summary.received.kept_local
                    ));
                    report.succeeded += 1;
                }
                Err(e) => {
                    self.registry.set_status(peer.id, PeerStatus::Offline)?;
                    self.log.warn(format_args!("Sync with {peer} failed: {e}"));
                    report.failed += 1;
                }
            }
        }

        self.log.info(format_args!(
            "P2P sync finished: {} ok, {} failed",
            report.succeeded, report.failed
        ));
        Ok(report)
    }

    fn run_central_cycle(&self, config: &SyncConfiguration) -> SyncResult<()> {
        let strategy = config.strategy()?;
        let (bridge, endpoint) = self.central_bridge(config)?;
        self.log
            .info(format_args!("Central sync started with {}", endpoint.url));

        let push = bridge.push(&endpoint)?;
        let pull = bridge.pull(&endpoint, strategy, config.delete_local_on_central_pull)?;

        if pull.is_complete() {
            self.update_config(&[keys::LAST_CENTRAL_PULL_TIMESTAMP], |c| {
                c.last_central_pull_timestamp = Some(pull.completed_at)
            })?;
        }
        self.log.info("Central sync finished");

        if push.failed > 0 {
            return Err(SyncError::Central(format!(
                "{} entries were rejected",
                push.failed
            )));
        }
        if !pull.is_complete() {
            return Err(SyncError::Central(format!(
                "pull incomplete for {}",
                pull.failed_tables.join(", ")
            )));
        }
        Ok(())
    }

    fn central_bridge(
        &self,
        config: &SyncConfiguration,
    ) -> SyncResult<(CentralSyncBridge, CentralEndpoint)> {
        let endpoint = config.central_endpoint(self.net.central_timeout)?;
        let connector = self
            .central
            .as_ref()
            .ok_or_else(|| SyncError::Configuration("no central connector configured".into()))?;
        let bridge = CentralSyncBridge::new(
            Arc::clone(connector),
            Arc::clone(&self.store),
            Arc::clone(&self.gate),
            self.entities.clone(),
            self.log.clone(),
        );
        Ok((bridge, endpoint))
    }

    fn discovery_round(&self) -> usize {
        match self.discovery().discover(self.advertised_port()) {
            Ok(report) => report.registered.len(),
            Err(e) => {
                self.log.warn(format_args!("Discovery round aborted: {e}"));
                0
            }
        }
    }

    fn discovery(&self) -> DiscoveryService {
        DiscoveryService::new(self.net.clone(), self.registry.clone(), self.log.clone())
    }

    fn exchange_handler(&self) -> ExchangeHandler {
        ExchangeHandler::new(
            Arc::clone(&self.config),
            self.tracker.clone(),
            self.applier.clone(),
            self.registry.clone(),
            self.net.io_timeout,
            self.log.clone(),
        )
    }

    fn advertised_port(&self) -> u16 {
        match self.listen_port.load(Ordering::SeqCst) {
            0 => self.net.tcp_port,
            port => port,
        }
    }

    /// Returns whether the change requires a restart.
    fn update_config(
        &self,
        changed: &[&'static str],
        change: impl FnOnce(&mut SyncConfiguration),
    ) -> SyncResult<bool> {
        let mut config = self.config.write();
        let mut next = config.clone();
        change(&mut next);
        next.invalid_keys.retain(|k| !changed.contains(k));

        for key in changed {
            self.config_store.set(key, &next.value_of(key))?;
        }
        let restart = config.requires_restart(&next);
        *config = next;
        Ok(restart)
    }

    fn report_peer_change(&self, result: SyncResult<bool>, id: u64, action: &str) -> bool {
        match result {
            Ok(true) => {
                self.log.info(format_args!("Peer {id} {action}"));
                true
            }
            Ok(false) => {
                self.log.warn(format_args!("Peer {id} not found"));
                false
            }
            Err(e) => {
                self.log.error(format_args!("Peer {id} not {action}: {e}"));
                false
            }
        }
    }
}

fn with_inner(weak: &Weak<Inner>, f: impl FnOnce(&Inner)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

fn report_invalid_keys(log: &SyncLog, config: &SyncConfiguration) {
    for key in &config.invalid_keys {
        log.warn(format_args!("Ignoring invalid value for {key}; using default"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::MemoryCentralStore;
    use crate::config_store::MemoryConfigStore;
    use crate::log::testing::CapturedLog;
    use crate::store::MemoryLocalStore;
    use peersync_protocol::Record;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use LifecycleState::*;

    fn net() -> NetworkConfig {
        NetworkConfig::new()
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_tcp_port(0)
            .with_discovery_port(0)
            .with_shutdown_grace(Duration::from_millis(10))
    }

    fn orchestrator(values: &[(&str, &str)]) -> (SyncOrchestrator, Arc<MemoryConfigStore>, CapturedLog) {
        let config_store = Arc::new(MemoryConfigStore::with_values(values.iter().copied()));
        let captured = CapturedLog::default();
        let orchestrator = SyncOrchestrator::builder(Arc::new(MemoryLocalStore::new()), config_store.clone())
            .with_network(net())
            .with_log_sink(captured.sink())
            .build();
        (orchestrator, config_store, captured)
    }

    #[test]
    fn start_and_stop_walk_the_state_machine() {
        let (orchestrator, _, _) = orchestrator(&[]);
        orchestrator.stop();
        assert_eq!(orchestrator.lifecycle_state(), Idle);
        assert!(orchestrator.state_transitions().is_empty());

        orchestrator.start();
        assert_eq!(orchestrator.lifecycle_state(), Running);
        assert!(orchestrator.listener_addr().is_some());
        assert!(orchestrator.discovery_addr().is_some());

        orchestrator.stop();
        assert_eq!(orchestrator.lifecycle_state(), Idle);
        assert!(orchestrator.listener_addr().is_none());

        let states: Vec<_> = orchestrator.state_transitions().iter().map(|t| t.to).collect();
        assert_eq!(states, vec![Starting, Running, Stopping, Idle]);
    }

    #[test]
    fn start_is_idempotent() {
        let (orchestrator, _, _) = orchestrator(&[]);
        orchestrator.start();
        orchestrator.start();
        assert_eq!(orchestrator.lifecycle_state(), Running);
        let states: Vec<_> = orchestrator.state_transitions().iter().map(|t| t.to).collect();
        assert_eq!(states, vec![Starting, Running, Stopping, Idle, Starting, Running]);
    }

    #[test]
    fn services_follow_role_and_mode() {
        let (client, _, _) = orchestrator(&[(keys::ROLE, "CLIENT")]);
        client.start();
        assert!(client.listener_addr().is_none());
        client.stop();

        let (central_only, _, _) = orchestrator(&[(keys::HYBRID_MODE, "CENTRAL_API_ONLY")]);
        central_only.start();
        assert!(central_only.listener_addr().is_none());
        assert!(central_only.discovery_addr().is_none());
        central_only.stop();
    }

    #[test]
    fn network_setting_restarts_running_service() {
        let (orchestrator, store, _) = orchestrator(&[]);
        orchestrator.start();
        let before = orchestrator.state_transitions().len();

        assert!(orchestrator.set_role(SyncRole::Client));
        assert_eq!(store.get(keys::ROLE).unwrap().as_deref(), Some("CLIENT"));

        let states: Vec<_> = orchestrator.state_transitions()[before..]
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![(Running, Stopping), (Stopping, Idle), (Idle, Starting), (Starting, Running)]
        );
        assert!(orchestrator.listener_addr().is_none());
    }

    #[test]
    fn policy_setting_does_not_restart() {
        let (orchestrator, store, _) = orchestrator(&[]);
        orchestrator.start();
        let before = orchestrator.state_transitions().len();

        assert!(orchestrator.set_conflict_strategy(ConflictStrategy::ServerWins));
        assert!(orchestrator.set_changelog_retention_days(7));
        assert_eq!(orchestrator.state_transitions().len(), before);
        assert_eq!(
            store.get(keys::CONFLICT_STRATEGY).unwrap().as_deref(),
            Some(ConflictStrategy::ServerWins.as_str())
        );
    }

    #[test]
    fn setters_persist_without_restart_when_idle() {
        let (orchestrator, store, _) = orchestrator(&[]);
        assert!(orchestrator.set_interval_minutes(15));
        assert!(!orchestrator.set_interval_minutes(0));
        assert_eq!(orchestrator.interval_minutes(), 15);
        assert_eq!(store.get(keys::INTERVAL_MINUTES).unwrap().as_deref(), Some("15"));
        assert!(orchestrator.state_transitions().is_empty());
    }

    #[test]
    fn reload_picks_up_external_changes() {
        let (orchestrator, store, _) = orchestrator(&[]);
        orchestrator.start();
        store.set(keys::HYBRID_MODE, "CENTRAL_API_ONLY").unwrap();

        assert!(orchestrator.reload_configuration());
        assert_eq!(orchestrator.hybrid_mode(), HybridMode::CentralApiOnly);
        assert!(orchestrator.listener_addr().is_none());
        assert_eq!(orchestrator.lifecycle_state(), Running);
    }

    #[test]
    fn peer_management() {
        let (orchestrator, _, log) = orchestrator(&[]);
        assert!(orchestrator.add_peer("192.168.1.20", 8080, false));
        assert!(!orchestrator.add_peer("192.168.1.20", 8080, true));
        assert!(!orchestrator.add_peer("not-an-ip", 8080, true));
        assert!(log.contains("already registered"));

        let id = orchestrator.peers()[0].id;
        assert!(orchestrator.set_peer_trusted(id, true));
        assert!(orchestrator.peers()[0].is_trusted);
        assert!(orchestrator.remove_peer(id));
        assert!(!orchestrator.remove_peer(id));
        assert!(orchestrator.peers().is_empty());
    }

    #[test]
    fn unreachable_peer_is_marked_offline() {
        let (orchestrator, _, _) = orchestrator(&[(keys::ROLE, "CLIENT")]);
        // nothing listens on the discard port
        assert!(orchestrator.add_peer("127.0.0.1", 9, true));

        assert!(!orchestrator.force_sync_now());
        assert_eq!(orchestrator.peers()[0].status, PeerStatus::Offline);
    }

    #[test]
    fn central_cycle_without_url_is_a_configuration_skip() {
        let (orchestrator, _, log) = orchestrator(&[(keys::HYBRID_MODE, "CENTRAL_API_ONLY")]);
        assert!(!orchestrator.force_sync_now());
        assert!(log.contains("central API URL is not set"));
        assert!(!orchestrator.test_central_connection());
    }

    #[test]
    fn central_cycle_records_pull_timestamp() {
        let local = Arc::new(MemoryLocalStore::new());
        let central = MemoryCentralStore::new();
        central.put_row("users", Record::new(9, 1));
        let config_store = Arc::new(MemoryConfigStore::with_values([
            (keys::HYBRID_MODE, "CENTRAL_API_ONLY"),
            (keys::CENTRAL_API_URL, "memory://central"),
        ]));
        let orchestrator = SyncOrchestrator::builder(local.clone(), config_store.clone())
            .with_network(net())
            .with_central(Arc::new(central.clone()))
            .build();
        local.insert_tracked("users", Record::new(1, 5)).unwrap();

        assert!(orchestrator.test_central_connection());
        assert!(orchestrator.force_sync_now());
        assert_eq!(central.rows("users").len(), 2);
        assert_eq!(local.local_ids("users").unwrap(), vec![1, 9]);

        let recorded = orchestrator.last_central_pull_timestamp();
        assert!(recorded.is_some());
        assert_eq!(
            config_store.get(keys::LAST_CENTRAL_PULL_TIMESTAMP).unwrap(),
            recorded.map(|t| t.to_string())
        );
    }

    #[test]
    fn invalid_strategy_skips_cycles_until_fixed() {
        let local = Arc::new(MemoryLocalStore::new());
        let central = MemoryCentralStore::new();
        let config_store = Arc::new(MemoryConfigStore::with_values([
            (keys::HYBRID_MODE, "CENTRAL_API_ONLY"),
            (keys::CENTRAL_API_URL, "memory://central"),
            (keys::CONFLICT_STRATEGY, "MERGE"),
        ]));
        let orchestrator = SyncOrchestrator::builder(local, config_store)
            .with_network(net())
            .with_central(Arc::new(central.clone()))
            .build();

        assert!(!orchestrator.force_sync_now());
        assert!(orchestrator.set_conflict_strategy(ConflictStrategy::LastWriteWins));
        assert!(orchestrator.force_sync_now());
    }
}
