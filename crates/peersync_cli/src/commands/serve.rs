//! Serve command implementation.

use peersync_engine::{JsonFileConfigStore, MemoryLocalStore, NetworkConfig, SyncOrchestrator};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

/// Runs a node until Enter is pressed or stdin closes.
pub fn run(config_path: &Path, net: NetworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(JsonFileConfigStore::open(config_path)?);
    let store = Arc::new(MemoryLocalStore::new());

    let orchestrator = SyncOrchestrator::builder(store, config)
        .with_network(net)
        .with_log_sink(Arc::new(|line: &str| println!("{line}")))
        .build();
    orchestrator.start();

    let settings = orchestrator.configuration();
    println!(
        "Node running: role {}, mode {}",
        settings.role, settings.hybrid_mode
    );
    if let Some(addr) = orchestrator.listener_addr() {
        println!("  Replication: {addr}");
    }
    if let Some(addr) = orchestrator.discovery_addr() {
        println!("  Discovery:   {addr}");
    }
    println!("Press Enter to stop.");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    orchestrator.stop();
    println!("Node stopped.");
    Ok(())
}
