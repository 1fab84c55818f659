//! Discover command implementation.

use peersync_engine::{JsonFileConfigStore, MemoryLocalStore, NetworkConfig, SyncOrchestrator};
use std::path::Path;
use std::sync::Arc;

/// Runs one discovery round and prints the peers that answered.
pub fn run(
    config_path: &Path,
    net: NetworkConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(JsonFileConfigStore::open(config_path)?);
    let orchestrator = SyncOrchestrator::builder(Arc::new(MemoryLocalStore::new()), config)
        .with_network(net)
        .build();

    orchestrator.discover_peers();
    let peers = orchestrator.peers();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&peers)?);
        }
        _ => {
            if peers.is_empty() {
                println!("No peers answered.");
            }
            for peer in &peers {
                println!("{peer}");
            }
        }
    }

    Ok(())
}
