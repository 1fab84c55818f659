//! Config command implementations.

use peersync_engine::{
    keys, ConfigStore, JsonFileConfigStore, MemoryConfigStore, SyncConfiguration,
};
use std::collections::BTreeMap;
use std::path::Path;

const MASK: &str = "********";

/// Prints every sync setting.
pub fn show(config_path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonFileConfigStore::open(config_path)?;
    let config = SyncConfiguration::load(&store)?;
    println!("{}", render(&config, format)?);
    Ok(())
}

/// Validates and persists one setting.
pub fn set(config_path: &Path, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let key = keys::ALL
        .into_iter()
        .find(|k| *k == key)
        .ok_or_else(|| format!("Unknown setting {key:?}"))?;

    let probe = SyncConfiguration::load(&MemoryConfigStore::with_values([(key, value)]))?;
    if probe.invalid_keys.contains(&key) {
        return Err(format!("Invalid value {value:?} for {key}").into());
    }

    let store = JsonFileConfigStore::open(config_path)?;
    store.set(key, value)?;
    println!("{key} updated");
    Ok(())
}

fn settings(config: &SyncConfiguration) -> BTreeMap<&'static str, String> {
    keys::ALL
        .into_iter()
        .map(|key| {
            let value = config.value_of(key);
            let value = if key == keys::CENTRAL_AUTH_TOKEN && !value.is_empty() {
                MASK.to_string()
            } else {
                value
            };
            (key, value)
        })
        .collect()
}

fn render(config: &SyncConfiguration, format: &str) -> Result<String, serde_json::Error> {
    let values = settings(config);
    if format == "json" {
        return serde_json::to_string_pretty(&values);
    }

    let width = keys::ALL.iter().map(|k| k.len()).max().unwrap_or_default();
    let mut out = String::from("Sync settings\n");
    for (key, value) in &values {
        let note = if config.invalid_keys.contains(key) {
            "  (invalid, using default)"
        } else {
            ""
        };
        out.push_str(&format!("  {key:width$}  {value}{note}\n"));
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_persists_valid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.json");

        set(&path, keys::ROLE, "CLIENT").unwrap();
        set(&path, keys::INTERVAL_MINUTES, "15").unwrap();

        let store = JsonFileConfigStore::open(&path).unwrap();
        let config = SyncConfiguration::load(&store).unwrap();
        assert_eq!(config.role.as_str(), "CLIENT");
        assert_eq!(config.interval_minutes, 15);
    }

    #[test]
    fn set_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peersync.json");

        assert!(set(&path, "sync.nope", "1").is_err());
        assert!(set(&path, keys::INTERVAL_MINUTES, "0").is_err());
        assert!(set(&path, keys::CONFLICT_STRATEGY, "COIN_FLIP").is_err());
        // nothing was written
        assert!(!path.exists());
    }

    #[test]
    fn render_masks_token_and_flags_invalid() {
        let store = MemoryConfigStore::with_values([
            (keys::CENTRAL_AUTH_TOKEN, "secret"),
            (keys::AUTO_SYNC_ENABLED, "maybe"),
        ]);
        let config = SyncConfiguration::load(&store).unwrap();

        let text = render(&config, "text").unwrap();
        assert!(!text.contains("secret"));
        assert!(text.contains(MASK));
        assert!(text.contains("(invalid, using default)"));

        let json: BTreeMap<String, String> =
            serde_json::from_str(&render(&config, "json").unwrap()).unwrap();
        assert_eq!(json[keys::CENTRAL_AUTH_TOKEN], MASK);
        assert_eq!(json.len(), keys::ALL.len());
    }
}
