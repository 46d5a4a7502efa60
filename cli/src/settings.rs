//! Plaintext `key=value` settings and preset files.
//!
//! Settings are loaded at startup (command-line flags win) and written
//! back on clean shutdown so KISS parameter frames survive restarts.

use packetwave_core::{CodeRate, Modulation, TncConfig};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("packetwave"))
}

pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("settings"))
}

pub fn presets_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("presets"))
}

fn parse_kv(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Overlay saved settings onto `config`. Unknown keys are ignored,
/// malformed values keep the current setting.
pub fn load(path: &Path, config: &mut TncConfig) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let map = parse_kv(&text);
    let mut set_string = |key: &str, slot: &mut String| {
        if let Some(value) = map.get(key) {
            *slot = value.clone();
        }
    };
    set_string("callsign", &mut config.callsign);
    set_string("bind_address", &mut config.bind_address);

    fn set_parsed<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, slot: &mut T) {
        if let Some(value) = map.get(key) {
            if let Ok(parsed) = value.parse() {
                *slot = parsed;
            }
        }
    }
    set_parsed(&map, "port", &mut config.port);
    set_parsed(&map, "center_freq", &mut config.center_freq);
    set_parsed(&map, "tx_delay_ms", &mut config.tx_delay_ms);
    set_parsed(&map, "slot_time_ms", &mut config.slot_time_ms);
    set_parsed(&map, "p_persistence", &mut config.p_persistence);
    set_parsed(&map, "csma_enabled", &mut config.csma_enabled);
    set_parsed(&map, "carrier_threshold_db", &mut config.carrier_threshold_db);
    set_parsed(&map, "fragmentation_enabled", &mut config.fragmentation_enabled);
    set_parsed(&map, "short_frame", &mut config.short_frame);
    if let Some(value) = map.get("modulation") {
        if let Some(modulation) = Modulation::from_name(value) {
            config.modulation = modulation;
        }
    }
    if let Some(value) = map.get("code_rate") {
        if let Some(rate) = CodeRate::from_name(value) {
            config.code_rate = rate;
        }
    }
    true
}

pub fn save(path: &Path, config: &TncConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "callsign={}", config.callsign)?;
    writeln!(file, "bind_address={}", config.bind_address)?;
    writeln!(file, "port={}", config.port)?;
    writeln!(file, "center_freq={}", config.center_freq)?;
    writeln!(file, "modulation={}", config.modulation.name())?;
    writeln!(file, "code_rate={}", config.code_rate.name())?;
    writeln!(file, "short_frame={}", config.short_frame)?;
    writeln!(file, "tx_delay_ms={}", config.tx_delay_ms)?;
    writeln!(file, "slot_time_ms={}", config.slot_time_ms)?;
    writeln!(file, "p_persistence={}", config.p_persistence)?;
    writeln!(file, "csma_enabled={}", config.csma_enabled)?;
    writeln!(file, "carrier_threshold_db={}", config.carrier_threshold_db)?;
    writeln!(file, "fragmentation_enabled={}", config.fragmentation_enabled)?;
    Ok(())
}

/// Preset lines look like `hf-weak=QPSK,1/4,short`.
pub fn apply_preset(path: &Path, name: &str, config: &mut TncConfig) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let map = parse_kv(&text);
    let Some(spec) = map.get(name) else {
        return false;
    };
    let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return false;
    }
    let (Some(modulation), Some(rate)) = (
        Modulation::from_name(parts[0]),
        CodeRate::from_name(parts[1]),
    ) else {
        return false;
    };
    config.modulation = modulation;
    config.code_rate = rate;
    config.short_frame = parts[2].eq_ignore_ascii_case("short");
    true
}
