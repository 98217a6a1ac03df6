//! Per-host identifier cached across restarts.
//!
//! Shared-memory addresses are only meaningful on the host that created
//! them; the serialized form embeds this identifier so that deserializing on
//! another host fails cleanly instead of resolving a wrong peer. The value
//! is generated once and cached in a small TOML file, best effort.

use std::io::Read;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::SHM_PREFIX;

#[derive(Serialize, Deserialize)]
struct HostIdFile {
    host_id: String,
}

fn cache_path() -> String {
    format!("/tmp/{SHM_PREFIX}_uuid.cfg")
}

fn load_cached() -> Option<u128> {
    let content = std::fs::read_to_string(cache_path()).ok()?;
    let file: HostIdFile = toml::from_str(&content).ok()?;
    u128::from_str_radix(&file.host_id, 16).ok()
}

fn generate() -> u128 {
    let mut bytes = [0u8; 16];
    match std::fs::File::open("/dev/urandom").and_then(|mut f| f.read_exact(&mut bytes)) {
        Ok(()) => u128::from_ne_bytes(bytes),
        Err(_) => {
            // Degraded fallback, still unique enough within one host.
            let pid = std::process::id() as u128;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            now ^ (pid << 64)
        }
    }
}

fn store(id: u128) {
    let file = HostIdFile {
        host_id: format!("{id:032x}"),
    };
    if let Ok(content) = toml::to_string(&file) {
        let _ = std::fs::write(cache_path(), content);
    }
}

/// The host identifier, loading or creating the cache file on first use.
pub(crate) fn host_id() -> u128 {
    static HOST_ID: OnceLock<u128> = OnceLock::new();
    *HOST_ID.get_or_init(|| match load_cached() {
        Some(id) => id,
        None => {
            let id = generate();
            store(id);
            id
        }
    })
}
