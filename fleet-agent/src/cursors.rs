//! Per-gateway acknowledged-sequence cursors (spec.md §6:
//! `<buffer_dir>/wab/cursors`). Fsynced on every update so a crash never loses
//! more than the last unflushed ack; loaded once at startup to resume WAB
//! replay from the right point per gateway.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cursors {
    #[serde(flatten)]
    by_gateway: HashMap<String, u64>,
}

pub struct CursorStore {
    path: PathBuf,
    cursors: std::sync::Mutex<Cursors>,
}

impl CursorStore {
    pub fn open(buffer_dir: &Path) -> anyhow::Result<Self> {
        let wab_dir = buffer_dir.join("wab");
        std::fs::create_dir_all(&wab_dir)?;
        let path = wab_dir.join("cursors");
        let cursors = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).unwrap_or_default(),
            _ => Cursors::default(),
        };
        Ok(Self {
            path,
            cursors: std::sync::Mutex::new(cursors),
        })
    }

    pub fn get(&self, gateway: &str) -> u64 {
        self.cursors.lock().unwrap().by_gateway.get(gateway).copied().unwrap_or(0)
    }

    /// Persists the new cursor value for `gateway`, fsyncing before return.
    pub fn set(&self, gateway: &str, seq: u64) -> anyhow::Result<()> {
        let snapshot = {
            let mut guard = self.cursors.lock().unwrap();
            guard.by_gateway.insert(gateway.to_string(), seq);
            guard.clone()
        };
        let text = serde_json::to_string(&snapshot)?;
        let mut file = std::fs::File::create(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// The lowest acknowledged sequence across all configured gateways; the
    /// WAB may retire entries at or below this floor (spec.md §4.2 fan-out:
    /// "only retires an entry once all configured gateways have acknowledged
    /// it").
    pub fn slowest(&self, gateways: &[String]) -> u64 {
        let guard = self.cursors.lock().unwrap();
        gateways
            .iter()
            .map(|g| guard.by_gateway.get(g).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::open(dir.path()).unwrap();
        store.set("gw1", 42).unwrap();
        assert_eq!(store.get("gw1"), 42);
        assert_eq!(store.get("gw2"), 0);
    }

    #[test]
    fn reopen_recovers_persisted_cursors() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CursorStore::open(dir.path()).unwrap();
            store.set("gw1", 7).unwrap();
        }
        let store = CursorStore::open(dir.path()).unwrap();
        assert_eq!(store.get("gw1"), 7);
    }

    #[test]
    fn slowest_is_the_minimum_across_gateways() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::open(dir.path()).unwrap();
        store.set("gw1", 10).unwrap();
        store.set("gw2", 3).unwrap();
        assert_eq!(store.slowest(&["gw1".to_string(), "gw2".to_string()]), 3);
    }
}
