//! Persistent agent identity (spec.md §6: `<buffer_dir>/agent_id`). Generated
//! once on first run and reused across restarts and self-updates.

use std::path::Path;

use uuid::Uuid;

pub fn load_or_create(buffer_dir: &Path) -> anyhow::Result<String> {
    let path = buffer_dir.join("agent_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    std::fs::create_dir_all(buffer_dir)?;
    let id = Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_load_reuses_the_persisted_id() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
