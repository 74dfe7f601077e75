use crate::domain::SessionStore;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

fn session_store_path(state_dir: &Path) -> PathBuf {
    state_dir.join("session_store.json")
}

fn atomic_write_json(path: &Path, value: &impl Serialize) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp_path, format!("{text}\n"))?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

pub fn load_session_store(state_dir: &Path) -> io::Result<SessionStore> {
    let raw = match fs::read_to_string(session_store_path(state_dir)) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Ok(SessionStore::default());
        }
        Err(error) => return Err(error),
    };
    serde_json::from_str(&raw).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

pub fn save_session_store(state_dir: &Path, store: &SessionStore) -> io::Result<()> {
    atomic_write_json(&session_store_path(state_dir), store)
}
