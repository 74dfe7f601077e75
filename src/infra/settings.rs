use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    pub api_endpoint: String,
    pub frontend_endpoint: String,
    pub bind: String,
    pub port: u16,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_endpoint: "http://localhost:8992".to_string(),
            frontend_endpoint: "http://localhost:3082".to_string(),
            bind: "127.0.0.1".to_string(),
            port: 8991,
            poll_interval_secs: 5,
            request_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveStateDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_state_dir() -> Result<PathBuf, ResolveStateDirError> {
    if let Some(override_dir) = std::env::var_os("CCWEB_STATE_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let Some(home) = dirs::home_dir() else {
        return Err(ResolveStateDirError::HomeDirNotFound);
    };
    Ok(home.join(".ccweb"))
}

#[derive(Debug, Error)]
pub enum LoadSettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

fn settings_path(state_dir: &Path) -> PathBuf {
    state_dir.join("settings.json")
}

/// File values, then `CCWEB_*` environment overrides.
pub fn load_settings(state_dir: &Path) -> Result<Settings, LoadSettingsError> {
    let mut settings = load_settings_file(state_dir)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    Ok(settings)
}

pub fn load_settings_file(state_dir: &Path) -> Result<Settings, LoadSettingsError> {
    let raw = match fs::read_to_string(settings_path(state_dir)) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(error) => return Err(error.into()),
    };
    Ok(serde_json::from_str(&raw)?)
}

pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), LoadSettingsError> {
    if let Some(value) = lookup("CCWEB_API_ENDPOINT") {
        settings.api_endpoint = value;
    }
    if let Some(value) = lookup("CCWEB_FRONTEND_ENDPOINT") {
        settings.frontend_endpoint = value;
    }
    if let Some(value) = lookup("CCWEB_BIND") {
        settings.bind = value;
    }
    if let Some(value) = lookup("CCWEB_PORT") {
        settings.port = value
            .trim()
            .parse::<u16>()
            .map_err(|_| LoadSettingsError::InvalidEnv {
                name: "CCWEB_PORT",
                value,
            })?;
    }
    if let Some(value) = lookup("CCWEB_LOG") {
        settings.log_level = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let settings = load_settings_file(dir.path()).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("settings.json"),
            r#"{"api_endpoint":"http://backend:9000","port":9100}"#,
        )
        .expect("write");

        let settings = load_settings_file(dir.path()).expect("load");
        assert_eq!(settings.api_endpoint, "http://backend:9000");
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.bind, "127.0.0.1");
    }

    #[test]
    fn env_overrides_win_and_bad_port_is_rejected() {
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, |name| match name {
            "CCWEB_PORT" => Some("7000".to_string()),
            "CCWEB_LOG" => Some("debug".to_string()),
            _ => None,
        })
        .expect("apply");
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.log_level, "debug");

        let error = apply_env_overrides(&mut settings, |name| {
            (name == "CCWEB_PORT").then(|| "http".to_string())
        })
        .expect_err("invalid port");
        assert!(matches!(
            error,
            LoadSettingsError::InvalidEnv {
                name: "CCWEB_PORT",
                ..
            }
        ));
    }
}
