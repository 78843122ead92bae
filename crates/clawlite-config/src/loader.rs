use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use clawlite_core::{ClawLiteError, Result};

use crate::schema::AppConfig;

/// Loads, persists and optionally hot-reloads the ClawLite configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > CLAWLITE_CONFIG env >
    /// ~/.clawlite/config.json
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CLAWLITE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clawlite")
            .join("config.json")
    }

    /// Load the config from disk, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<AppConfig>(&raw).map_err(|e| {
                ClawLiteError::ConfigInvalid(format!(
                    "failed to parse {}: {e}",
                    config_path.display()
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            AppConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{w}");
                }
            }
            Err(e) => return Err(ClawLiteError::ConfigInvalid(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Shared reference for components that follow hot reloads.
    pub fn shared(&self) -> Arc<RwLock<AppConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Environment overrides. Credentials are env-first: a set environment
    /// variable wins over the config file.
    fn apply_env_overrides(mut config: AppConfig) -> AppConfig {
        if let Ok(v) = std::env::var("CLAWLITE_MODEL") {
            if !v.trim().is_empty() {
                config.provider.model = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("CLAWLITE_WORKSPACE") {
            if !v.trim().is_empty() {
                config.workspace_path = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = std::env::var("CLAWLITE_GATEWAY_HOST") {
            if !v.trim().is_empty() {
                config.gateway.host = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("CLAWLITE_GATEWAY_PORT") {
            if let Ok(port) = v.trim().parse::<u16>() {
                config.gateway.port = port;
            }
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            if !v.trim().is_empty() {
                config.provider.anthropic_api_key = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                config.provider.openai_api_key = Some(v.trim().to_string());
            }
        }
        config
    }

    /// Persist the current config to disk as pretty-printed JSON.
    pub fn save(&self) -> Result<()> {
        let config = self.config.read().clone();
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&config)?;
        std::fs::write(&self.config_path, raw)?;
        Ok(())
    }

    /// Generate and persist the gateway bearer token if it is absent.
    /// Returns the effective token.
    pub fn ensure_gateway_token(&self) -> Result<String> {
        {
            let config = self.config.read();
            if !config.gateway.token.is_empty() {
                return Ok(config.gateway.token.clone());
            }
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.config.write().gateway.token = token.clone();
        self.save()?;
        info!("generated gateway bearer token on first run");
        Ok(token)
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(ClawLiteError::ConfigInvalid(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = serde_json::from_str::<AppConfig>(&raw).map_err(|e| {
            ClawLiteError::ConfigInvalid(format!(
                "failed to parse {}: {e}",
                self.config_path.display()
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads on changes to the
    /// config file. The returned watcher must be kept alive.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        // Editors create temp files and rename over ours —
                        // match by file name rather than full path.
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }
                        match std::fs::read_to_string(&path_for_event) {
                            Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
                                Ok(new_config) => {
                                    let new_config = ConfigLoader::apply_env_overrides(new_config);
                                    *config.write() = new_config;
                                    info!("configuration hot-reloaded");
                                }
                                Err(e) => {
                                    warn!(error = %e, "config file has errors, keeping current config");
                                }
                            },
                            Err(e) => {
                                warn!(error = %e, "failed to read config file during hot-reload");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "config watcher error"),
                }
            })
            .map_err(|e| ClawLiteError::ConfigInvalid(format!("failed to create watcher: {e}")))?;

        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ClawLiteError::ConfigInvalid(format!("failed to watch config directory: {e}"))
            })?;

        Ok(watcher)
    }
}
