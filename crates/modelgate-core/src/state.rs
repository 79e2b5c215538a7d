use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use modelgate_common::ProxyConfig;
use modelgate_upstream::{Manager, ManagerSettings, UpstreamError};

/// Runtime knobs that hot-reload alongside the Manager.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub api_keys: Vec<String>,
    pub admin_key: String,
    pub max_retries: usize,
}

impl RuntimeSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            api_keys: config.api_keys.clone(),
            admin_key: config.admin_key.clone(),
            max_retries: config.effective_max_retries(),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn accepts_key(&self, key: &str) -> bool {
        self.api_keys.iter().any(|candidate| candidate == key)
    }
}

/// Shared per-process state. Handlers read the Manager and runtime settings
/// through lock-free snapshots; a reload observes either the old or the new
/// Manager consistently for the whole request.
pub struct AppState {
    manager: ArcSwap<Manager>,
    runtime: ArcSwap<RuntimeSettings>,
    config_path: PathBuf,
}

impl AppState {
    pub fn new(config: &ProxyConfig, config_path: PathBuf) -> Result<Arc<Self>, UpstreamError> {
        let manager = Manager::new(&config.providers, ManagerSettings::from_config(config))?;
        Ok(Arc::new(Self {
            manager: ArcSwap::new(manager),
            runtime: ArcSwap::from_pointee(RuntimeSettings::from_config(config)),
            config_path,
        }))
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.load_full()
    }

    pub fn runtime(&self) -> Arc<RuntimeSettings> {
        self.runtime.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Hot reload: build the replacement Manager, carry the round-robin
    /// counter over, publish it with a single pointer swap, then stop the old
    /// Manager's recovery loop.
    pub fn reload(&self, config: &ProxyConfig) -> Result<(), UpstreamError> {
        let next = Manager::new(&config.providers, ManagerSettings::from_config(config))?;
        next.restore_round_robin(self.manager.load().round_robin_value());
        self.runtime
            .store(Arc::new(RuntimeSettings::from_config(config)));
        let old = self.manager.swap(next);
        old.stop();
        info!(providers = config.providers.len(), "manager replaced");
        Ok(())
    }
}
