use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub catalog: CatalogConf,
    pub device: DeviceConf,
    pub poll: PollConf,
    pub hub: HubConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConf {
    pub paths: Vec<String>,
}

impl Default for CatalogConf {
    fn default() -> Self {
        Self { paths: vec!["tags.json".into(), "../websocket/tags.json".into()] }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConf {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for DeviceConf {
    fn default() -> Self {
        Self {
            port: 102,
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,
            reconnect_interval_ms: 5000,
        }
    }
}

impl DeviceConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollConf {
    pub interval_ms: u64,
}

impl Default for PollConf {
    fn default() -> Self {
        Self { interval_ms: 25 }
    }
}

impl PollConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    pub mailbox_capacity: usize,
    pub broadcast_capacity: usize,
    pub control_capacity: usize,
    pub ping_interval_secs: u64,
    pub liveness_multiplier: u32,
    pub write_timeout_ms: u64,
}

impl Default for HubConf {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            broadcast_capacity: 512,
            control_capacity: 100,
            ping_interval_secs: 60,
            liveness_multiplier: 3,
            write_timeout_ms: 10_000,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ECLUSA_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> KernelConfig {
    if Path::new(path).exists() {
        let txt = fs::read_to_string(path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("[kernel] config invalide ({path}): {e}");
            KernelConfig::default()
        })
    } else {
        info!("[kernel] pas de {path}, usage config par défaut");
        KernelConfig::default()
    }
}
