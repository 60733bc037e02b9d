use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub history: HistoryConfig,
    pub sync: SyncConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub store_name: String,
    pub store_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub max_stack_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_drain: bool,
    /// 定期ドレインの間隔（秒）。0 の場合は接続復帰時のみ
    pub drain_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub base_url: String,
    pub request_timeout: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:data/rewind.db?mode=rwc".to_string(),
                max_connections: 5,
                store_name: "rewind".to_string(),
                store_version: 1,
            },
            history: HistoryConfig::default(),
            sync: SyncConfig {
                auto_drain: true,
                drain_interval: 0,
            },
            network: NetworkConfig {
                base_url: "http://localhost:8080".to_string(),
                request_timeout: 30,
            },
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_stack_size: 50 }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        // 既定値
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("REWIND_DATABASE_URL") {
            let v = v.trim();
            if !v.is_empty() {
                cfg.database.url = v.to_string();
            }
        }
        if let Ok(v) = std::env::var("REWIND_DATABASE_MAX_CONNECTIONS") {
            if let Some(value) = parse_u64(&v) {
                cfg.database.max_connections = value.max(1) as u32;
            }
        }
        if let Ok(v) = std::env::var("REWIND_STORE_VERSION") {
            if let Some(value) = parse_u64(&v) {
                cfg.database.store_version = value as u32;
            }
        }
        if let Ok(v) = std::env::var("REWIND_MAX_STACK_SIZE") {
            if let Some(value) = parse_u64(&v) {
                cfg.history.max_stack_size = value as usize;
            }
        }
        if let Ok(v) = std::env::var("REWIND_AUTO_DRAIN") {
            cfg.sync.auto_drain = parse_bool(&v, cfg.sync.auto_drain);
        }
        if let Ok(v) = std::env::var("REWIND_DRAIN_INTERVAL") {
            if let Some(value) = parse_u64(&v) {
                cfg.sync.drain_interval = value;
            }
        }
        if let Ok(v) = std::env::var("REWIND_BASE_URL") {
            let v = v.trim();
            if !v.is_empty() {
                cfg.network.base_url = v.trim_end_matches('/').to_string();
            }
        }
        if let Ok(v) = std::env::var("REWIND_REQUEST_TIMEOUT") {
            if let Some(value) = parse_u64(&v) {
                cfg.network.request_timeout = value.max(1);
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.database.store_version == 0 {
            return Err("Database store_version must be greater than 0".to_string());
        }
        if self.history.max_stack_size == 0 {
            return Err("History max_stack_size must be greater than 0".to_string());
        }
        if self.network.request_timeout == 0 {
            return Err("Network request_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn parse_bool(s: &str, default: bool) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.history.max_stack_size, 50);
    }

    #[test]
    fn zero_stack_size_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.history.max_stack_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_bool_falls_back_to_default() {
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("maybe", true));
    }
}
