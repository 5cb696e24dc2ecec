use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Worker count of the bounded execution pool.
    pub task_pool_num: usize,
    /// Per-tenant in-flight task cap.
    pub user_max_task: usize,
    /// Per-language container pool capacity.
    pub container_max_num: usize,
    /// Per-language warm spares kept through idle eviction.
    pub container_reserved_num: usize,
    pub container_idle_timeout: Duration,
    pub store_driver: StoreDriver,
    pub store_dsn: Option<PathBuf>,
    /// `app_id:key` pairs accepted on the `x-api-key` header.
    pub api_keys: HashMap<String, u64>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            bind_addr: env_parse("APP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            task_pool_num: env_parse("APP_TASK_POOL_NUM", 4usize),
            user_max_task: env_parse("APP_TASK_USER_MAX_TASK", 4usize),
            container_max_num: env_parse("APP_CONTAINER_MAX_NUM", 4usize),
            container_reserved_num: env_parse("APP_CONTAINER_RESERVED_NUM", 1usize),
            container_idle_timeout: Duration::from_secs(
                env_parse("APP_CONTAINER_TIMEOUT_HOURS", 1u64) * 3600,
            ),
            store_driver: env_parse("APP_DATA_DB_DRIVER", StoreDriver::Memory),
            store_dsn: env::var("APP_DATA_DB_DSN").ok().map(PathBuf::from),
            api_keys: parse_api_keys(
                &env::var("API_KEYS").unwrap_or_else(|_| "1:dev-key".to_string()),
            ),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        if config.container_max_num == 0
            || config.container_max_num < config.container_reserved_num
        {
            bail!(
                "invalid container pool bounds: max_num={} reserved_num={}",
                config.container_max_num,
                config.container_reserved_num
            );
        }
        if config.store_driver == StoreDriver::Jsonl && config.store_dsn.is_none() {
            bail!("APP_DATA_DB_DRIVER=jsonl requires APP_DATA_DB_DSN");
        }
        Ok(config)
    }

    /// Journal path for the store, when the jsonl driver is selected.
    pub fn journal_path(&self) -> Option<PathBuf> {
        match self.store_driver {
            StoreDriver::Memory => None,
            StoreDriver::Jsonl => self.store_dsn.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreDriver {
    #[default]
    Memory,
    Jsonl,
}

impl FromStr for StoreDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "jsonl" => Ok(Self::Jsonl),
            _ => Err(format!("unsupported store driver: {s}")),
        }
    }
}

fn parse_api_keys(input: &str) -> HashMap<String, u64> {
    let mut keys = HashMap::new();
    for raw in input.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((app_id, key)) = entry.split_once(':') {
            if let Ok(app_id) = app_id.trim().parse::<u64>() {
                keys.insert(key.trim().to_string(), app_id);
            }
        }
    }
    if keys.is_empty() {
        keys.insert("dev-key".to_string(), 1);
    }
    keys
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_map_key_to_app_id() {
        let keys = parse_api_keys("42:alpha, 7:beta");
        assert_eq!(keys.get("alpha"), Some(&42));
        assert_eq!(keys.get("beta"), Some(&7));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let keys = parse_api_keys("not-a-pair, x:y, 9:ok");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("ok"), Some(&9));
    }

    #[test]
    fn empty_key_table_falls_back_to_dev_key() {
        let keys = parse_api_keys("");
        assert_eq!(keys.get("dev-key"), Some(&1));
    }

    #[test]
    fn store_driver_parses_case_insensitively() {
        assert_eq!("MEMORY".parse::<StoreDriver>().unwrap(), StoreDriver::Memory);
        assert_eq!("jsonl".parse::<StoreDriver>().unwrap(), StoreDriver::Jsonl);
        assert!("mysql".parse::<StoreDriver>().is_err());
    }
}
