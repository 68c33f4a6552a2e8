use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "XENOPIXEL_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub bluetooth: BluetoothConfig,
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8470,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: crate::sync::WLED_SYNC_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub scan_timeout_secs: u64,
    pub reconnect_max_secs: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 30,
            reconnect_max_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub address: String,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Start with default config
        let mut config = Self::default();
        let config_path = active_config_path();

        // Load from file if it exists
        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)?;
        }

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        if let Ok(val) = env::var(format!("{}SYNC_ENABLED", ENV_PREFIX)) {
            self.sync.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}SYNC_BIND", ENV_PREFIX)) {
            self.sync.bind = val;
        }
        if let Ok(val) = env::var(format!("{}SYNC_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.sync.port = port;
            }
        }

        if let Ok(val) = env::var(format!("{}SCAN_TIMEOUT_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.bluetooth.scan_timeout_secs = secs;
            }
        }

        // A single saber can be configured without a file at all.
        if let Ok(address) = env::var(format!("{}DEVICE_ADDRESS", ENV_PREFIX)) {
            let name = env::var(format!("{}DEVICE_NAME", ENV_PREFIX))
                .unwrap_or_else(|_| "saber".to_string());
            self.devices = vec![DeviceConfig { name, address }];
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.sync.enabled {
            if self.sync.port == 0 {
                return Err("sync.port must be non-zero".into());
            }
            if self.sync.bind.parse::<std::net::IpAddr>().is_err() {
                return Err("sync.bind must be an IP address".into());
            }
        }
        if self.bluetooth.scan_timeout_secs == 0 {
            return Err("bluetooth.scan_timeout_secs must be non-zero".into());
        }
        if self.bluetooth.reconnect_max_secs == 0 {
            return Err("bluetooth.reconnect_max_secs must be non-zero".into());
        }
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err("device.name must be set".into());
            }
            if !is_valid_bdaddr(&device.address) {
                return Err(format!(
                    "device.address {:?} is not a MAC address (AA:BB:CC:DD:EE:FF)",
                    device.address
                )
                .into());
            }
        }
        let mut names: Vec<&str> = self.devices.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.devices.len() {
            return Err("device names must be unique".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn is_valid_bdaddr(address: &str) -> bool {
    let groups: Vec<&str> = address.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("xenopixel-bridge")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
        cfg.server.port = 8470;
        cfg.sync.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_sync_skips_sync_validation() {
        let mut cfg = Config::default();
        cfg.sync.enabled = false;
        cfg.sync.port = 0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_addresses() {
        let mut cfg = Config::default();
        cfg.devices.push(DeviceConfig {
            name: "saber".to_string(),
            address: "not-a-mac".to_string(),
        });
        assert!(cfg.validate().is_err());

        cfg.devices[0].address = "B0:CB:D8:DB:E1:AE".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut cfg = Config::default();
        for _ in 0..2 {
            cfg.devices.push(DeviceConfig {
                name: "saber".to_string(),
                address: "B0:CB:D8:DB:E1:AE".to_string(),
            });
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bdaddr_format_check() {
        assert!(is_valid_bdaddr("00:11:22:aa:bb:cc"));
        assert!(!is_valid_bdaddr("00:11:22:aa:bb"));
        assert!(!is_valid_bdaddr("00:11:22:aa:bb:gg"));
        assert!(!is_valid_bdaddr("001122aabbcc"));
    }

    #[test]
    fn device_list_parses_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [[device]]
            name = "hallway"
            address = "B0:CB:D8:DB:E1:AE"

            [[device]]
            name = "workshop"
            address = "B0:CB:D8:DB:E1:AF"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[1].name, "workshop");
        cfg.validate().unwrap();
    }
}
