use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Process-level configuration. Everything clients receive (routers, DNS,
/// boot parameters) lives on subnets in the address book, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the interface the server answers on; also the DHCP
    /// server identifier and the default routing key for unrelayed packets.
    pub server_ip: Ipv4Addr,

    /// Directory holding the snapshot database.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_ip == Ipv4Addr::UNSPECIFIED || self.server_ip == Ipv4Addr::BROADCAST {
            return Err(Error::InvalidConfig(format!(
                "server_ip {} is not a host address",
                self.server_ip
            )));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir must be set".to_string()));
        }

        Ok(())
    }
}
