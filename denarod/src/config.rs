//! Daemon configuration: a TOML file with `DENARO_*` environment
//! overrides layered on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use denaro_state::BoxError;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the RPC surface listens on.
    pub listen_addr: SocketAddr,
    /// Directory holding the database and the node registry.
    pub data_dir: PathBuf,
    /// Name of the database directory inside `data_dir`.
    pub database_name: String,
    /// Peer contacted when the registry is empty.
    pub bootstrap_node: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("denaro");
        Config {
            listen_addr: "127.0.0.1:3006".parse().expect("hardcoded address parses"),
            data_dir,
            database_name: "denaro".to_string(),
            bootstrap_node: None,
        }
    }
}

impl Config {
    /// Reads the config file if there is one, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, BoxError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            None => Config::default(),
        };

        if let Ok(listen) = std::env::var("DENARO_LISTEN") {
            config.listen_addr = listen.parse()?;
        }
        if let Ok(data_dir) = std::env::var("DENARO_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(name) = std::env::var("DENARO_DATABASE_NAME") {
            config.database_name = name;
        }
        if let Ok(node) = std::env::var("DENARO_BOOTSTRAP_NODE") {
            config.bootstrap_node = Some(node);
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_name)
    }

    pub fn nodes_file(&self) -> PathBuf {
        self.data_dir.join("nodes.json")
    }
}
