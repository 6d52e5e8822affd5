use std::io;
use std::{env, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The rendezvous socket file name used when none is configured.
pub const SOCKET_NAME: &str = "cryptmux.sock";

const ENGINE_ENV: &str = "CRYPTMUX_ENGINE";
const ENGINE_ARGS_ENV: &str = "CRYPTMUX_ENGINE_ARGS";
const SOCKET_DIR_ENV: &str = "CRYPTMUX_SOCKET_DIR";
const CONFIG_FILE_ENV: &str = "CRYPTMUX_CONFIG";

const DEFAULT_ENGINE: &str = "fake-engine";
const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// How to reach the engine: the executable to spawn for pipe transports and
/// the rendezvous socket for socket transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine executable path.
    pub program:     PathBuf,
    /// Arguments passed to the engine executable.
    #[serde(default)]
    pub args:        Vec<String>,
    /// Rendezvous socket path for socket-mode connections.
    pub socket_path: PathBuf,
}

impl EngineConfig {
    /// Compiled-in defaults: the stub engine on the default socket.
    pub fn new() -> Self {
        Self {
            program:     PathBuf::from(DEFAULT_ENGINE),
            args:        Vec::new(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_DIR).join(SOCKET_NAME),
        }
    }

    /// Build a configuration from the environment.
    ///
    /// `CRYPTMUX_CONFIG` names a JSON config file and wins outright;
    /// otherwise `CRYPTMUX_ENGINE`, `CRYPTMUX_ENGINE_ARGS` (whitespace
    /// separated) and `CRYPTMUX_SOCKET_DIR` override the defaults.
    pub fn from_env() -> Result<Self> {
        if let Ok(file) = env::var(CONFIG_FILE_ENV) {
            return Self::from_file(Path::new(&file));
        }

        let mut config = Self::new();
        if let Ok(program) = env::var(ENGINE_ENV) {
            config.program = PathBuf::from(program);
        }
        if let Ok(args) = env::var(ENGINE_ARGS_ENV) {
            config.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(dir) = env::var(SOCKET_DIR_ENV) {
            config.socket_path = PathBuf::from(dir).join(SOCKET_NAME);
        }
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad config file {}: {e}", path.display()),
            ))
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
