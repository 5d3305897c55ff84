// config.rs
//
// Configuration for the RISC-V backend

use std::env;
use std::sync::OnceLock;

/// Complete configuration for the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Enable opportunistic RVC (16-bit) re-encoding.
    pub rvc: bool,
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// `GORISCVRVC=no` disables compressed encoding; any other value,
    /// including unset, enables it. The environment is consulted once per
    /// process; subsequent calls return the cached result.
    pub fn from_env() -> Config {
        static RVC: OnceLock<bool> = OnceLock::new();
        let rvc = *RVC.get_or_init(|| env::var("GORISCVRVC").as_deref() != Ok("no"));
        Config { rvc }
    }

    /// A configuration with compression explicitly enabled or disabled,
    /// independent of the environment.
    pub fn with_rvc(rvc: bool) -> Config {
        Config { rvc }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::from_env()
    }
}
