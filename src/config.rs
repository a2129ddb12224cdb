use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug)]
pub struct Config {
    /// Bind address for the robot and local-control legs.
    pub bind_ip: String,
    /// The address advertised to the robot in the rewritten push-server
    /// list. Same variable as `bind_ip`, different default.
    pub advertised_ip: String,
    pub robot_port: u16,
    pub local_control_host: String,
    pub local_control_port: u16,
    pub cache_static: bool,
    pub data_path: PathBuf,
    pub block_update: bool,
    pub map_intv: i64,
    pub path_intv: i64,
    pub status_intv: i64,
    /// Where the small persisted files live (push key, product id,
    /// request log, captured update response). Not environment-driven;
    /// the deployment contract is the working directory.
    pub state_dir: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    Malformed { var: String, value: String },
    Io { path: String, source: std::io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Malformed { var, value } => {
                write!(f, "Malformed value for {var}: {value:?}")
            }
            ConfigError::Io { path, source } => write!(f, "Cannot write {path}: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Tests pass a closure over
    /// a map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        Ok(Config {
            bind_ip: lookup("LOCAL_PROXY_IP").unwrap_or_else(|| "0.0.0.0".to_owned()),
            advertised_ip: lookup("LOCAL_PROXY_IP").unwrap_or_else(|| "192.168.0.254".to_owned()),
            robot_port: parse_var(&lookup, "ROBOT_PORT", 80)?,
            local_control_host: lookup("LOCAL_CONTROL_HOST")
                .unwrap_or_else(|| "0.0.0.0".to_owned()),
            local_control_port: parse_var(&lookup, "LOCAL_CONTROL_PORT", 4468)?,
            cache_static: flag_var(&lookup, "CACHE_STATIC", true),
            data_path: lookup("DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            block_update: flag_var(&lookup, "BLOCK_UPDATE", true),
            map_intv: parse_var(&lookup, "MAP_INTV", 1)?,
            path_intv: parse_var(&lookup, "PATH_INTV", 1)?,
            status_intv: parse_var(&lookup, "STATUS_INTV", 1)?,
            state_dir: PathBuf::from("."),
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value.parse().map_err(|_| ConfigError::Malformed {
            var: var.to_owned(),
            value,
        }),
        None => Ok(default),
    }
}

fn flag_var(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: bool) -> bool {
    match lookup(var) {
        Some(value) => value.to_lowercase() == "true",
        None => default,
    }
}
