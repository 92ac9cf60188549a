use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Application configuration derived from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub networks_path: PathBuf,
    pub request_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parse_env("RPCGATE_LISTEN_ADDR", "0.0.0.0:8080", parse_socket_addr)?;
        let networks_path = parse_env("RPCGATE_NETWORKS_PATH", "networks.json", parse_path)?;
        let request_timeout = clamp_duration(
            parse_env("RPCGATE_REQUEST_TIMEOUT_SECS", "10", parse_duration_secs)?,
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        let max_payload_bytes =
            parse_env("RPCGATE_MAX_PAYLOAD_KB", "512", parse_usize)?.clamp(1, 10_240) * 1024;

        Ok(Self {
            listen_addr,
            networks_path,
            request_timeout,
            max_payload_bytes,
        })
    }
}

fn clamp_duration(value: Duration, min: Duration, max: Duration) -> Duration {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

fn parse_socket_addr(input: &str) -> Result<SocketAddr> {
    input
        .parse::<SocketAddr>()
        .map_err(|err| anyhow!("invalid socket address `{input}`: {err}"))
}

fn parse_path(input: &str) -> Result<PathBuf> {
    Ok(Path::new(input).to_path_buf())
}

fn parse_duration_secs(input: &str) -> Result<Duration> {
    let secs: u64 = input
        .parse()
        .with_context(|| format!("invalid duration seconds `{input}`"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_usize(input: &str) -> Result<usize> {
    input
        .parse::<usize>()
        .with_context(|| format!("invalid integer value `{input}`"))
}

fn parse_env<T, F>(key: &str, default: &str, parser: F) -> Result<T>
where
    F: Fn(&str) -> Result<T>,
{
    match env::var(key).ok().filter(|value| !value.is_empty()) {
        Some(value) => parser(&value),
        None => parser(default),
    }
}
