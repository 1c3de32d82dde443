/// Configuration management
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_PUSH_PORT: u16 = 3001;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend (http only)
    pub backend_url: String,

    /// Address of the push relay
    pub push_addr: SocketAddr,

    /// Timeout applied to every REST request
    pub request_timeout: Duration,

    /// Timeout for establishing the push connection
    pub connect_timeout: Duration,

    /// Interval between keepalive pings on an idle push connection
    pub keepalive_interval: Duration,

    /// First delay between reconnect attempts
    pub reconnect_initial_backoff: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max_backoff: Duration,

    /// Consecutive failed attempts before the outage is reported to the user
    pub max_reconnect_attempts: u32,

    /// Close the push connection once no view is subscribed
    pub close_push_when_idle: bool,

    /// Session cookie to replay (e.g. from a previous `login`)
    pub session_cookie: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            push_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PUSH_PORT)),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            close_push_when_idle: false,
            session_cookie: None,
        }
    }
}

impl Config {
    /// Build a config from command line flags; positional arguments are left to the caller.
    ///
    /// Returns the config and the remaining (non-flag) arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Config::default();
        let mut rest = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--backend" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ClientError::Config("--backend requires a URL argument".to_string())
                    })?;
                    config.backend_url = url.clone();
                    i += 2;
                }
                "--push" => {
                    let addr = args.get(i + 1).ok_or_else(|| {
                        ClientError::Config("--push requires an address argument".to_string())
                    })?;
                    config.push_addr = parse_addr("--push", addr)?;
                    i += 2;
                }
                "--timeout-secs" => {
                    let secs = args.get(i + 1).ok_or_else(|| {
                        ClientError::Config("--timeout-secs requires a number".to_string())
                    })?;
                    config.request_timeout = Duration::from_secs(secs.parse::<u64>().map_err(|_| {
                        ClientError::Config("--timeout-secs must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                "--close-idle-push" => {
                    config.close_push_when_idle = true;
                    i += 1;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("PROCONNECT_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Ok(addr) = std::env::var("PROCONNECT_PUSH_ADDR") {
            config.push_addr = parse_addr("PROCONNECT_PUSH_ADDR", &addr)?;
        }
        if let Ok(cookie) = std::env::var("PROCONNECT_SESSION") {
            if !cookie.trim().is_empty() {
                config.session_cookie = Some(cookie);
            }
        }

        config.validate()?;
        Ok((config, rest))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend_url.starts_with("http://") {
            return Err(ClientError::Config(format!(
                "backend URL must start with http:// (got {})",
                self.backend_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::Config("request timeout must be non-zero".to_string()));
        }
        if self.reconnect_initial_backoff > self.reconnect_max_backoff {
            return Err(ClientError::Config(
                "initial reconnect backoff exceeds the maximum".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_addr(flag: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|_| ClientError::Config(format!("{} must be host:port (got {})", flag, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "--backend",
            "http://localhost:4000",
            "chat",
            "--push",
            "127.0.0.1:4001",
            "abc123",
            "--close-idle-push",
        ]))
        .unwrap();
        assert_eq!(config.backend_url, "http://localhost:4000");
        assert_eq!(config.push_addr.port(), 4001);
        assert!(config.close_push_when_idle);
        assert_eq!(rest, vec!["chat".to_string(), "abc123".to_string()]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_args(&args(&["--push", "nowhere"])).is_err());
        assert!(Config::from_args(&args(&["--timeout-secs"])).is_err());
        assert!(Config::from_args(&args(&["--backend", "https://tls.example"])).is_err());
    }
}
