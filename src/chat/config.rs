/// Server configuration, read from the environment.
///
/// | Variable        | Default                  |
/// |-----------------|--------------------------|
/// | `COVE_BIND`     | `127.0.0.1:0`            |
/// | `COVE_BUS`      | `redis://localhost:6379` |
/// | `COVE_CHANNEL`  | `chat`                   |
/// | `COVE_RETRY_MS` | `1000`                   |
use std::sync::Arc;
use std::time::Duration;

use super::bus::Bus;
use super::memory::MemoryBus;
use super::redis::RedisBus;

pub const DEFAULT_BIND: &str = "127.0.0.1:0";
pub const DEFAULT_BUS: &str = "redis://localhost:6379";
pub const DEFAULT_CHANNEL: &str = "chat";
pub const DEFAULT_RETRY: Duration = Duration::from_secs(1);

const REDIS_PORT: u16 = 6379;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported bus url {0:?} (expected redis://host[:port] or memory://)")]
    BusUrl(String),
    #[error("invalid retry delay {0:?} (expected milliseconds)")]
    RetryDelay(String),
    #[error("channel name must not be empty")]
    EmptyChannel,
}

/// Where the bus lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusUrl {
    /// A Redis-protocol broker at `host:port`.
    Redis { addr: String },
    /// An in-process bus; only sessions on this server see each other.
    Memory,
}

impl BusUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        if url == "memory://" || url == "memory" {
            return Ok(BusUrl::Memory);
        }

        let rest = url
            .strip_prefix("redis://")
            .or_else(|| url.strip_prefix("tcp://"))
            .ok_or_else(|| ConfigError::BusUrl(url.into()))?;

        // Drop any `/db` suffix; pub/sub ignores the database index.
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(ConfigError::BusUrl(url.into()));
        }

        let has_port = match authority.rsplit_once(':') {
            // `[::1]` without a port still contains colons.
            Some((host, port)) => !host.is_empty()
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.starts_with('[') || host.ends_with(']')),
            None => false,
        };

        let addr = if has_port {
            authority.to_owned()
        } else {
            format!("{authority}:{REDIS_PORT}")
        };
        Ok(BusUrl::Redis { addr })
    }

    /// Build the bus this url points at. Connections are opened lazily.
    pub fn connect(&self) -> Arc<dyn Bus> {
        match self {
            BusUrl::Redis { addr } => Arc::new(RedisBus::new(addr.clone())),
            BusUrl::Memory => Arc::new(MemoryBus::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for chat clients.
    pub bind: String,
    pub bus: BusUrl,
    /// The one bus channel all instances share.
    pub channel: String,
    /// Fixed delay between subscription attempts.
    pub retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            bus: BusUrl::Redis {
                addr: format!("localhost:{REDIS_PORT}"),
            },
            channel: DEFAULT_CHANNEL.into(),
            retry_delay: DEFAULT_RETRY,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = lookup("COVE_BIND").unwrap_or_else(|| DEFAULT_BIND.into());
        let bus = BusUrl::parse(&lookup("COVE_BUS").unwrap_or_else(|| DEFAULT_BUS.into()))?;

        let channel = lookup("COVE_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.into());
        if channel.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }

        let retry_delay = match lookup("COVE_RETRY_MS") {
            Some(ms) => Duration::from_millis(
                ms.trim()
                    .parse()
                    .map_err(|_| ConfigError::RetryDelay(ms.clone()))?,
            ),
            None => DEFAULT_RETRY,
        };

        Ok(Self {
            bind,
            bus,
            channel,
            retry_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind, "127.0.0.1:0");
        assert_eq!(config.bus, BusUrl::Redis { addr: "localhost:6379".into() });
        assert_eq!(config.channel, "chat");
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn overrides() {
        let config = Config::from_lookup(lookup(&[
            ("COVE_BIND", "0.0.0.0:1337"),
            ("COVE_BUS", "memory://"),
            ("COVE_CHANNEL", "lobby"),
            ("COVE_RETRY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:1337");
        assert_eq!(config.bus, BusUrl::Memory);
        assert_eq!(config.channel, "lobby");
        assert_eq!(config.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn bad_retry_delay() {
        let err = Config::from_lookup(lookup(&[("COVE_RETRY_MS", "soon")])).unwrap_err();
        assert_eq!(err, ConfigError::RetryDelay("soon".into()));
    }

    #[test]
    fn empty_channel() {
        let err = Config::from_lookup(lookup(&[("COVE_CHANNEL", "")])).unwrap_err();
        assert_eq!(err, ConfigError::EmptyChannel);
    }

    #[test]
    fn parse_redis_urls() {
        let cases = [
            ("redis://localhost:6379", "localhost:6379"),
            ("redis://redis", "redis:6379"),
            ("redis://10.0.0.5:7000/0", "10.0.0.5:7000"),
            ("tcp://localhost:6380", "localhost:6380"),
            ("redis://[::1]:6379", "[::1]:6379"),
            ("redis://[::1]", "[::1]:6379"),
        ];
        for (url, addr) in cases {
            assert_eq!(
                BusUrl::parse(url).unwrap(),
                BusUrl::Redis { addr: addr.into() },
                "{url}"
            );
        }
    }

    #[test]
    fn parse_memory_url() {
        assert_eq!(BusUrl::parse("memory://").unwrap(), BusUrl::Memory);
    }

    #[test]
    fn reject_other_urls() {
        for url in ["http://localhost", "redis://", "localhost:6379", ""] {
            assert!(BusUrl::parse(url).is_err(), "{url}");
        }
    }
}
