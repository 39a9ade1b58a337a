// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! This module defines the properties the gateway is built from. They can be
//! deserialized from JSON (camelCase keys) or read from the process environment,
//! optionally seeded from a `.env` file. Once loaded and validated the
//! properties are never mutated.

use crate::errors::GatewayError;
use serde::Deserialize;
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use tracing::debug;

/// Routing key binding the waitlist queue to the exchange. The publisher always
/// sends with this key.
pub const WAITLIST_BINDING_KEY: &str = "gateway.waitlist";

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_MAX_THREADS: usize = 1;
pub const DEFAULT_CONNECTION_NAME: &str = "broker-gateway";
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_TLS_VERSION: &str = "RABBITMQ_TLS_VERSION";
pub const ENV_TLS_CA_PATH: &str = "RABBITMQ_TLS_CA_PATH";
pub const ENV_EXCHANGE_NAME: &str = "RABBITMQ_EXCHANGE_NAME";
pub const ENV_QUEUE_NAME: &str = "RABBITMQ_QUEUE_NAME";
pub const ENV_WAITLIST_QUEUE_NAME: &str = "RABBITMQ_WAITLIST_QUEUE_NAME";
pub const ENV_BINDING_KEYS: &str = "RABBITMQ_BINDING_KEYS";
pub const ENV_MAX_THREADS: &str = "THREADS_MAX_POOL_SIZE";
pub const ENV_CONNECTION_NAME: &str = "APP_NAME";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "RABBITMQ_SHUTDOWN_TIMEOUT_MS";

/// Connection, topology and consumer settings for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProperties {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub tls_version: Option<String>,
    #[serde(default)]
    pub tls_ca_path: Option<PathBuf>,
    pub exchange_name: String,
    pub queue_name: String,
    pub waitlist_queue_name: String,
    pub binding_keys: String,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_owned()
}

fn default_max_threads() -> usize {
    DEFAULT_MAX_THREADS
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

impl BrokerProperties {
    /// Parses and validates properties from a JSON document.
    ///
    /// # Parameters
    /// * `raw` - A JSON object with camelCase keys (`host`, `exchangeName`, ...)
    ///
    /// # Returns
    /// * `Result<BrokerProperties, GatewayError>` - The validated properties, or
    ///   `InvalidProperty` for malformed JSON and the first validation error otherwise
    pub fn from_json(raw: &str) -> Result<Self, GatewayError> {
        let props: BrokerProperties =
            serde_json::from_str(raw).map_err(|err| GatewayError::InvalidProperty {
                name: "json".to_owned(),
                value: err.to_string(),
            })?;

        props.validate()?;
        Ok(props)
    }

    /// Reads the properties from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first when present;
    /// variables already set in the environment take precedence over it.
    pub fn from_env() -> Result<Self, GatewayError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("loaded environment from {}", path.display()),
            Err(err) => debug!(error = err.to_string(), "no .env file loaded"),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the properties from an arbitrary key lookup using the
    /// `RABBITMQ_*` variable names. Blank values count as unset.
    ///
    /// # Parameters
    /// * `lookup` - Returns the value of a variable, or `None` when unset
    ///
    /// # Returns
    /// * `Result<BrokerProperties, GatewayError>` - The validated properties, or
    ///   `MissingProperty` naming the first required variable that is unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            value(key).ok_or_else(|| GatewayError::MissingProperty(key.to_owned()))
        };

        let props = BrokerProperties {
            host: required(ENV_HOST)?,
            port: parse_or(ENV_PORT, value(ENV_PORT), DEFAULT_PORT)?,
            user: value(ENV_USER).unwrap_or_default(),
            password: value(ENV_PASSWORD).unwrap_or_default(),
            vhost: value(ENV_VHOST).unwrap_or_else(default_vhost),
            tls_version: value(ENV_TLS_VERSION),
            tls_ca_path: value(ENV_TLS_CA_PATH).map(PathBuf::from),
            exchange_name: required(ENV_EXCHANGE_NAME)?,
            queue_name: required(ENV_QUEUE_NAME)?,
            waitlist_queue_name: required(ENV_WAITLIST_QUEUE_NAME)?,
            binding_keys: required(ENV_BINDING_KEYS)?,
            max_threads: parse_or(ENV_MAX_THREADS, value(ENV_MAX_THREADS), DEFAULT_MAX_THREADS)?,
            connection_name: value(ENV_CONNECTION_NAME).unwrap_or_else(default_connection_name),
            shutdown_timeout_ms: parse_or(
                ENV_SHUTDOWN_TIMEOUT_MS,
                value(ENV_SHUTDOWN_TIMEOUT_MS),
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            )?,
        };

        props.validate()?;
        Ok(props)
    }

    /// Checks names, the thread limit and the binding-key list.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (name, value) in [
            ("host", &self.host),
            ("exchangeName", &self.exchange_name),
            ("queueName", &self.queue_name),
            ("waitlistQueueName", &self.waitlist_queue_name),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::MissingProperty(name.to_owned()));
            }
        }

        self.prefetch_count()?;
        self.binding_keys()?;

        Ok(())
    }

    /// Both user and password must be non-blank for credentials to be used.
    pub fn has_credentials(&self) -> bool {
        !self.user.trim().is_empty() && !self.password.trim().is_empty()
    }

    /// The incoming-queue binding keys, whitespace removed.
    pub fn binding_keys(&self) -> Result<Vec<String>, GatewayError> {
        split_binding_keys(&self.binding_keys)
    }

    /// Prefetch count for each consumer, equal to the worker limit.
    pub fn prefetch_count(&self) -> Result<u16, GatewayError> {
        match u16::try_from(self.max_threads) {
            Ok(count) if count > 0 => Ok(count),
            _ => Err(GatewayError::InvalidProperty {
                name: "maxThreads".to_owned(),
                value: self.max_threads.to_string(),
            }),
        }
    }

    /// How long stopping the consumers may wait for in-flight handlers.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T, GatewayError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::InvalidProperty {
                name: name.to_owned(),
                value: raw,
            }),
    }
}

/// Removes every whitespace character and splits on commas.
///
/// Empty entries are rejected here rather than left for the broker to refuse.
pub fn split_binding_keys(raw: &str) -> Result<Vec<String>, GatewayError> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    compact
        .split(',')
        .enumerate()
        .map(|(position, key)| {
            if key.is_empty() {
                Err(GatewayError::EmptyBindingKey {
                    keys: raw.to_owned(),
                    position,
                })
            } else {
                Ok(key.to_owned())
            }
        })
        .collect()
}

/// TLS protocol versions the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        let version = normalized.strip_prefix("tlsv").unwrap_or(&normalized);

        match version {
            "1.2" => Ok(TlsVersion::Tls12),
            "1.3" => Ok(TlsVersion::Tls13),
            _ => Err(GatewayError::TlsConfigError(format!(
                "unsupported tls version `{raw}`"
            ))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_env() -> HashMap<String, String> {
        env(&[
            (ENV_HOST, "mq"),
            (ENV_EXCHANGE_NAME, "events"),
            (ENV_QUEUE_NAME, "incoming"),
            (ENV_WAITLIST_QUEUE_NAME, "waitlist"),
            (ENV_BINDING_KEYS, "a.*, b.*"),
        ])
    }

    #[test]
    fn splits_and_strips_binding_keys() {
        assert_eq!(split_binding_keys("a.*, b.*").unwrap(), vec!["a.*", "b.*"]);
        assert_eq!(
            split_binding_keys("  a.* ,\tb.*  ").unwrap(),
            split_binding_keys("a.*,b.*").unwrap()
        );
        assert_eq!(split_binding_keys("#").unwrap(), vec!["#"]);
    }

    #[test]
    fn rejects_empty_binding_keys() {
        assert_eq!(
            split_binding_keys("a.*,"),
            Err(GatewayError::EmptyBindingKey {
                keys: "a.*,".to_owned(),
                position: 1
            })
        );
        assert!(split_binding_keys("").is_err());
        assert!(split_binding_keys("a.*, ,b.*").is_err());
    }

    #[test]
    fn loads_from_lookup_with_defaults() {
        let vars = base_env();
        let props = BrokerProperties::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(props.host, "mq");
        assert_eq!(props.port, DEFAULT_PORT);
        assert_eq!(props.vhost, "/");
        assert_eq!(props.max_threads, 1);
        assert_eq!(props.tls_version, None);
        assert!(!props.has_credentials());
        assert_eq!(props.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn reports_missing_and_invalid_variables() {
        let mut vars = base_env();
        vars.remove(ENV_QUEUE_NAME);
        assert_eq!(
            BrokerProperties::from_lookup(|k| vars.get(k).cloned()),
            Err(GatewayError::MissingProperty(ENV_QUEUE_NAME.to_owned()))
        );

        let mut vars = base_env();
        vars.insert(ENV_PORT.to_owned(), "amqp".to_owned());
        assert!(matches!(
            BrokerProperties::from_lookup(|k| vars.get(k).cloned()),
            Err(GatewayError::InvalidProperty { .. })
        ));

        let mut vars = base_env();
        vars.insert(ENV_MAX_THREADS.to_owned(), "0".to_owned());
        assert!(matches!(
            BrokerProperties::from_lookup(|k| vars.get(k).cloned()),
            Err(GatewayError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn credentials_require_user_and_password() {
        let mut vars = base_env();
        vars.insert(ENV_USER.to_owned(), "admin".to_owned());
        let props = BrokerProperties::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(!props.has_credentials());

        vars.insert(ENV_PASSWORD.to_owned(), "secret".to_owned());
        let props = BrokerProperties::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(props.has_credentials());
    }

    #[test]
    fn blank_credentials_are_ignored_from_json_and_env_alike() {
        let json = BrokerProperties::from_json(
            r#"{"host": "mq", "user": "   ", "password": "secret",
                "exchangeName": "events", "queueName": "incoming",
                "waitlistQueueName": "waitlist", "bindingKeys": "a.*"}"#,
        )
        .unwrap();

        let mut vars = base_env();
        vars.insert(ENV_USER.to_owned(), "   ".to_owned());
        vars.insert(ENV_PASSWORD.to_owned(), "secret".to_owned());
        let env = BrokerProperties::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert!(!json.has_credentials());
        assert!(!env.has_credentials());
    }

    #[test]
    fn parses_json_with_camel_case_keys() {
        let props = BrokerProperties::from_json(
            r#"{
                "host": "mq",
                "port": 5671,
                "tlsVersion": "TLSv1.2",
                "exchangeName": "events",
                "queueName": "incoming",
                "waitlistQueueName": "waitlist",
                "bindingKeys": "a.*, b.*",
                "maxThreads": 8
            }"#,
        )
        .unwrap();

        assert_eq!(props.port, 5671);
        assert_eq!(props.tls_version.as_deref(), Some("TLSv1.2"));
        assert_eq!(props.prefetch_count().unwrap(), 8);
        assert_eq!(props.binding_keys().unwrap(), vec!["a.*", "b.*"]);
    }

    #[test]
    fn json_with_trailing_comma_key_is_rejected() {
        let result = BrokerProperties::from_json(
            r#"{"host": "mq", "exchangeName": "e", "queueName": "q",
                "waitlistQueueName": "w", "bindingKeys": "a.*,"}"#,
        );
        assert!(matches!(result, Err(GatewayError::EmptyBindingKey { .. })));
    }

    #[test]
    fn parses_tls_versions() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert!("TLSv1.1".parse::<TlsVersion>().is_err());
        assert!("SSLv3".parse::<TlsVersion>().is_err());
        assert_eq!(TlsVersion::Tls13.to_string(), "TLSv1.3");
    }
}
