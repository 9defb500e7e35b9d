use clap::Parser;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Result, SqlSessionError};

/// Smallest number of connections a pool may be configured with, after rounding
pub const MIN_EFFECTIVE_CONNECTIONS: usize = 5;

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlsession")]
#[command(about = "sqlsession - shared SQLite sessions for many callers over a small pool", long_about = None)]
pub struct Config {
    #[arg(short, long, default_value = "sqlsession.db", env = "SQLSESSION_DATABASE")]
    pub database: String,

    // Pool configuration
    #[arg(long, default_value = "1", env = "SQLSESSION_PARTITIONS", help = "Number of pool partitions")]
    pub partitions: usize,

    #[arg(long, default_value = "20", env = "SQLSESSION_MAX_CONNECTIONS", help = "Maximum pooled connections, rounded down to a multiple of the partition count")]
    pub max_connections: usize,

    #[arg(long, default_value = "0", env = "SQLSESSION_ACQUIRE_TIMEOUT", help = "Seconds to wait for a pooled connection (0 waits forever)")]
    pub acquire_timeout: u64,

    #[arg(long, default_value = "on", env = "SQLSESSION_AUTODISCONNECT", help = "Release pooled connections after each unit of work")]
    pub autodisconnect: String,

    #[arg(long, default_value = "shell", env = "SQLSESSION_CALLER", help = "Caller identity of the shell session")]
    pub caller: String,

    #[arg(long, default_value = "info", env = "SQLSESSION_LOG_LEVEL")]
    pub log_level: String,
}

impl Config {
    /// Resolve from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    /// Key/value form of the `defaultconnection` aspect
    pub fn connection_aspect(&self) -> HashMap<String, String> {
        HashMap::from([
            ("brand".to_string(), "sqlite".to_string()),
            ("database".to_string(), self.database.clone()),
            ("autodisconnect".to_string(), self.autodisconnect.clone()),
        ])
    }

    /// Key/value form of the `connectionpool` aspect
    pub fn pool_aspect(&self) -> HashMap<String, String> {
        HashMap::from([
            ("partitions".to_string(), self.partitions.to_string()),
            ("max-connections".to_string(), self.max_connections.to_string()),
            ("timeout".to_string(), self.acquire_timeout.to_string()),
        ])
    }
}

/// Named groups of settings accepted by [`ConfigurationStore::configure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigAspect {
    DefaultConnection,
    ConnectionPool,
}

impl ConfigAspect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigAspect::DefaultConnection => "defaultconnection",
            ConfigAspect::ConnectionPool => "connectionpool",
        }
    }
}

impl fmt::Display for ConfigAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigAspect {
    type Err = SqlSessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "defaultconnection" => Ok(ConfigAspect::DefaultConnection),
            "connectionpool" => Ok(ConfigAspect::ConnectionPool),
            _ => Err(SqlSessionError::Configuration(format!(
                "unknown configuration aspect '{s}'"
            ))),
        }
    }
}

/// Where pooled sessions connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub brand: String,
    /// Unset until configured; pooled connects fail while it is `None`
    pub database: Option<String>,
    pub autodisconnect: bool,
}

impl ConnectionSettings {
    pub fn sqlite(database: impl Into<String>) -> Self {
        ConnectionSettings {
            database: Some(database.into()),
            ..Default::default()
        }
    }

    pub fn database(&self) -> Result<&str> {
        self.database.as_deref().ok_or_else(|| {
            SqlSessionError::Configuration("no database has been configured".to_string())
        })
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            brand: "sqlite".to_string(),
            database: None,
            autodisconnect: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub partitions: usize,
    pub max_connections: usize,
    /// 0 waits without bound
    pub timeout_seconds: u64,
}

impl PoolSettings {
    /// Connections actually available: `max_connections` rounded down to a multiple of
    /// `partitions`
    pub fn effective_connections(&self) -> usize {
        if self.partitions == 0 {
            return 0;
        }
        (self.max_connections / self.partitions) * self.partitions
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions < 1 {
            return Err(SqlSessionError::PoolConfiguration(
                "partitions must be at least 1".to_string(),
            ));
        }
        let effective = self.effective_connections();
        if effective < MIN_EFFECTIVE_CONNECTIONS {
            return Err(SqlSessionError::PoolConfiguration(format!(
                "{} partition(s) with {} max connection(s) leaves {} usable connection(s); at least {} are required",
                self.partitions, self.max_connections, effective, MIN_EFFECTIVE_CONNECTIONS
            )));
        }
        Ok(())
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            partitions: 1,
            max_connections: 20,
            timeout_seconds: 0,
        }
    }
}

/// Turns one aspect's key/value map into validated settings
pub trait ConfigureListener {
    type Settings;

    fn aspect(&self) -> ConfigAspect;

    /// Apply `values` on top of `current`. Unknown keys and unparsable values are
    /// configuration errors.
    fn on_configure(
        &self,
        current: &Self::Settings,
        values: &HashMap<String, String>,
    ) -> Result<Self::Settings>;
}

pub struct ConnectionConfigListener;

impl ConfigureListener for ConnectionConfigListener {
    type Settings = ConnectionSettings;

    fn aspect(&self) -> ConfigAspect {
        ConfigAspect::DefaultConnection
    }

    fn on_configure(
        &self,
        current: &ConnectionSettings,
        values: &HashMap<String, String>,
    ) -> Result<ConnectionSettings> {
        let mut settings = current.clone();
        for (key, value) in values {
            match key.to_ascii_lowercase().as_str() {
                "brand" => settings.brand = value.trim().to_ascii_lowercase(),
                "database" => {
                    let value = value.trim();
                    settings.database = (!value.is_empty()).then(|| value.to_string());
                }
                "autodisconnect" => settings.autodisconnect = parse_switch(key, value)?,
                _ => return Err(unknown_key(self.aspect(), key)),
            }
        }
        if settings.brand.is_empty() {
            return Err(SqlSessionError::Configuration(
                "brand must not be empty".to_string(),
            ));
        }
        Ok(settings)
    }
}

pub struct PoolConfigListener;

impl ConfigureListener for PoolConfigListener {
    type Settings = PoolSettings;

    fn aspect(&self) -> ConfigAspect {
        ConfigAspect::ConnectionPool
    }

    fn on_configure(
        &self,
        current: &PoolSettings,
        values: &HashMap<String, String>,
    ) -> Result<PoolSettings> {
        let mut settings = *current;
        for (key, value) in values {
            match key.to_ascii_lowercase().as_str() {
                "partitions" => settings.partitions = parse_number(key, value)?,
                "max-connections" | "maxconnections" => {
                    settings.max_connections = parse_number(key, value)?
                }
                "timeout" => settings.timeout_seconds = parse_number(key, value)?,
                _ => return Err(unknown_key(self.aspect(), key)),
            }
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Current settings of every aspect.
///
/// A `defaultconnection` configuration is what turns pooling on.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationStore {
    connection: ConnectionSettings,
    pool: PoolSettings,
    pooling_enabled: bool,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply one aspect. Nothing changes when validation fails.
    pub fn configure(&mut self, aspect: &str, values: &HashMap<String, String>) -> Result<ConfigAspect> {
        let aspect: ConfigAspect = aspect.parse()?;
        match aspect {
            ConfigAspect::DefaultConnection => {
                self.connection = ConnectionConfigListener.on_configure(&self.connection, values)?;
                self.pooling_enabled = true;
            }
            ConfigAspect::ConnectionPool => {
                self.pool = PoolConfigListener.on_configure(&self.pool, values)?;
            }
        }
        Ok(aspect)
    }

    /// Replace the pool settings directly, bypassing the key/value form
    pub fn set_pool(&mut self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        self.pool = settings;
        Ok(())
    }

    pub fn connection(&self) -> &ConnectionSettings {
        &self.connection
    }

    pub fn pool(&self) -> &PoolSettings {
        &self.pool
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pooling_enabled
    }
}

fn unknown_key(aspect: ConfigAspect, key: &str) -> SqlSessionError {
    SqlSessionError::Configuration(format!("unknown key '{key}' for aspect '{aspect}'"))
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        SqlSessionError::Configuration(format!("invalid value '{value}' for '{key}'"))
    })
}

fn parse_switch(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(SqlSessionError::Configuration(format!(
            "invalid value '{value}' for '{key}', expected on or off"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_effective_connections_round_down() {
        let settings = PoolSettings {
            partitions: 3,
            max_connections: 10,
            timeout_seconds: 0,
        };
        assert_eq!(settings.effective_connections(), 9);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_floor_is_checked_after_rounding() {
        // 2 * floor(9 / 2) = 8, 4 * floor(7 / 4) = 4
        assert!(PoolSettings { partitions: 2, max_connections: 9, timeout_seconds: 0 }.validate().is_ok());
        assert!(matches!(
            PoolSettings { partitions: 4, max_connections: 7, timeout_seconds: 0 }.validate(),
            Err(SqlSessionError::PoolConfiguration(_))
        ));
        assert!(matches!(
            PoolSettings { partitions: 0, max_connections: 20, timeout_seconds: 0 }.validate(),
            Err(SqlSessionError::PoolConfiguration(_))
        ));
    }

    #[test]
    fn test_unknown_aspect_and_key() {
        let mut store = ConfigurationStore::new();
        assert!(matches!(
            store.configure("cache", &values(&[])),
            Err(SqlSessionError::Configuration(_))
        ));
        assert!(matches!(
            store.configure("connectionpool", &values(&[("size", "5")])),
            Err(SqlSessionError::Configuration(_))
        ));
        assert!(matches!(
            store.configure("connectionpool", &values(&[("partitions", "many")])),
            Err(SqlSessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_connection_enables_pooling() {
        let mut store = ConfigurationStore::new();
        assert!(!store.pooling_enabled());
        assert!(store.connection().database().is_err());

        let aspect = store
            .configure(
                "DefaultConnection",
                &values(&[("database", "/tmp/app.db"), ("autodisconnect", "off")]),
            )
            .unwrap();
        assert_eq!(aspect, ConfigAspect::DefaultConnection);
        assert!(store.pooling_enabled());
        assert_eq!(store.connection().database().unwrap(), "/tmp/app.db");
        assert!(!store.connection().autodisconnect);
    }

    #[test]
    fn test_failed_pool_configuration_keeps_previous_settings() {
        let mut store = ConfigurationStore::new();
        store
            .configure("connectionpool", &values(&[("partitions", "2"), ("max-connections", "10")]))
            .unwrap();
        let err = store
            .configure("connectionpool", &values(&[("max-connections", "0")]))
            .unwrap_err();
        assert!(matches!(err, SqlSessionError::PoolConfiguration(_)));
        assert_eq!(store.pool().max_connections, 10);
    }

    #[test]
    fn test_cli_config_maps_to_aspects() {
        let config = Config::parse_from(["sqlsession", "--database", "x.db", "--partitions", "2"]);
        let mut store = ConfigurationStore::new();
        store.configure("defaultconnection", &config.connection_aspect()).unwrap();
        store.configure("connectionpool", &config.pool_aspect()).unwrap();
        assert_eq!(store.connection().database.as_deref(), Some("x.db"));
        assert_eq!(store.pool().partitions, 2);
        assert_eq!(store.pool().effective_connections(), 20);
    }
}
