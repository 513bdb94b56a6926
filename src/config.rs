use std::{fmt, io::ErrorKind, str::FromStr};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

use crate::file_storage::DEFAULT_FILE_PATH;

#[derive(Parser, Debug)]
#[command(name = "hbnb", about = "hbnb - inspect the object store")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "hbnb.toml")]
    pub config: String,

    /// Storage backend (overrides config file and environment)
    #[arg(short, long, value_enum)]
    pub storage: Option<Backend>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Count stored entities, optionally of one type
    Count { kind: Option<String> },
    /// List stored entities, optionally of one type
    List { kind: Option<String> },
    /// Show one entity
    Show { kind: String, id: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {name}, expected one of: {expected}")]
    InvalidValue {
        name: String,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    File,
    Db,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::File => write!(f, "file"),
            Backend::Db => write!(f, "db"),
        }
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Backend::File),
            "db" => Ok(Backend::Db),
            other => Err(ConfigError::InvalidValue {
                name: "HBNB_TYPE_STORAGE".to_string(),
                value: other.to_string(),
                expected: "file, db",
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbDriver {
    Sqlite,
    Postgres,
}

impl FromStr for DbDriver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(DbDriver::Sqlite),
            "postgres" => Ok(DbDriver::Postgres),
            other => Err(ConfigError::InvalidValue {
                name: "HBNB_DB_DRIVER".to_string(),
                value: other.to_string(),
                expected: "sqlite, postgres",
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    #[serde(default = "default_file")]
    pub file: FileConfig,

    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    /// `test` drops every relational table when the engine is constructed.
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileConfig {
    #[serde(default = "default_file_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_driver")]
    pub driver: DbDriver,

    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        backend: default_backend(),
        file: default_file(),
        database: default_database(),
        environment: String::new(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_backend() -> Backend {
    Backend::File
}

fn default_file() -> FileConfig {
    FileConfig {
        path: default_file_path(),
    }
}

fn default_file_path() -> String {
    DEFAULT_FILE_PATH.to_string()
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        driver: default_driver(),
        path: default_db_path(),
        host: default_db_host(),
        port: default_db_port(),
        user: String::new(),
        password: String::new(),
        name: String::new(),
    }
}

fn default_driver() -> DbDriver {
    DbDriver::Sqlite
}

fn default_db_path() -> String {
    "hbnb.db".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: default_storage(),
            logging: default_logging(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        default_storage()
    }
}

impl StorageConfig {
    pub fn is_test(&self) -> bool {
        self.environment == "test"
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DatabaseConfig {
    /// libpq style `key='value'` connection string for the PostgreSQL driver.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote(&self.host)),
            format!("port={}", self.port),
        ];
        if !self.user.is_empty() {
            parts.push(format!("user={}", quote(&self.user)));
        }
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote(&self.password)));
        }
        if !self.name.is_empty() {
            parts.push(format!("dbname={}", quote(&self.name)));
        }
        parts.join(" ")
    }
}

impl Config {
    /// File, then `HBNB_*` environment variables, then CLI flags.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&cli.config)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Config::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = &mut self.storage;
        if let Some(value) = lookup("HBNB_TYPE_STORAGE") {
            storage.backend = value.parse()?;
        }
        if let Some(value) = lookup("HBNB_FILE_PATH") {
            storage.file.path = value;
        }
        if let Some(value) = lookup("HBNB_DB_DRIVER") {
            storage.database.driver = value.parse()?;
        }
        if let Some(value) = lookup("HBNB_DB_PATH") {
            storage.database.path = value;
        }
        if let Some(value) = lookup("HBNB_DB_USER") {
            storage.database.user = value;
        }
        if let Some(value) = lookup("HBNB_DB_PWD") {
            storage.database.password = value;
        }
        if let Some(value) = lookup("HBNB_DB_HOST") {
            storage.database.host = value;
        }
        if let Some(value) = lookup("HBNB_DB_NAME") {
            storage.database.name = value;
        }
        if let Some(value) = lookup("HBNB_ENV") {
            storage.environment = value;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliArgs) {
        if let Some(backend) = cli.storage {
            self.storage.backend = backend;
        }
        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.backend, Backend::File);
        assert_eq!(config.storage.file.path, "file.json");
        assert_eq!(config.storage.database.driver, DbDriver::Sqlite);
        assert_eq!(config.logging.level, "info");
        assert!(!config.storage.is_test());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "db"

            [storage.database]
            driver = "postgres"
            name = "hbnb_dev_db"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, Backend::Db);
        assert_eq!(config.storage.database.driver, DbDriver::Postgres);
        assert_eq!(config.storage.database.port, 5432);
        assert_eq!(config.storage.file.path, "file.json");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::from_file("does-not-exist.toml").unwrap();
        assert_eq!(config.storage.backend, Backend::File);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbnb.toml");
        std::fs::write(&path, "[storage\nbackend = ").unwrap();
        let result = Config::from_file(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: Config = toml::from_str("[storage.file]\npath = \"from-file.json\"").unwrap();
        config
            .apply_env(env(&[
                ("HBNB_FILE_PATH", "from-env.json"),
                ("HBNB_TYPE_STORAGE", "db"),
                ("HBNB_DB_DRIVER", "postgres"),
                ("HBNB_DB_USER", "hbnb_test"),
                ("HBNB_ENV", "test"),
            ]))
            .unwrap();
        assert_eq!(config.storage.file.path, "from-env.json");
        assert_eq!(config.storage.backend, Backend::Db);
        assert_eq!(config.storage.database.driver, DbDriver::Postgres);
        assert_eq!(config.storage.database.user, "hbnb_test");
        assert!(config.storage.is_test());
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("HBNB_TYPE_STORAGE", "mongo")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref value, .. } if value == "mongo"));
    }

    #[test]
    fn test_cli_overrides_env() {
        let cli = CliArgs::try_parse_from(["hbnb", "--storage", "file", "-l", "debug", "count"]).unwrap();
        let mut config = Config::default();
        config.apply_env(env(&[("HBNB_TYPE_STORAGE", "db")])).unwrap();
        config.apply_cli(&cli);
        assert_eq!(config.storage.backend, Backend::File);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(cli.command, Command::Count { kind: None });
    }

    #[test]
    fn test_show_command() {
        let cli = CliArgs::try_parse_from(["hbnb", "show", "City", "abc"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Show {
                kind: "City".to_string(),
                id: "abc".to_string()
            }
        );
        assert_eq!(cli.config, "hbnb.toml");
    }

    #[test]
    fn test_connection_string_quotes_values() {
        let database = DatabaseConfig {
            user: "hbnb_dev".to_string(),
            password: "it's secret".to_string(),
            name: "hbnb_dev_db".to_string(),
            ..default_database()
        };
        assert_eq!(
            database.connection_string(),
            "host='localhost' port=5432 user='hbnb_dev' password='it\\'s secret' dbname='hbnb_dev_db'"
        );
    }
}
