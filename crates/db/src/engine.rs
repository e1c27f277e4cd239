//! Persistence engine selection.
//!
//! Exactly one engine backs the identity schema for the lifetime of the
//! process. The choice is made once, from whichever connection strings are
//! configured.

use std::{fmt, str::FromStr};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Sqlite,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Sqlite => "sqlite",
        }
    }

    /// Directory (relative to this crate) holding the engine's own migration
    /// history. The two histories never share a table.
    pub fn migrations_dir(&self) -> &'static str {
        match self {
            Engine::Postgres => "migrations/postgres",
            Engine::Sqlite => "migrations/sqlite",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" | "pg" => Ok(Engine::Postgres),
            "sqlite" | "sqlite3" => Ok(Engine::Sqlite),
            other => Err(EngineError::UnknownEngine(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "no database connection string configured; set BROKER_PGSQL_DATABASE_URL or BROKER_SQLITE_DATABASE_URL"
    )]
    NotConfigured,
    #[error(
        "both postgres and sqlite connection strings are configured; remove one or set BROKER_PREFERRED_ENGINE"
    )]
    Ambiguous,
    #[error("unknown database engine `{0}`")]
    UnknownEngine(String),
}

/// One optional connection descriptor per supported engine.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub postgres_url: Option<SecretString>,
    pub sqlite_url: Option<SecretString>,
    /// Fixed priority used only when both descriptors are present.
    pub preferred_engine: Option<Engine>,
}

impl DatabaseConfig {
    pub fn new(postgres_url: Option<String>, sqlite_url: Option<String>) -> Self {
        Self {
            postgres_url: postgres_url.map(SecretString::from),
            sqlite_url: sqlite_url.map(SecretString::from),
            preferred_engine: None,
        }
    }

    pub fn with_preferred_engine(mut self, engine: Option<Engine>) -> Self {
        self.preferred_engine = engine;
        self
    }

    /// Connection string for `engine`, ignoring empty or whitespace-only values.
    pub fn url_for(&self, engine: Engine) -> Option<&str> {
        let url = match engine {
            Engine::Postgres => self.postgres_url.as_ref(),
            Engine::Sqlite => self.sqlite_url.as_ref(),
        }?;
        let url = url.expose_secret();
        (!url.trim().is_empty()).then_some(url)
    }

    /// Resolve which engine to activate.
    ///
    /// - nothing configured: `NotConfigured`
    /// - one configured: that engine
    /// - both configured: the preferred engine if one is set, else `Ambiguous`
    pub fn select_engine(&self) -> Result<Engine, EngineError> {
        let postgres = self.url_for(Engine::Postgres).is_some();
        let sqlite = self.url_for(Engine::Sqlite).is_some();

        match (postgres, sqlite) {
            (false, false) => Err(EngineError::NotConfigured),
            (true, false) => Ok(Engine::Postgres),
            (false, true) => Ok(Engine::Sqlite),
            (true, true) => match self.preferred_engine {
                Some(engine) => {
                    warn!(
                        engine = %engine,
                        "Both database connection strings are configured; using the preferred engine"
                    );
                    Ok(engine)
                }
                None => Err(EngineError::Ambiguous),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_descriptor_is_a_configuration_error() {
        let config = DatabaseConfig::new(None, None);
        assert!(matches!(
            config.select_engine(),
            Err(EngineError::NotConfigured)
        ));
    }

    #[test]
    fn blank_descriptors_count_as_absent() {
        let config = DatabaseConfig::new(Some("   ".to_string()), Some(String::new()));
        assert!(matches!(
            config.select_engine(),
            Err(EngineError::NotConfigured)
        ));
    }

    #[test]
    fn single_descriptor_selects_that_engine() {
        let pg = DatabaseConfig::new(Some("postgres://broker@localhost/broker".into()), None);
        assert_eq!(pg.select_engine().unwrap(), Engine::Postgres);

        let sqlite = DatabaseConfig::new(None, Some("sqlite://broker.db".into()));
        assert_eq!(sqlite.select_engine().unwrap(), Engine::Sqlite);
    }

    #[test]
    fn both_descriptors_without_priority_are_ambiguous() {
        let config = DatabaseConfig::new(
            Some("postgres://broker@localhost/broker".into()),
            Some("sqlite://broker.db".into()),
        );
        assert!(matches!(config.select_engine(), Err(EngineError::Ambiguous)));
    }

    #[test]
    fn both_descriptors_with_priority_pick_the_preferred_engine() {
        let config = DatabaseConfig::new(
            Some("postgres://broker@localhost/broker".into()),
            Some("sqlite://broker.db".into()),
        )
        .with_preferred_engine(Some(Engine::Sqlite));
        assert_eq!(config.select_engine().unwrap(), Engine::Sqlite);
    }

    #[test]
    fn engine_names_parse_case_insensitively() {
        assert_eq!("PostgreSQL".parse::<Engine>().unwrap(), Engine::Postgres);
        assert_eq!("sqlite".parse::<Engine>().unwrap(), Engine::Sqlite);
        assert!("mssql".parse::<Engine>().is_err());
    }
}
