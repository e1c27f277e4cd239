//! Process configuration read from the environment.
//!
//! Everything is parsed once at startup into [`BrokerConfig`]; any missing or
//! malformed required value is a [`ConfigError`] and the process exits before
//! binding a listener.

use std::{path::PathBuf, str::FromStr, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use db::{DatabaseConfig, Engine, EngineError};
use rand::RngCore;
use secrecy::SecretString;
use services::services::oauth::{
    ProviderEndpoints, ProviderRegistration, ProviderRegistry, RegistryError,
};
use thiserror::Error;
use url::Url;

const DEFAULT_PROVIDERS: &str = "google,microsoft";
const DEFAULT_AUTH_COOKIE: &str = "Broker.Auth";
const DEFAULT_SESSION_COOKIE: &str = ".Broker.Session";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TICKET_EXPIRY_MINUTES: i64 = 60;
/// Thirty days.
const MAX_TICKET_EXPIRY_MINUTES: i64 = 60 * 24 * 30;
/// One day.
const MAX_IDLE_TIMEOUT_SECS: u64 = 60 * 60 * 24;
const DEFAULT_PORT: u16 = 5000;
const MIN_TICKET_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider `{provider}` is missing {key}")]
    MissingProviderSetting { provider: String, key: String },
    #[error("BROKER_TICKET_SECRET is required in Production")]
    MissingTicketSecret,
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("invalid url in {key}: {source}")]
    InvalidUrl {
        key: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Providers(#[from] RegistryError),
}

/// Hosting environment. Anything other than `Development` is production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("development") {
            Environment::Development
        } else {
            Environment::Production
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "Development",
            Environment::Production => "Production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub providers: Vec<ProviderRegistration>,
    /// Base64 HS256 key for authentication tickets.
    pub ticket_secret: SecretString,
    pub ticket_window: chrono::Duration,
    pub auth_cookie_name: String,
    pub session_cookie_name: String,
    pub session_idle_timeout: Duration,
    pub login_path: String,
    pub access_denied_path: String,
    pub public_base_url: Url,
    pub web_root: PathBuf,
    pub https_port: Option<u16>,
    pub host: String,
    pub port: u16,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Blank values are
    /// treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = get("BROKER_ENVIRONMENT")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Production);

        let mut database = DatabaseConfig::new(
            get("BROKER_PGSQL_DATABASE_URL"),
            get("BROKER_SQLITE_DATABASE_URL"),
        );
        if let Some(preferred) = get("BROKER_PREFERRED_ENGINE") {
            database =
                database.with_preferred_engine(Some(Engine::from_str(preferred.trim())?));
        }

        let providers = match lookup("BROKER_AUTH_PROVIDERS") {
            Some(list) => list,
            None => DEFAULT_PROVIDERS.to_string(),
        };
        let providers = providers
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| provider_from_lookup(name, &get))
            .collect::<Result<Vec<_>, _>>()?;

        let ticket_secret = match get("BROKER_TICKET_SECRET") {
            Some(secret) => {
                check_ticket_secret(&secret)?;
                SecretString::from(secret.trim().to_string())
            }
            None if environment.is_production() => return Err(ConfigError::MissingTicketSecret),
            None => {
                tracing::warn!("BROKER_TICKET_SECRET not set, using a random development key");
                random_ticket_secret()
            }
        };

        let ticket_minutes: i64 =
            parse_or(&get, "BROKER_TICKET_EXPIRY_MINUTES", DEFAULT_TICKET_EXPIRY_MINUTES)?;
        let idle_secs: u64 =
            parse_or(&get, "BROKER_SESSION_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;
        if ticket_minutes <= 0 {
            return Err(invalid("BROKER_TICKET_EXPIRY_MINUTES", "must be positive"));
        }
        if ticket_minutes > MAX_TICKET_EXPIRY_MINUTES {
            return Err(invalid(
                "BROKER_TICKET_EXPIRY_MINUTES",
                &format!("must be at most {MAX_TICKET_EXPIRY_MINUTES}"),
            ));
        }
        if idle_secs == 0 {
            return Err(invalid("BROKER_SESSION_IDLE_TIMEOUT_SECS", "must be positive"));
        }
        if idle_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(invalid(
                "BROKER_SESSION_IDLE_TIMEOUT_SECS",
                &format!("must be at most {MAX_IDLE_TIMEOUT_SECS}"),
            ));
        }

        let host = get("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&get, "PORT", DEFAULT_PORT)?;
        let https_port = get("BROKER_HTTPS_PORT")
            .map(|v| {
                v.trim()
                    .parse::<u16>()
                    .map_err(|e| invalid("BROKER_HTTPS_PORT", &e.to_string()))
            })
            .transpose()?;

        let public_base_url = get("BROKER_PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let public_base_url =
            Url::parse(public_base_url.trim()).map_err(|source| ConfigError::InvalidUrl {
                key: "BROKER_PUBLIC_BASE_URL".to_string(),
                source,
            })?;

        Ok(Self {
            environment,
            database,
            providers,
            ticket_secret,
            ticket_window: chrono::Duration::minutes(ticket_minutes),
            auth_cookie_name: get("BROKER_AUTH_COOKIE_NAME")
                .unwrap_or_else(|| DEFAULT_AUTH_COOKIE.to_string()),
            session_cookie_name: get("BROKER_SESSION_COOKIE_NAME")
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
            session_idle_timeout: Duration::from_secs(idle_secs),
            login_path: local_path(&get, "BROKER_LOGIN_PATH", "/Login")?,
            access_denied_path: local_path(&get, "BROKER_ACCESS_DENIED_PATH", "/AccessDenied")?,
            public_base_url,
            web_root: get("BROKER_WEB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("wwwroot")),
            https_port,
            host,
            port,
        })
    }

    pub fn provider_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        Ok(ProviderRegistry::new(self.providers.clone())?)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        None => Ok(default),
    }
}

fn local_path(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<String, ConfigError> {
    let path = get(key).unwrap_or_else(|| default.to_string());
    let path = path.trim();
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(invalid(key, "must be a local path starting with `/`"));
    }
    Ok(path.to_string())
}

fn provider_from_lookup(
    name: &str,
    get: &impl Fn(&str) -> Option<String>,
) -> Result<ProviderRegistration, ConfigError> {
    let name = ProviderRegistration::canonical_name(name);
    let prefix = format!("BROKER_AUTH_{}", name.to_ascii_uppercase().replace('-', "_"));
    let required = |suffix: &str| {
        let key = format!("{prefix}_{suffix}");
        get(&key).ok_or(ConfigError::MissingProviderSetting {
            provider: name.clone(),
            key,
        })
    };

    let client_id = required("CLIENT_ID")?;
    let client_secret = required("CLIENT_SECRET")?;

    let endpoints = match ProviderEndpoints::builtin(&name) {
        Some(mut endpoints) => {
            // Built-in endpoints can still be pointed elsewhere, e.g. a tenant.
            if let Some(url) = get(&format!("{prefix}_AUTHORIZE_URL")) {
                endpoints.authorize_url = url;
            }
            if let Some(url) = get(&format!("{prefix}_TOKEN_URL")) {
                endpoints.token_url = url;
            }
            if let Some(url) = get(&format!("{prefix}_USERINFO_URL")) {
                endpoints.userinfo_url = url;
            }
            endpoints
        }
        None => ProviderEndpoints {
            authorize_url: required("AUTHORIZE_URL")?,
            token_url: required("TOKEN_URL")?,
            userinfo_url: required("USERINFO_URL")?,
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
        },
    };

    let endpoints = match get(&format!("{prefix}_SCOPES")) {
        Some(scopes) => ProviderEndpoints {
            scopes: scopes.split_whitespace().map(str::to_string).collect(),
            ..endpoints
        },
        None => endpoints,
    };

    for (key, url) in [
        ("AUTHORIZE_URL", &endpoints.authorize_url),
        ("TOKEN_URL", &endpoints.token_url),
        ("USERINFO_URL", &endpoints.userinfo_url),
    ] {
        Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
            key: format!("{prefix}_{key}"),
            source,
        })?;
    }

    Ok(ProviderRegistration {
        display_name: get(&format!("{prefix}_DISPLAY_NAME"))
            .unwrap_or_else(|| ProviderRegistration::default_display_name(&name)),
        callback_path: get(&format!("{prefix}_CALLBACK_PATH"))
            .unwrap_or_else(|| ProviderRegistration::default_callback_path(&name)),
        client_id,
        client_secret: SecretString::from(client_secret),
        endpoints,
        name,
    })
}

fn check_ticket_secret(secret: &str) -> Result<(), ConfigError> {
    let bytes = STANDARD
        .decode(secret.trim())
        .map_err(|_| invalid("BROKER_TICKET_SECRET", "must be standard base64"))?;
    if bytes.len() < MIN_TICKET_SECRET_BYTES {
        return Err(invalid(
            "BROKER_TICKET_SECRET",
            &format!("must decode to at least {MIN_TICKET_SECRET_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn random_ticket_secret() -> SecretString {
    let mut bytes = [0u8; MIN_TICKET_SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    SecretString::from(STANDARD.encode(bytes))
}

impl BrokerConfig {
    /// Log the effective configuration without secrets.
    pub fn log_summary(&self) {
        tracing::info!(
            environment = self.environment.as_str(),
            providers = ?self.providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            public_base_url = %self.public_base_url,
            https_port = ?self.https_port,
            web_root = %self.web_root.display(),
            ticket_expiry_minutes = self.ticket_window.num_minutes(),
            session_idle_secs = self.session_idle_timeout.as_secs(),
            "Loaded configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn secret() -> String {
        STANDARD.encode([9u8; 32])
    }

    #[test]
    fn development_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "development"),
            ("BROKER_AUTH_PROVIDERS", ""),
        ]))
        .unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert!(config.providers.is_empty());
        assert_eq!(config.auth_cookie_name, "Broker.Auth");
        assert_eq!(config.session_cookie_name, ".Broker.Session");
        assert_eq!(config.session_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.ticket_window, chrono::Duration::minutes(60));
        assert_eq!(config.login_path, "/Login");
        assert_eq!(config.access_denied_path, "/AccessDenied");
        assert_eq!(config.port, 5000);
        assert_eq!(config.public_base_url.as_str(), "http://localhost:5000/");
        assert!(config.https_port.is_none());
        // Random dev key still satisfies the secret rules.
        check_ticket_secret(config.ticket_secret.expose_secret()).unwrap();
    }

    #[test]
    fn unknown_environment_is_production() {
        assert_eq!(Environment::parse("Staging"), Environment::Production);
        assert_eq!(Environment::parse(" DEVELOPMENT "), Environment::Development);
    }

    #[test]
    fn production_requires_ticket_secret() {
        let err = BrokerConfig::from_lookup(lookup(&[("BROKER_AUTH_PROVIDERS", "")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTicketSecret));
    }

    #[test]
    fn short_ticket_secret_is_rejected() {
        let short = STANDARD.encode([1u8; 8]);
        let err = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_AUTH_PROVIDERS", ""),
            ("BROKER_TICKET_SECRET", &short),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn default_providers_require_credentials() {
        let err = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_GOOGLE_CLIENT_ID", "gid"),
            ("BROKER_AUTH_GOOGLE_CLIENT_SECRET", "gsecret"),
            ("BROKER_AUTH_MICROSOFT_CLIENT_ID", "mid"),
        ]))
        .unwrap_err();

        match err {
            ConfigError::MissingProviderSetting { provider, key } => {
                assert_eq!(provider, "microsoft");
                assert_eq!(key, "BROKER_AUTH_MICROSOFT_CLIENT_SECRET");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn builtin_and_custom_providers() {
        let secret = secret();
        let config = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_TICKET_SECRET", &secret),
            ("BROKER_AUTH_PROVIDERS", "Google, github"),
            ("BROKER_AUTH_GOOGLE_CLIENT_ID", "gid"),
            ("BROKER_AUTH_GOOGLE_CLIENT_SECRET", "gsecret"),
            ("BROKER_AUTH_GITHUB_CLIENT_ID", "hid"),
            ("BROKER_AUTH_GITHUB_CLIENT_SECRET", "hsecret"),
            ("BROKER_AUTH_GITHUB_CALLBACK_PATH", "/auth/github/callback"),
            ("BROKER_AUTH_GITHUB_AUTHORIZE_URL", "https://github.com/login/oauth/authorize"),
            ("BROKER_AUTH_GITHUB_TOKEN_URL", "https://github.com/login/oauth/access_token"),
            ("BROKER_AUTH_GITHUB_USERINFO_URL", "https://api.github.com/user"),
            ("BROKER_AUTH_GITHUB_SCOPES", "read:user user:email"),
        ]))
        .unwrap();

        let registry = config.provider_registry().unwrap();
        assert_eq!(registry.len(), 2);

        let google = registry.get("google").unwrap();
        assert_eq!(google.callback_path, "/signin-google");
        assert_eq!(google.display_name, "Google");
        assert_eq!(google.endpoints, ProviderEndpoints::google());

        let github = registry.by_callback_path("/auth/github/callback").unwrap();
        assert_eq!(github.name, "github");
        assert_eq!(github.endpoints.scopes, vec!["read:user", "user:email"]);
    }

    #[test]
    fn custom_provider_needs_endpoints() {
        let err = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", "okta"),
            ("BROKER_AUTH_OKTA_CLIENT_ID", "id"),
            ("BROKER_AUTH_OKTA_CLIENT_SECRET", "secret"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingProviderSetting { ref key, .. } if key == "BROKER_AUTH_OKTA_AUTHORIZE_URL"
        ));
    }

    #[test]
    fn duplicate_provider_is_rejected_by_registry() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", "google,GOOGLE"),
            ("BROKER_AUTH_GOOGLE_CLIENT_ID", "gid"),
            ("BROKER_AUTH_GOOGLE_CLIENT_SECRET", "gsecret"),
        ]))
        .unwrap();
        assert!(matches!(
            config.provider_registry(),
            Err(ConfigError::Providers(RegistryError::DuplicateProvider(_)))
        ));
    }

    #[test]
    fn database_urls_and_preferred_engine() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", ""),
            ("BROKER_PGSQL_DATABASE_URL", "postgres://localhost/broker"),
            ("BROKER_SQLITE_DATABASE_URL", "sqlite://broker.db"),
            ("BROKER_PREFERRED_ENGINE", "sqlite"),
        ]))
        .unwrap();
        assert_eq!(config.database.select_engine().unwrap(), Engine::Sqlite);

        let err = BrokerConfig::from_lookup(lookup(&[
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", ""),
            ("BROKER_PREFERRED_ENGINE", "mssql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Engine(EngineError::UnknownEngine(_))));
    }

    #[test]
    fn malformed_numbers_and_paths_are_errors() {
        let base = [
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", ""),
        ];

        let mut vars = base.to_vec();
        vars.push(("PORT", "http"));
        assert!(matches!(
            BrokerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "PORT"
        ));

        let mut vars = base.to_vec();
        vars.push(("BROKER_LOGIN_PATH", "https://evil.example/login"));
        assert!(BrokerConfig::from_lookup(lookup(&vars)).is_err());

        let mut vars = base.to_vec();
        vars.push(("BROKER_SESSION_IDLE_TIMEOUT_SECS", "0"));
        assert!(BrokerConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn oversized_lifetimes_are_rejected_not_overflowed() {
        let base = [
            ("BROKER_ENVIRONMENT", "Development"),
            ("BROKER_AUTH_PROVIDERS", ""),
        ];

        let mut vars = base.to_vec();
        vars.push(("BROKER_TICKET_EXPIRY_MINUTES", "9223372036854775807"));
        assert!(matches!(
            BrokerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "BROKER_TICKET_EXPIRY_MINUTES"
        ));

        let mut vars = base.to_vec();
        vars.push(("BROKER_SESSION_IDLE_TIMEOUT_SECS", "18446744073709551615"));
        assert!(matches!(
            BrokerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "BROKER_SESSION_IDLE_TIMEOUT_SECS"
        ));

        let mut vars = base.to_vec();
        vars.push(("BROKER_TICKET_EXPIRY_MINUTES", "43200"));
        let config = BrokerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.ticket_window, chrono::Duration::days(30));
    }
}
