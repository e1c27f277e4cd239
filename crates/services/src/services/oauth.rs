//! Authorization-code handshake against external OAuth providers.
//!
//! Each provider is a [`ProviderRegistration`]; the same code path serves
//! every registration, so adding a provider is configuration only. The
//! handshake uses PKCE (S256) and an opaque `state` that is remembered for
//! ten minutes and consumed exactly once. The browser that started a
//! handshake also holds a correlation value derived from its `state`, and the
//! callback must present it, so a `state` minted for one browser cannot be
//! replayed in another.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use db::models::ExternalIdentity;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// What a completed handshake yields.
pub type ExternalLoginInfo = ExternalIdentity;

const STATE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("unknown or already used state")]
    InvalidState,
    #[error("callback did not come from the browser that started the handshake")]
    CorrelationFailed,
    #[error("authorization request expired")]
    StateExpired,
    #[error("state was issued for provider `{expected}`")]
    ProviderMismatch { expected: String },
    #[error("provider returned an error: {0}")]
    Denied(String),
    #[error("provider responded with {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("provider response has no subject identifier")]
    MissingSubject,
    #[error("invalid redirect url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider `{0}` is registered twice")]
    DuplicateProvider(String),
    #[error("callback path `{0}` is used by more than one provider")]
    DuplicateCallbackPath(String),
    #[error("callback path `{0}` must start with `/`")]
    InvalidCallbackPath(String),
}

/// Authorize, token and userinfo endpoints plus the scopes to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
}

impl ProviderEndpoints {
    pub fn google() -> Self {
        Self {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
        }
    }

    pub fn microsoft() -> Self {
        Self {
            authorize_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                .to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            userinfo_url: "https://graph.microsoft.com/v1.0/me".to_string(),
            scopes: vec!["https://graph.microsoft.com/user.read".into()],
        }
    }

    /// Endpoints for providers that need no endpoint configuration.
    pub fn builtin(provider: &str) -> Option<Self> {
        match provider {
            "google" => Some(Self::google()),
            "microsoft" => Some(Self::microsoft()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRegistration {
    /// Canonical lower-case name, e.g. `google`.
    pub name: String,
    /// Human-facing name, e.g. `Google`.
    pub display_name: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub callback_path: String,
    pub endpoints: ProviderEndpoints,
}

impl ProviderRegistration {
    pub fn canonical_name(name: &str) -> String {
        name.trim().to_ascii_lowercase()
    }

    pub fn default_callback_path(name: &str) -> String {
        format!("/signin-{}", Self::canonical_name(name))
    }

    pub fn default_display_name(name: &str) -> String {
        let name = Self::canonical_name(name);
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// The typed provider list, iterated uniformly everywhere.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderRegistration>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderRegistration>) -> Result<Self, RegistryError> {
        for (i, provider) in providers.iter().enumerate() {
            if !provider.callback_path.starts_with('/') {
                return Err(RegistryError::InvalidCallbackPath(
                    provider.callback_path.clone(),
                ));
            }
            for other in &providers[..i] {
                if other.name == provider.name {
                    return Err(RegistryError::DuplicateProvider(provider.name.clone()));
                }
                if other.callback_path.eq_ignore_ascii_case(&provider.callback_path) {
                    return Err(RegistryError::DuplicateCallbackPath(
                        provider.callback_path.clone(),
                    ));
                }
            }
        }
        Ok(Self { providers })
    }

    pub fn get(&self, name: &str) -> Option<&ProviderRegistration> {
        let name = ProviderRegistration::canonical_name(name);
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn by_callback_path(&self, path: &str) -> Option<&ProviderRegistration> {
        self.providers
            .iter()
            .find(|p| p.callback_path.eq_ignore_ascii_case(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Why the handshake was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeIntent {
    SignIn,
    /// Attach the external identity to an already signed-in account.
    Link(Uuid),
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Provider authorize URL the browser is sent to.
    pub url: String,
    pub state: String,
    /// Value the browser must hand back on the callback.
    pub correlation: String,
}

#[derive(Debug, Clone)]
struct PendingAuthorization {
    provider: String,
    pkce_verifier: String,
    return_url: Option<String>,
    intent: HandshakeIntent,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedHandshake {
    pub identity: ExternalLoginInfo,
    pub return_url: Option<String>,
    pub intent: HandshakeIntent,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct OAuthClient {
    registry: Arc<ProviderRegistry>,
    http: reqwest::Client,
    public_base_url: Url,
    pending: DashMap<String, PendingAuthorization>,
    state_ttl: Duration,
}

impl OAuthClient {
    pub fn new(registry: Arc<ProviderRegistry>, public_base_url: Url) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            public_base_url,
            pending: DashMap::new(),
            state_ttl: Duration::minutes(STATE_TTL_MINUTES),
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn redirect_uri(&self, provider: &ProviderRegistration) -> Result<Url, HandshakeError> {
        Ok(self.public_base_url.join(&provider.callback_path)?)
    }

    /// Start a handshake and return the URL to send the browser to.
    pub fn begin(
        &self,
        provider: &str,
        return_url: Option<String>,
        intent: HandshakeIntent,
    ) -> Result<AuthorizationRequest, HandshakeError> {
        let registration = self
            .registry
            .get(provider)
            .ok_or_else(|| HandshakeError::UnknownProvider(provider.to_string()))?;

        self.purge_expired(Utc::now());

        let state = random_token();
        let pkce_verifier = random_token();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce_verifier.as_bytes()));
        let redirect_uri = self.redirect_uri(registration)?;
        let scope = registration.endpoints.scopes.join(" ");

        let url = Url::parse_with_params(
            &registration.endpoints.authorize_url,
            &[
                ("client_id", registration.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )?;

        self.pending.insert(
            state.clone(),
            PendingAuthorization {
                provider: registration.name.clone(),
                pkce_verifier,
                return_url,
                intent,
                created_at: Utc::now(),
            },
        );

        debug!(provider = %registration.name, "Started external login handshake");
        Ok(AuthorizationRequest {
            url: url.into(),
            correlation: correlation_for(&state),
            state,
        })
    }

    /// Consume the pending state for `provider`. A state is usable once.
    fn take_pending(
        &self,
        provider: &str,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingAuthorization, HandshakeError> {
        let (_, pending) = self
            .pending
            .remove(state)
            .ok_or(HandshakeError::InvalidState)?;

        if now - pending.created_at >= self.state_ttl {
            return Err(HandshakeError::StateExpired);
        }
        if pending.provider != provider {
            return Err(HandshakeError::ProviderMismatch {
                expected: pending.provider,
            });
        }
        Ok(pending)
    }

    /// Finish a handshake: check the state, redeem the code, fetch the profile.
    ///
    /// `correlation` is what the calling browser presented. It is checked
    /// before the state is consumed, so a forged callback leaves the real
    /// handshake usable.
    pub async fn complete(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        correlation: Option<&str>,
    ) -> Result<CompletedHandshake, HandshakeError> {
        let registration = self
            .registry
            .get(provider)
            .ok_or_else(|| HandshakeError::UnknownProvider(provider.to_string()))?;
        if correlation != Some(correlation_for(state).as_str()) {
            warn!(provider = %registration.name, "External login callback failed correlation");
            return Err(HandshakeError::CorrelationFailed);
        }
        let pending = self.take_pending(&registration.name, state, Utc::now())?;
        let redirect_uri = self.redirect_uri(registration)?;

        let response = self
            .http
            .post(&registration.endpoints.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", registration.client_id.as_str()),
                (
                    "client_secret",
                    registration.client_secret.expose_secret(),
                ),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", pending.pkce_verifier.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %registration.name, status, "Token exchange failed");
            return Err(HandshakeError::Provider { status, body });
        }
        let tokens: TokenResponse = response.json().await?;

        let response = self
            .http
            .get(&registration.endpoints.userinfo_url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %registration.name, status, "Userinfo request failed");
            return Err(HandshakeError::Provider { status, body });
        }
        let profile: Value = response.json().await?;
        let identity = identity_from_profile(registration, &profile)?;

        Ok(CompletedHandshake {
            identity,
            return_url: pending.return_url,
            intent: pending.intent,
        })
    }

    /// Drop states older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| now - pending.created_at < self.state_ttl);
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Map a userinfo document onto an external identity.
///
/// Google answers OIDC claims (`sub`, `email`, `name`); Microsoft Graph
/// answers `id`, `mail` / `userPrincipalName` and `displayName`.
pub fn identity_from_profile(
    provider: &ProviderRegistration,
    profile: &Value,
) -> Result<ExternalLoginInfo, HandshakeError> {
    let field = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|key| match profile.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let subject = field(&["sub", "id"]).ok_or(HandshakeError::MissingSubject)?;

    Ok(ExternalLoginInfo {
        provider: provider.name.clone(),
        provider_display_name: provider.display_name.clone(),
        subject,
        email: field(&["email", "mail", "userPrincipalName"]),
        name: field(&["name", "displayName"]),
    })
}

/// Browser-held proof for `state`. Only a digest is stored client side.
pub fn correlation_for(state: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(state.as_bytes()))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registration(name: &str) -> ProviderRegistration {
        ProviderRegistration {
            name: name.to_string(),
            display_name: ProviderRegistration::default_display_name(name),
            client_id: format!("{name}-client"),
            client_secret: SecretString::from("secret"),
            callback_path: ProviderRegistration::default_callback_path(name),
            endpoints: ProviderEndpoints::builtin(name).unwrap_or_else(ProviderEndpoints::google),
        }
    }

    fn client() -> OAuthClient {
        let registry =
            ProviderRegistry::new(vec![registration("google"), registration("microsoft")])
                .unwrap();
        OAuthClient::new(
            Arc::new(registry),
            Url::parse("https://broker.example.org").unwrap(),
        )
    }

    #[test]
    fn registry_rejects_duplicate_names_and_paths() {
        let err = ProviderRegistry::new(vec![registration("google"), registration("google")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProvider(name) if name == "google"));

        let mut other = registration("github");
        other.callback_path = "/signin-google".to_string();
        let err = ProviderRegistry::new(vec![registration("google"), other]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateCallbackPath(_)));
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let client = client();
        assert_eq!(client.registry().get("Google").unwrap().name, "google");
        assert_eq!(
            client.registry().by_callback_path("/signin-microsoft").unwrap().display_name,
            "Microsoft"
        );
        assert!(client.registry().get("github").is_none());
    }

    #[test]
    fn begin_builds_pkce_authorize_url() {
        let client = client();
        let request = client
            .begin("google", Some("/Account/Me".into()), HandshakeIntent::SignIn)
            .unwrap();

        let url = Url::parse(&request.url).unwrap();
        assert_eq!(url.host_str(), Some("accounts.google.com"));
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "google-client");
        assert_eq!(
            params["redirect_uri"],
            "https://broker.example.org/signin-google"
        );
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "openid profile email");
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(client.pending_count(), 1);
    }

    #[test]
    fn begin_rejects_unknown_provider() {
        let err = client()
            .begin("github", None, HandshakeIntent::SignIn)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownProvider(_)));
    }

    #[test]
    fn state_is_single_use_and_bound_to_provider() {
        let client = client();
        let request = client.begin("google", None, HandshakeIntent::SignIn).unwrap();

        let err = client
            .take_pending("microsoft", &request.state, Utc::now())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ProviderMismatch { .. }));

        // The mismatched attempt consumed the state.
        let err = client
            .take_pending("google", &request.state, Utc::now())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidState));
    }

    #[test]
    fn state_expires_after_ttl() {
        let client = client();
        let request = client
            .begin("microsoft", Some("/".into()), HandshakeIntent::SignIn)
            .unwrap();

        let later = Utc::now() + Duration::minutes(11);
        let err = client
            .take_pending("microsoft", &request.state, later)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::StateExpired));
    }

    #[test]
    fn purge_drops_only_expired_states() {
        let client = client();
        client.begin("google", None, HandshakeIntent::SignIn).unwrap();
        assert_eq!(client.purge_expired(Utc::now()), 0);
        assert_eq!(client.purge_expired(Utc::now() + Duration::minutes(10)), 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn complete_with_unknown_state_fails_before_any_request() {
        let correlation = correlation_for("never-issued");
        let err = client()
            .complete("google", "code", "never-issued", Some(&correlation))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidState));
    }

    #[tokio::test]
    async fn foreign_browser_cannot_complete_or_burn_a_handshake() {
        let client = client();
        let request = client.begin("google", None, HandshakeIntent::SignIn).unwrap();
        assert_ne!(request.correlation, request.state);

        for presented in [None, Some("someone-elses-cookie")] {
            let err = client
                .complete("google", "code", &request.state, presented)
                .await
                .unwrap_err();
            assert!(matches!(err, HandshakeError::CorrelationFailed));
        }
        // The state is still pending for the browser that owns it.
        assert_eq!(client.pending_count(), 1);
        assert!(client
            .take_pending("google", &request.state, Utc::now())
            .is_ok());
    }

    #[test]
    fn google_profile_maps_oidc_claims() {
        let identity = identity_from_profile(
            &registration("google"),
            &json!({ "sub": "abc123", "email": "x@y.com", "name": "X Y" }),
        )
        .unwrap();

        assert_eq!(identity.provider, "google");
        assert_eq!(identity.provider_display_name, "Google");
        assert_eq!(identity.subject, "abc123");
        assert_eq!(identity.email.as_deref(), Some("x@y.com"));
        assert_eq!(identity.name.as_deref(), Some("X Y"));
    }

    #[test]
    fn microsoft_profile_falls_back_to_principal_name() {
        let identity = identity_from_profile(
            &registration("microsoft"),
            &json!({
                "id": "00000000-0000-0000-0000-000000000001",
                "displayName": "Ada",
                "mail": null,
                "userPrincipalName": "ada@contoso.edu"
            }),
        )
        .unwrap();

        assert_eq!(identity.subject, "00000000-0000-0000-0000-000000000001");
        assert_eq!(identity.email.as_deref(), Some("ada@contoso.edu"));
        assert_eq!(identity.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn profile_without_subject_is_rejected() {
        let err = identity_from_profile(&registration("google"), &json!({ "email": "x@y.com" }))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::MissingSubject));
    }
}
