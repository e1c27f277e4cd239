//! Signed authentication tickets carried in the auth cookie.
//!
//! A ticket is an HS256 JWT with an absolute expiry. Validation takes the
//! current instant explicitly; once more than half of the window has elapsed
//! a valid ticket is reissued with a fresh window (sliding expiration).

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const TICKET_AUDIENCE: &str = "broker";

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("invalid ticket")]
    InvalidToken,
    #[error("ticket expired")]
    Expired,
    #[error("ticket secret must be base64 encoded")]
    InvalidSecret,
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// How the principal proved who they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider", rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    pub sub: Uuid,
    pub name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub auth_method: AuthMethod,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

impl TicketClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn principal(&self) -> AuthPrincipal {
        AuthPrincipal {
            account_id: self.sub,
            user_name: self.name.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            auth_method: self.auth_method.clone(),
        }
    }
}

/// The identity a ticket is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPrincipal {
    pub account_id: Uuid,
    pub user_name: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub auth_method: AuthMethod,
}

impl AuthPrincipal {
    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TicketCheck {
    pub claims: TicketClaims,
    /// Present when the ticket passed the renewal threshold.
    pub renewed: Option<IssuedTicket>,
}

#[derive(Clone)]
pub struct TicketService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    window: Duration,
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl TicketService {
    pub fn new(secret: &SecretString, window: Duration) -> Result<Self, TicketError> {
        let encoding_key = EncodingKey::from_base64_secret(secret.expose_secret())
            .map_err(|_| TicketError::InvalidSecret)?;
        let decoding_key = DecodingKey::from_base64_secret(secret.expose_secret())
            .map_err(|_| TicketError::InvalidSecret)?;

        Ok(Self {
            encoding_key,
            decoding_key,
            window,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn issue(
        &self,
        principal: &AuthPrincipal,
        now: DateTime<Utc>,
    ) -> Result<IssuedTicket, TicketError> {
        let expires_at = now + self.window;
        let claims = TicketClaims {
            sub: principal.account_id,
            name: principal.user_name.clone(),
            email: principal.email.clone(),
            roles: principal.roles.clone(),
            auth_method: principal.auth_method.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: TICKET_AUDIENCE.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(IssuedTicket { token, expires_at })
    }

    /// Check signature, audience and expiry against `now`.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<TicketCheck, TicketError> {
        if token.trim().is_empty() {
            return Err(TicketError::InvalidToken);
        }

        // Expiry is checked below against the caller's clock, not the system's.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_audience(&[TICKET_AUDIENCE]);
        validation.required_spec_claims = HashSet::from([
            "sub".to_string(),
            "exp".to_string(),
            "aud".to_string(),
        ]);

        let claims = decode::<TicketClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected authentication ticket");
                TicketError::InvalidToken
            })?
            .claims;

        let now_ts = now.timestamp();
        if now_ts >= claims.exp {
            return Err(TicketError::Expired);
        }

        let elapsed = now_ts - claims.iat;
        let renewed = if elapsed > self.window.num_seconds() / 2 {
            Some(self.issue(&claims.principal(), now)?)
        } else {
            None
        };

        Ok(TicketCheck { claims, renewed })
    }
}

#[cfg(test)]
mod tests {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use chrono::TimeZone;

    use super::*;

    fn service() -> TicketService {
        let secret = SecretString::from(STANDARD.encode([7u8; 32]));
        TicketService::new(&secret, Duration::minutes(60)).unwrap()
    }

    fn principal() -> AuthPrincipal {
        AuthPrincipal {
            account_id: Uuid::new_v4(),
            user_name: "google:abc123".to_string(),
            email: Some("x@y.com".to_string()),
            roles: vec!["Admin".to_string()],
            auth_method: AuthMethod::External("google".to_string()),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn fresh_ticket_validates_without_renewal() {
        let service = service();
        let principal = principal();
        let ticket = service.issue(&principal, t0()).unwrap();

        let check = service
            .validate(&ticket.token, t0() + Duration::minutes(10))
            .unwrap();
        assert_eq!(check.claims.principal(), principal);
        assert!(check.renewed.is_none());
        assert_eq!(ticket.expires_at, t0() + Duration::minutes(60));
    }

    #[test]
    fn ticket_is_renewed_at_59_minutes() {
        let service = service();
        let ticket = service.issue(&principal(), t0()).unwrap();
        let now = t0() + Duration::minutes(59);

        let check = service.validate(&ticket.token, now).unwrap();
        let renewed = check.renewed.expect("ticket should be renewed");
        assert_eq!(renewed.expires_at, now + Duration::minutes(60));

        // The renewed ticket carries the window forward.
        let later = service
            .validate(&renewed.token, t0() + Duration::minutes(100))
            .unwrap();
        assert_eq!(later.claims.sub, check.claims.sub);
    }

    #[test]
    fn ticket_is_rejected_at_61_minutes() {
        let service = service();
        let ticket = service.issue(&principal(), t0()).unwrap();

        let err = service
            .validate(&ticket.token, t0() + Duration::minutes(61))
            .unwrap_err();
        assert!(matches!(err, TicketError::Expired));
    }

    #[test]
    fn ticket_is_rejected_exactly_at_expiry() {
        let service = service();
        let ticket = service.issue(&principal(), t0()).unwrap();
        assert!(matches!(
            service.validate(&ticket.token, t0() + Duration::minutes(60)),
            Err(TicketError::Expired)
        ));
    }

    #[test]
    fn ticket_signed_with_another_key_is_invalid() {
        let other = TicketService::new(
            &SecretString::from(STANDARD.encode([9u8; 32])),
            Duration::minutes(60),
        )
        .unwrap();
        let ticket = other.issue(&principal(), t0()).unwrap();

        assert!(matches!(
            service().validate(&ticket.token, t0()),
            Err(TicketError::InvalidToken)
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            service().validate("not-a-jwt", t0()),
            Err(TicketError::InvalidToken)
        ));
        assert!(matches!(
            service().validate("", t0()),
            Err(TicketError::InvalidToken)
        ));
    }

    #[test]
    fn non_base64_secret_is_rejected() {
        let err = TicketService::new(&SecretString::from("not base64 !!"), Duration::minutes(60))
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidSecret));
    }

    #[test]
    fn role_check_is_case_insensitive() {
        assert!(principal().is_in_role("admin"));
        assert!(!principal().is_in_role("Auditor"));
    }
}
