//! Method + path resolution ahead of dispatch, so later stages know which
//! endpoint (and which access policy) a request is headed for.

use axum::http::Method;

use crate::context::Principal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    Anonymous,
    Authenticated,
    /// Signed in and holding at least one of these roles.
    Roles(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// No principal: send the caller to log in.
    Challenge,
    /// Principal present but not permitted.
    Forbid,
}

impl AccessPolicy {
    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessPolicy::Roles(roles.into_iter().map(Into::into).collect())
    }

    pub fn evaluate(&self, principal: Option<&Principal>) -> AccessDecision {
        match (self, principal) {
            (AccessPolicy::Anonymous, _) => AccessDecision::Allow,
            (_, None) => AccessDecision::Challenge,
            (AccessPolicy::Authenticated, Some(_)) => AccessDecision::Allow,
            (AccessPolicy::Roles(roles), Some(principal)) => {
                if roles.iter().any(|role| principal.is_in_role(role)) {
                    AccessDecision::Allow
                } else {
                    AccessDecision::Forbid
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    policy: AccessPolicy,
}

/// Attached to the request by the routing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Matched pattern, `None` when nothing matched.
    pub pattern: Option<String>,
    pub policy: AccessPolicy,
}

impl ResolvedRoute {
    pub fn unmatched() -> Self {
        Self {
            pattern: None,
            policy: AccessPolicy::Anonymous,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` (axum syntax, `{name}` for a parameter).
    pub fn route(mut self, method: Method, pattern: &str, policy: AccessPolicy) -> Self {
        let segments = split(pattern)
            .map(|s| {
                if s.starts_with('{') && s.ends_with('}') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        self.entries.push(RouteEntry {
            method,
            pattern: pattern.to_string(),
            segments,
            policy,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First registered entry whose method and path match. `HEAD` matches
    /// `GET` routes.
    pub fn resolve(&self, method: &Method, path: &str) -> ResolvedRoute {
        let parts: Vec<&str> = split(path).collect();

        self.entries
            .iter()
            .find(|entry| {
                let method_matches =
                    entry.method == method || (method == Method::HEAD && entry.method == Method::GET);
                method_matches
                    && entry.segments.len() == parts.len()
                    && entry.segments.iter().zip(&parts).all(|(seg, part)| match seg {
                        Segment::Literal(lit) => lit == part,
                        Segment::Param => true,
                    })
            })
            .map(|entry| ResolvedRoute {
                pattern: Some(entry.pattern.clone()),
                policy: entry.policy.clone(),
            })
            .unwrap_or_else(ResolvedRoute::unmatched)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use db::models::IdentityAccount;
    use services::services::ticket::AuthMethod;
    use uuid::Uuid;

    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        let now = Utc::now();
        Principal {
            account: IdentityAccount {
                id: Uuid::new_v4(),
                user_name: "alice".into(),
                display_name: None,
                email: None,
                password_hash: None,
                created_at: now,
                updated_at: now,
            },
            roles: roles.iter().map(|r| r.to_string()).collect(),
            auth_method: AuthMethod::Password,
        }
    }

    fn table() -> RouteTable {
        RouteTable::new()
            .route(Method::GET, "/", AccessPolicy::Anonymous)
            .route(Method::GET, "/Account/Me", AccessPolicy::Authenticated)
            .route(Method::DELETE, "/Account/Logins/{provider}", AccessPolicy::Authenticated)
            .route(Method::GET, "/Admin/Accounts/{id}", AccessPolicy::roles(["Admin"]))
    }

    #[test]
    fn resolves_literals_and_params() {
        let table = table();
        assert_eq!(table.len(), 4);

        let root = table.resolve(&Method::GET, "/");
        assert_eq!(root.pattern.as_deref(), Some("/"));

        let admin = table.resolve(&Method::GET, "/Admin/Accounts/42");
        assert_eq!(admin.pattern.as_deref(), Some("/Admin/Accounts/{id}"));
        assert_eq!(admin.policy, AccessPolicy::roles(["Admin"]));

        let unlink = table.resolve(&Method::DELETE, "/Account/Logins/google");
        assert_eq!(unlink.policy, AccessPolicy::Authenticated);
    }

    #[test]
    fn method_must_match_except_head() {
        let table = table();
        assert_eq!(
            table.resolve(&Method::POST, "/Account/Me"),
            ResolvedRoute::unmatched()
        );
        assert_eq!(
            table.resolve(&Method::HEAD, "/Account/Me").policy,
            AccessPolicy::Authenticated
        );
    }

    #[test]
    fn unmatched_paths_are_anonymous() {
        let table = table();
        assert_eq!(table.resolve(&Method::GET, "/nope"), ResolvedRoute::unmatched());
        assert_eq!(
            table.resolve(&Method::GET, "/Admin/Accounts"),
            ResolvedRoute::unmatched()
        );
        assert_eq!(
            table.resolve(&Method::GET, "/Admin/Accounts/1/extra"),
            ResolvedRoute::unmatched()
        );
    }

    #[test]
    fn policy_decisions() {
        let user = principal(&[]);
        let admin = principal(&["admin"]);

        assert_eq!(AccessPolicy::Anonymous.evaluate(None), AccessDecision::Allow);
        assert_eq!(
            AccessPolicy::Authenticated.evaluate(None),
            AccessDecision::Challenge
        );
        assert_eq!(
            AccessPolicy::Authenticated.evaluate(Some(&user)),
            AccessDecision::Allow
        );

        let admins = AccessPolicy::roles(["Admin"]);
        assert_eq!(admins.evaluate(None), AccessDecision::Challenge);
        assert_eq!(admins.evaluate(Some(&user)), AccessDecision::Forbid);
        assert_eq!(admins.evaluate(Some(&admin)), AccessDecision::Allow);
    }
}
