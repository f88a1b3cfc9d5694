use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error_response;

/// Shared-secret settings for the trigger endpoints.
///
/// An unset secret rejects every request on the surface it guards.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub cron_secret: Option<String>,
    pub admin_token: Option<String>,
    /// Header set by the hosting platform's scheduler. Its presence is
    /// accepted in place of the cron secret.
    pub trusted_scheduler_header: Option<HeaderName>,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let trusted_scheduler_header = non_empty("DEALCRAWL_TRUSTED_SCHEDULER_HEADER").and_then(|raw| {
            match HeaderName::try_from(raw.to_ascii_lowercase()) {
                Ok(name) => Some(name),
                Err(err) => {
                    warn!(header = %raw, error = %err, "ignoring invalid trusted scheduler header");
                    None
                }
            }
        });

        let config = Self {
            cron_secret: non_empty("CRON_SECRET"),
            admin_token: non_empty("DEALCRAWL_ADMIN_TOKEN"),
            trusted_scheduler_header,
        };
        if config.cron_secret.is_none() && config.trusted_scheduler_header.is_none() {
            warn!("CRON_SECRET not set; cron endpoints will reject every request");
        }
        if config.admin_token.is_none() {
            warn!("DEALCRAWL_ADMIN_TOKEN not set; admin endpoints will reject every request");
        }
        config
    }

    fn allows_cron(&self, headers: &HeaderMap) -> bool {
        if let Some(name) = &self.trusted_scheduler_header {
            if headers.contains_key(name) {
                return true;
            }
        }
        bearer_matches(headers, self.cron_secret.as_deref())
    }

    fn allows_admin(&self, headers: &HeaderMap) -> bool {
        bearer_matches(headers, self.admin_token.as_deref())
    }
}

fn bearer_matches(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let (Some(expected), Some(token)) = (expected, extract_bearer_token(headers)) else {
        return false;
    };
    token.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub async fn require_cron_auth(
    State(auth): State<Arc<AuthConfig>>,
    req: Request,
    next: Next,
) -> Response {
    if auth.allows_cron(req.headers()) {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid cron secret")
    }
}

pub async fn require_admin_auth(
    State(auth): State<Arc<AuthConfig>>,
    req: Request,
    next: Next,
) -> Response {
    if auth.allows_admin(req.headers()) {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token")
    }
}
