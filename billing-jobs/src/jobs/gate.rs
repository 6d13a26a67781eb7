//! Job scheduler gate.
//!
//! Every job endpoint requires either the shared cron secret or a session
//! token carrying a privileged role. With neither configured the gate fails
//! closed.

use crate::config::BillingJobsConfig;
use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::utils::signature::constant_time_eq;
use std::sync::Arc;
use uuid::Uuid;

/// Who invoked a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// The external scheduler presenting the cron secret.
    Scheduler,
    /// A signed-in operator with a privileged role.
    Operator {
        subject: String,
        company_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    MissingCredential,
    InvalidCredential,
    Misconfigured(String),
}

impl GateRejection {
    pub fn reason(&self) -> String {
        match self {
            GateRejection::MissingCredential => "missing bearer credential".to_string(),
            GateRejection::InvalidCredential => "invalid credential".to_string(),
            GateRejection::Misconfigured(msg) => msg.clone(),
        }
    }
}

impl From<GateRejection> for AppError {
    fn from(rejection: GateRejection) -> Self {
        match rejection {
            GateRejection::Misconfigured(msg) => AppError::ServiceUnavailable(msg),
            other => AppError::Unauthorized(anyhow::anyhow!(other.reason())),
        }
    }
}

/// Decision in the `{ authorized, reason }` shape reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobAuthorization {
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    role: String,
    #[serde(default)]
    company_id: Option<Uuid>,
    #[allow(dead_code)]
    exp: i64,
}

struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
    privileged_roles: Vec<String>,
}

pub struct CronGate {
    secret: Option<Secret<String>>,
    session: Option<SessionVerifier>,
    production: bool,
}

impl CronGate {
    pub fn new(
        secret: Option<Secret<String>>,
        session_secret: Option<Secret<String>>,
        privileged_roles: Vec<String>,
        production: bool,
    ) -> Self {
        let secret = secret.filter(|s| !s.expose_secret().trim().is_empty());
        let session = session_secret
            .filter(|s| !s.expose_secret().trim().is_empty())
            .map(|s| SessionVerifier {
                key: DecodingKey::from_secret(s.expose_secret().as_bytes()),
                validation: Validation::new(Algorithm::HS256),
                privileged_roles,
            });
        Self {
            secret,
            session,
            production,
        }
    }

    pub fn from_config(config: &BillingJobsConfig) -> Self {
        Self::new(
            config.cron.secret.clone(),
            config.cron.session_jwt_secret.clone(),
            config.cron.privileged_roles.clone(),
            config.is_production(),
        )
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Principal, GateRejection> {
        if self.secret.is_none() && (self.production || self.session.is_none()) {
            return Err(GateRejection::Misconfigured(
                "cron secret is not configured".to_string(),
            ));
        }

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GateRejection::MissingCredential)?;

        if let Some(secret) = &self.secret {
            if constant_time_eq(secret.expose_secret().as_bytes(), token.as_bytes()) {
                return Ok(Principal::Scheduler);
            }
        }

        if let Some(session) = &self.session {
            if let Ok(data) = decode::<SessionClaims>(token, &session.key, &session.validation) {
                let claims = data.claims;
                if session.privileged_roles.iter().any(|r| r == &claims.role) {
                    return Ok(Principal::Operator {
                        subject: claims.sub,
                        company_id: claims.company_id,
                    });
                }
                tracing::warn!(subject = %claims.sub, role = %claims.role, "Session lacks a privileged role");
            }
        }

        Err(GateRejection::InvalidCredential)
    }

    pub fn authorize_job(&self, headers: &HeaderMap) -> JobAuthorization {
        match self.authorize(headers) {
            Ok(_) => JobAuthorization {
                authorized: true,
                reason: None,
            },
            Err(rejection) => JobAuthorization {
                authorized: false,
                reason: Some(rejection.reason()),
            },
        }
    }
}

/// Extractor for gated endpoints. Rejects with 401 or 503.
#[derive(Debug, Clone)]
pub struct CronCaller(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CronCaller
where
    S: Send + Sync,
    Arc<CronGate>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gate = Arc::<CronGate>::from_ref(state);
        match gate.authorize(&parts.headers) {
            Ok(principal) => Ok(CronCaller(principal)),
            Err(rejection) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    reason = %rejection.reason(),
                    "Job request rejected"
                );
                Err(rejection.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn gate(secret: Option<&str>, session: Option<&str>, production: bool) -> CronGate {
        CronGate::new(
            secret.map(|s| Secret::new(s.to_string())),
            session.map(|s| Secret::new(s.to_string())),
            vec!["billing_admin".to_string()],
            production,
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    fn session_token(secret: &str, role: &str) -> String {
        let exp = chrono::Utc::now().timestamp() + 600;
        encode(
            &Header::default(),
            &json!({"sub": "ops-1", "role": role, "exp": exp}),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn cron_secret_authorizes_scheduler() {
        let gate = gate(Some("s3cret"), None, true);
        assert_eq!(gate.authorize(&bearer("s3cret")), Ok(Principal::Scheduler));
    }

    #[test]
    fn wrong_or_missing_credential_is_rejected() {
        let gate = gate(Some("s3cret"), None, true);
        assert_eq!(
            gate.authorize(&bearer("nope")),
            Err(GateRejection::InvalidCredential)
        );
        assert_eq!(
            gate.authorize(&HeaderMap::new()),
            Err(GateRejection::MissingCredential)
        );
    }

    #[test]
    fn production_without_secret_fails_closed() {
        let gate = gate(None, Some("jwt"), true);
        assert!(matches!(
            gate.authorize(&bearer("anything")),
            Err(GateRejection::Misconfigured(_))
        ));
    }

    #[test]
    fn nothing_configured_is_never_open() {
        let gate = gate(None, None, false);
        let decision = gate.authorize_job(&bearer("anything"));
        assert!(!decision.authorized);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn privileged_session_is_an_operator() {
        let gate = gate(Some("s3cret"), Some("jwt-secret"), false);
        let token = session_token("jwt-secret", "billing_admin");
        assert!(matches!(
            gate.authorize(&bearer(&token)),
            Ok(Principal::Operator { ref subject, .. }) if subject == "ops-1"
        ));
    }

    #[test]
    fn unprivileged_session_is_rejected() {
        let gate = gate(Some("s3cret"), Some("jwt-secret"), false);
        let token = session_token("jwt-secret", "viewer");
        assert_eq!(
            gate.authorize(&bearer(&token)),
            Err(GateRejection::InvalidCredential)
        );
    }

    #[test]
    fn rejections_map_to_http_status() {
        let err: AppError = GateRejection::MissingCredential.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
        let err: AppError = GateRejection::Misconfigured("x".to_string()).into();
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
