//! Bearer-token authentication
//!
//! Callers sign in with Google in the browser and send either the ID token
//! (a JWT) or an OAuth access token. Both resolve to an [`AuthUser`] whose
//! lowercased email is the only identity the rest of the backend uses.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{extract::State, middleware::Next, response::Response};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Longest a successful verification is reused
pub const MAX_CACHE_AGE: Duration = Duration::from_secs(5 * 60);

/// Identity attached to an authenticated request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthUser {
    /// Always lowercase
    pub email: String,
    pub sub: String,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("token verification failed: {0}")]
    Rejected(String),

    #[error("token was issued for another client")]
    AudienceMismatch,

    #[error("token is missing the email claim")]
    MissingEmail,

    #[error("identity provider unreachable: {0}")]
    Http(#[from] reqwest::Error),
}

/// Turns a bearer token into a user
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError>;
}

/// Claims returned by the token-info endpoint for an ID token
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    aud: String,
    #[serde(default)]
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
    /// Seconds since the epoch, sent as a string
    #[serde(default, deserialize_with = "seconds")]
    exp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    id: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

fn seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.parse().ok(),
        None => None,
    })
}

/// Three dot-separated parts: an ID token rather than an access token
pub fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3
}

/// Verifies tokens against Google's token-info and userinfo endpoints
pub struct GoogleTokenVerifier {
    http: Client,
    client_id: String,
    tokeninfo_url: String,
    userinfo_url: String,
    verified: RwLock<HashMap<String, (AuthUser, Instant)>>,
}

impl GoogleTokenVerifier {
    pub fn new(http: Client, client_id: impl Into<String>) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            tokeninfo_url: TOKENINFO_URL.to_string(),
            userinfo_url: USERINFO_URL.to_string(),
            verified: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_endpoints(mut self, tokeninfo_url: &str, userinfo_url: &str) -> Self {
        self.tokeninfo_url = tokeninfo_url.to_string();
        self.userinfo_url = userinfo_url.to_string();
        self
    }

    fn cached(&self, token: &str) -> Option<AuthUser> {
        let verified = self.verified.read().ok()?;
        let (user, expires) = verified.get(token)?;
        (Instant::now() < *expires).then(|| user.clone())
    }

    fn remember(&self, token: &str, user: &AuthUser, ttl: Duration) {
        if let Ok(mut verified) = self.verified.write() {
            let now = Instant::now();
            verified.retain(|_, (_, expires)| *expires > now);
            verified.insert(token.to_string(), (user.clone(), now + ttl.min(MAX_CACHE_AGE)));
        }
    }

    async fn verify_id_token(&self, token: &str) -> Result<(AuthUser, Duration), AuthError> {
        info!("[Auth] Verifying JWT ID token...");
        let response = self
            .http
            .get(&self.tokeninfo_url)
            .query(&[("id_token", token)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected(format!(
                "ID token rejected with status {}",
                response.status()
            )));
        }
        let claims: IdTokenClaims = response.json().await?;
        if self.client_id.is_empty() || claims.aud != self.client_id {
            return Err(AuthError::AudienceMismatch);
        }
        let email = claims.email.ok_or(AuthError::MissingEmail)?;

        let ttl = claims
            .exp
            .map(|exp| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Duration::from_secs(exp.saturating_sub(now))
            })
            .unwrap_or(MAX_CACHE_AGE);

        let user = AuthUser {
            email: email.to_lowercase(),
            sub: claims.sub,
            name: claims.name,
            picture: claims.picture,
        };
        info!("[Auth] JWT token verified for user: {}", user.email);
        Ok((user, ttl))
    }

    async fn verify_access_token(&self, token: &str) -> Result<(AuthUser, Duration), AuthError> {
        info!("[Auth] Verifying OAuth access token...");
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected(format!(
                "OAuth token verification failed: {}",
                response.status()
            )));
        }
        let info: UserInfo = response.json().await?;
        let email = info.email.ok_or(AuthError::MissingEmail)?;
        let user = AuthUser {
            email: email.to_lowercase(),
            sub: info.id,
            name: info.name,
            picture: info.picture,
        };
        info!("[Auth] OAuth token verified for user: {}", user.email);
        Ok((user, MAX_CACHE_AGE))
    }
}

#[async_trait]
impl TokenVerifier for GoogleTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if let Some(user) = self.cached(token) {
            return Ok(user);
        }

        let (user, ttl) = if looks_like_jwt(token) {
            self.verify_id_token(token).await?
        } else {
            self.verify_access_token(token).await?
        };
        self.remember(token, &user, ttl);
        Ok(user)
    }
}

/// What the auth middleware needs from the application state
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
    /// Lowercased; empty disables every admin endpoint
    pub admin_email: String,
}

/// Raw bearer token of the request, stored next to the [`AuthUser`]
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

async fn authenticate(
    auth: &AuthState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<(AuthUser, BearerToken), AppError> {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return Err(AppError::Unauthorized("Missing authorization token".to_string()));
    };
    let token = bearer.token().to_string();
    match auth.verifier.verify(&token).await {
        Ok(user) => Ok((user, BearerToken(token))),
        Err(err) => {
            warn!("[Auth] {}", err);
            Err(AppError::Unauthorized("Invalid or expired token".to_string()))
        }
    }
}

/// Middleware for routes any signed-in user may call
///
/// # Arguments
/// * `auth` - Verifier and admin address
/// * `bearer` - The `Authorization: Bearer` header, if any
/// * `request` - The incoming request
/// * `next` - Next middleware in the chain
///
/// # Returns
/// * `Result<Response, AppError>` - The downstream response, or 401
pub async fn require_user(
    State(auth): State<AuthState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let (user, token) = authenticate(&auth, bearer).await?;
    request.extensions_mut().insert(user);
    request.extensions_mut().insert(token);
    Ok(next.run(request).await)
}

/// Middleware for admin-only routes: 401 without a valid token, 403 for
/// anyone but the configured admin
pub async fn require_admin(
    State(auth): State<AuthState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let (user, token) = authenticate(&auth, bearer).await?;
    if auth.admin_email.is_empty() || !user.email.eq_ignore_ascii_case(&auth.admin_email) {
        warn!("[Auth] Admin access refused for {}", user.email);
        return Err(AppError::Forbidden("Forbidden".to_string()));
    }
    request.extensions_mut().insert(user);
    request.extensions_mut().insert(token);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn distinguishes_id_tokens() {
        assert!(looks_like_jwt("aaa.bbb.ccc"));
        assert!(!looks_like_jwt("ya29.a0AfH6SM"));
        assert!(!looks_like_jwt("opaque"));
    }

    #[test]
    fn expiry_claim_accepts_strings_and_numbers() {
        let claims: IdTokenClaims =
            serde_json::from_value(json!({"aud": "c", "sub": "1", "exp": "1700000000"})).unwrap();
        assert_eq!(claims.exp, Some(1_700_000_000));
        let claims: IdTokenClaims = serde_json::from_value(json!({"exp": 42})).unwrap();
        assert_eq!(claims.exp, Some(42));
        let claims: IdTokenClaims = serde_json::from_value(json!({})).unwrap();
        assert_eq!(claims.exp, None);
    }

    #[tokio::test]
    async fn cached_users_skip_the_network() {
        // endpoints are unroutable; only a cache hit can succeed
        let verifier = GoogleTokenVerifier::new(Client::new(), "client")
            .with_endpoints("http://127.0.0.1:9/tokeninfo", "http://127.0.0.1:9/userinfo");
        let user = AuthUser {
            email: "a@x.io".to_string(),
            sub: "1".to_string(),
            name: None,
            picture: None,
        };
        verifier.remember("tok", &user, Duration::from_secs(60));
        assert_eq!(verifier.verify("tok").await.unwrap(), user);

        verifier.remember("stale", &user, Duration::ZERO);
        assert!(verifier.verify("stale").await.is_err());
    }

    #[tokio::test]
    async fn empty_tokens_are_rejected() {
        let verifier = GoogleTokenVerifier::new(Client::new(), "client");
        assert!(matches!(verifier.verify("").await, Err(AuthError::MissingToken)));
    }
}
