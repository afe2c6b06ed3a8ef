#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use portfolio::app::{AppState, UserDriveFactory, router};
use portfolio::drive::Drive;
use portfolio::layout::{PortfolioStore, StorageLayout};
use portfolio::login::{AuthError, AuthState, AuthUser, TokenVerifier};
use portfolio::memory::MemoryDrive;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

pub const ORIGIN: &str = "https://someone.github.io/portfolio/";
pub const ADMIN: &str = "admin@school.edu";

/// Accepts a fixed set of tokens, each mapped to an email
pub struct StubVerifier {
    users: HashMap<String, String>,
}

impl StubVerifier {
    pub fn new(users: &[(&str, &str)]) -> Self {
        StubVerifier {
            users: users
                .iter()
                .map(|(token, email)| (token.to_string(), email.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StubVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let email = self
            .users
            .get(token)
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))?;
        Ok(AuthUser {
            email: email.to_lowercase(),
            sub: token.to_string(),
            name: None,
            picture: None,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub drive: Arc<MemoryDrive>,
    pub app_data: Arc<MemoryDrive>,
    pub store: Arc<PortfolioStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_drive(MemoryDrive::new())
    }

    pub fn with_drive(drive: MemoryDrive) -> Self {
        let drive = Arc::new(drive);
        let app_data = Arc::new(MemoryDrive::new());
        let store = Arc::new(PortfolioStore::new(drive.clone(), StorageLayout::default()));

        let user_space: Arc<dyn Drive> = app_data.clone();
        let user_drive: UserDriveFactory = Arc::new(move |_token: &str| user_space.clone());
        let state = AppState {
            store: store.clone(),
            auth: AuthState {
                verifier: Arc::new(StubVerifier::new(&[
                    ("alice-token", "Alice@School.edu"),
                    ("bob-token", "bob@school.edu"),
                    ("admin-token", ADMIN),
                ])),
                admin_email: ADMIN.to_string(),
            },
            user_drive,
            origin: Arc::from(ORIGIN),
        };

        TestApp {
            router: router(state),
            drive,
            app_data,
            store,
        }
    }

    /// Send a request and decode the JSON body (`Null` when empty)
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.send(request("GET", uri, token, None)).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.send(request("POST", uri, token, Some(body))).await
    }

    pub async fn delete(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.send(request("DELETE", uri, token, None)).await
    }

    pub async fn save(&self, token: &str, filename: &str, portfolio: Value) -> (StatusCode, Value) {
        self.post(
            "/api/save",
            Some(token),
            json!({
                "email": "student@school.edu",
                "filename": filename,
                "portfolio": portfolio,
            }),
        )
        .await
    }
}

pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn sample_portfolio(name: &str, roll: &str) -> Value {
    json!({
        "personalInfo": {
            "name": name,
            "rollNo": roll,
            "email": "student@school.edu"
        },
        "achievements": [
            {"id": "a1", "title": "Science fair", "category": "academic", "date": "2024-03-01"}
        ],
        "reflections": [
            {"id": "r1", "title": "Looking back", "linkedAchievement": "a1"}
        ],
        "profilePhoto": null
    })
}
