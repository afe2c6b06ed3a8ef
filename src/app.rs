use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::Config;
use crate::downloader::{PortfolioSelector, user_drive_portfolio};
use crate::drive::Drive;
use crate::error::AppError;
use crate::google::{GoogleDrive, http_client};
use crate::layout::{PortfolioStore, timestamp};
use crate::login::{AuthState, AuthUser, BearerToken, GoogleTokenVerifier, require_admin, require_user};
use crate::memory::MemoryDrive;
use crate::saving::SaveRequest;

/// Largest accepted request body
pub const BODY_LIMIT: usize = 5 * 1024 * 1024;

const SERVICE_NAME: &str = "Portfolio Backend";

const ENDPOINTS: [&str; 10] = [
    "/healthz",
    "/api/list",
    "/api/save",
    "/api/download",
    "/api/user-portfolios",
    "/api/user-portfolio",
    "/api/user-drive-portfolio",
    "/api/storage-status",
    "/api/cleanup-temp-files",
    "/api/generate-manifest",
];

/// Opens a storage client acting as the caller, from their access token
pub type UserDriveFactory = Arc<dyn Fn(&str) -> Arc<dyn Drive> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PortfolioStore>,
    pub auth: AuthState,
    pub user_drive: UserDriveFactory,
    /// Browser origin allowed by CORS
    pub origin: Arc<str>,
}

#[derive(Deserialize)]
struct PortfolioQuery {
    id: Option<String>,
    filename: Option<String>,
}

#[derive(Deserialize)]
struct DownloadQuery {
    id: Option<String>,
}

/// Wire the production state from configuration
///
/// With `in_memory` both the service store and every user's app-data space
/// live in process and nothing reaches the storage provider.
pub fn build_state(config: &Config, in_memory: bool) -> Result<AppState, reqwest::Error> {
    let http = http_client()?;

    let (drive, user_drive): (Arc<dyn Drive>, UserDriveFactory) = if in_memory {
        let app_data: Arc<dyn Drive> = Arc::new(MemoryDrive::new());
        (
            Arc::new(MemoryDrive::new()),
            Arc::new(move |_token: &str| app_data.clone()),
        )
    } else {
        let user_http = http.clone();
        (
            Arc::new(GoogleDrive::service_account(
                http.clone(),
                config.drive_access_token.clone(),
            )),
            Arc::new(move |token: &str| -> Arc<dyn Drive> {
                Arc::new(GoogleDrive::for_user(user_http.clone(), token))
            }),
        )
    };

    let store = PortfolioStore::new(drive, config.layout()).with_temp_max_age(config.cleanup_max_age());
    Ok(AppState {
        store: Arc::new(store),
        auth: AuthState {
            verifier: Arc::new(GoogleTokenVerifier::new(http, config.google_client_id.clone())),
            admin_email: config.admin_email(),
        },
        user_drive,
        origin: Arc::from(config.origin.as_str()),
    })
}

/// Whether a browser origin may call the API
///
/// An exact match always passes. When the configured origin is a page on
/// `github.io`, the bare host is accepted too.
pub fn origin_allowed(configured: &str, origin: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    if origin == configured {
        return true;
    }
    if let Some(rest) = configured.strip_prefix("https://") {
        if configured.contains("github.io") {
            let host = rest.split('/').next().unwrap_or(rest);
            return origin == format!("https://{}", host);
        }
    }
    false
}

fn cors(origin: Arc<str>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |value: &HeaderValue, _| {
            value
                .to_str()
                .map(|v| origin_allowed(&origin, v))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/api/save", post(save_portfolio))
        .route("/api/user-portfolios", get(list_user_portfolios))
        .route("/api/user-portfolio", get(get_user_portfolio))
        .route("/api/user-portfolio/:id", delete(delete_user_portfolio))
        .route("/api/user-drive-portfolio", get(get_user_drive_portfolio))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_user));

    let admin_routes = Router::new()
        .route("/api/list", get(list_all_portfolios))
        .route("/api/download", get(download_portfolio))
        .route("/api/generate-manifest", post(generate_manifest))
        .route("/api/cleanup-temp-files", post(cleanup_temp_files))
        .route("/api/storage-status", get(storage_status))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_admin));

    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/api/run-json2excel", post(run_json2excel))
        .merge(user_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(middleware::from_fn_with_state(state.origin.clone(), reject_foreign_origin))
        .layer(middleware::from_fn(log_requests))
        .layer(cors(state.origin.clone()))
        .with_state(state)
}

/// Start the server and block until shutdown
pub async fn run(config: Config, in_memory: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.warn_missing();
    if in_memory {
        info!("Using in-memory storage; nothing will be persisted");
    }

    let state = build_state(&config, in_memory)?;
    let app = router(state);

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Portfolio backend listening on {}", address);
    info!(
        "Configured folders: temp=\"{}\", final=\"{}\"",
        config.temp_folder_name, config.final_folder_name
    );
    info!("Parent folder ID: {}", config.drive_parent_folder_id);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", err);
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} {} {}ms",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Refuse browser requests from origins CORS would not allow
async fn reject_foreign_origin(
    State(configured): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .map(|v| v.to_str().unwrap_or_default().to_string());
    match origin {
        Some(origin) if !origin_allowed(&configured, &origin) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Not allowed by CORS" })),
        )
            .into_response(),
        _ => next.run(request).await,
    }
}

async fn service_info() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": ENDPOINTS,
        "features": ["multi-user-support", "two-tier-storage", "user-isolation"],
    }))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn run_json2excel() -> AppError {
    AppError::NotImplemented
}

async fn save_portfolio(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Response {
    info!("[Save] Processing save request...");
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                rejection.status(),
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };
    let input = match request.into_input() {
        Ok(input) => input,
        Err(err) => return AppError::BadRequest(err.to_string()).into_response(),
    };

    match state.store.save_portfolio(&user.email, &input).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "fileId": outcome.file_id,
            "message": "Portfolio saved successfully",
            "filename": format!("{}.json", input.filename),
        }))
        .into_response(),
        Err(err) => AppError::from(err).save_failure(),
    }
}

async fn list_user_portfolios(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let portfolios = state.store.list_user_portfolios(&user.email).await?;
    Ok(Json(json!({
        "success": true,
        "portfolios": portfolios,
        "userEmail": user.email,
    })))
}

async fn get_user_portfolio(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PortfolioQuery>,
) -> Result<impl IntoResponse, AppError> {
    let selector = PortfolioSelector::from_query(query.id, query.filename);
    let document = state.store.find_user_portfolio(&user.email, &selector).await?;
    Ok(Json(document))
}

async fn delete_user_portfolio(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.store.delete_user_portfolio(&user.email, &id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Portfolio deleted successfully",
    })))
}

async fn get_user_drive_portfolio(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(BearerToken(token)): Extension<BearerToken>,
) -> Result<impl IntoResponse, AppError> {
    info!("[user-portfolio] Loading portfolio for user: {}", user.email);
    let drive = (state.user_drive)(&token);
    let document = user_drive_portfolio(drive.as_ref()).await?;
    Ok(Json(document))
}

async fn list_all_portfolios(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.list_all_portfolios().await?))
}

async fn download_portfolio(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, AppError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing id".to_string()))?;
    let bytes = state.store.download(&id).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes))
}

async fn generate_manifest(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    info!("[manifest] Admin authenticated - generating manifest");
    let manifest = state.store.generate_manifest().await?;
    Ok(Json(json!({
        "success": true,
        "count": manifest.len(),
        "manifest": manifest,
        "generatedAt": timestamp(Utc::now()),
    })))
}

async fn cleanup_temp_files(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let store = &state.store;
    let report = store
        .cleanup_old_temp_files(store.temp_max_age(), false)
        .await?;
    let mut body = json!({
        "success": true,
        "message": format!("Cleaned up {} old temporary files", report.cleaned_count),
        "cleanedCount": report.cleaned_count,
    });
    if !report.errors.is_empty() {
        body["errors"] = json!(report.errors);
    }
    Ok(Json(body))
}

async fn storage_status(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.storage_status().await?))
}
