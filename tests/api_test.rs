mod common;

use axum::http::{StatusCode, header};
use common::{ORIGIN, TestApp, request, sample_portfolio};
use portfolio::drive::{FileFilter, NewFile};
use portfolio::memory::MemoryDrive;
use serde_json::json;

#[tokio::test]
async fn service_info_is_public() {
    let app = TestApp::new();
    let (status, body) = app.get("/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert!(
        body["features"]
            .as_array()
            .unwrap()
            .contains(&json!("two-tier-storage"))
    );

    let (status, body) = app.get("/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn spreadsheet_export_is_not_implemented() {
    let app = TestApp::new();
    let (status, _) = app.post("/api/run-json2excel", None, json!({})).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn user_routes_need_a_valid_token() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/user-portfolios", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Missing authorization token");

    let (status, body) = app.get("/api/user-portfolios", Some("forged")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid or expired token");
}

#[tokio::test]
async fn admin_routes_refuse_other_users() {
    let app = TestApp::new();
    let (status, _) = app.get("/api/list", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.get("/api/list", Some("alice-token")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Forbidden");

    let (status, body) = app.get("/api/list", Some("admin-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn save_rejects_incomplete_requests() {
    let app = TestApp::new();
    let (status, body) = app
        .post("/api/save", Some("alice-token"), json!({"filename": "p"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Missing required fields: email, filename, or portfolio data"
    );

    let (status, body) = app
        .post(
            "/api/save",
            Some("alice-token"),
            json!({"email": "not-an-email", "filename": "p", "portfolio": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid email format or portfolio data");
    assert_eq!(app.drive.file_count(), 0);
}

#[tokio::test]
async fn save_then_read_back() {
    let app = TestApp::new();
    let (status, body) = app
        .save("alice-token", "my-portfolio", sample_portfolio("Alice Smith", "12-R52"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Portfolio saved successfully");
    assert_eq!(body["filename"], "my-portfolio.json");
    let file_id = body["fileId"].as_str().unwrap().to_string();

    let (status, body) = app.get("/api/user-portfolios", Some("alice-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userEmail"], "alice@school.edu");
    let portfolios = body["portfolios"].as_array().unwrap();
    assert_eq!(portfolios.len(), 1);
    assert_eq!(portfolios[0]["id"], file_id.as_str());
    assert_eq!(portfolios[0]["filename"], "my-portfolio");
    assert_eq!(portfolios[0]["roll"], "12-R52");
    assert_eq!(portfolios[0]["version"], "1.0");

    let (status, body) = app
        .get(&format!("/api/user-portfolio?id={}", file_id), Some("alice-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["personalInfo"]["name"], "Alice Smith");

    let (status, body) = app
        .get("/api/user-portfolio?filename=my-portfolio", Some("alice-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["achievements"][0]["title"], "Science fair");

    let (status, body) = app.get("/api/user-portfolio", Some("alice-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["personalInfo"]["rollNo"], "12-R52");
}

#[tokio::test]
async fn saving_twice_updates_one_file() {
    let app = TestApp::new();
    let (_, first) = app
        .save("alice-token", "p", sample_portfolio("Alice Smith", "12-R52"))
        .await;
    let (status, second) = app
        .save("alice-token", "p", sample_portfolio("Alice B. Smith", "12-R52"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["fileId"], second["fileId"]);

    let (_, body) = app.get("/api/user-portfolios", Some("alice-token")).await;
    let portfolios = body["portfolios"].as_array().unwrap();
    assert_eq!(portfolios.len(), 1);
    assert_eq!(portfolios[0]["version"], "1.1");

    let (_, body) = app.get("/api/user-portfolio", Some("alice-token")).await;
    assert_eq!(body["personalInfo"]["name"], "Alice B. Smith");
}

#[tokio::test]
async fn invalid_portfolios_leave_nothing_behind() {
    let app = TestApp::new();
    let (status, body) = app
        .save("alice-token", "p", json!({"achievements": [], "reflections": []}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Portfolio validation failed: Validation failed: hasPersonalInfo"
    );
    assert!(app.drive.snapshot(&FileFilter::anywhere().json()).is_empty());

    let (status, body) = app
        .save("alice-token", "p", sample_portfolio("Alice", "not a roll"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Portfolio validation failed: Invalid roll number format"
    );

    let (status, body) = app
        .post(
            "/api/save",
            Some("alice-token"),
            json!({
                "email": "student@school.edu",
                "filename": "p",
                "roll": "../evil",
                "portfolio": sample_portfolio("Alice", ""),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Portfolio validation failed: Invalid roll number format"
    );
    assert!(app.drive.snapshot(&FileFilter::anywhere().json()).is_empty());
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let app = TestApp::new();
    let mut portfolio = sample_portfolio("Alice", "12-R52");
    portfolio["personalInfo"]["bio"] = json!("x".repeat(6 * 1024 * 1024));
    let (status, _) = app.save("alice-token", "p", portfolio).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.drive.file_count(), 0);
}

#[tokio::test]
async fn full_storage_reports_insufficient_storage() {
    let app = TestApp::with_drive(MemoryDrive::with_quota(16));
    let (status, body) = app
        .save("alice-token", "p", sample_portfolio("Alice", "12-R52"))
        .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(
        body["error"],
        "Storage temporarily full. Please contact the administrator."
    );
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn users_only_see_their_own_portfolios() {
    let app = TestApp::new();
    let (_, body) = app
        .save("alice-token", "p", sample_portfolio("Alice", "12-R52"))
        .await;
    let alice_file = body["fileId"].as_str().unwrap().to_string();

    let (_, body) = app.get("/api/user-portfolios", Some("bob-token")).await;
    assert_eq!(body["portfolios"], json!([]));

    let (status, body) = app
        .get(&format!("/api/user-portfolio?id={}", alice_file), Some("bob-token"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "Access denied: This portfolio belongs to another user"
    );

    let (status, _) = app
        .delete(&format!("/api/user-portfolio/{}", alice_file), Some("bob-token"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.get("/api/user-portfolio", Some("bob-token")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No portfolio found");
    assert!(body["suggestion"].is_string());
}

#[tokio::test]
async fn owners_can_delete_their_portfolios() {
    let app = TestApp::new();
    let (_, body) = app
        .save("alice-token", "p", sample_portfolio("Alice", "12-R52"))
        .await;
    let file_id = body["fileId"].as_str().unwrap().to_string();

    let (status, body) = app
        .delete(&format!("/api/user-portfolio/{}", file_id), Some("alice-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = app
        .get(&format!("/api/user-portfolio?id={}", file_id), Some("alice-token"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Portfolio not found or access denied");

    let (status, _) = app
        .delete("/api/user-portfolio/missing", Some("alice-token"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_sees_every_portfolio() {
    let app = TestApp::new();
    app.save("alice-token", "alice-smith-12-R52", sample_portfolio("Alice Smith", "12-R52"))
        .await;
    app.save("bob-token", "bob-jones-3-R50", sample_portfolio("Bob Jones", "3-R50"))
        .await;

    let (status, body) = app.get("/api/list", Some("admin-token")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    let alice = items
        .iter()
        .find(|item| item["email"] == "alice@school.edu")
        .unwrap();
    assert_eq!(alice["userFolder"], "user_alice_school_edu");
    assert_eq!(alice["file"], "alice-smith-12-R52");
    assert_eq!(alice["roll"], "12-R52");

    let id = alice["id"].as_str().unwrap();
    let (status, body) = app
        .get(&format!("/api/download?id={}", id), Some("admin-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["personalInfo"]["name"], "Alice Smith");

    let (status, body) = app.get("/api/download", Some("admin-token")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing id");

    let (status, body) = app
        .post("/api/generate-manifest", Some("admin-token"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["manifest"][0]["roll"], "12-R52");
    assert_eq!(body["manifest"][0]["source"], "final-storage");
    assert!(body["generatedAt"].is_string());
}

#[tokio::test]
async fn admin_maintenance_endpoints() {
    let app = TestApp::new();
    app.save("alice-token", "p", sample_portfolio("Alice", "12-R52"))
        .await;

    let (status, body) = app
        .post("/api/cleanup-temp-files", Some("admin-token"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleanedCount"], 0);
    assert_eq!(body["message"], "Cleaned up 0 old temporary files");
    assert!(body.get("errors").is_none());

    let (status, body) = app.get("/api/storage-status", Some("admin-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files"]["temporary"], 0);
    assert_eq!(body["files"]["userPortfolios"], 1);
    assert_eq!(body["users"]["totalUsers"], 1);
}

#[tokio::test]
async fn legacy_app_data_portfolio_is_served() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/user-drive-portfolio", Some("alice-token")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No portfolio found in your Drive");

    app.app_data.insert_file(
        NewFile {
            name: "portfolio.json".to_string(),
            ..NewFile::default()
        },
        br#"{"personalInfo": {"name": "Alice"}}"#,
        chrono::Utc::now(),
    );
    let (status, body) = app.get("/api/user-drive-portfolio", Some("alice-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["personalInfo"]["name"], "Alice");
}

#[tokio::test]
async fn foreign_origins_are_refused() {
    let app = TestApp::new();
    let mut req = request("GET", "/healthz", None, None);
    req.headers_mut()
        .insert(header::ORIGIN, "https://evil.example.com".parse().unwrap());
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Not allowed by CORS");

    let mut req = request("GET", "/healthz", None, None);
    req.headers_mut()
        .insert(header::ORIGIN, "https://someone.github.io".parse().unwrap());
    let response = tower::ServiceExt::oneshot(app.router.clone(), req)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://someone.github.io"
    );

    let mut req = request("GET", "/healthz", None, None);
    req.headers_mut()
        .insert(header::ORIGIN, ORIGIN.trim_end_matches('/').parse().unwrap());
    let (status, _) = app.send(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
