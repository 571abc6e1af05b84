//! HTTP-level tests driving the full router.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use launchsite::config::{Config, SecretSourceKind};
use launchsite::error::AppResult;
use launchsite::password::DailyPasswordRecord;
use launchsite::store::{Document, JsonStore};
use launchsite::webhook::PasswordNotifier;
use launchsite::{router, AppState};

const SECRET: &str = "Integration-Secret-42!x";
const LOCAL: [u8; 4] = [127, 0, 0, 1];
const REMOTE: [u8; 4] = [203, 0, 113, 9];

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<DailyPasswordRecord>>,
}

#[async_trait]
impl PasswordNotifier for Recorder {
    async fn notify(&self, record: &DailyPasswordRecord) -> AppResult<()> {
        self.sent.lock().push(record.clone());
        Ok(())
    }
}

struct TestApp {
    dir: TempDir,
    app: Router,
    state: Arc<AppState>,
    recorder: Arc<Recorder>,
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.document_root = dir.path().join("public");
    config.storage.data_dir = dir.path().join("data");
    config.storage.uploads_dir = dir.path().join("uploads");
    config.password.source = SecretSourceKind::File;
    config.password.secret_file = dir.path().join("admin_secret.txt");
    config.analytics.google_analytics_id = "G-TEST".to_string();
    config
}

async fn spawn_app(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("admin_secret.txt"), SECRET).unwrap();
    std::fs::create_dir_all(dir.path().join("public")).unwrap();
    std::fs::write(
        dir.path().join("public/index.html"),
        "<!doctype html><title>Launcher</title>",
    )
    .unwrap();

    let mut config = test_config(&dir);
    configure(&mut config);

    let recorder = Arc::new(Recorder::default());
    let state = Arc::new(AppState::build(config, recorder.clone()).await.unwrap());
    TestApp {
        app: router(state.clone()),
        dir,
        state,
        recorder,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    bytes: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.bytes).unwrap()
    }

    fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }
}

async fn call(app: &Router, mut request: Request<Body>, ip: [u8; 4]) -> Reply {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    Reply {
        status,
        headers,
        bytes,
    }
}

fn json_request(method: Method, uri: &str, password: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(password) = password {
        builder = builder.header("x-admin-password", password);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, password: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(password) = password {
        builder = builder.header("x-admin-password", password);
    }
    builder.body(Body::empty()).unwrap()
}

fn delete(uri: &str, password: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::DELETE).uri(uri);
    if let Some(password) = password {
        builder = builder.header("x-admin-password", password);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_version_with_security_headers() {
    let t = spawn_app(|_| {}).await;
    let reply = call(&t.app, get("/api/health", None), LOCAL).await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["version"], launchsite::VERSION);
    assert_eq!(reply.headers["x-frame-options"], "DENY");
    assert_eq!(reply.headers["x-content-type-options"], "nosniff");
    assert!(reply.headers.contains_key("content-security-policy"));
    assert!(reply.headers.contains_key("permissions-policy"));
}

#[tokio::test]
async fn add_mod_then_list_includes_it() {
    let t = spawn_app(|_| {}).await;
    let reply = call(
        &t.app,
        json_request(
            Method::POST,
            "/api/mods",
            Some(SECRET),
            json!({ "name": "Speed Pack", "description": "FPS boost" }),
        ),
        LOCAL,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    let created = &body["mod"];
    assert!(!created["id"].as_str().unwrap().is_empty());
    assert!(created["createdAt"].is_string());
    assert_eq!(created["createdBy"], "127.0.0.1");
    assert_eq!(body["mods"].as_array().unwrap().len(), 1);

    let listed = call(&t.app, get("/api/mods", None), REMOTE).await.json();
    assert_eq!(listed["mods"][0]["name"], "Speed Pack");
    assert_eq!(listed["mods"][0]["id"], created["id"]);
}

#[tokio::test]
async fn add_mod_requires_name_and_description() {
    let t = spawn_app(|_| {}).await;
    let reply = call(
        &t.app,
        json_request(
            Method::POST,
            "/api/mods",
            None,
            json!({ "name": "Speed Pack", "description": "  ", "password": SECRET }),
        ),
        LOCAL,
    )
    .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["success"], false);
}

#[tokio::test]
async fn delete_unknown_mod_is_not_found() {
    let t = spawn_app(|_| {}).await;
    let reply = call(&t.app, delete("/api/mods/12345", Some(SECRET)), LOCAL).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_routes_check_secret_then_allowlist() {
    let t = spawn_app(|_| {}).await;

    let missing = call(&t.app, get("/api/admin/ips", None), LOCAL).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

    let wrong = call(&t.app, get("/api/admin/ips", Some("nope")), LOCAL).await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.json(), json!({ "success": false, "message": "Invalid admin password" }));

    let foreign = call(&t.app, get("/api/admin/ips", Some(SECRET)), REMOTE).await;
    assert_eq!(foreign.status, StatusCode::FORBIDDEN);

    let ok = call(&t.app, get("/api/admin/ips", Some(SECRET)), LOCAL).await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json()["ips"], json!(["127.0.0.1", "::1", "localhost"]));
}

#[tokio::test]
async fn invalid_and_duplicate_ips_leave_list_unchanged() {
    let t = spawn_app(|_| {}).await;
    let add = |ip: &str| {
        json_request(Method::POST, "/api/admin/ips", Some(SECRET), json!({ "ip": ip }))
    };

    let invalid = call(&t.app, add("999.999.999.999"), LOCAL).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    let added = call(&t.app, add("198.51.100.7"), LOCAL).await;
    assert_eq!(added.status, StatusCode::OK);
    let ips = added.json()["ips"].clone();
    assert_eq!(
        ips.as_array().unwrap().iter().filter(|ip| *ip == "198.51.100.7").count(),
        1
    );

    let duplicate = call(&t.app, add("198.51.100.7"), LOCAL).await;
    assert_eq!(duplicate.status, StatusCode::BAD_REQUEST);

    let listed = call(&t.app, get("/api/admin/ips", Some(SECRET)), LOCAL).await;
    assert_eq!(listed.json()["ips"], ips);
}

#[tokio::test]
async fn removing_missing_ip_is_not_found() {
    let t = spawn_app(|_| {}).await;
    let reply = call(&t.app, delete("/api/admin/ips/192.0.2.55", Some(SECRET)), LOCAL).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let listed = call(&t.app, get("/api/admin/ips", Some(SECRET)), LOCAL).await;
    assert_eq!(listed.json()["ips"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn user_status_and_verify() {
    let t = spawn_app(|_| {}).await;

    let status = call(&t.app, get("/api/user/status", None), REMOTE).await.json();
    assert_eq!(status["ip"], "203.0.113.9");
    assert_eq!(status["isAdmin"], false);

    let verify = |password: &str| {
        json_request(Method::POST, "/api/admin/verify", None, json!({ "password": password }))
    };
    let ok = call(&t.app, verify(SECRET), LOCAL).await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json()["ip"], "127.0.0.1");

    let bad = call(&t.app, verify("guess"), LOCAL).await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

    let empty = call(&t.app, verify(""), LOCAL).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_json_uses_error_envelope() {
    let t = spawn_app(|_| {}).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/analytics/hotspot")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"x\": "))
        .unwrap();
    let reply = call(&t.app, request, LOCAL).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["success"], false);
}

#[tokio::test]
async fn hotspot_log_keeps_newest_entries() {
    let t = spawn_app(|config| config.storage.hotspot_cap = 5).await;

    for i in 0..7 {
        let reply = call(
            &t.app,
            json_request(
                Method::POST,
                "/api/analytics/hotspot",
                None,
                json!({ "x": i, "y": 1, "sessionId": "s1", "type": "click" }),
            ),
            REMOTE,
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    let stored: Vec<Value> = JsonStore::new(t.dir.path().join("data"))
        .load(Document::Hotspots)
        .await
        .unwrap()
        .unwrap();
    let xs: Vec<f64> = stored.iter().map(|h| h["x"].as_f64().unwrap()).collect();
    assert_eq!(xs, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(stored[0]["ip"], "203.0.113.9");
}

#[tokio::test]
async fn utm_events_feed_the_summary() {
    let t = spawn_app(|_| {}).await;
    for (kind, session) in [("pageview", "a"), ("click", "a"), ("click", "b"), ("scroll", "b")] {
        call(
            &t.app,
            json_request(
                Method::POST,
                "/api/analytics/utm",
                None,
                json!({ "type": kind, "sessionId": session, "source": "newsletter" }),
            ),
            REMOTE,
        )
        .await;
    }

    let denied = call(&t.app, get("/api/analytics/summary", None), LOCAL).await;
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);

    let summary = call(&t.app, get("/api/analytics/summary", Some(SECRET)), LOCAL).await.json();
    assert_eq!(
        summary["stats"],
        json!({ "totalClicks": 2, "totalViews": 1, "uniqueVisitors": 2 })
    );
    assert_eq!(summary["utmRecords"].as_array().unwrap().len(), 4);
    assert_eq!(summary["utmRecords"][0]["source"], "newsletter");
    assert_eq!(summary["utmRecords"][0]["medium"], "none");
}

#[tokio::test]
async fn cookie_consent_issues_and_expires_categories() {
    let t = spawn_app(|_| {}).await;

    let essentials = call(
        &t.app,
        json_request(Method::POST, "/api/cookies", None, json!({ "action": "init_essentials" })),
        REMOTE,
    )
    .await;
    assert_eq!(essentials.status, StatusCode::OK);
    let cookies = essentials.set_cookies();
    let session = cookies.iter().find(|c| c.starts_with("session_id=")).unwrap();
    assert!(session.contains("HttpOnly"));
    assert!(session.contains("SameSite=Lax"));
    assert!(!session.contains("Secure"));

    let denied = call(
        &t.app,
        json_request(
            Method::POST,
            "/api/cookies",
            None,
            json!({ "action": "save", "consent": { "preferences": false, "advertising": false } }),
        ),
        REMOTE,
    )
    .await;
    let cookies = denied.set_cookies();
    let ad = cookies.iter().find(|c| c.starts_with("ad_tracking=")).unwrap();
    assert!(ad.contains("Max-Age=0"));
    let consent = cookies.iter().find(|c| c.starts_with("cookie_consent=")).unwrap();
    assert!(!consent.contains("HttpOnly"));

    let pair = consent.split(';').next().unwrap().to_string();
    let read = Request::builder()
        .uri("/api/cookies")
        .header(header::COOKIE, pair)
        .body(Body::empty())
        .unwrap();
    let stored = call(&t.app, read, REMOTE).await.json();
    assert_eq!(stored["consent"]["advertising"], false);
    assert_eq!(stored["consent"]["essentials"], true);

    let essentials_delete = call(
        &t.app,
        json_request(
            Method::POST,
            "/api/cookies",
            None,
            json!({ "action": "delete", "category": "essentials" }),
        ),
        REMOTE,
    )
    .await;
    assert_eq!(essentials_delete.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cookies_are_secure_behind_trusted_https_proxy() {
    let t = spawn_app(|config| config.server.trust_proxy_headers = true).await;
    let mut request = json_request(
        Method::POST,
        "/api/cookies",
        None,
        json!({ "action": "save", "consent": { "preferences": true, "advertising": true } }),
    );
    request
        .headers_mut()
        .insert("x-forwarded-proto", "https".parse().unwrap());

    let reply = call(&t.app, request, REMOTE).await;
    let cookies = reply.set_cookies();
    assert!(cookies.iter().all(|c| c.contains("; Secure")));
    assert!(cookies.iter().any(|c| c.starts_with("theme_preference=dark")));
    assert!(cookies.iter().any(|c| c.starts_with("analytics_id=analytics_")));
}

#[tokio::test]
async fn upload_attach_and_download() {
    let t = spawn_app(|_| {}).await;
    let boundary = "launchsite-test-boundary";
    let content = b"PK\x03\x04fake zip";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"speed pack.zip\"\r\nContent-Type: application/zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(
        format!(
            "\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"password\"\r\n\r\n{SECRET}\r\n--{boundary}--\r\n"
        )
        .as_bytes(),
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/mods/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let uploaded = call(&t.app, request, LOCAL).await;
    assert_eq!(uploaded.status, StatusCode::OK);
    let file = uploaded.json()["file"].clone();
    assert_eq!(file["name"], "speed pack.zip");
    assert_eq!(file["size"], content.len());
    assert!(file.get("base64").is_none());
    let stored = file["path"].as_str().unwrap().to_string();
    assert!(stored.ends_with("_speed_pack.zip"));
    assert!(t.dir.path().join("uploads").join(&stored).is_file());

    let created = call(
        &t.app,
        json_request(
            Method::POST,
            "/api/mods",
            Some(SECRET),
            json!({ "name": "Speed Pack", "description": "FPS boost", "file": file }),
        ),
        LOCAL,
    )
    .await;
    assert_eq!(created.status, StatusCode::OK);
    let id = created.json()["mod"]["id"].as_str().unwrap().to_string();

    let download = call(&t.app, get(&format!("/api/mods/{id}/download"), None), REMOTE).await;
    assert_eq!(download.status, StatusCode::OK);
    assert_eq!(download.bytes, content);
    assert!(download.headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment"));
}

#[tokio::test]
async fn upload_rejects_disallowed_extension() {
    let t = spawn_app(|_| {}).await;
    let boundary = "b";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"run.sh\"\r\n\r\necho\r\n--{boundary}--\r\n"
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/mods/upload")
        .header("x-admin-password", SECRET)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let reply = call(&t.app, request, LOCAL).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["message"], "File type not allowed");
}

#[tokio::test]
async fn upload_checks_header_secret_before_reading_body() {
    let t = spawn_app(|_| {}).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/mods/upload")
        .header("x-admin-password", "wrong")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b")
        .body(Body::from("not a multipart body at all"))
        .unwrap();
    let reply = call(&t.app, request, LOCAL).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let entries = std::fs::read_dir(t.dir.path().join("uploads")).unwrap().count();
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn public_config_lookup() {
    let t = spawn_app(|_| {}).await;
    let known = call(&t.app, get("/api/config?key=google_analytics_id", None), REMOTE).await;
    assert_eq!(known.json(), json!({ "success": true, "value": "G-TEST" }));

    let unknown = call(&t.app, get("/api/config?key=secret", None), REMOTE).await.json();
    assert_eq!(unknown["success"], false);
    assert_eq!(unknown["value"], Value::Null);
}

#[tokio::test]
async fn static_site_and_api_fallbacks() {
    let t = spawn_app(|_| {}).await;

    let index = call(&t.app, get("/", None), REMOTE).await;
    assert_eq!(index.status, StatusCode::OK);
    assert!(index.headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));

    let missing = call(&t.app, get("/nope.css", None), REMOTE).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let api_missing = call(&t.app, get("/api/nope", None), REMOTE).await;
    assert_eq!(api_missing.status, StatusCode::NOT_FOUND);
    assert_eq!(api_missing.json()["success"], false);
}

#[tokio::test]
async fn preflight_is_answered() {
    let t = spawn_app(|_| {}).await;
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/mods")
        .header(header::ORIGIN, "https://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-admin-password")
        .body(Body::empty())
        .unwrap();
    let reply = call(&t.app, request, REMOTE).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(reply.bytes.is_empty());
}

#[tokio::test]
async fn daily_password_authorizes_and_is_announced_once() {
    let t = spawn_app(|config| config.password.source = SecretSourceKind::Daily).await;
    let manager = t.state.passwords.clone().unwrap();
    let password = manager.current_password().await.unwrap();

    let ok = call(&t.app, get("/api/admin/ips", Some(password.as_str())), LOCAL).await;
    assert_eq!(ok.status, StatusCode::OK);
    let again = call(&t.app, get("/api/admin/ips", Some(password.as_str())), LOCAL).await;
    assert_eq!(again.status, StatusCode::OK);

    let stale = call(&t.app, get("/api/admin/ips", Some(SECRET)), LOCAL).await;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

    assert_eq!(t.recorder.sent.lock().len(), 1);
}
