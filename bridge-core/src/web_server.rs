use crate::bridge::Bridge;
use crate::config::SettingsUpdate;
use crate::scan::{ScanPoll, StartOutcome};
use crate::supervisor::ConnectivitySupervisor;
use crate::traits::UiAssetProvider;
use crate::wireless::ConnectRequest;
use crate::Error;
use axum::{
    body::{Body, Bytes},
    extract::{Query, Request, State},
    http::{header, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// Router and link implementations are injected as `Arc<dyn Trait>`
// inside `Bridge` and `ConnectivitySupervisor`.
pub type WebServerState = State<Arc<AppState>>;

/// Page served in place of everything else while the fallback AP is up.
const CAPTIVE_PAGE: &str = "/config.html";

/// Shared by the HTTP handlers and the scheduler tick.
///
/// Lock order is always `bridge` before `supervisor`.
pub struct AppState {
    pub bridge: Mutex<Bridge>,
    pub supervisor: Mutex<ConnectivitySupervisor>,
    pub frontend: Arc<dyn UiAssetProvider>,
    pub ap_ssid: String,
    /// File name never served as a static asset (the runtime config).
    pub hidden_asset: Option<String>,
    /// Check for finished scans from the tick, not only when polled.
    pub prefetch: bool,
}

impl AppState {
    /// One scheduler step: scan pre-fetch, then the connectivity supervisor.
    pub async fn tick(&self) {
        let creds = {
            let mut bridge = self.bridge.lock().await;
            if self.prefetch {
                bridge.prefetch_scan().await;
            }
            bridge.station()
        };
        self.supervisor.lock().await.tick(&creds).await;
    }

    /// Initial station connection, before the server accepts requests.
    pub async fn boot(&self) {
        let creds = self.bridge.lock().await.station();
        self.supervisor.lock().await.boot(&creds).await;
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = match &self {
            Error::NotFound(m) | Error::InvalidInput(m) => m.clone(),
            other => other.to_string(),
        };
        error_json(self.status_code(), &message)
    }
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!("Rejecting request body: {}", e);
        error_json(StatusCode::BAD_REQUEST, "Invalid JSON")
    })
}

/// Builds the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    // 门户模式下这些接口需要可用的路由器会话，一律拒绝
    let gated = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/scan/start", post(api_scan_start))
        .route("/api/scan/result", get(api_scan_result))
        .route("/api/connect", post(api_connect))
        .route("/api/disconnect", post(api_disconnect))
        .route("/api/profile/delete", post(api_delete_profile))
        .route_layer(middleware::from_fn_with_state(state.clone(), captive_gate));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/config", get(api_config))
        .route("/api/settings", get(api_settings_get).post(api_settings_update))
        .merge(gated)
        .route("/generate_204", get(|| async { StatusCode::NO_CONTENT }))
        .fallback(serve_static_asset)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the Axum web server.
///
/// # Arguments
/// * `state` - Shared application state.
/// * `addr` - Listen address.
/// * `shutdown` - Resolves when the server should stop accepting connections.
///
/// # Returns
/// A `JoinHandle` for the server task.
pub fn start_web_server<F>(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: F,
) -> JoinHandle<crate::Result<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("🌐 Web server listening on {}", addr);
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::WebServer(e.into()))
    })
}

async fn captive_gate(State(state): WebServerState, request: Request, next: Next) -> Response {
    if state.supervisor.lock().await.is_captive() {
        tracing::debug!(path = %request.uri().path(), "Rejected while captive portal is active");
        return error_json(StatusCode::FORBIDDEN, "Captive portal active");
    }
    next.run(request).await
}

// --- Route Handlers ---

async fn api_config(State(state): WebServerState) -> Response {
    Json(state.bridge.lock().await.ui_config()).into_response()
}

async fn api_settings_get(State(state): WebServerState) -> Response {
    let mut view = state.bridge.lock().await.settings_view();
    let status = state.supervisor.lock().await.status();
    view["status"] = json!({
        "wifi_connected": status.wifi_connected,
        "captive_portal": status.captive_portal,
        "reconnect_pending": status.reconnect_pending,
        "phase": status.phase,
        "ap_ssid": state.ap_ssid,
    });
    Json(view).into_response()
}

async fn api_settings_update(State(state): WebServerState, body: Bytes) -> Response {
    let update: SettingsUpdate = match parse_body(&body) {
        Ok(u) => u,
        Err(resp) => return resp,
    };

    let mut bridge = state.bridge.lock().await;
    let change = match bridge.update_settings(update) {
        Ok(change) => change,
        Err(Error::InvalidInput(msg)) => return error_json(StatusCode::BAD_REQUEST, &msg),
        Err(e) => {
            tracing::error!("Failed to save configuration: {}", e);
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save configuration");
        }
    };

    let mut supervisor = state.supervisor.lock().await;
    if change.wifi_changed {
        tracing::info!(
            ssid = %bridge.config().wifi.ssid,
            "Station credentials changed, reconnecting"
        );
        supervisor.request_reconnect().await;
    }

    Json(json!({
        "success": true,
        "wifi_changed": change.wifi_changed,
        "mikrotik_changed": change.router_changed,
        "bands_changed": change.bands_changed,
        "scan_changed": change.scan_changed,
        "captive_portal": supervisor.is_captive(),
    }))
    .into_response()
}

async fn api_status(State(state): WebServerState) -> Response {
    Json(state.bridge.lock().await.router_status().await).into_response()
}

#[derive(Debug, Deserialize)]
struct ScanStartParams {
    band: Option<String>,
}

async fn api_scan_start(
    State(state): WebServerState,
    Query(params): Query<ScanStartParams>,
) -> Response {
    let mut bridge = state.bridge.lock().await;
    match bridge.start_scan(params.band.as_deref()).await {
        Ok(StartOutcome::Started(started)) => Json(started).into_response(),
        Ok(StartOutcome::AlreadyScanning) => {
            Json(json!({ "status": "already_scanning" })).into_response()
        }
        Err(Error::ResourceUnavailable(_)) => {
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "tmpfs not available")
        }
        Err(e) => e.into_response(),
    }
}

async fn api_scan_result(State(state): WebServerState) -> Response {
    let poll = state.bridge.lock().await.scan_result().await;
    let body = match poll {
        ScanPoll::Ready(report) => return Json(report).into_response(),
        ScanPoll::Pending => json!({ "status": "pending" }),
        ScanPoll::NoResult => json!({ "status": "no_result", "error": "No scan in progress" }),
        ScanPoll::Timeout => json!({ "status": "timeout", "error": "Scan timeout" }),
    };
    Json(body).into_response()
}

async fn api_connect(State(state): WebServerState, body: Bytes) -> Response {
    let request: ConnectRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.bridge.lock().await.connect(&request).await {
        Ok(outcome) => Json(json!({ "success": true, "profile": outcome.name })).into_response(),
        Err(e) => {
            tracing::warn!(ssid = %request.ssid, "Connect failed: {}", e);
            e.into_response()
        }
    }
}

async fn api_disconnect(State(state): WebServerState) -> Response {
    match state.bridge.lock().await.disconnect().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteProfileRequest {
    #[serde(default)]
    ssid: Option<String>,
    #[serde(default)]
    profile_name: Option<String>,
}

async fn api_delete_profile(State(state): WebServerState, body: Bytes) -> Response {
    let request: DeleteProfileRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let bridge = state.bridge.lock().await;
    match bridge
        .delete_profile(request.ssid.as_deref(), request.profile_name.as_deref())
        .await
    {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(e @ (Error::InvalidInput(_) | Error::NotFound(_))) => e.into_response(),
        Err(Error::CommandFailed(_)) => {
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete profile")
        }
        Err(e) => {
            tracing::error!("Failed to read profiles: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read profiles")
        }
    }
}

/// Paths reachable while the fallback AP is up.
fn allowed_during_captive(path: &str) -> bool {
    matches!(
        path,
        "/"
            | "/config.html"
            | "/config.js"
            | "/style.css"
            | "/favicon.png"
            | "/favicon.ico"
            | "/favicon@2x.png"
    ) || path.starts_with("/i18n/")
}

/// Serves a static asset (e.g., CSS, JS) from the frontend provider.
async fn serve_static_asset(State(state): WebServerState, uri: Uri) -> Response {
    let requested = uri.path();

    let is_hidden = Path::new(requested)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| state.hidden_asset.as_deref() == Some(n));
    if is_hidden {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let captive = state.supervisor.lock().await.is_captive();
    if captive && !allowed_during_captive(requested) {
        return (StatusCode::FOUND, [(header::LOCATION, CAPTIVE_PAGE)], "Redirect").into_response();
    }

    let mut path = requested.to_string();
    if path.ends_with('/') {
        path.push_str("index.html");
    }
    if captive && path == "/index.html" {
        path = CAPTIVE_PAGE.to_string();
    }

    match state.frontend.get_asset(&path).await {
        Ok((data, mime)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, mime)], Body::from(data)).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "404: Not Found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, SupervisorConfig, builtin_config};
    use crate::frontends::DiskFrontend;
    use crate::link::MockLink;
    use crate::router::mock::MockRouter;
    use crate::scan::SCAN_CSV_FILENAME;
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const CSV: &str = "\"AA:BB:CC:00:00:01\",\"Home\",\"2412/20/gn\",\"-50\"\n";

    struct TestApp {
        router: Router,
        state: Arc<AppState>,
        mock: Arc<MockRouter>,
        link: Arc<MockLink>,
        _dir: tempfile::TempDir,
    }

    async fn test_app(captive: bool) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let ui = dir.path().join("ui");
        std::fs::create_dir(&ui).unwrap();
        std::fs::write(ui.join("index.html"), "index page").unwrap();
        std::fs::write(ui.join("config.html"), "config page").unwrap();
        std::fs::write(ui.join("style.css"), "body {}").unwrap();

        let app = builtin_config().unwrap();
        let store = ConfigStore::load(ui.join("runtime.toml"), app.defaults);
        let mock = Arc::new(
            MockRouter::new()
                .with_interface("wlan1", "2ghz-b/g/n")
                .with_profile("client-Home", "dynamic-keys", "wifi-manager:ssid=Home"),
        );
        let link = Arc::new(MockLink::new());
        let mut supervisor =
            ConnectivitySupervisor::new(link.clone(), app.ap, SupervisorConfig::default());
        if captive {
            supervisor.request_reconnect().await;
        }

        let state = Arc::new(AppState {
            bridge: Mutex::new(Bridge::new(store, mock.clone())),
            supervisor: Mutex::new(supervisor),
            frontend: Arc::new(DiskFrontend::new(&ui)),
            ap_ssid: "MikroTikSetup".into(),
            hidden_asset: Some("runtime.toml".into()),
            prefetch: false,
        });

        TestApp {
            router: build_router(state.clone()),
            state,
            mock,
            link,
            _dir: dir,
        }
    }

    fn get_req(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &TestApp, req: HttpRequest<Body>) -> Response {
        app.router.clone().oneshot(req).await.unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn gated_routes_are_forbidden_while_captive() {
        let app = test_app(true).await;
        let requests = [
            get_req("/api/status"),
            post_req("/api/scan/start", ""),
            get_req("/api/scan/result"),
            post_req("/api/connect", r#"{"ssid":"Home"}"#),
            post_req("/api/disconnect", ""),
            post_req("/api/profile/delete", r#"{"ssid":"Home"}"#),
        ];
        for req in requests {
            let resp = send(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(body_json(resp).await, json!({ "error": "Captive portal active" }));
        }
        assert!(app.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn config_surface_stays_reachable_while_captive() {
        let app = test_app(true).await;

        let resp = send(&app, get_req("/api/config")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["scan_poll_interval_ms"], 1_000);

        let resp = send(&app, get_req("/api/settings")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let settings = body_json(resp).await;
        assert_eq!(settings["status"]["captive_portal"], true);
        assert_eq!(settings["status"]["ap_ssid"], "MikroTikSetup");
        assert_eq!(settings["mikrotik"]["wlan_interface"], "wlan1");
        assert!(settings["mikrotik"].get("password").is_none());
    }

    #[tokio::test]
    async fn wifi_change_forces_captive_and_pending_reconnect() {
        let app = test_app(false).await;

        let resp = send(
            &app,
            post_req("/api/settings", r#"{"wifi":{"ssid":"Office","password":"pw-12345"}}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["wifi_changed"], true);
        assert_eq!(body["mikrotik_changed"], false);
        assert_eq!(body["captive_portal"], true);

        {
            let supervisor = app.state.supervisor.lock().await;
            assert!(supervisor.is_captive());
            assert!(supervisor.state().reconnect_pending);
        }
        assert!(app.link.ap_active());

        app.state.tick().await;
        assert_eq!(app.link.attempts(), vec!["Office".to_string()]);
    }

    #[tokio::test]
    async fn settings_rejects_bad_input() {
        let app = test_app(false).await;

        let resp = send(&app, post_req("/api/settings", "{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, json!({ "error": "Invalid JSON" }));

        let req = post_req("/api/settings", r#"{"scan":{"duration_seconds":0}}"#);
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, json!({ "error": "invalid_scan_duration" }));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_flow_over_http() {
        let app = test_app(false).await;
        app.mock.set_scan_artifact(Some(CSV));

        let resp = send(&app, post_req("/api/scan/start?band=2ghz-b/g/n", "")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let started = body_json(resp).await;
        assert_eq!(started["status"], "started");
        assert_eq!(started["duration_ms"], 4_000);
        assert_eq!(started["timeout_ms"], 10_000);
        assert_eq!(started["csv_filename"], SCAN_CSV_FILENAME);

        let resp = send(&app, post_req("/api/scan/start", "")).await;
        assert_eq!(body_json(resp).await, json!({ "status": "already_scanning" }));

        let resp = send(&app, get_req("/api/scan/result")).await;
        assert_eq!(body_json(resp).await, json!({ "status": "pending" }));

        tokio::time::advance(Duration::from_millis(4_000)).await;
        let resp = send(&app, get_req("/api/scan/result")).await;
        let result = body_json(resp).await;
        assert_eq!(result["csv"], CSV);
        assert_eq!(result["band"], "2ghz-b/g/n");
        assert_eq!(result["profiles"][0]["ssid"], "Home");
        assert_eq!(result["profiles"][0]["authentication-types"], "wpa-psk,wpa2-psk");

        let resp = send(&app, get_req("/api/scan/result")).await;
        assert_eq!(body_json(resp).await["status"], "no_result");
    }

    #[tokio::test]
    async fn scan_start_reports_missing_tmpfs() {
        let app = test_app(false).await;
        app.mock.reject(crate::traits::Method::Post, "/disk/add");

        let resp = send(&app, post_req("/api/scan/start", "")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await, json!({ "error": "tmpfs not available" }));
    }

    #[tokio::test]
    async fn connect_and_profile_delete() {
        let app = test_app(false).await;

        let req = post_req("/api/connect", r#"{"ssid":"Home","password":"pw-12345"}"#);
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["success"], true);

        let resp = send(&app, post_req("/api/profile/delete", r#"{"ssid":"Nowhere"}"#)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({ "error": "Managed profile not found" }));

        let resp = send(&app, post_req("/api/profile/delete", r#"{}"#)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, post_req("/api/profile/delete", r#"{"ssid":"Home"}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(app.mock.profiles().is_empty());
    }

    #[tokio::test]
    async fn connect_without_ssid_is_bad_request() {
        let app = test_app(false).await;
        let resp = send(&app, post_req("/api/connect", r#"{"password":"x"}"#)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn static_files_follow_captive_rules() {
        let app = test_app(true).await;

        let resp = send(&app, get_req("/status.html")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[header::LOCATION], "/config.html");

        let resp = send(&app, get_req("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "config page");

        let resp = send(&app, get_req("/style.css")).await;
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/css");

        let resp = send(&app, get_req("/runtime.toml")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_files_when_connected() {
        let app = test_app(false).await;

        let resp = send(&app, get_req("/")).await;
        assert_eq!(body_text(resp).await, "index page");

        let resp = send(&app, get_req("/missing.js")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&app, get_req("/generate_204")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let app = test_app(false).await;
        let req = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/api/connect")
            .header("origin", "http://192.168.4.1")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
