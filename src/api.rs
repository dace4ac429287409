//! HTTP control surface (axum).
//!
//! Handlers are thin adapters over the lifecycle controller: all
//! enforcement (validation, one-per-client, state checks) lives there.
//! Successful reads are JSON; errors map to plain-text responses.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth;
use crate::error::Error;
use crate::metrics::ResourceSample;
use crate::server::AppState;
use crate::templates::Template;
use crate::vm::{CreateParams, Progress, Vps};

pub fn router(state: AppState) -> Router {
    let api_key = state.api_key.clone();

    Router::new()
        .route("/api/vps/create", post(create_vps))
        .route("/api/vps/list", get(list_vps))
        .route("/api/vps/get", get(get_vps))
        .route("/api/vps/progress", get(get_progress))
        .route("/api/vps/delete", delete(delete_vps))
        .route("/api/vps/start", post(start_vps))
        .route("/api/vps/stop", post(stop_vps))
        .route("/api/vps/restart", post(restart_vps))
        .route("/api/vps/metrics", get(get_metrics))
        .route("/api/images/list", get(list_images))
        .route("/api/templates/list", get(list_templates))
        .layer(middleware::from_fn_with_state(api_key, auth::require_api_key))
        // Outermost so preflight OPTIONS never hits the auth check.
        .layer(auth::cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request / response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub image_type: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateQuery {
    #[serde(default)]
    os: Option<String>,
}

#[derive(Debug, Serialize)]
struct TemplateEntry {
    #[serde(flatten)]
    template: Template,
    compatible: bool,
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// The start/stop/restart wire contract reports every failure as a server
/// error: lookup misses and state preconditions are not part of it, so
/// those collapse into the 500 family before leaving the handler.
fn operational(err: Error) -> Error {
    match err {
        Error::NotFound(msg) | Error::Conflict(msg) => Error::Internal(msg),
        other => other,
    }
}

/// `POST /api/vps/create` — create a VM; returns the record in `creating`.
async fn create_vps(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Vps>, Error> {
    let params = CreateParams {
        hostname: req
            .hostname
            .unwrap_or_else(|| format!("{}.vps.local", req.name)),
        image_type: req.image_type.unwrap_or_else(|| "ubuntu-22.04".to_string()),
        template: req.template.unwrap_or_else(|| "blank".to_string()),
        name: req.name,
    };
    info!(name = %params.name, image = %params.image_type, template = %params.template,
          client = %addr.ip(), "create vps");
    let vps = state.manager.create(params, &addr.ip().to_string())?;
    Ok(Json(vps))
}

/// `GET /api/vps/list` — all records, stale statuses corrected.
async fn list_vps(State(state): State<AppState>) -> Json<Vec<Vps>> {
    Json(state.manager.list())
}

/// `GET /api/vps/get?id=` — one record.
async fn get_vps(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<Json<Vps>, Error> {
    Ok(Json(state.manager.get(&q.id)?))
}

/// `GET /api/vps/progress?id=` — creation stage, progress and error.
async fn get_progress(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<Json<Progress>, Error> {
    Ok(Json(state.manager.progress(&q.id)?))
}

/// `DELETE /api/vps/delete?id=` — reclaim the VM and its resources.
async fn delete_vps(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<StatusCode, Error> {
    info!(vm = %q.id, "delete vps");
    state.manager.delete(&q.id).await?;
    Ok(StatusCode::OK)
}

/// `POST /api/vps/start?id=` — cold-start a stopped VM.
async fn start_vps(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<StatusCode, Error> {
    info!(vm = %q.id, "start vps");
    state.manager.start(&q.id).await.map_err(operational)?;
    Ok(StatusCode::OK)
}

/// `POST /api/vps/stop?id=` — graceful power-off.
async fn stop_vps(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<StatusCode, Error> {
    info!(vm = %q.id, "stop vps");
    state.manager.stop(&q.id).await.map_err(operational)?;
    Ok(StatusCode::OK)
}

/// `POST /api/vps/restart?id=` — ACPI reset of a running VM.
async fn restart_vps(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<StatusCode, Error> {
    info!(vm = %q.id, "restart vps");
    state.manager.restart(&q.id).await.map_err(operational)?;
    Ok(StatusCode::OK)
}

/// `GET /api/vps/metrics?id=` — bounded sample history.
async fn get_metrics(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> Result<Json<Vec<ResourceSample>>, Error> {
    Ok(Json(state.manager.metrics_history(&q.id)?))
}

/// `GET /api/images/list` — supported image ids.
async fn list_images(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.manager.images().ids())
}

/// `GET /api/templates/list?os=` — templates, flagged for compatibility
/// with the given image when `os` is present.
async fn list_templates(
    State(state): State<AppState>,
    Query(q): Query<TemplateQuery>,
) -> Json<Vec<TemplateEntry>> {
    let entries = state
        .manager
        .templates()
        .iter()
        .map(|t| TemplateEntry {
            compatible: q.os.as_deref().map_or(true, |os| t.supports_image(os)),
            template: t.clone(),
        })
        .collect();
    Json(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    const KEY: &str = "test-secret";

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = crate::vm::VpsManager::new(crate::vm::DataDirs::new(
            dir.path().to_path_buf(),
        ));
        (
            AppState { manager, api_key: auth::ApiKey::new(KEY.to_string()) },
            dir,
        )
    }

    fn request(method: Method, uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(auth::API_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn requests_without_key_are_unauthorized() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(Method::GET, "/api/vps/list", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn requests_with_wrong_key_are_unauthorized() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(Method::GET, "/api/vps/list", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_passes_without_key() {
        let (state, _dir) = test_state();
        let app = router(state);
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/vps/list")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn cors_headers_ride_on_authorized_responses() {
        let (state, _dir) = test_state();
        let app = router(state);
        let mut req = request(Method::GET, "/api/vps/list", Some(KEY));
        req.headers_mut()
            .insert(header::ORIGIN, "http://example.com".parse().unwrap());
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn list_starts_empty() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(Method::GET, "/api/vps/list", Some(KEY)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_vm_is_a_plain_text_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(Method::GET, "/api/vps/get?id=ghost", Some(KEY)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn images_list_contains_the_default_image() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(Method::GET, "/api/images/list", Some(KEY)))
            .await
            .unwrap();
        let images = body_json(resp).await;
        assert!(images
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "ubuntu-22.04"));
    }

    #[tokio::test]
    async fn templates_list_flags_compatibility_for_os_filter() {
        let (state, _dir) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request(
                Method::GET,
                "/api/templates/list?os=centos-7",
                Some(KEY),
            ))
            .await
            .unwrap();
        let templates = body_json(resp).await;
        let list = templates.as_array().unwrap();
        assert!(!list.is_empty());
        for entry in list {
            let id = entry["id"].as_str().unwrap();
            let compatible = entry["compatible"].as_bool().unwrap();
            match id {
                "blank" => assert!(compatible),
                "docker" => assert!(!compatible),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn stop_start_restart_on_unknown_vm_are_500() {
        let (state, _dir) = test_state();
        let app = router(state);
        for (method, uri) in [
            (Method::POST, "/api/vps/stop?id=ghost"),
            (Method::POST, "/api/vps/start?id=ghost"),
            (Method::POST, "/api/vps/restart?id=ghost"),
        ] {
            let resp = app
                .clone()
                .oneshot(request(method, uri, Some(KEY)))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
        }
    }

    #[tokio::test]
    async fn stop_start_restart_state_preconditions_are_500() {
        let (state, _dir) = test_state();
        let manager = state.manager.clone();
        let app = router(state);

        // Still in `creating`: no pid to stop, not stopped for start, not
        // running for restart.
        let vps = manager
            .create(
                CreateParams {
                    name: "n1".into(),
                    hostname: "n1.vps.local".into(),
                    image_type: "ubuntu-22.04".into(),
                    template: "blank".into(),
                },
                "203.0.113.9",
            )
            .unwrap();

        for op in ["stop", "start", "restart"] {
            let uri = format!("/api/vps/{op}?id={}", vps.id);
            let resp = app
                .clone()
                .oneshot(request(Method::POST, &uri, Some(KEY)))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR, "{op}");
        }
    }

    #[tokio::test]
    async fn delete_twice_yields_404_on_the_second_call() {
        let (state, _dir) = test_state();
        let manager = state.manager.clone();
        let app = router(state);

        let vps = manager
            .create(
                CreateParams {
                    name: "n1".into(),
                    hostname: "n1.vps.local".into(),
                    image_type: "ubuntu-22.04".into(),
                    template: "blank".into(),
                },
                "198.51.100.4",
            )
            .unwrap();

        let uri = format!("/api/vps/delete?id={}", vps.id);
        let resp = app
            .clone()
            .oneshot(request(Method::DELETE, &uri, Some(KEY)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(request(Method::DELETE, &uri, Some(KEY)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
