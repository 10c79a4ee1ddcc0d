// Copyright 2026 Percolator Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface for proxy clients and operators.
//!
//! Read endpoints never fail because acquisition is broken: they serve the
//! latest snapshot, degrading to the bundled sample document or an empty
//! node list. The only mutating endpoint is the shared-secret refresh
//! trigger, which runs a coordinator cycle synchronously.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::coordinator::Coordinator;
use crate::model::ClashConfig;
use crate::normalize;
use crate::store::CacheStore;

const STATUS_TEMPLATE: &str = include_str!("assets/status.html");

/// Upstream headers worth forwarding to proxy clients. Content-type and
/// etag are ours, never the upstream's.
const PASSTHROUGH_HEADERS: &[&str] = &[
    "subscription-userinfo",
    "profile-update-interval",
    "profile-title",
    "content-disposition",
];

/// Build the router with all subscription endpoints.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/subscribe/clash", get(clash))
        .route("/api/subscribe/sample", get(sample))
        .route("/api/subscribe/nodes", get(nodes))
        .route("/api/subscribe/shadowrocket", get(shadowrocket))
        .route("/api/subscribe/url", get(url))
        .route("/api/subscribe/status", get(status_page))
        .route("/api/subscribe/refresh", post(refresh))
        .layer(cors)
        .with_state(coordinator)
}

/// Serve until daemon shutdown is signaled.
pub async fn start(coordinator: Arc<Coordinator>, shutdown: Arc<Notify>) -> Result<()> {
    let port = coordinator.settings().port;
    let app = router(coordinator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("subscription API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await
        .context("http server failed")?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Canonical Clash document with conditional caching, upstream header
/// passthrough, and the upstream status code when one was recorded.
async fn clash(State(coordinator): State<Arc<Coordinator>>, headers: HeaderMap) -> Response {
    let store = coordinator.store();
    let text = store.latest_text();
    let etag = CacheStore::etag(&text);
    if etag_matches(&headers, &etag) {
        return not_modified(&etag);
    }

    let meta = store.latest_meta();
    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/yaml; charset=utf-8"),
    );
    insert_etag(&mut out, &etag);
    for name in PASSTHROUGH_HEADERS {
        if let Some(value) = meta.headers.get(*name) {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                out.insert(n, v);
            }
        }
    }

    let status = meta
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);
    (status, out, text).into_response()
}

/// The bundled sample document, served unconditionally.
async fn sample() -> Response {
    let text = CacheStore::sample();
    let etag = CacheStore::etag(text);
    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/yaml; charset=utf-8"),
    );
    insert_etag(&mut out, &etag);
    (StatusCode::OK, out, text).into_response()
}

async fn nodes(State(coordinator): State<Arc<Coordinator>>) -> Response {
    Json(coordinator.store().latest_nodes()).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct ShadowrocketParams {
    base64: Option<String>,
}

/// Newline-joined `ss://` links regenerated from cached nodes, falling back
/// to the canonical document's proxies when the node cache is empty.
async fn shadowrocket(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<ShadowrocketParams>,
    headers: HeaderMap,
) -> Response {
    let store = coordinator.store();
    let mut node_list = store.latest_nodes();
    if node_list.is_empty() {
        if let Ok(config) = ClashConfig::from_yaml_str(&store.latest_text()) {
            node_list = normalize::nodes_from_config(&config);
        }
    }

    let mut text = normalize::links_from_nodes(&node_list).join("\n");
    if wants_base64(params.base64.as_deref()) {
        text = STANDARD.encode(text.as_bytes());
    }

    let etag = CacheStore::etag(&text);
    if etag_matches(&headers, &etag) {
        return not_modified(&etag);
    }
    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    insert_etag(&mut out, &etag);
    (StatusCode::OK, out, text).into_response()
}

async fn url(State(coordinator): State<Arc<Coordinator>>) -> Response {
    Json(coordinator.store().latest_meta()).into_response()
}

/// Operator-facing status view.
async fn status_page(State(coordinator): State<Arc<Coordinator>>) -> Html<String> {
    let store = coordinator.store();
    let meta = store.latest_meta();
    let etag = CacheStore::etag(&store.latest_text());
    let counts = meta.counts;
    let has_data = counts.proxies + counts.groups + counts.rules > 0;

    let fetched_at = meta
        .fetched_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "无".to_string());
    let source_url = match meta.url.as_deref() {
        Some(u) => {
            let escaped = escape_html(u);
            format!(
                "<a href=\"{escaped}\" target=\"_blank\" rel=\"noopener noreferrer\">{escaped}</a>"
            )
        }
        None => "无".to_string(),
    };

    let page = STATUS_TEMPLATE
        .replace("{{badge_class}}", if has_data { "ok" } else { "warn" })
        .replace("{{badge_text}}", if has_data { "已获取数据" } else { "暂无数据" })
        .replace("{{fetched_at}}", &fetched_at)
        .replace("{{source_url}}", &source_url)
        .replace("{{etag}}", &etag)
        .replace("{{proxies}}", &counts.proxies.to_string())
        .replace("{{groups}}", &counts.groups.to_string())
        .replace("{{rules}}", &counts.rules.to_string());
    Html(page)
}

/// Shared-secret refresh trigger. An unset key keeps the endpoint closed.
async fn refresh(State(coordinator): State<Arc<Coordinator>>, headers: HeaderMap) -> Response {
    let Some(expected) = coordinator.settings().api_key.clone() else {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    };
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    match coordinator.refresh().await {
        Ok(refreshed) => Json(serde_json::json!({ "url": refreshed })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == etag)
        .unwrap_or(false)
}

fn insert_etag(out: &mut HeaderMap, etag: &str) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        out.insert(header::ETAG, value);
    }
}

fn not_modified(etag: &str) -> Response {
    let mut out = HeaderMap::new();
    insert_etag(&mut out, etag);
    (StatusCode::NOT_MODIFIED, out).into_response()
}

fn wants_base64(flag: Option<&str>) -> bool {
    matches!(
        flag.map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
