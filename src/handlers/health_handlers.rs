//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the object store

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness check; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and a readiness check against the configured object
/// store. HTTP 200 when both pass, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::pass(),
        Ok(v) => CheckStatus::fail(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::fail(format!("error: {}", e)),
    };

    let store = service.store();
    let storage_check = match store.check_ready().await {
        Ok(()) => CheckStatus::pass(),
        Err(e) => CheckStatus::fail(format!("{} store: {}", store.name(), e)),
    };

    let overall_ok = sqlite_check.ok && storage_check.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn pass() -> Self {
        Self { ok: true, error: None }
    }

    fn fail(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
