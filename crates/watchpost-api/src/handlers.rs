//! Query handlers.
//!
//! Every handler copies a snapshot out of the history index; none of them
//! touch the log file or wait on the writer.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use watchpost_history::{HistoryStats, Item};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// One check's history.
#[derive(Debug, Serialize)]
pub struct CheckHistory {
    pub group: String,
    pub name: String,
    pub registered: bool,
    /// Newest first.
    pub items: Vec<Item>,
}

#[derive(Debug, Serialize)]
pub struct StatsView {
    pub name: String,
    #[serde(flatten)]
    pub stats: HistoryStats,
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.groups())
}

/// GET /api/v1/checks
pub async fn list_checks(State(state): State<ApiState>) -> impl IntoResponse {
    let all: BTreeMap<String, BTreeMap<String, Vec<Item>>> = state.store.all();
    ApiResponse::ok(all)
}

/// GET /api/v1/checks/{group}/{name}
pub async fn get_check(
    State(state): State<ApiState>,
    Path((group, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let items = state.store.series(&group, &name);
    let registered = state.store.is_registered(&group, &name);
    if items.is_empty() && !registered {
        return error_response("check not found", StatusCode::NOT_FOUND).into_response();
    }
    ApiResponse::ok(CheckHistory {
        group,
        name,
        registered,
        items,
    })
    .into_response()
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(StatsView {
        name: state.name.clone(),
        stats: state.store.stats(),
    })
}
