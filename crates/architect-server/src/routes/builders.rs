//! Builder listing endpoints.

use architect_core::{BuilderState, BuilderSummary, ResourceId};
use architect_scheduler::Page;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Largest page a client may ask for.
const MAX_PER_PAGE: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_builders))
        .route("/{id}", get(get_builder))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    state: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuilderList {
    builders: Vec<BuilderSummary>,
    page: usize,
    per_page: usize,
    total: usize,
}

async fn list_builders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BuilderList>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<BuilderState>)
        .transpose()?;

    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(state.page_size)
        .clamp(1, MAX_PER_PAGE);

    let total = state.registry.snapshot(filter).len();
    let builders = state
        .registry
        .list(filter, Page::new(page, per_page))
        .iter()
        .map(|b| b.summary())
        .collect();

    Ok(Json(BuilderList {
        builders,
        page,
        per_page,
        total,
    }))
}

async fn get_builder(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BuilderSummary>, ApiError> {
    let id: ResourceId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid builder id '{id}'")))?;
    let builder = state
        .registry
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("builder {id}")))?;
    Ok(Json(builder.summary()))
}
