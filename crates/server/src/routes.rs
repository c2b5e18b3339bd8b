//! The axum router and its handlers.
//!
//! Everything that is not a transport problem rides in the JSON body with
//! `status = "Error"`; unknown paths fall through to a plain 404.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use weave_client::{
    AbortRequest, CommitRequest, PlainResponse, PrepareRequest, PrepareResponse, ReadRequest,
    ReadResponse, STATUS_ERROR, STATUS_OK,
};

use crate::committer::Committer;
use crate::reader::Reader;

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<Reader>,
    pub committer: Arc<Committer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/read", post(read))
        .route("/prepare", post(prepare))
        .route("/commit", post(commit))
        .route("/abort", post(abort))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn read(State(state): State<AppState>, Json(req): Json<ReadRequest>) -> Json<ReadResponse> {
    info!(ds_name = %req.ds_name, key = %req.key, start_time = req.start_time, "read request");
    match state
        .reader
        .read(&req.ds_name, &req.key, req.start_time, &req.config)
        .await
    {
        Ok(resolved) => Json(ReadResponse {
            status: STATUS_OK.into(),
            data: Some(resolved.item),
            data_strategy: Some(resolved.strategy),
            group_key: resolved.assumption.map(|(owner, _)| owner),
            err_msg: None,
        }),
        Err(e) => Json(ReadResponse {
            status: STATUS_ERROR.into(),
            data: None,
            data_strategy: None,
            group_key: None,
            err_msg: Some(e.to_string()),
        }),
    }
}

async fn prepare(
    State(state): State<AppState>,
    Json(req): Json<PrepareRequest>,
) -> Json<PrepareResponse> {
    info!(ds_name = %req.ds_name, records = req.item_list.len(), "prepare request");
    match state
        .committer
        .prepare(
            &req.ds_name,
            req.item_list,
            req.start_time,
            &req.config,
            &req.validation_map,
        )
        .await
    {
        Ok((ver_map, t_commit)) => Json(PrepareResponse {
            status: STATUS_OK.into(),
            ver_map: Some(ver_map),
            t_commit: Some(t_commit),
            err_msg: None,
        }),
        Err(e) => Json(PrepareResponse {
            status: STATUS_ERROR.into(),
            ver_map: None,
            t_commit: None,
            err_msg: Some(e.to_string()),
        }),
    }
}

async fn commit(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Json<PlainResponse> {
    match state
        .committer
        .commit(&req.ds_name, req.list, req.t_commit)
        .await
    {
        Ok(()) => Json(PlainResponse {
            status: STATUS_OK.into(),
            err_msg: None,
        }),
        Err(e) => Json(PlainResponse {
            status: STATUS_ERROR.into(),
            err_msg: Some(e.to_string()),
        }),
    }
}

async fn abort(
    State(state): State<AppState>,
    Json(req): Json<AbortRequest>,
) -> Json<PlainResponse> {
    match state
        .committer
        .abort(&req.ds_name, &req.key_list, &req.group_key_list)
        .await
    {
        Ok(()) => Json(PlainResponse {
            status: STATUS_OK.into(),
            err_msg: None,
        }),
        Err(e) => Json(PlainResponse {
            status: STATUS_ERROR.into(),
            err_msg: Some(e.to_string()),
        }),
    }
}
