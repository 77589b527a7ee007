//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::{
    DeployRequest, DeploymentListResponse, ErrorResponse, HealthResponse, VersionResponse,
};
use tracing::{error, warn};

use crate::deploy::fsm::DeploymentStatus;
use crate::server::state::ServerState;
use crate::utils::version_info;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn authorize(state: &ServerState, headers: &HeaderMap) -> Result<(), Response> {
    match &state.api_key {
        Some(key) if !key.verify_headers(headers) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing or invalid API key",
        )),
        _ => Ok(()),
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Run a deployment and answer with its final record
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    // The pipeline runs on its own task so a dropped connection cannot abandon it halfway
    let engine = state.engine.clone();
    let result = tokio::spawn(async move { engine.deploy(&request).await }).await;

    match result {
        Ok(Ok(deployment)) => {
            let status = if deployment.status() == DeploymentStatus::Success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(deployment.to_record())).into_response()
        }
        Ok(Err(e)) if e.is_validation() => {
            warn!("Rejected deploy request: {}", e);
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Ok(Err(e)) => {
            error!("Deploy request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Deployment task failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error: {}", e),
            )
        }
    }
}

/// Recent deployments, newest first
pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let deployments: Vec<_> = state
        .history()
        .list()
        .iter()
        .map(|deployment| deployment.to_record())
        .collect();
    let total = deployments.len();

    Json(DeploymentListResponse { deployments, total }).into_response()
}

/// One deployment by id
pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.history().get(&id) {
        Some(deployment) => Json(deployment.to_record()).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("deployment {} not found", id),
        ),
    }
}
