//! Request handlers for the tunnel API.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use streamgate_core::estimate::estimate_for_urls;
use streamgate_core::headers::build_headers;
use streamgate_core::tunnel::{
    FfmpegJob, StreamDescriptor, TunnelError, TunnelPlan, build_audio_args, build_gif_args,
    build_remux_args, proxy_tunnel, run_pipeline,
};
use tracing::info;

use crate::server::AppState;

/// API-facing error with a client-safe message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request itself was malformed.
    #[error("{0}")]
    BadRequest(String),
    /// The gateway failed while setting the tunnel up.
    #[error("{0}")]
    Internal(String),
}

impl From<TunnelError> for ApiError {
    fn from(error: TunnelError) -> Self {
        match error {
            TunnelError::WrongInputCount { .. }
            | TunnelError::UnsupportedMetadataTag { .. }
            | TunnelError::UnsupportedFormat { .. } => ApiError::BadRequest(error.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn pipeline_response(
    state: &AppState,
    job: FfmpegJob,
    urls: Vec<String>,
    filename: &str,
) -> Result<Response, ApiError> {
    let estimate =
        estimate_for_urls(state.probe.as_ref(), &urls, job.estimate_multiplier).await;
    Ok(run_pipeline(
        &job,
        &urls,
        filename,
        estimate,
        state.registry.as_ref(),
        &state.config.processing,
    )?)
}

/// `POST /tunnel` - delivers the media a descriptor names.
///
/// Validation happens at the boundary; an invalid descriptor never
/// reaches the subprocess or an upstream origin.
///
/// # Errors
///
/// - `ApiError::BadRequest` - Descriptor failed validation
/// - `ApiError::Internal` - Tunnel setup failed
pub async fn create_tunnel(
    State(state): State<AppState>,
    Json(descriptor): Json<StreamDescriptor>,
) -> Result<Response, ApiError> {
    let plan = TunnelPlan::from_descriptor(descriptor)?;
    info!(
        service = plan.service(),
        filename = plan.filename(),
        "tunnel requested"
    );

    match plan {
        TunnelPlan::Proxy(plan) => Ok(proxy_tunnel(
            &plan,
            &state.client,
            &state.store,
            state.registry.as_ref(),
            &state.config.network,
        )
        .await?),
        TunnelPlan::Remux(plan) => {
            let headers = build_headers(&state.store, &plan.service, &state.config.network);
            let block = plan.is_hls.then(|| headers.as_header_block());
            let job = build_remux_args(&plan, block.as_deref())?;
            pipeline_response(&state, job, plan.urls.clone(), &plan.filename).await
        }
        TunnelPlan::AudioConvert(plan) => {
            let headers = build_headers(&state.store, &plan.service, &state.config.network);
            let block = plan.is_hls.then(|| headers.as_header_block());
            let job = build_audio_args(&plan, block.as_deref())?;
            pipeline_response(&state, job, vec![plan.url.clone()], &plan.filename).await
        }
        TunnelPlan::GifConvert(plan) => {
            let job = build_gif_args(&plan)?;
            pipeline_response(&state, job, vec![plan.url.clone()], &plan.filename).await
        }
    }
}

/// `GET /health` - liveness plus cookie store and tunnel diagnostics.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services: std::collections::BTreeMap<String, usize> =
        state.store.service_counts().into_iter().collect();

    Json(json!({
        "status": if state.store.flush_stopped() { "degraded" } else { "ok" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_tunnels": state.registry.active(),
        "cookies": {
            "services": services,
            "quarantined": state.store.quarantined_keys().len(),
            "flush_stopped": state.store.flush_stopped(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use streamgate_core::config::GatewayConfig;
    use tower::ServiceExt;

    use super::*;
    use crate::server::router;

    fn test_router() -> axum::Router {
        let state = AppState::from_config(GatewayConfig::for_testing()).unwrap();
        router(state)
    }

    fn tunnel_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/tunnel")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_error_mapping() {
        let wrong_count: ApiError = TunnelError::WrongInputCount {
            expected: 2,
            got: 1,
        }
        .into();
        assert!(matches!(wrong_count, ApiError::BadRequest(_)));

        let pipe: ApiError = TunnelError::PipeUnavailable.into();
        assert!(matches!(pipe, ApiError::Internal(_)));
    }

    #[tokio::test]
    async fn test_merge_with_one_url_is_rejected() {
        let response = test_router()
            .oneshot(tunnel_request(json!({
                "service": "youtube",
                "type": "merge",
                "urls": ["https://v.example/only"],
                "filename": "video.mp4"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(error["error"].as_str().unwrap().contains("2"));
    }

    #[tokio::test]
    async fn test_unknown_metadata_tag_is_rejected() {
        let response = test_router()
            .oneshot(tunnel_request(json!({
                "service": "twitter",
                "type": "remux",
                "urls": ["https://v.example/clip"],
                "filename": "clip.mp4",
                "metadata": { "comment": "nope" }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["active_tunnels"], 0);
    }
}
