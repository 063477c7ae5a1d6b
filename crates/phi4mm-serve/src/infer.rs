use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use phi4mm::{InferenceRequest, InferenceResponse, MultimodalModel, Phi4MmError, Phi4Multimodal};

/// The loaded pipeline, shared by every request and used by one at a time.
pub type SharedPipeline<M> = Arc<Mutex<Phi4Multimodal<M>>>;

pub fn router<M>(pipeline: SharedPipeline<M>) -> Router
where
    M: MultimodalModel + Send + 'static,
{
    Router::new()
        .route("/", get(|| async { "Welcome to the Phi-4 multimodal server!" }))
        .route("/health", get(health))
        .route("/infer", post(infer::<M>))
        .with_state(pipeline)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn infer<M>(
    State(pipeline): State<SharedPipeline<M>>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, ApiError>
where
    M: MultimodalModel + Send + 'static,
{
    log::debug!("{} request for {}", request.task_type, request.content_url);

    // inference is blocking and holds the model for the whole request
    let response = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline
            .lock()
            .map_err(|_| ApiError::internal("the model lock is poisoned"))?;
        pipeline.infer(&request).map_err(ApiError::from)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;

    Ok(Json(response))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Phi4MmError> for ApiError {
    fn from(err: Phi4MmError) -> Self {
        let status = status_code(&err);
        if status.is_server_error() {
            log::error!("Inference failed: {err}");
        } else {
            log::warn!("Rejected request: {err}");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Client mistakes map to 400, failures of the media host to 502.
fn status_code(err: &Phi4MmError) -> StatusCode {
    match err {
        Phi4MmError::InvalidRequest(_)
        | Phi4MmError::UnsupportedUrl(_)
        | Phi4MmError::MismatchedMediaCount { .. }
        | Phi4MmError::MediaTokenMismatch { .. }
        | Phi4MmError::ImageDecodeError(_)
        | Phi4MmError::AudioDecodeError(_)
        | Phi4MmError::EmptyAudio
        | Phi4MmError::AudioTooShort { .. }
        | Phi4MmError::UnsupportedSampleRate(_) => StatusCode::BAD_REQUEST,
        Phi4MmError::HttpError(_) | Phi4MmError::HttpStatus { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
