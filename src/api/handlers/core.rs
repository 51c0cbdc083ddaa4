use axum::{Json, extract::State, response::Redirect};
use serde::Serialize;

use crate::{
    api::{ApiState, error::HttpError},
    engine::EngineError,
    pieces::{Availability, largest_file, range_of},
    session::ShutdownReason,
};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) ok: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusResponse {
    /// Engine state code, `-1` while no download is attached.
    pub(crate) state: i32,
    #[serde(flatten)]
    pub(crate) detail: Option<StatusDetail>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusDetail {
    pub(crate) progress: f32,
    /// kB/s
    pub(crate) download_rate: f64,
    /// kB/s
    pub(crate) upload_rate: f64,
    pub(crate) num_peers: u32,
    pub(crate) num_seeds: u32,
    pub(crate) has_metadata: bool,
    pub(crate) served_file: Option<usize>,
    /// First missing piece of the served file, counted from its first piece.
    pub(crate) max_piece: u32,
    pub(crate) total_pieces: u32,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

pub(crate) async fn root_redirect() -> Redirect {
    Redirect::to("/ls")
}

pub(crate) async fn status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, HttpError> {
    let status = match tokio::time::timeout(state.status_timeout, state.engine.status()).await {
        Err(_) => return Err(HttpError::timeout("engine status")),
        Ok(Err(EngineError::NoDownload)) => {
            return Ok(Json(StatusResponse {
                state: -1,
                detail: None,
            }));
        }
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(status)) => status,
    };

    let mut served_file = state.scheduler.served().await;
    let (mut max_piece, mut total_pieces) = (0, 0);
    if let Some(info) = status.info.as_deref() {
        served_file = served_file.or_else(|| largest_file(&info.files));
        if let Some(entry) = served_file.and_then(|i| info.files.get(i)) {
            let range = range_of(entry, info.piece_length);
            max_piece = Availability::new(&status.pieces).first_missing(range) - range.first;
            total_pieces = range.total_pieces();
        }
    }

    Ok(Json(StatusResponse {
        state: status.state.code(),
        detail: Some(StatusDetail {
            progress: status.progress,
            download_rate: status.download_rate as f64 / 1000.0,
            upload_rate: status.upload_rate as f64 / 1000.0,
            num_peers: status.num_peers,
            num_seeds: status.num_seeds,
            has_metadata: status.has_metadata(),
            served_file,
            max_piece,
            total_pieces,
        }),
    }))
}

/// Acknowledges immediately; teardown runs in the background and the process exits after it.
pub(crate) async fn shutdown(State(state): State<ApiState>) -> &'static str {
    state.shutdown.fire(ShutdownReason::Requested);
    "OK"
}
