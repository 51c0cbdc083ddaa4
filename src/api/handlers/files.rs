use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::io::SeekFrom;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    api::{
        ApiState,
        error::HttpError,
        range::{RangeRequest, parse_range},
    },
    fs::{DirEntry, FsError, StreamingFile},
};

const PUMP_BUF: usize = 64 * 1024;
const PUMP_DEPTH: usize = 4;

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse {
    pub(crate) files: Vec<DirEntry>,
}

pub(crate) async fn ls(State(state): State<ApiState>) -> Result<Json<ListResponse>, HttpError> {
    Ok(Json(ListResponse {
        files: state.directory.read_dir()?,
    }))
}

pub(crate) async fn file(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let info = state.directory.wait_for_info(state.metadata_wait).await?;
    let mut file = state.directory.open(&path).await?;
    if let Some(index) = file.file_index() {
        state.scheduler.serve(info.files.len(), index).await?;
    }

    let size = file.size();
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let (status, start, len, content_range) = match parse_range(range_header, size) {
        RangeRequest::Full => (StatusCode::OK, 0, size, None),
        RangeRequest::Partial(r) => (
            StatusCode::PARTIAL_CONTENT,
            r.start,
            r.len(),
            Some(r.content_range(size)),
        ),
        RangeRequest::Unsatisfiable => {
            file.close();
            let mut resp = HttpError::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                format!("requested range is outside {size} bytes"),
            )
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                resp.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(resp);
        }
    };

    // Seeking to 0 is a no-op that could only arm a virtual read on tiny files.
    if start > 0
        && let Err(err) = file.seek(SeekFrom::Start(start)).await
    {
        file.close();
        return Err(err.into());
    }

    tracing::info!(file = %file.name(), start, len, "streaming file");
    let content_type = content_type_for_path(std::path::Path::new(file.name()));
    let (tx, rx) = mpsc::channel(PUMP_DEPTH);
    tokio::spawn(pump(file, len, tx));

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, len);
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

/// Copies up to `remaining` bytes from `file` into the response channel. A closed channel is
/// the client going away; it also ends a read that is still waiting for a piece.
async fn pump(
    mut file: StreamingFile,
    mut remaining: u64,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut buf = vec![0u8; PUMP_BUF];
    let outcome = loop {
        if remaining == 0 {
            break Ok(());
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let read = tokio::select! {
            read = file.read(&mut buf[..want]) => read,
            _ = tx.closed() => Err(FsError::Disconnected),
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(n) => {
                remaining -= n as u64;
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break Err(FsError::Disconnected);
                }
            }
            Err(err) => break Err(err),
        }
    };
    let position = file.position();
    file.close();

    match outcome {
        Ok(()) => tracing::debug!(file = %file.name(), position, "stream finished"),
        Err(FsError::Disconnected) => {
            tracing::info!(file = %file.name(), position, "client disconnected")
        }
        Err(err) => {
            tracing::warn!(file = %file.name(), position, error = %err, "stream aborted");
            let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
        }
    }
}

pub(crate) fn content_type_for_path(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "m4a" => "audio/mp4",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt; charset=utf-8",
        "txt" | "nfo" => "text/plain; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
