use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header, Response, StatusCode};
use warp::hyper::Body;
use warp::Filter;

use super::sfu_websocket;
use crate::error::{ErrorKind, SfuError};
use crate::media::codecs;
use crate::recording::RecordingStatus;
use crate::sfu::{EngineHealth, SfuServer};

/// Every HTTP and WebSocket route of the server.
pub fn routes(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    sfu_websocket_route(sfu_server.clone())
        .or(sfu_health_check(sfu_server.clone()))
        .or(sfu_config_endpoint(sfu_server.clone()))
        .or(recordings_list(sfu_server.clone()))
        .or(recording_download(sfu_server.clone()))
        .or(recording_delete(sfu_server))
        .with(warp::trace::request())
}

/// Creates the SFU WebSocket route
pub fn sfu_websocket_route(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("sfu")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_sfu_server(sfu_server))
        .map(|ws: warp::ws::Ws, sfu_server: Arc<SfuServer>| {
            ws.on_upgrade(move |websocket| {
                sfu_websocket::handle_sfu_websocket(websocket, sfu_server)
            })
        })
}

pub fn sfu_health_check(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("sfu" / "health")
        .and(warp::get())
        .and(with_sfu_server(sfu_server))
        .map(|sfu_server: Arc<SfuServer>| {
            let status = match sfu_server.health() {
                EngineHealth::Healthy => "healthy",
                EngineHealth::Degraded => "degraded",
            };
            warp::reply::json(&serde_json::json!({
                "status": status,
                "service": "SFU Server",
                "version": env!("CARGO_PKG_VERSION"),
                "rooms": sfu_server.registry().room_count(),
                "activeRecordings": sfu_server.recordings().active_count(),
            }))
        })
}

pub fn sfu_config_endpoint(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("sfu" / "config")
        .and(warp::get())
        .and(with_sfu_server(sfu_server))
        .map(|sfu_server: Arc<SfuServer>| {
            let recording = &sfu_server.config().recording;
            warp::reply::json(&serde_json::json!({
                "routerRtpCapabilities": codecs::router_capabilities(),
                "recording": {
                    "enabled": recording.enabled,
                    "format": recording.format.extension(),
                },
            }))
        })
}

pub fn recordings_list(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("sfu" / "recordings")
        .and(warp::get())
        .and(with_sfu_server(sfu_server))
        .map(|sfu_server: Arc<SfuServer>| {
            warp::reply::json(&serde_json::json!({
                "recordings": sfu_server.recordings().list_all(),
            }))
        })
}

pub fn recording_download(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("sfu" / "recordings" / String / "download")
        .and(warp::get())
        .and(with_sfu_server(sfu_server))
        .and_then(download_recording)
}

pub fn recording_delete(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("sfu" / "recordings" / String)
        .and(warp::delete())
        .and(with_sfu_server(sfu_server))
        .and_then(delete_recording)
}

async fn download_recording(
    recording_id: String,
    sfu_server: Arc<SfuServer>,
) -> Result<Response<Body>, Infallible> {
    let Some(session) = sfu_server.recordings().get(&recording_id) else {
        return Ok(error_response(&SfuError::RecordingNotFound(recording_id)));
    };
    if session.status != RecordingStatus::Completed {
        return Ok(json_response(
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": format!("Recording {} is {}", session.id, session.status),
                "code": ErrorKind::Conflict,
            }),
        ));
    }

    match tokio::fs::read(&session.file_path).await {
        Ok(bytes) => {
            let file_name = std::path::Path::new(&session.file_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| session.id.clone());
            let content_type = if file_name.ends_with(".mp4") {
                "video/mp4"
            } else {
                "video/webm"
            };
            tracing::info!(recording_id = %session.id, bytes = bytes.len(), "Serving recording download");
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name),
                )
                .body(Body::from(bytes))
                .unwrap_or_else(|_| Response::new(Body::empty())))
        }
        Err(e) => {
            tracing::error!(recording_id = %session.id, error = %e, "Failed to read recording file");
            Ok(error_response(&SfuError::Io(e)))
        }
    }
}

async fn delete_recording(
    recording_id: String,
    sfu_server: Arc<SfuServer>,
) -> Result<Response<Body>, Infallible> {
    match sfu_server.delete_recording(&recording_id).await {
        Ok(session) => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "deleted": session.id }),
        )),
        Err(e) => Ok(error_response(&e)),
    }
}

fn status_for(error: &SfuError) -> StatusCode {
    match error {
        SfuError::RecordingNotFound(_) | SfuError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        _ => match error.kind() {
            ErrorKind::Validation | ErrorKind::Capability => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Resource => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_response(error: &SfuError) -> Response<Body> {
    json_response(
        status_for(error),
        serde_json::json!({
            "error": error.to_string(),
            "code": error.kind(),
        }),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn with_sfu_server(
    sfu_server: Arc<SfuServer>,
) -> impl Filter<Extract = (Arc<SfuServer>,), Error = Infallible> + Clone {
    warp::any().map(move || sfu_server.clone())
}
