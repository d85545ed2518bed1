//! HTTP surface: `/init`, `/part` and `/thumbnail`.
//!
//! `/part` doubles as the session's life sign: it carries the client's
//! reported playback position in `X-Playback-Position`, an optional skip
//! request in `X-Skip-Song`, and returns encoded audio with queued metadata
//! events URI-encoded in `X-Metadata`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/init", get(init))
        .route("/part", get(part))
        .route("/thumbnail", get(thumbnail))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> crate::error::Result<()> {
    let addr = &state.settings.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on {addr}");
    state.sessions.start_watchdog();
    axum::serve(listener, router(state))
        .await
        .map_err(ServerError::Io)?;
    Ok(())
}

#[derive(Deserialize)]
struct InitQuery {
    collection: String,
    #[serde(rename = "numChannels", default = "default_channels")]
    num_channels: u16,
}

fn default_channels() -> u16 {
    2
}

async fn init(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InitQuery>,
) -> Result<Response, ServerError> {
    let session = state
        .sessions
        .create_session(&query.collection, query.num_channels)
        .await?;
    Ok(Json(serde_json::json!({ "sid": session.sid })).into_response())
}

#[derive(Deserialize)]
struct PartQuery {
    sid: String,
    // Cache-buster; unused.
    #[serde(default)]
    #[allow(dead_code)]
    id: String,
}

async fn part(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PartQuery>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let session = state
        .sessions
        .get(&query.sid)
        .ok_or_else(|| ServerError::UnknownSession(query.sid.clone()))?;

    let position = headers
        .get("x-playback-position")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);
    let skip = headers
        .get("x-skip-song")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let (audio, events) = session.life_sign(position, skip.as_deref()).await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if !events.is_empty() {
        let json = serde_json::to_string(&events)
            .map_err(|e| ServerError::BadRequest(format!("event serialization: {e}")))?;
        response = response.header("X-Metadata", urlencoding::encode(&json).into_owned());
    }
    response
        .body(Body::from(audio))
        .map_err(|e| ServerError::BadRequest(e.to_string()))
}

#[derive(Deserialize)]
struct ThumbnailQuery {
    sid: String,
    song: String,
}

async fn thumbnail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, ServerError> {
    let session = state
        .sessions
        .get(&query.sid)
        .ok_or_else(|| ServerError::UnknownSession(query.sid.clone()))?;
    let bytes = session.thumbnail(&query.song).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::UnknownCollection(_)
            | ServerError::UnknownSession(_)
            | ServerError::UnknownTrack(_)
            | ServerError::EmptyCatalog(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::SessionClosed => StatusCode::GONE,
            ServerError::Encoder(_) | ServerError::Worker(_) | ServerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(
            ServerError::UnknownSession("x".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::SessionClosed.into_response().status(),
            StatusCode::GONE
        );
    }

    #[test]
    fn metadata_header_is_uri_encoded_json() {
        let events = vec![crate::session::events::Event::NextSong {
            song_name: "A & B".into(),
        }];
        let json = serde_json::to_string(&events).unwrap();
        let encoded = urlencoding::encode(&json).into_owned();
        assert!(!encoded.contains('&'));
        assert!(!encoded.contains('"'));

        let decoded = urlencoding::decode(&encoded).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(parsed[0]["type"], "NEXT_SONG");
        assert_eq!(parsed[0]["songName"], "A & B");
    }
}
