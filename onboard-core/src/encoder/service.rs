//! HTTP face of [`LocalEncoder`], the counterpart of [`super::RemoteServiceEncoder`].

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LocalEncoder, UnitPayload};
use crate::error::BuildError;

type Reply = Result<Vec<u8>, (StatusCode, String)>;

pub fn router(encoder: LocalEncoder) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/encode", post(encode))
        .route("/decode", post(decode))
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::new(encoder))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    encoder: LocalEncoder,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "encoder service listening");
    axum::serve(listener, router(encoder))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn refuse(e: BuildError) -> (StatusCode, String) {
    warn!(error = %e, "encoder request refused");
    let status = match e {
        BuildError::Format(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, e.to_string())
}

async fn run_blocking<F>(f: F) -> Reply
where
    F: FnOnce() -> Result<Vec<u8>, BuildError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res.map_err(refuse),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn encode(State(enc): State<Arc<LocalEncoder>>, body: Bytes) -> Reply {
    run_blocking(move || {
        let payload = UnitPayload::from_cbor(&body)?;
        let mut out = Vec::new();
        enc.encode_payload(&payload, &mut out)?;
        Ok(out)
    })
    .await
}

async fn decode(State(enc): State<Arc<LocalEncoder>>, body: Bytes) -> Reply {
    run_blocking(move || enc.decode_payload(&body)?.to_cbor()).await
}
