use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{Encoder, RestoredFile, UnitPayload};
use crate::error::BuildError;
use crate::pack::chunker::PackingUnit;

/// Client for an encoder service exposing `POST /encode` and `POST /decode`.
///
/// Connection failures, timeouts and 5xx answers are reported as
/// [`BuildError::BackendUnavailable`] so the builder can retry them.
pub struct RemoteServiceEncoder {
    base: String,
    client: Client,
}

impl RemoteServiceEncoder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, BuildError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BuildError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    fn call(&self, route: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        let resp = self
            .client
            .post(format!("{}/{route}", self.base))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .map_err(|e| BuildError::BackendUnavailable(e.to_string()))?;
        let resp = check(resp)?;
        let bytes = resp
            .bytes()
            .map_err(|e| BuildError::BackendUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn check(resp: Response) -> Result<Response, BuildError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().unwrap_or_default();
    if status.is_server_error() {
        return Err(BuildError::BackendUnavailable(format!("{status}: {message}")));
    }
    Err(BuildError::Remote {
        status: status.as_u16(),
        message,
    })
}

impl Encoder for RemoteServiceEncoder {
    fn encode(&self, unit: &PackingUnit, out: &mut dyn Write) -> Result<u64, BuildError> {
        let payload = UnitPayload::from_unit(unit)?;
        let archive = self.call("encode", "application/cbor", payload.to_cbor()?)?;
        out.write_all(&archive)?;
        debug!(unit = unit.index, bytes = archive.len(), url = %self.base, "remote encoded unit");
        Ok(archive.len() as u64)
    }

    fn decode(&self, archive: &Path, dest: &Path) -> Result<Vec<RestoredFile>, BuildError> {
        let bytes = fs::read(archive)?;
        let payload = self.call("decode", "application/octet-stream", bytes)?;
        UnitPayload::from_cbor(&payload)?.write_to(dest)
    }
}
