//! Publishing built archives to a storage gateway.
//!
//! Each archive listed in `archives.json` is posted to
//! `<endpoint>/v1/archives/<content id>`; the gateway answers `{"url": ...}`
//! and that URL is recorded on the descriptor. Descriptors that already carry
//! a URL are skipped, so a partly failed run can simply be repeated.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::{Body, Client};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::ArchiveDescriptor;
use crate::error::{OnboardError, Result, UploadError};
use crate::pack::pipeline::{descriptors_path, read_descriptors, write_descriptors};

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

pub struct Uploader {
    base: String,
    token: Option<String>,
    client: Client,
}

impl Uploader {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, UploadError> {
        if endpoint.trim().is_empty() {
            return Err(UploadError::MissingEndpoint);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Unavailable(e.to_string()))?;
        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Stream one archive to the gateway and return the URL it was given.
    pub fn upload(&self, d: &ArchiveDescriptor) -> std::result::Result<String, UploadError> {
        let unreadable = |source| UploadError::ArchiveUnreadable {
            path: d.archive_path.clone(),
            source,
        };
        let file = File::open(&d.archive_path).map_err(unreadable)?;
        let len = file.metadata().map_err(unreadable)?.len();

        let mut req = self
            .client
            .post(format!("{}/v1/archives/{}", self.base, d.content_id))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(file, len));
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let resp = req
            .send()
            .map_err(|e| UploadError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Refused {
                status: status.as_u16(),
                message: resp.text().unwrap_or_default(),
            });
        }
        let body: UploadResponse = resp
            .json()
            .map_err(|e| UploadError::BadResponse(e.to_string()))?;
        if body.url.trim().is_empty() {
            return Err(UploadError::BadResponse("empty url".into()));
        }
        Ok(body.url)
    }
}

#[derive(Debug)]
pub struct UploadFailure {
    pub archive: PathBuf,
    pub error: UploadError,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: usize,
    /// Descriptors that already had a URL.
    pub skipped: usize,
    pub failures: Vec<UploadFailure>,
    pub descriptors: Vec<ArchiveDescriptor>,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.descriptors.len()
    }

    pub fn into_result(self) -> Result<Vec<ArchiveDescriptor>> {
        if self.failures.is_empty() {
            Ok(self.descriptors)
        } else {
            Err(OnboardError::UploadIncomplete {
                failed: self.failures.len(),
                total: self.total(),
            })
        }
    }
}

/// Upload every archive listed in `<out_dir>/archives.json` that has no URL
/// yet. The listing is rewritten after each success.
pub fn upload_dir(out_dir: &Path, uploader: &Uploader) -> Result<UploadReport> {
    let listing = descriptors_path(out_dir);
    let mut report = UploadReport {
        descriptors: read_descriptors(&listing)?,
        ..UploadReport::default()
    };

    for i in 0..report.descriptors.len() {
        let d = &report.descriptors[i];
        if d.upload_url.is_some() {
            report.skipped += 1;
            continue;
        }
        match uploader.upload(d) {
            Ok(url) => {
                info!(content_id = %d.content_id, %url, bytes = d.byte_size, "archive uploaded");
                report.descriptors[i].upload_url = Some(url);
                report.uploaded += 1;
                write_descriptors(&listing, &report.descriptors)?;
            }
            Err(error) => {
                warn!(archive = %d.archive_path.display(), %error, "upload failed");
                report.failures.push(UploadFailure {
                    archive: d.archive_path.clone(),
                    error,
                });
            }
        }
    }
    Ok(report)
}
