//! TOML configuration.
//!
//! Loaded once at startup into an immutable [`Config`] and handed to each
//! component. Every field has a default, so an empty file (or none) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::DispatchOptions;
use crate::error::ConfigError;
use crate::pack::builder::BuildOptions;
use crate::pack::chunker::{ChunkOptions, DEFAULT_SLICE_SIZE};
use crate::pack::pipeline::PackOptions;
use crate::task::assembler::DEFAULT_MAX_COPY_NUMBER;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sender: SenderSection,
    pub encoder: EncoderSection,
    pub market: MarketSection,
    pub store: StoreSection,
    pub upload: UploadSection,
    pub log: LogSection,
}

/// `[sender]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderSection {
    /// Archives, `archives.json` and exported tasks go here.
    pub output_dir: PathBuf,
    /// Upper bound on the input bytes of one archive.
    pub slice_size_limit: u64,
    /// Add an MD5 of each archive to its descriptor.
    pub generate_checksum: bool,
    /// Concurrent archive builds.
    pub parallelism: usize,
    /// Replication target of auto-dispatched pieces.
    pub max_copy_number: u32,
    /// Keep the input directory's name as the top level of restored trees.
    pub parent_path: bool,
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp/tasks"),
            slice_size_limit: DEFAULT_SLICE_SIZE,
            generate_checksum: true,
            parallelism: 5,
            max_copy_number: DEFAULT_MAX_COPY_NUMBER,
            parent_path: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    #[default]
    Local,
    Remote,
}

/// `[encoder]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub backend: EncoderBackend,
    /// Base URL of the encoder service, e.g. `http://10.0.0.5:7070`.
    pub remote_url: Option<String>,
    pub compression_level: i32,
    pub min_gain: f32,
    pub request_timeout_secs: u64,
    /// Extra attempts when the backend is unreachable.
    pub build_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            backend: EncoderBackend::Local,
            remote_url: None,
            compression_level: 3,
            min_gain: 0.05,
            request_timeout_secs: 600,
            build_retries: 2,
            retry_delay_ms: 2000,
        }
    }
}

impl EncoderSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `[market]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketSection {
    pub api_url: String,
    /// Bearer token for the market API.
    pub access_token: Option<String>,
    pub deal_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_rounds: u32,
    pub piece_concurrency: usize,
}

impl Default for MarketSection {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8090".to_string(),
            access_token: None,
            deal_timeout_secs: 120,
            poll_interval_secs: 60,
            max_rounds: 8,
            piece_concurrency: 4,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Directory of the task store.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/tasks/store"),
        }
    }
}

/// `[upload]` section. Archives are posted to `<endpoint>/v1/archives/<content id>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub endpoint: Option<String>,
    pub access_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_token: None,
            timeout_secs: 600,
        }
    }
}

impl UploadSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Read and validate `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunk_options().validate()?;
        if self.sender.max_copy_number == 0 {
            return Err(ConfigError::InvalidReplicationTarget(0));
        }
        let has_url = self
            .encoder
            .remote_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        if self.encoder.backend == EncoderBackend::Remote && !has_url {
            return Err(ConfigError::MissingRemoteUrl);
        }
        Ok(())
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            slice_size_limit: self.sender.slice_size_limit,
            parallelism: self.sender.parallelism,
            parent_path: self.sender.parent_path,
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            out_dir: self.sender.output_dir.clone(),
            generate_checksum: self.sender.generate_checksum,
            build_retries: self.encoder.build_retries,
            retry_delay: Duration::from_millis(self.encoder.retry_delay_ms),
        }
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            chunk: self.chunk_options(),
            build: self.build_options(),
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            deal_timeout: Duration::from_secs(self.market.deal_timeout_secs),
            poll_interval: Duration::from_secs(self.market.poll_interval_secs),
            max_rounds: self.market.max_rounds,
            piece_concurrency: self.market.piece_concurrency,
        }
    }
}
