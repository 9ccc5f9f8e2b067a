#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod error;
pub mod tree;

pub mod util {
    pub mod hash_forward;
}

pub mod codec;

pub mod container {
    pub mod manifest;
    pub mod superblock;
    pub mod tail;
}

pub mod encoder;

pub mod pack {
    pub mod builder;
    pub mod chunker;
    pub mod pipeline;
}

pub mod read {
    pub mod restore;
}

pub mod task {
    pub mod assembler;
}

pub mod dispatch;
pub mod store;
pub mod upload;

// Re-exports: stable API surface
pub use config::Config;
pub use dispatch::{DealMarket, DealTracker, DispatchOptions, Dispatcher, HttpDealMarket, RunMode};
pub use domain::{ArchiveDescriptor, DispatchMode, Piece, PieceStatus, Task, TaskId};
pub use encoder::{Backend, Encoder, LocalEncoder, RemoteServiceEncoder};
pub use error::{OnboardError, Result};
pub use pack::builder::{BuildOptions, PackReport, build, build_all};
pub use pack::chunker::{ChunkOptions, PackingUnit, chunk};
pub use pack::pipeline::{PackOptions, pack_tree, read_descriptors};
pub use read::restore::{RestoreReport, restore};
pub use store::{FileStore, MemoryStore, Store};
pub use task::assembler::{TaskParams, assemble};
pub use tree::InputTree;
pub use upload::{UploadReport, Uploader, upload_dir};
