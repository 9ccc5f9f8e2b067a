use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
    pub u_size: u64,
    pub codec: u8,
    pub c_size: u64,
    /// Offset of the encoded bytes, relative to the start of the data section.
    pub data_off: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Meta {
    pub tool: String,
}

/// Archive table of contents. Carries no wall-clock time so equal units encode
/// to equal bytes.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub parent_path: Option<String>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub dirs: Vec<DirEntry>,
    pub meta: Meta,
}

pub const TOOL: &str = "onboard-core/obar-v1";
