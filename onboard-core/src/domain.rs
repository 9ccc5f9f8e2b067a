// onboard_core/src/domain.rs
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pack::chunker::PackingUnit;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s.trim())?))
            }
        }
    };
}

uuid_id!(TaskId);
uuid_id!(PieceId);

/// Storage provider identifier, e.g. `f01234`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterpartyId(String);

impl CounterpartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Blank or whitespace-only ids are treated as "not set".
    pub fn parse_opt(id: Option<&str>) -> Option<Self> {
        id.map(str::trim).filter(|s| !s.is_empty()).map(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterpartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// blake3 digest of an archive's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl FromStr for ContentId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub content_id: ContentId,
    pub byte_size: u64,
    pub unit: PackingUnit,
    /// MD5 of the archive bytes, when checksum generation is enabled.
    pub aux_checksum: Option<String>,
    pub archive_path: PathBuf,
    /// Where the archive was published by `upload`, once it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Auto,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceStatus {
    New,
    Dispatching,
    PartiallySatisfied,
    Satisfied,
    Failed,
}

impl PieceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PieceStatus::Satisfied | PieceStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub piece_id: PieceId,
    pub task_id: TaskId,
    pub archive: ArchiveDescriptor,
    pub replication_target: u32,
    pub current_replicas: BTreeSet<CounterpartyId>,
    pub status: PieceStatus,
    /// Pre-seeded counterparty for manual dispatch.
    pub target_counterparty: Option<CounterpartyId>,
}

impl Piece {
    pub fn remaining_slots(&self) -> usize {
        (self.replication_target as usize).saturating_sub(self.current_replicas.len())
    }

    pub fn is_satisfied(&self) -> bool {
        self.current_replicas.len() >= self.replication_target as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub dataset_label: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub mode: DispatchMode,
    pub pieces: Vec<Piece>,
}

impl Task {
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.status.is_terminal())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealOutcome {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl DealOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DealOutcome::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealAttempt {
    pub piece_id: PieceId,
    pub counterparty: CounterpartyId,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
    pub outcome: DealOutcome,
}

impl DealAttempt {
    pub fn pending(piece_id: PieceId, counterparty: CounterpartyId) -> Self {
        Self {
            piece_id,
            counterparty,
            attempted_at: OffsetDateTime::now_utc(),
            outcome: DealOutcome::Pending,
        }
    }

    /// The resolution record for this attempt; shares `attempted_at`.
    pub fn resolve(&self, outcome: DealOutcome) -> Self {
        Self {
            outcome,
            ..self.clone()
        }
    }
}
