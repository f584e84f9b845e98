//! Transfer protocol control messages.
//!
//! These travel as JSON text frames on the direct peer channel, interleaved
//! with raw binary chunks. The shapes are fixed by the wire protocol:
//!
//! - `{ "multiFileMeta": true, "total": n }` opens a batch,
//! - `{ "name": ..., "size": ... }` announces one file,
//! - `{ "type": "EOF" }` closes one file.
//!
//! Chunk ordering carries no sequence numbers; it relies entirely on the
//! transport's in-order delivery contract.

use serde::{Deserialize, Serialize};

/// Batch header: how many files the sender will transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHeader {
    /// Always `true` on the wire; distinguishes the shape from [`FileMeta`].
    pub multi_file_meta: bool,
    pub total: u32,
}

/// Per-file metadata preceding that file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
}

/// Strict match for `{ "type": "EOF" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EofTag {
    #[serde(rename = "EOF")]
    Eof,
}

/// The explicit end-of-file marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndMarker {
    #[serde(rename = "type")]
    tag: EofTag,
}

/// A parsed transfer control message.
///
/// The wire shapes share no tag field, so parsing is by shape: the batch
/// header requires `multiFileMeta`, the end marker requires `"type":"EOF"`,
/// and anything with `name`/`size` is file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Batch(BatchHeader),
    Eof(EndMarker),
    FileMeta(FileMeta),
}

impl ControlMessage {
    pub fn batch(total: u32) -> Self {
        Self::Batch(BatchHeader {
            multi_file_meta: true,
            total,
        })
    }

    pub fn file_meta(name: impl Into<String>, size: u64) -> Self {
        Self::FileMeta(FileMeta {
            name: name.into(),
            size,
        })
    }

    pub fn eof() -> Self {
        Self::Eof(EndMarker { tag: EofTag::Eof })
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof(_))
    }

    /// Serializes to the wire JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a text frame received on the channel.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
