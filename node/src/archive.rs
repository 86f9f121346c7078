//! Backup archive container.
//!
//! ```text
//! magic "TLYA" | format u8 | flags u8 | header_len u32 LE | header JSON | body
//! ```
//!
//! The header is never encrypted, so archives can be listed and adopted
//! without a key. The body is the zstd-compressed JSON snapshot, sealed with
//! the archive key when the encrypted flag is set.

use crate::crypto::{self, SecretKey};
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tally_engine::{BranchId, CollectionName, NodeId, SchemaVersion, StoreSnapshot, Timestamp};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"TLYA";
pub const ARCHIVE_FORMAT_VERSION: u8 = 1;
pub const ARCHIVE_EXTENSION: &str = "tly";

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;
const PREFIX_LEN: usize = 4 + 1 + 1 + 4;
const MAX_HEADER_LEN: usize = 1 << 20;
const ZSTD_LEVEL: i32 = 3;

/// Descriptive metadata stored in clear at the front of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveHeader {
    pub name: String,
    pub created_at: Timestamp,
    /// Format of the snapshot inside the body
    pub snapshot_format: u32,
    pub schema_version: SchemaVersion,
    pub branch_id: BranchId,
    pub node_id: NodeId,
    pub collections: Vec<CollectionName>,
    pub document_count: usize,
    #[serde(default)]
    pub encrypted: bool,
}

impl ArchiveHeader {
    pub fn for_snapshot(name: impl Into<String>, snapshot: &StoreSnapshot, encrypted: bool) -> Self {
        Self {
            name: name.into(),
            created_at: snapshot.created_at,
            snapshot_format: snapshot.format_version,
            schema_version: snapshot.schema_version,
            branch_id: snapshot.branch_id.clone(),
            node_id: snapshot.node_id.clone(),
            collections: snapshot.collection_names(),
            document_count: snapshot.document_count(),
            encrypted,
        }
    }
}

/// Serialized snapshot body.
pub fn serialize(snapshot: &StoreSnapshot) -> Result<Vec<u8>> {
    Ok(snapshot.to_json()?)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(std::io::Cursor::new(bytes), ZSTD_LEVEL)
        .map_err(|e| StoreError::Serialization(format!("zstd encode failed: {e}")))
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(std::io::Cursor::new(bytes))
        .map_err(|e| StoreError::Serialization(format!("zstd decode failed: {e}")))
}

/// Frame a header and a (compressed, possibly sealed) body.
pub fn assemble(header: &ArchiveHeader, body: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| StoreError::Serialization("archive header too large".to_string()))?;

    let mut flags = FLAG_COMPRESSED;
    if header.encrypted {
        flags |= FLAG_ENCRYPTED;
    }

    let mut out = Vec::with_capacity(PREFIX_LEN + header_bytes.len() + body.len());
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.push(ARCHIVE_FORMAT_VERSION);
    out.push(flags);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(body);
    Ok(out)
}

/// Build a complete archive in one step.
pub fn encode(snapshot: &StoreSnapshot, name: &str, key: Option<&SecretKey>) -> Result<Vec<u8>> {
    let header = ArchiveHeader::for_snapshot(name, snapshot, key.is_some());
    let mut body = compress(&serialize(snapshot)?)?;
    if let Some(key) = key {
        body = crypto::seal(key, &body)?;
    }
    assemble(&header, &body)
}

/// Parsed framing of an archive.
#[derive(Debug)]
pub struct ArchiveView<'a> {
    pub format: u8,
    pub header: ArchiveHeader,
    compressed: bool,
    encrypted: bool,
    body: &'a [u8],
}

/// Parse the framing and header without touching the body.
pub fn read_header(bytes: &[u8]) -> Result<ArchiveView<'_>> {
    if bytes.len() < PREFIX_LEN || !bytes.starts_with(ARCHIVE_MAGIC) {
        return Err(StoreError::Validation("not a tally archive".to_string()));
    }
    let format = bytes[4];
    if format > ARCHIVE_FORMAT_VERSION {
        return Err(StoreError::Validation(format!(
            "unsupported archive format {format} (max supported: {ARCHIVE_FORMAT_VERSION})"
        )));
    }
    let flags = bytes[5];
    let header_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    if header_len > MAX_HEADER_LEN || PREFIX_LEN + header_len > bytes.len() {
        return Err(StoreError::Serialization("archive header is truncated".to_string()));
    }

    let header: ArchiveHeader =
        serde_json::from_slice(&bytes[PREFIX_LEN..PREFIX_LEN + header_len])?;
    Ok(ArchiveView {
        format,
        header,
        compressed: flags & FLAG_COMPRESSED != 0,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        body: &bytes[PREFIX_LEN + header_len..],
    })
}

impl ArchiveView<'_> {
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Decrypt and decompress the body back into a snapshot.
    pub fn snapshot(&self, key: Option<&SecretKey>) -> Result<StoreSnapshot> {
        let body = if self.encrypted {
            let key = key.ok_or_else(|| {
                StoreError::Crypto(format!(
                    "archive '{}' is encrypted and no key was provided",
                    self.header.name
                ))
            })?;
            crypto::open(key, self.body)?
        } else {
            self.body.to_vec()
        };
        let json = if self.compressed {
            decompress(&body)?
        } else {
            body
        };
        Ok(StoreSnapshot::from_json(&json)?)
    }
}

/// Decode a whole archive.
pub fn decode(bytes: &[u8], key: Option<&SecretKey>) -> Result<(ArchiveHeader, StoreSnapshot)> {
    let view = read_header(bytes)?;
    let snapshot = view.snapshot(key)?;
    Ok((view.header, snapshot))
}

/// Hex SHA-256 over the final archive bytes.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
