//! Bootstrap snapshot chunk encoding.
//!
//! Rows are framed one JSON object per line, gzip-compressed; the content
//! hash is SHA-256 over the compressed bytes and doubles as the HTTP ETag.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use syncular_db::SnapshotRow;
use syncular_schemas::{PartitionId, ScopeMap, SnapshotChunk};

pub const CHUNK_ENCODING: &str = "ndjson";
pub const CHUNK_COMPRESSION: &str = "gzip";

/// One framed row inside a chunk body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRow {
    pub row_id: String,
    pub row_json: serde_json::Value,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub chunk: SnapshotChunk,
    pub row_count: i64,
}

pub fn encode_chunk(
    partition: &PartitionId,
    table: &str,
    rows: &[SnapshotRow],
    ttl_secs: i64,
) -> Result<EncodedChunk> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for row in rows {
        let framed = ChunkRow {
            row_id: row.row_id.clone(),
            row_json: row.row_json.clone(),
            row_version: row.row_version,
            scopes: row.scopes.clone(),
        };
        let line = serde_json::to_vec(&framed).context("chunk row encode failed")?;
        encoder.write_all(&line).context("chunk write failed")?;
        encoder.write_all(b"\n").context("chunk write failed")?;
    }
    let body = encoder.finish().context("chunk gzip finish failed")?;

    let mut hasher = Sha256::new();
    hasher.update(&body);
    let sha256 = hex::encode(hasher.finalize());

    Ok(EncodedChunk {
        chunk: SnapshotChunk {
            chunk_id: Uuid::new_v4().to_string(),
            partition_id: partition.clone(),
            table: table.to_string(),
            sha256,
            encoding: CHUNK_ENCODING.to_string(),
            compression: CHUNK_COMPRESSION.to_string(),
            byte_length: body.len() as i64,
            body,
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        },
        row_count: rows.len() as i64,
    })
}

/// Inverse of [`encode_chunk`], used by tests and diagnostics.
pub fn decode_chunk_rows(body: &[u8]) -> Result<Vec<ChunkRow>> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .context("chunk gunzip failed")?;

    text.lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).context("chunk row decode failed"))
        .collect()
}
