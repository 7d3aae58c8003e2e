//! Chunked file transfer.
//!
//! A file larger than one chunk travels as several File packets sharing a
//! transfer id. Each chunk's `uniq` is `"<id>:<index>:<total>"` with a
//! 1-based index. The receiver writes every chunk at its offset in
//! `<files_dir>/<id>` and keeps the chunk total and the indices seen so far
//! in `<files_dir>/<id>.meta`, so chunks may arrive in any order.

use crate::error::HubError;
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use vxproto_types::{File, Packet, Payload};

/// Size of one file chunk on the wire.
pub const FILE_CHUNK_SIZE: usize = 100 * 1024;
/// Largest chunk count a transfer may announce (just under 1 GiB).
pub const MAX_FILE_CHUNKS: u64 = 10_000;

/// Position of one chunk inside a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkId {
    pub transfer_id: String,
    pub index: u64,
    pub total: u64,
}

impl ChunkId {
    pub fn to_uniq(&self) -> String {
        format!("{}:{}:{}", self.transfer_id, self.index, self.total)
    }

    /// Parses a `uniq` field, rejecting ids that are not safe file names.
    pub fn parse(uniq: &str) -> Result<Self, HubError> {
        let bad = || HubError::BadChunk(uniq.to_string());
        let mut parts = uniq.rsplitn(3, ':');
        let total = parts.next().and_then(|s| s.parse::<u64>().ok()).ok_or_else(bad)?;
        let index = parts.next().and_then(|s| s.parse::<u64>().ok()).ok_or_else(bad)?;
        let transfer_id = parts.next().ok_or_else(bad)?;

        let safe_id = !transfer_id.is_empty()
            && transfer_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !safe_id || total == 0 || total > MAX_FILE_CHUNKS || index == 0 || index > total {
            return Err(bad());
        }
        Ok(Self {
            transfer_id: transfer_id.to_string(),
            index,
            total,
        })
    }

    /// Byte offset of this chunk inside the assembled file.
    pub fn offset(&self) -> Result<u64, HubError> {
        (self.index - 1)
            .checked_mul(FILE_CHUNK_SIZE as u64)
            .ok_or_else(|| HubError::BadChunk(self.to_uniq()))
    }
}

/// Number of chunks a payload of `len` bytes is split into. Empty files
/// still travel as one chunk.
pub fn chunk_count(len: usize) -> u64 {
    len.div_ceil(FILE_CHUNK_SIZE).max(1) as u64
}

/// Splits a file payload into chunk packets addressed to `dst`. Every chunk
/// of an upgrader artifact carries the `upgrader` flag.
pub fn split_file(module: &str, dst: &str, name: &str, data: &[u8], upgrader: bool) -> Vec<Packet> {
    let transfer_id = uuid::Uuid::new_v4().simple().to_string();
    let total = chunk_count(data.len());
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(FILE_CHUNK_SIZE).collect()
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let id = ChunkId {
                transfer_id: transfer_id.clone(),
                index: i as u64 + 1,
                total,
            };
            Packet::new(
                module,
                dst,
                Payload::File(File {
                    data: chunk.to_vec(),
                    name: name.to_string(),
                    uniq: id.to_uniq(),
                    upgrader,
                    ..File::default()
                }),
            )
        })
        .collect()
}

/// Reassembles incoming chunked transfers on disk.
#[derive(Debug)]
pub struct FileAssembler {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileAssembler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Feeds a packet through reassembly.
    ///
    /// Packets that are not chunked files are returned unchanged. A chunk
    /// that does not complete its transfer is acknowledged and swallowed
    /// (`Ok(None)`). The chunk that completes it comes back with `path` set
    /// to the assembled file and `data` cleared.
    pub async fn accept(&self, mut packet: Packet) -> Result<Option<Packet>, HubError> {
        let uniq = match &packet.payload {
            Payload::File(file) if !file.uniq.is_empty() => file.uniq.clone(),
            _ => return Ok(Some(packet)),
        };
        let chunk = ChunkId::parse(&uniq)?;
        let offset = chunk.offset()?;
        if packet.bytes().len() > FILE_CHUNK_SIZE {
            return Err(HubError::BadChunk(format!(
                "{}: {} bytes exceed the chunk size",
                uniq,
                packet.bytes().len()
            )));
        }

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(&chunk.transfer_id);
        let meta_path = self.dir.join(format!("{}.meta", chunk.transfer_id));

        let (total, mut received): (u64, BTreeSet<u64>) = match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| HubError::BadChunk(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (chunk.total, BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };
        if total != chunk.total {
            return Err(HubError::BadChunk(format!(
                "{}: transfer announced {} chunks",
                uniq, total
            )));
        }

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await?;
        out.seek(SeekFrom::Start(offset)).await?;
        out.write_all(packet.bytes()).await?;
        out.flush().await?;

        received.insert(chunk.index);

        if (received.len() as u64) < total {
            let raw = serde_json::to_vec(&(total, &received)).map_err(|e| HubError::BadChunk(e.to_string()))?;
            tokio::fs::write(&meta_path, raw).await?;
            tracing::trace!(
                transfer_id = %chunk.transfer_id,
                received = received.len(),
                total = chunk.total,
                "file chunk stored"
            );
            packet.set_ack();
            return Ok(None);
        }

        match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Payload::File(file) = &mut packet.payload {
            file.path = path.to_string_lossy().into_owned();
            file.data.clear();
        }
        tracing::debug!(transfer_id = %chunk.transfer_id, path = %path.display(), "file transfer complete");
        Ok(Some(packet))
    }
}
