//! Append-only vector storage with tombstones.
//!
//! # Storage Format
//!
//! - Header (16 bytes): magic `CMPV`, format version, dimension, slot count
//! - Slots: live flag (u8), id length (u16), id bytes, `dimension` f32 values
//!
//! All integers and floats are little-endian. Vectors are stored normalized,
//! so the inner product of two stored vectors is their cosine similarity.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use compass_embeddings::{normalize, top_k};
use tracing::debug;

use crate::error::{IndexError, Result};

/// Current blob format version.
pub const FORMAT_VERSION: u32 = 1;

const MAGIC_BYTES: &[u8; 4] = b"CMPV";
const HEADER_SIZE: usize = 16;
const BYTES_PER_F32: usize = 4;

/// Position of a vector in the store.
pub type Slot = u32;

#[derive(Debug, Clone, PartialEq)]
struct SlotRecord {
    chunk_id: String,
    live: bool,
    vector: Vec<f32>,
}

/// Flat vector store searched exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStore {
    dimension: usize,
    slots: Vec<SlotRecord>,
    tombstones: usize,
}

impl VectorStore {
    /// Create an empty store.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            slots: Vec::new(),
            tombstones: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Slots ever written and not yet compacted away.
    pub fn stored_count(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Fraction of stored slots that are tombstoned.
    pub fn tombstone_ratio(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            self.tombstones as f64 / self.slots.len() as f64
        }
    }

    /// Append a vector and return its slot.
    pub fn push(&mut self, chunk_id: &str, vector: &[f32]) -> Result<Slot> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let slot = Slot::try_from(self.slots.len())
            .map_err(|_| IndexError::InvalidInput("vector store is full".to_string()))?;

        let mut normalized = vector.to_vec();
        normalize(&mut normalized);
        self.slots.push(SlotRecord {
            chunk_id: chunk_id.to_string(),
            live: true,
            vector: normalized,
        });
        Ok(slot)
    }

    /// Mark a slot dead. Returns whether it was live.
    pub fn tombstone(&mut self, slot: Slot) -> bool {
        match self.slots.get_mut(slot as usize) {
            Some(record) if record.live => {
                record.live = false;
                self.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop slots at or past `len`, undoing pushes that were never committed.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len >= self.slots.len() {
            return;
        }
        let dropped_dead = self.slots[len..].iter().filter(|r| !r.live).count();
        self.slots.truncate(len);
        self.tombstones -= dropped_dead;
    }

    pub fn is_live(&self, slot: Slot) -> bool {
        self.slots.get(slot as usize).is_some_and(|r| r.live)
    }

    /// Chunk id stored at a slot, live or not.
    pub fn chunk_id(&self, slot: Slot) -> Option<&str> {
        self.slots.get(slot as usize).map(|r| r.chunk_id.as_str())
    }

    /// Live slots with their chunk ids.
    pub fn live_slots(&self) -> impl Iterator<Item = (Slot, &str)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.live)
            .map(|(slot, r)| (slot as Slot, r.chunk_id.as_str()))
    }

    /// The `k` live slots closest to `query`, best first.
    ///
    /// When `allowed` is given only those slots are considered.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        allowed: Option<&HashSet<Slot>>,
    ) -> Result<Vec<(Slot, f32)>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut query = query.to_vec();
        normalize(&mut query);

        let scored = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.live)
            .map(|(slot, r)| (slot as Slot, r))
            .filter(|(slot, _)| allowed.is_none_or(|set| set.contains(slot)))
            .map(|(slot, r)| (slot, inner_product(&query, &r.vector)));

        Ok(top_k(scored, k))
    }

    /// Drop tombstoned slots. Returns `(chunk_id, new_slot)` for every live entry.
    pub fn compact(&mut self) -> Vec<(String, Slot)> {
        let before = self.slots.len();
        self.slots.retain(|r| r.live);
        self.tombstones = 0;
        debug!("Compacted vector store from {before} to {} slots", self.slots.len());

        self.slots
            .iter()
            .enumerate()
            .map(|(slot, r)| (r.chunk_id.clone(), slot as Slot))
            .collect()
    }

    /// Serialize to the blob format.
    pub fn encode(&self) -> Vec<u8> {
        let per_slot = 3 + self.dimension * BYTES_PER_F32;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.slots.len() * (per_slot + 64));
        out.extend_from_slice(MAGIC_BYTES);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());

        for record in &self.slots {
            out.push(u8::from(record.live));
            let id = record.chunk_id.as_bytes();
            out.extend_from_slice(&(id.len() as u16).to_le_bytes());
            out.extend_from_slice(id);
            for value in &record.vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    /// Parse the blob format, checking version and dimension.
    pub fn decode(bytes: &[u8], expected_dimension: usize) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };

        if reader.take(4)? != MAGIC_BYTES {
            return Err(IndexError::Corruption("bad magic bytes".to_string()));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(IndexError::Corruption(format!(
                "unsupported vector format version {version}"
            )));
        }
        let dimension = reader.u32()? as usize;
        if dimension != expected_dimension {
            return Err(IndexError::Corruption(format!(
                "vector dimension {dimension} does not match {expected_dimension}"
            )));
        }
        let count = reader.u32()? as usize;

        let mut slots = Vec::with_capacity(count.min(bytes.len() / (dimension * BYTES_PER_F32).max(1)));
        let mut tombstones = 0;
        for _ in 0..count {
            let live = match reader.take(1)?[0] {
                0 => false,
                1 => true,
                other => {
                    return Err(IndexError::Corruption(format!("bad live flag {other}")));
                }
            };
            let id_len = reader.u16()? as usize;
            let chunk_id = std::str::from_utf8(reader.take(id_len)?)
                .map_err(|e| IndexError::Corruption(format!("chunk id is not utf-8: {e}")))?
                .to_string();
            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                vector.push(reader.f32()?);
            }
            if !live {
                tombstones += 1;
            }
            slots.push(SlotRecord {
                chunk_id,
                live,
                vector,
            });
        }
        if reader.pos != bytes.len() {
            return Err(IndexError::Corruption("trailing bytes after last slot".to_string()));
        }

        Ok(Self {
            dimension,
            slots,
            tombstones,
        })
    }

    /// Load from `path`; `None` when the file does not exist.
    pub fn load(path: &Path, expected_dimension: usize) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => Self::decode(&bytes, expected_dimension).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path` through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!("Saved {} vectors to {}", self.slots.len(), path.display());
        Ok(())
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| IndexError::Corruption("vector blob is truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn f32(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(f32::from_le_bytes(buf))
    }
}
