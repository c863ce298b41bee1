//! Content-addressed block fragmentation.
//!
//! A block is serialized once and split into fixed-size parts. Every part
//! carries a Merkle inclusion proof keyed by its 2-byte big-endian index, so
//! a receiver can verify each part individually against the part-set hash
//! before the whole block has arrived. The set is reconstructable from any
//! complete permutation of parts.

use {
    crate::bit_array::BitArray,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_sha256_hasher::hashv,
    std::io::{self, Write},
    thiserror::Error,
};

/// Default target payload size of a single part.
pub const DEFAULT_BLOCK_PART_SIZE: usize = 100 * 1024;

// Domain separation between leaves and interior nodes.
const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

/// Errors from the part-set receive path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range (count {count})")]
    InvalidIndex { index: u16, count: u16 },
    #[error("part {0} already added")]
    AlreadyAdded(u16),
    #[error("proof for part {0} does not match the part set hash")]
    ProofMismatch(u16),
}

/// Identity of a part set: part count plus the Merkle root over all parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetId {
    pub count: u16,
    pub hash: Hash,
}

/// A [`PartSetId`] with a 16-bit application datum packed next to the count
/// in a single 32-bit word for wire compatibility. The datum carries the
/// NTS vote count of the block the set encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetIdAndAppData {
    pub count: u16,
    pub app_data: u16,
    pub hash: Hash,
}

impl PartSetIdAndAppData {
    pub fn new(id: PartSetId, app_data: u16) -> Self {
        Self {
            count: id.count,
            app_data,
            hash: id.hash,
        }
    }

    pub fn id(&self) -> PartSetId {
        PartSetId {
            count: self.count,
            hash: self.hash,
        }
    }

    /// The packed 32-bit word: app data in the high half, count in the low.
    pub fn word(&self) -> u32 {
        (self.app_data as u32) << 16 | self.count as u32
    }

    pub fn from_word(word: u32, hash: Hash) -> Self {
        Self {
            count: word as u16,
            app_data: (word >> 16) as u16,
            hash,
        }
    }
}

/// A single verifiable fragment of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    index: u16,
    proof: Vec<Hash>,
    data: Vec<u8>,
}

impl Part {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// First proof hash; cache key component for parts whose set is not
    /// known yet. Single-part sets have no proof and anchor on default.
    pub fn proof_anchor(&self) -> Hash {
        self.proof.first().copied().unwrap_or_default()
    }

    /// Verify this part's inclusion proof against a part-set identity.
    pub fn verify(&self, id: &PartSetId) -> Result<(), PartSetError> {
        if self.index >= id.count {
            return Err(PartSetError::InvalidIndex {
                index: self.index,
                count: id.count,
            });
        }
        let leaf = leaf_hash(self.index, &self.data);
        match root_from_proof(self.index, id.count, leaf, &self.proof) {
            Some(root) if root == id.hash => Ok(()),
            _ => Err(PartSetError::ProofMismatch(self.index)),
        }
    }
}

fn leaf_hash(index: u16, data: &[u8]) -> Hash {
    hashv(&[LEAF_PREFIX, &index.to_be_bytes(), data])
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    hashv(&[NODE_PREFIX, left.as_ref(), right.as_ref()])
}

/// Recompute the root implied by `proof` for the leaf at `index` in a tree
/// of `count` leaves. Unpaired nodes at the end of a level are carried up
/// unchanged, so the verifier walks the same level widths as the builder.
fn root_from_proof(index: u16, count: u16, leaf: Hash, proof: &[Hash]) -> Option<Hash> {
    let mut idx = index as usize;
    let mut level_len = count as usize;
    let mut acc = leaf;
    let mut used = 0usize;
    while level_len > 1 {
        let sibling = idx ^ 1;
        if sibling < level_len {
            let sib = proof.get(used)?;
            used += 1;
            acc = if idx % 2 == 0 {
                node_hash(&acc, sib)
            } else {
                node_hash(sib, &acc)
            };
        }
        idx /= 2;
        level_len = level_len.div_ceil(2);
    }
    (used == proof.len()).then_some(acc)
}

/// A block's parts, either fully built (send path) or under streaming
/// assembly (receive path).
#[derive(Debug, Clone)]
pub struct PartSet {
    count: u16,
    hash: Hash,
    parts: Vec<Option<Part>>,
    mask: BitArray,
}

impl PartSet {
    /// Create an empty set that will accept parts proving against `id`.
    pub fn from_id(id: &PartSetId) -> Self {
        Self {
            count: id.count,
            hash: id.hash,
            parts: vec![None; id.count as usize],
            mask: BitArray::new(id.count as usize),
        }
    }

    pub fn id(&self) -> PartSetId {
        PartSetId {
            count: self.count,
            hash: self.hash,
        }
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Presence mask over part indices.
    pub fn mask(&self) -> &BitArray {
        &self.mask
    }

    pub fn part(&self, index: u16) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        self.mask.count() == self.count as usize
    }

    /// Add a received part after verifying its proof.
    pub fn add_part(&mut self, part: Part) -> Result<(), PartSetError> {
        if part.index >= self.count {
            return Err(PartSetError::InvalidIndex {
                index: part.index,
                count: self.count,
            });
        }
        if self.mask.get(part.index as usize) {
            return Err(PartSetError::AlreadyAdded(part.index));
        }
        part.verify(&self.id())?;
        let idx = part.index as usize;
        self.mask.set(idx);
        self.parts[idx] = Some(part);
        Ok(())
    }

    /// Concatenate all parts in index order. `None` until complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.data);
        }
        Some(out)
    }
}

/// Streams block bytes into parts, then seals them into a [`PartSet`].
pub struct PartSetBuffer {
    part_size: usize,
    chunks: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl PartSetBuffer {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size,
            chunks: Vec::new(),
            current: Vec::new(),
        }
    }

    /// Seal the buffer: build the Merkle tree over all parts and attach an
    /// inclusion proof to each.
    pub fn part_set(mut self) -> PartSet {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
        let count = self.chunks.len() as u16;

        // Leaves, then successive levels with odd tails carried up.
        let mut levels: Vec<Vec<Hash>> = Vec::new();
        let leaves: Vec<Hash> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, data)| leaf_hash(i as u16, data))
            .collect();
        levels.push(leaves);
        while levels
            .last()
            .map(|level| level.len() > 1)
            .unwrap_or(false)
        {
            let prev = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            for pair in prev.chunks(2) {
                match pair {
                    [l, r] => next.push(node_hash(l, r)),
                    [odd] => next.push(*odd),
                    _ => unreachable!(),
                }
            }
            levels.push(next);
        }
        let hash = levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default();

        let mut parts = Vec::with_capacity(count as usize);
        let mut mask = BitArray::new(count as usize);
        for (i, data) in self.chunks.into_iter().enumerate() {
            let mut proof = Vec::new();
            let mut idx = i;
            for level in &levels[..levels.len().saturating_sub(1)] {
                let sibling = idx ^ 1;
                if sibling < level.len() {
                    proof.push(level[sibling]);
                }
                idx /= 2;
            }
            mask.set(i);
            parts.push(Some(Part {
                index: i as u16,
                proof,
                data,
            }));
        }

        PartSet {
            count,
            hash,
            parts,
            mask,
        }
    }
}

impl Write for PartSetBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.part_size - self.current.len();
            let take = room.min(rest.len());
            self.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.current.len() == self.part_size {
                self.chunks.push(std::mem::take(&mut self.current));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Convenience: fragment `data` into a sealed part set.
pub fn part_set_from_bytes(part_size: usize, data: &[u8]) -> PartSet {
    let mut buf = PartSetBuffer::new(part_size);
    // Writing to a Vec-backed buffer cannot fail.
    let _ = buf.write(data);
    buf.part_set()
}
