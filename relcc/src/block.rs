//! The block dictionary: a diagram's dense symmetry blocks, keyed by the tuple of
//! irreps carried by its external lines, with on-disk spill and LRU residency control.

use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::symmetry::Irrep;
use ndarray::ArrayD;
use rustc_hash::FxHashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Key into a [`BlockDict`]: the irrep carried by each external line, in line order.
pub type IrrepKey = Vec<Irrep>;

/// Where a diagram's blocks are expected to live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageMode {
    /// All blocks stay resident; never considered for LRU eviction.
    Memory,
    /// Blocks may be spilled to `path` under LRU pressure.
    Disk,
}

enum Residency<S> {
    Resident(ArrayD<S>),
    /// Spilled to the diagram's backing file at the given byte offset and length.
    Spilled { offset: u64, len: u64, shape: Vec<usize> },
}

/// A single symmetry block together with its residency state.
struct Entry<S> {
    residency: Residency<S>,
}

/// Dense sub-tensors of one diagram, keyed by external-line irrep tuple.
pub struct BlockDict<S> {
    entries: FxHashMap<IrrepKey, Entry<S>>,
    /// Canonical iteration order (insertion order of first `put`), kept so that serialisation is
    /// byte-identical across runs on the same input.
    key_order: Vec<IrrepKey>,
    mode: StorageMode,
    backing_path: Option<PathBuf>,
}

impl<S: Scalar> BlockDict<S> {
    /// An empty block dictionary in the given storage mode.
    #[must_use]
    pub fn new(mode: StorageMode, backing_path: Option<PathBuf>) -> Self {
        Self {
            entries: FxHashMap::default(),
            key_order: Vec::new(),
            mode,
            backing_path,
        }
    }

    /// Storage mode this dictionary was created with.
    #[must_use]
    pub const fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Number of blocks (resident or spilled).
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_order.len()
    }

    /// Whether the dictionary has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_order.is_empty()
    }

    /// Irrep-tuple keys in canonical (insertion) order.
    #[must_use]
    pub fn keys(&self) -> &[IrrepKey] {
        &self.key_order
    }

    /// Approximate resident byte footprint.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|e| match &e.residency {
                Residency::Resident(a) => a.len() * std::mem::size_of::<S>(),
                Residency::Spilled { .. } => 0,
            })
            .sum()
    }

    /// Creates or replaces the block at `key`. Always makes it resident.
    pub fn put(&mut self, key: IrrepKey, block: ArrayD<S>) {
        if !self.entries.contains_key(&key) {
            self.key_order.push(key.clone());
        }
        self.entries.insert(key, Entry { residency: Residency::Resident(block) });
    }

    /// Looks up a block, loading it from the backing file if it is currently spilled. Returns
    /// `None` if no block exists for this key (a structural zero, per invariant I1 those keys are
    /// never materialised at all).
    pub fn get(&mut self, key: &IrrepKey) -> Result<Option<&ArrayD<S>>> {
        self.ensure_loaded(key)?;
        Ok(match self.entries.get(key) {
            Some(Entry { residency: Residency::Resident(a) }) => Some(a),
            _ => None,
        })
    }

    /// Mutable lookup; loads from disk first if necessary.
    pub fn get_mut(&mut self, key: &IrrepKey) -> Result<Option<&mut ArrayD<S>>> {
        self.ensure_loaded(key)?;
        Ok(match self.entries.get_mut(key) {
            Some(Entry { residency: Residency::Resident(a) }) => Some(a),
            _ => None,
        })
    }

    fn ensure_loaded(&mut self, key: &IrrepKey) -> Result<()> {
        let needs_load = matches!(
            self.entries.get(key),
            Some(Entry { residency: Residency::Spilled { .. } })
        );
        if !needs_load {
            return Ok(());
        }
        let Some(Entry { residency: Residency::Spilled { offset, len, shape } }) =
            self.entries.get(key)
        else {
            unreachable!()
        };
        let (offset, len, shape) = (*offset, *len, shape.clone());
        let path = self.backing_path.as_ref().ok_or_else(|| Error::Storage {
            path: "<no backing file>".into(),
            source: std::io::Error::other("spilled block has no backing file"),
        })?;

        let mut file = std::fs::File::open(path).map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;
        file.seek(SeekFrom::Start(offset)).map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;
        let values: Vec<S> = bincode::deserialize(&buf).map_err(|source| Error::Codec {
            path: path.display().to_string(),
            source,
        })?;
        let array = ArrayD::from_shape_vec(shape, values).map_err(|e| Error::ShapeMismatch {
            op: "block::load",
            detail: e.to_string(),
        })?;
        self.entries.insert(key.clone(), Entry { residency: Residency::Resident(array) });
        Ok(())
    }

    /// Writes the block at `key` to the backing file (if dirty/resident) and drops it from
    /// memory. No-op if the block is already spilled or the dictionary is in [`StorageMode::Memory`].
    pub fn unload(&mut self, key: &IrrepKey) -> Result<()> {
        if self.mode == StorageMode::Memory {
            return Ok(());
        }
        let Some(entry) = self.entries.get(key) else { return Ok(()) };
        let Residency::Resident(array) = &entry.residency else { return Ok(()) };

        let path = self.backing_path.as_ref().ok_or_else(|| Error::Storage {
            path: "<no backing file>".into(),
            source: std::io::Error::other("disk-mode diagram has no backing file"),
        })?;
        let shape = array.shape().to_vec();
        let values: Vec<S> = array.iter().copied().collect();
        let bytes = bincode::serialize(&values).map_err(|source| Error::Codec {
            path: path.display().to_string(),
            source,
        })?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::Storage { path: path.display().to_string(), source })?;
        let offset = file.stream_position().map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;
        file.write_all(&bytes).map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;

        self.entries.insert(
            key.clone(),
            Entry { residency: Residency::Spilled { offset, len: bytes.len() as u64, shape } },
        );
        Ok(())
    }

    /// Iterates blocks in canonical key order, loading each from disk on demand.
    pub fn enumerate(&mut self) -> Result<Vec<(IrrepKey, &ArrayD<S>)>> {
        let keys = self.key_order.clone();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.ensure_loaded(&key)?;
            if let Some(Entry { residency: Residency::Resident(a) }) = self.entries.get(&key) {
                out.push((key, a));
            }
        }
        Ok(out)
    }

    /// Like [`Self::enumerate`] but returns owned clones, so the dictionary's borrow ends before
    /// the caller builds a new diagram from the result (used by kernels that read two diagrams
    /// at once, e.g. `mult`).
    pub fn enumerate_cloned(&mut self) -> Result<Vec<(IrrepKey, ArrayD<S>)>> {
        Ok(self.enumerate()?.into_iter().map(|(k, a)| (k, a.clone())).collect())
    }

    /// Removes every block and, if the dictionary spills to disk, deletes the backing file.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.key_order.clear();
        if let Some(path) = &self.backing_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Assign a backing file path (used when a diagram's storage mode is switched to disk after
    /// creation, e.g. by the driver for huge T3 amplitudes).
    pub fn set_backing_path(&mut self, path: PathBuf) {
        self.backing_path = Some(path);
    }

    /// The configured backing file path, if any.
    #[must_use]
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use tempfile::tempdir;

    #[test]
    fn put_get_roundtrip_in_memory() {
        let mut dict: BlockDict<f64> = BlockDict::new(StorageMode::Memory, None);
        let key = vec![Irrep(0), Irrep(0)];
        dict.put(key.clone(), arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let block = dict.get(&key).unwrap().unwrap();
        assert_eq!(block[[0, 1]], 2.0);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn spill_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diagram.blk");
        let mut dict: BlockDict<f64> = BlockDict::new(StorageMode::Disk, Some(path));
        let key = vec![Irrep(1), Irrep(1)];
        dict.put(key.clone(), arr2(&[[5.0, 6.0], [7.0, 8.0]]).into_dyn());
        dict.unload(&key).unwrap();
        let block = dict.get(&key).unwrap().unwrap();
        assert_eq!(block[[1, 0]], 7.0);
    }

    #[test]
    fn missing_key_is_a_structural_zero() {
        let mut dict: BlockDict<f64> = BlockDict::new(StorageMode::Memory, None);
        assert!(dict.get(&vec![Irrep(0)]).unwrap().is_none());
    }
}
