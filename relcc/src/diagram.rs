//! Diagrams: named, ranked tensors over spinor indices, stored as symmetry blocks.

use crate::block::{BlockDict, IrrepKey, StorageMode};
use crate::scalar::Scalar;
use crate::spinor::ClassLetter;
use num_complex::Complex64;
use std::path::PathBuf;

/// A line-order permutation. `order[i]` is the original line position now occupying slot `i`.
/// The identity permutation for rank `r` is `(0..r).collect()`.
pub type Order = Vec<usize>;

/// A diagram: line classes, valence mask, current line order, uniqueness flag, and its blocks.
pub struct Diagram<S> {
    /// Registry-unique name.
    pub name: String,
    /// Class letter required on each external line, in canonical (creation) order.
    pub classes: Vec<ClassLetter>,
    /// Per-line flag: whether that line is restricted to active spinors.
    pub valence_mask: Vec<bool>,
    /// Current index permutation relative to the canonical `classes` order (invariant I3).
    pub order: Order,
    /// Whether only one representative per anti-symmetrisation class is stored (invariant I2).
    pub perm_unique: bool,
    /// The block dictionary.
    pub blocks: BlockDict<S>,
}

impl<S: Scalar> Diagram<S> {
    /// Allocates a zero diagram. `storage_path` is required when `mode` is
    /// [`StorageMode::Disk`].
    #[must_use]
    pub fn new(
        name: String,
        classes: Vec<ClassLetter>,
        valence_mask: Vec<bool>,
        order: Order,
        perm_unique: bool,
        mode: StorageMode,
        storage_path: Option<PathBuf>,
    ) -> Self {
        let rank = classes.len();
        debug_assert_eq!(valence_mask.len(), rank);
        debug_assert_eq!(order.len(), rank);
        Self {
            name,
            classes,
            valence_mask,
            order,
            perm_unique,
            blocks: BlockDict::new(mode, storage_path),
        }
    }

    /// Rank (number of external lines) of this diagram.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.classes.len()
    }

    /// Whether the current `order` is the identity permutation (invariant I4 precondition).
    #[must_use]
    pub fn is_canonical_order(&self) -> bool {
        self.order.iter().enumerate().all(|(i, &o)| i == o)
    }

    /// Structural copy of metadata and blocks from `self` into a fresh diagram with name `dst`.
    #[must_use]
    pub fn structural_copy(&mut self, dst: String) -> crate::error::Result<Self> {
        let mut copy = Self::new(
            dst,
            self.classes.clone(),
            self.valence_mask.clone(),
            self.order.clone(),
            self.perm_unique,
            self.blocks.mode(),
            self.blocks.backing_path().map(std::path::Path::to_path_buf),
        );
        for (key, block) in self.blocks.enumerate()? {
            copy.blocks.put(key, block.clone());
        }
        Ok(copy)
    }
}

/// Dispatch tag selecting a diagram's element type: tagged variants, not OO dispatch. Every
/// kernel matches on this once per call and then runs a generic
/// implementation over [`Scalar`].
pub enum AnyDiagram {
    /// Real (`f64`) amplitudes/integrals.
    Real(Diagram<f64>),
    /// Complex (`Complex64`) amplitudes/integrals, used in fully relativistic (Kramers-unrestricted)
    /// runs.
    Complex(Diagram<Complex64>),
}

impl AnyDiagram {
    /// The diagram's registry name, regardless of element type.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Real(d) => &d.name,
            Self::Complex(d) => &d.name,
        }
    }

    /// Rank, regardless of element type.
    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Real(d) => d.rank(),
            Self::Complex(d) => d.rank(),
        }
    }

    /// Class letters, regardless of element type.
    #[must_use]
    pub fn classes(&self) -> &[ClassLetter] {
        match self {
            Self::Real(d) => &d.classes,
            Self::Complex(d) => &d.classes,
        }
    }

    /// Total number of stored blocks across the full dictionary.
    #[must_use]
    pub fn block_count(&self) -> usize {
        match self {
            Self::Real(d) => d.blocks.len(),
            Self::Complex(d) => d.blocks.len(),
        }
    }

    /// Unwraps as real, returning `None` if this diagram is complex.
    #[must_use]
    pub fn as_real(&self) -> Option<&Diagram<f64>> {
        match self {
            Self::Real(d) => Some(d),
            Self::Complex(_) => None,
        }
    }

    /// Mutable real unwrap.
    #[must_use]
    pub fn as_real_mut(&mut self) -> Option<&mut Diagram<f64>> {
        match self {
            Self::Real(d) => Some(d),
            Self::Complex(_) => None,
        }
    }

    /// Unwraps as complex, returning `None` if this diagram is real.
    #[must_use]
    pub fn as_complex(&self) -> Option<&Diagram<Complex64>> {
        match self {
            Self::Complex(d) => Some(d),
            Self::Real(_) => None,
        }
    }

    /// Mutable complex unwrap.
    #[must_use]
    pub fn as_complex_mut(&mut self) -> Option<&mut Diagram<Complex64>> {
        match self {
            Self::Complex(d) => Some(d),
            Self::Real(_) => None,
        }
    }
}

/// The irrep-tuple key type re-exported for catalogue routines that enumerate blocks directly.
pub type BlockKey = IrrepKey;
