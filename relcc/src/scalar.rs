//! The element-type tag for diagrams and blocks.
//!
//! Per the design notes, element type is a two-way switch (real/complex) applied at block
//! granularity rather than a virtual dispatch: every kernel is generic over [`Scalar`] and the
//! registry stores diagrams behind a small `Real`/`Complex` tagged enum (see
//! [`crate::diagram::AnyDiagram`]).

use ndarray::LinalgScalar;
use num_complex::Complex64;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::ops::Neg;

/// Numeric element type usable inside a [`crate::block::BlockDict`].
///
/// Implemented for `f64` (real mode) and [`Complex64`] (complex mode). `conj` is the identity for
/// real numbers; `re` extracts the real part (used by `scalar_product`, which per the source
/// always reduces to a real number even in complex mode).
pub trait Scalar:
    LinalgScalar + Neg<Output = Self> + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync
{
    /// Complex conjugate (identity in real mode).
    fn conj(self) -> Self;
    /// Real part.
    fn re(self) -> f64;
    /// Absolute value (modulus in complex mode).
    fn modulus(self) -> f64;
    /// Lift a real number into this scalar type.
    fn from_f64(x: f64) -> Self;
}

impl Scalar for f64 {
    fn conj(self) -> Self {
        self
    }

    fn re(self) -> f64 {
        self
    }

    fn modulus(self) -> f64 {
        self.abs()
    }

    fn from_f64(x: f64) -> Self {
        x
    }
}

impl Scalar for Complex64 {
    fn conj(self) -> Self {
        Complex64::conj(&self)
    }

    fn re(self) -> f64 {
        self.re
    }

    fn modulus(self) -> f64 {
        self.norm()
    }

    fn from_f64(x: f64) -> Self {
        Complex64::new(x, 0.0)
    }
}
