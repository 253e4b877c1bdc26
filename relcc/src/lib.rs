#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! `relcc` is a diagrammatic amplitude solver for relativistic Fock-space multireference
//! coupled cluster theory.
//!
//! It consumes pre-sorted one- and two-electron integral diagrams over a partitioned spinor
//! index space and iteratively solves the coupled-cluster amplitude equations of each Fock-space
//! sector `(h, p)`, producing converged cluster amplitudes and an effective-Hamiltonian operator
//! per sector. Parsing molecular input, integral generation/sorting, and diagonalising the
//! effective Hamiltonian are external collaborators this crate treats as opaque services.

pub mod block;
pub mod catalogue;
pub mod diagram;
pub mod diis;
pub mod driver;
pub mod error;
pub mod kernels;
pub mod options;
pub mod persistence;
pub mod registry;
pub mod scalar;
pub mod sector;
pub mod spinor;
pub mod symmetry;

pub use error::{Error, Result};
