//! Solver configuration: the CLI-facing, TOML-deserialisable settings record.
//!
//! `SolverOptions` is the `serde`-deserialisable record the CLI loads from TOML, following the
//! `SubgridParams`-style `Default` impl used throughout this crate.

use crate::sector::Sector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The coupled-cluster model: which triples diagrams (if any) are active, and at what
/// perturbative order. Mirrors EXP-T's `cc_model` tag.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum CcModel {
    /// CCSD: no triples.
    #[default]
    Ccsd,
    /// CCSD with a non-iterative perturbative triples correction, evaluated once after CCSD
    /// converges.
    CcsdT3,
    /// CCSDT-1: leading iterative triples terms only.
    CcsdtA,
    /// CCSDT-2: CCSDT-1 plus the `T1`-`T3` coupling terms omitted there.
    CcsdtB,
    /// CCSDT-3: all terms through third order in perturbation theory.
    CcsdtC,
    /// Full CCSDT: every triples diagram, regardless of perturbative order.
    Ccsdt,
}

impl CcModel {
    /// The lowest perturbative order at which this model includes triples, or `None` for CCSD
    /// (no triples at all). Used by [`PtOrder::selected_by`] to build the canonical per-diagram
    /// selection table (one selection table, not ad-hoc per-diagram `if` cascades).
    #[must_use]
    pub const fn triples_floor(self) -> Option<PtOrder> {
        match self {
            Self::Ccsd => None,
            Self::CcsdT3 => None,
            Self::CcsdtA => Some(PtOrder::Second),
            Self::CcsdtB => Some(PtOrder::Third),
            Self::CcsdtC => Some(PtOrder::Third),
            Self::Ccsdt => Some(PtOrder::Second),
        }
    }

    /// Whether a non-iterative perturbative triples correction should be evaluated once after
    /// the CCSD amplitudes converge.
    #[must_use]
    pub const fn has_noniterative_triples(self) -> bool {
        matches!(self, Self::CcsdT3)
    }
}

/// Perturbation-theory order tag used to select which triples diagrams participate in a given
/// residual evaluation. `Inf` means "every term, full coupled cluster".
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PtOrder {
    /// Second order.
    Second,
    /// Third order.
    Third,
    /// Fourth order.
    Fourth,
    /// Full CC: no truncation (`PT_INF`).
    Inf,
}

impl PtOrder {
    /// Whether a diagram tagged with `self` as its lowest contributing PT order is selected when
    /// the residual is evaluated at `requested` order (diagrams tagged at or below the requested
    /// order are included; `Inf` selects everything).
    #[must_use]
    pub fn selected_by(self, requested: Self) -> bool {
        requested == Self::Inf || self <= requested
    }
}

/// Per-sector damping schedule: blend `(1 - alpha) * new + alpha * old` through iteration
/// `stop_iteration`, then switch to undamped updates.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DampingSchedule {
    /// Damping factor `alpha` in `[0, 1)`.
    pub alpha: f64,
    /// Last iteration (inclusive) at which damping is applied.
    pub stop_iteration: usize,
}

impl Default for DampingSchedule {
    fn default() -> Self {
        Self { alpha: 0.0, stop_iteration: 0 }
    }
}

/// Per-sector convergence and extrapolation controls.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SectorOptions {
    /// Residual `diffmax` tolerance for convergence.
    pub tolerance: f64,
    /// Maximum iteration count before the sector is declared [`crate::error::Error::NotConverged`].
    pub maxiter: usize,
    /// Maximum number of DIIS vectors retained (`DIIS_MAX`); `0` disables DIIS entirely.
    pub diis_max_dim: usize,
    /// First iteration (1-based) at which DIIS extrapolation is attempted.
    pub diis_start_iteration: usize,
    /// Damping schedule.
    pub damping: DampingSchedule,
    /// Whether amplitudes of this sector spill to disk (`StorageMode::Disk`) rather than stay
    /// resident (used for huge `T3` amplitudes).
    pub force_disk_storage: bool,
    /// Flush amplitudes/H_eff to disk every `flush_every` iterations; `0` disables
    /// periodic flushing (only the final converged state is written).
    pub flush_every: usize,
}

impl Default for SectorOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            maxiter: 50,
            diis_max_dim: 5,
            diis_start_iteration: 2,
            damping: DampingSchedule::default(),
            force_disk_storage: false,
            flush_every: 0,
        }
    }
}

/// Top-level solver configuration, `serde`-deserialisable from the CLI's TOML input.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SolverOptions {
    /// The coupled-cluster model selecting which triples diagrams are active.
    pub model: CcModel,
    /// Per-sector options, keyed by `"<h>h<p>p"` (e.g. `"0h0p"`); sectors absent from this map
    /// use [`SectorOptions::default`].
    pub sectors: HashMap<String, SectorOptions>,
    /// Sectors to solve, in the order given; each must precede its dependents in
    /// [`crate::sector::Sector::solve_order`].
    pub requested_sectors: Vec<(u8, u8)>,
    /// Global resident-block memory budget in bytes.
    pub memory_budget: usize,
    /// Whether amplitudes/H_eff are real (`false`) or complex (`true`, fully relativistic
    /// Kramers-unrestricted runs).
    pub complex_amplitudes: bool,
    /// Restart converged amplitudes from a previous run's flushed `.dg` files, if present.
    pub restart_from_disk: bool,
    /// Directory amplitude/H_eff files are read from and written to.
    pub work_dir: std::path::PathBuf,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            model: CcModel::default(),
            sectors: HashMap::new(),
            requested_sectors: vec![(0, 0)],
            memory_budget: 1 << 30,
            complex_amplitudes: false,
            restart_from_disk: false,
            work_dir: std::path::PathBuf::from("."),
        }
    }
}

impl SolverOptions {
    /// Options for `sector`, falling back to [`SectorOptions::default`] if unconfigured.
    #[must_use]
    pub fn sector_options(&self, sector: Sector) -> SectorOptions {
        self.sectors.get(&format!("{sector}")).copied().unwrap_or_default()
    }

    /// Validates cross-field configuration constraints.
    ///
    /// # Errors
    ///
    /// [`crate::error::Error::Configuration`] if a requested sector is not one of the sectors
    /// this engine implements.
    pub fn validate(&self) -> crate::error::Result<()> {
        let order = Sector::solve_order();
        for &(h, p) in &self.requested_sectors {
            let sector = Sector::new(h, p);
            if !order.contains(&sector) {
                return Err(crate::error::Error::Configuration(format!(
                    "sector {sector} is not one of the sectors this engine implements"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pt_order_selection() {
        assert!(PtOrder::Second.selected_by(PtOrder::Inf));
        assert!(PtOrder::Second.selected_by(PtOrder::Third));
        assert!(!PtOrder::Third.selected_by(PtOrder::Second));
    }

    #[test]
    fn default_sector_options_are_reasonable() {
        let opts = SectorOptions::default();
        assert!(opts.tolerance < 1e-6);
        assert!(opts.maxiter > 0);
    }

    #[test]
    fn validate_rejects_unknown_sector() {
        let mut opts = SolverOptions { requested_sectors: vec![(9, 9)], ..SolverOptions::default() };
        assert!(opts.validate().is_err());
        opts.requested_sectors = vec![(0, 0)];
        assert!(opts.validate().is_ok());
    }
}
