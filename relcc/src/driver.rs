//! The solver driver: drives one Fock-space sector from its constant terms through
//! convergence, grounded on the iteration loop shared by every `examples/original_source/src/
//! methods/sector*.c` file (`calc_*` residual, fold, divide by denominators, `diffmax`/divergence
//! check, DIIS, damping, swap, periodic flush, `diag_heff`).
//!
//! A sector's equations are heterogeneous (some have one amplitude rank, some three; some fold a
//! lower sector's `H_eff`, some fold their own), so [`equations`] packages each sector's four
//! catalogue entry points behind one uniform closure signature and the iteration loop below stays
//! sector-agnostic.

use crate::catalogue;
use crate::diis::{DiisQueue, EnabledRanks};
use crate::error::{Error, Result};
use crate::kernels;
use crate::options::{CcModel, SectorOptions, SolverOptions};
use crate::persistence;
use crate::registry::Registry;
use crate::sector::Sector;
use crate::spinor::SpinorSpace;
use crate::symmetry::SymmetryTable;
use std::time::Instant;
use tracing::{info, info_span, warn};

/// `T1`-tier amplitude rank argument to [`Sector::amplitude_name`] and friends (singles, two
/// indices).
const T1: usize = 1;
/// `T2`-tier amplitude rank argument (doubles, four indices).
const T2: usize = 2;
/// `T3`-tier amplitude rank argument (triples, six indices).
const T3: usize = 3;

/// One line of the per-iteration progress table, mirroring the `" it.  diffmax(..)  ...  t,sec
/// mem,Gb"` line printed by every `sector*.c` driver.
#[derive(Clone, Debug)]
pub struct IterationReport {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Correlation energy at this iterate, if this sector carries one (only `(0, 0)`).
    pub energy: Option<f64>,
    /// `diffmax` of each active rank this iteration, in rank order.
    pub diffmax: Vec<(usize, f64)>,
    /// The largest amplitude magnitude this iteration (divergence-check input).
    pub max_amplitude: f64,
    /// Whether DIIS extrapolation was applied this iteration.
    pub diis_applied: bool,
    /// Wall-clock time spent in this iteration.
    pub elapsed: std::time::Duration,
}

/// Outcome of solving one sector to convergence.
#[derive(Clone, Debug)]
pub struct SectorReport {
    /// The sector that was solved.
    pub sector: Sector,
    /// One entry per completed iteration.
    pub iterations: Vec<IterationReport>,
    /// Correlation energy of the converged iterate, if this sector carries one.
    pub final_energy: Option<f64>,
}

/// A sector's four catalogue entry points, wrapped behind one signature so the iteration loop
/// doesn't need to know which ranks or which folding a given sector uses.
struct SectorEquations<'a> {
    ranks: &'a [usize],
    const_terms: Box<dyn Fn(&mut Registry) -> Result<()> + 'a>,
    calc_residual: Box<dyn Fn(&mut Registry, &SymmetryTable) -> Result<()> + 'a>,
    folded: Box<dyn Fn(&mut Registry, &SymmetryTable) -> Result<()> + 'a>,
    build_heff: Box<dyn Fn(&mut Registry, &SymmetryTable) -> Result<()> + 'a>,
    has_energy: bool,
}

/// Looks up the catalogue routines for `sector`, generalised to the shared closure signature
/// above. Mirrors the `#include "sectorXY.h"` dispatch a C driver would do at compile time; here
/// it's a runtime match over the eight implemented sectors.
fn equations<'a>(sector: Sector, model: CcModel) -> Result<SectorEquations<'a>> {
    let unused_symmetry = |f: fn(&mut Registry) -> Result<()>| {
        Box::new(move |r: &mut Registry, _s: &SymmetryTable| f(r)) as Box<dyn Fn(&mut Registry, &SymmetryTable) -> Result<()>>
    };
    match (sector.h, sector.p) {
        (0, 0) => Ok(SectorEquations {
            ranks: &[T1, T2],
            const_terms: Box::new(catalogue::const_terms_0h0p),
            calc_residual: Box::new(catalogue::calc_residual_0h0p),
            folded: unused_symmetry(catalogue::folded_0h0p),
            build_heff: Box::new(catalogue::build_heff_0h0p),
            has_energy: true,
        }),
        (0, 1) => Ok(SectorEquations {
            ranks: &[T1, T2],
            const_terms: Box::new(catalogue::const_terms_0h1p),
            calc_residual: Box::new(catalogue::calc_residual_0h1p),
            folded: unused_symmetry(catalogue::folded_0h1p),
            build_heff: unused_symmetry(catalogue::build_heff_0h1p),
            has_energy: false,
        }),
        (1, 0) => Ok(SectorEquations {
            ranks: &[T1, T2],
            const_terms: Box::new(catalogue::const_terms_1h0p),
            calc_residual: Box::new(catalogue::calc_residual_1h0p),
            folded: Box::new(catalogue::folded_1h0p),
            build_heff: unused_symmetry(catalogue::build_heff_1h0p),
            has_energy: false,
        }),
        (0, 2) => Ok(SectorEquations {
            ranks: &[T2],
            const_terms: Box::new(catalogue::const_terms_0h2p),
            calc_residual: Box::new(catalogue::calc_residual_0h2p),
            folded: Box::new(catalogue::folded_0h2p),
            build_heff: unused_symmetry(catalogue::build_heff_0h2p),
            has_energy: false,
        }),
        (2, 0) => Ok(SectorEquations {
            ranks: &[T2],
            const_terms: Box::new(catalogue::const_terms_2h0p),
            calc_residual: Box::new(catalogue::calc_residual_2h0p),
            folded: Box::new(catalogue::folded_2h0p),
            build_heff: unused_symmetry(catalogue::build_heff_2h0p),
            has_energy: false,
        }),
        (1, 1) => Ok(SectorEquations {
            ranks: &[T1, T2],
            const_terms: Box::new(catalogue::const_terms_1h1p),
            calc_residual: Box::new(catalogue::calc_residual_1h1p),
            folded: Box::new(catalogue::folded_1h1p),
            build_heff: unused_symmetry(catalogue::build_heff_1h1p),
            has_energy: false,
        }),
        (0, 3) => Ok(SectorEquations {
            ranks: &[T3],
            const_terms: Box::new(catalogue::const_terms_0h3p),
            calc_residual: Box::new(move |r: &mut Registry, s: &SymmetryTable| catalogue::calc_residual_0h3p(r, s, model)),
            folded: Box::new(catalogue::folded_0h3p),
            build_heff: unused_symmetry(catalogue::build_heff_0h3p),
            has_energy: false,
        }),
        (1, 2) => Ok(SectorEquations {
            ranks: &[T3],
            const_terms: Box::new(catalogue::const_terms_1h2p),
            calc_residual: Box::new(move |r: &mut Registry, s: &SymmetryTable| catalogue::calc_residual_1h2p(r, s, model)),
            folded: Box::new(catalogue::folded_1h2p),
            build_heff: unused_symmetry(catalogue::build_heff_1h2p),
            has_energy: false,
        }),
        _ => Err(Error::Configuration(format!("sector {sector} is not one of the sectors this engine implements"))),
    }
}

/// `init_amplitudes`, grounded on `init_amplitudes()` in `sector00.c`: restart from a
/// previous run's flushed amplitude file if one is present and requested, otherwise seed the
/// current amplitude of each active rank with its constant term divided by the orbital-energy
/// denominator (the MP2 guess).
fn init_amplitudes(
    registry: &mut Registry,
    spinors: &SpinorSpace,
    sector: Sector,
    ranks: &[usize],
    opts: &SolverOptions,
) -> Result<()> {
    for &rank in ranks {
        let amp = sector.amplitude_name(rank);
        if opts.restart_from_disk {
            let path = opts.work_dir.join(sector.amplitude_file(rank));
            if path.is_file() {
                persistence::read(registry, &path, Some(amp.as_str()))?;
                continue;
            }
        }
        let constant = sector.constant_name(rank);
        kernels::copy(registry, &constant, &amp)?;
        kernels::diveps(registry, &amp, spinors)?;
    }
    if opts.restart_from_disk {
        let heff_path = opts.work_dir.join(sector.heff_file());
        if heff_path.is_file() {
            let heff_name = sector.heff_name();
            persistence::read(registry, &heff_path, Some(heff_name.as_str()))?;
        }
    }
    Ok(())
}

/// Names DIIS needs for rank `rank` of `sector`, or `None` if `rank` isn't active there.
fn diis_pair(sector: Sector, ranks: &[usize], rank: usize) -> Option<(String, String)> {
    ranks.contains(&rank).then(|| (sector.residual_name(rank), sector.amplitude_name(rank)))
}

/// Solves `sector`'s amplitude equations to convergence (the `ITERATE` state), following
/// the fixed order `SORTING → CONST_TERMS → INIT_AMPLITUDES → ITERATE → CONVERGED|DIVERGED →
/// FLUSH → BUILD_HEFF`. Integrals and lower-sector `H_eff` diagrams are assumed already present in
/// `registry` (an external collaborator's responsibility); `SORTING` itself is out of
/// this crate's scope.
///
/// # Errors
///
/// [`Error::NumericalDivergence`] if any amplitude magnitude exceeds `1.0`;
/// [`Error::NotConverged`] if `maxiter` is exhausted first; propagates kernel/catalogue/storage
/// errors otherwise.
#[allow(clippy::too_many_lines)]
pub fn solve_sector(
    registry: &mut Registry,
    symmetry: &SymmetryTable,
    spinors: &SpinorSpace,
    sector: Sector,
    model: CcModel,
    opts: &SolverOptions,
) -> Result<SectorReport> {
    let sector_opts = opts.sector_options(sector);
    let eqs = equations(sector, model)?;
    let _span = info_span!("sector", sector = %sector, model = ?model).entered();

    (eqs.const_terms)(registry)?;
    init_amplitudes(registry, spinors, sector, eqs.ranks, opts)?;

    let enabled = EnabledRanks {
        t1: eqs.ranks.contains(&T1),
        t2: eqs.ranks.contains(&T2),
        t3: eqs.ranks.contains(&T3),
    };
    let mut diis = DiisQueue::new(enabled);

    let mut reports = Vec::with_capacity(sector_opts.maxiter);
    let mut converged = false;
    let mut last_residual = f64::INFINITY;
    let mut final_energy = None;

    for it in 1..=sector_opts.maxiter {
        let iter_start = Instant::now();

        (eqs.calc_residual)(registry, symmetry)?;
        (eqs.folded)(registry, symmetry)?;
        for &rank in eqs.ranks {
            kernels::diveps(registry, &sector.residual_name(rank), spinors)?;
        }

        let energy = if eqs.has_energy { Some(catalogue::correlation_energy(registry, symmetry)?) } else { None };

        let mut diffmax = Vec::with_capacity(eqs.ranks.len());
        let mut worst = 0.0_f64;
        let mut max_amplitude = 0.0_f64;
        for &rank in eqs.ranks {
            let d = kernels::diffmax(registry, &sector.amplitude_name(rank), &sector.residual_name(rank))?;
            diffmax.push((rank, d));
            worst = worst.max(d);
            let (m, _, _) = kernels::findmax(registry, &sector.residual_name(rank))?;
            max_amplitude = max_amplitude.max(m);
        }
        last_residual = worst;

        if max_amplitude > 1.0 {
            return Err(Error::NumericalDivergence { sector: sector.to_string(), iteration: it, max_amplitude });
        }

        let is_converged = worst < sector_opts.tolerance;

        let mut diis_applied = false;
        if sector_opts.diis_max_dim > 0 && diis.is_enabled() && it >= sector_opts.diis_start_iteration {
            let t1p = diis_pair(sector, eqs.ranks, T1);
            let t2p = diis_pair(sector, eqs.ranks, T2);
            let t3p = diis_pair(sector, eqs.ranks, T3);
            diis.put(
                registry,
                t1p.as_ref().map(|(n, _)| n.as_str()),
                t1p.as_ref().map(|(_, o)| o.as_str()),
                t2p.as_ref().map(|(n, _)| n.as_str()),
                t2p.as_ref().map(|(_, o)| o.as_str()),
                t3p.as_ref().map(|(n, _)| n.as_str()),
                t3p.as_ref().map(|(_, o)| o.as_str()),
            )?;
            diis.truncate(registry, sector_opts.diis_max_dim);
            diis_applied = diis.extrapolate(
                registry,
                t1p.as_ref().map(|(n, _)| n.as_str()),
                t2p.as_ref().map(|(n, _)| n.as_str()),
                t3p.as_ref().map(|(n, _)| n.as_str()),
            )?;
            if !diis.is_enabled() {
                warn!("{}", crate::diis::diis_disabled_warning(&sector.to_string()));
            }
        }

        if sector_opts.damping.alpha > 0.0 && it <= sector_opts.damping.stop_iteration {
            for &rank in eqs.ranks {
                let nw = sector.residual_name(rank);
                let cur = sector.amplitude_name(rank);
                kernels::update(registry, &nw, -sector_opts.damping.alpha, &nw)?;
                kernels::update(registry, &nw, sector_opts.damping.alpha, &cur)?;
            }
        }

        for &rank in eqs.ranks {
            kernels::copy(registry, &sector.residual_name(rank), &sector.amplitude_name(rank))?;
        }
        (eqs.build_heff)(registry, symmetry)?;

        if sector_opts.flush_every > 0 && it % sector_opts.flush_every == 0 {
            flush(registry, opts, sector, eqs.ranks)?;
        }

        let elapsed = iter_start.elapsed();
        info!(
            iteration = it,
            energy = energy,
            diffmax = worst,
            diis_applied,
            elapsed_ms = elapsed.as_secs_f64() * 1e3,
            resident_bytes = registry.resident_bytes(),
            "iteration"
        );
        reports.push(IterationReport { iteration: it, energy, diffmax, max_amplitude, diis_applied, elapsed });

        if is_converged {
            converged = true;
            final_energy = energy;
            break;
        }
    }

    if !converged {
        return Err(Error::NotConverged { sector: sector.to_string(), maxiter: sector_opts.maxiter, residual: last_residual });
    }

    flush(registry, opts, sector, eqs.ranks)?;
    Ok(SectorReport { sector, iterations: reports, final_energy })
}

/// Writes every active-rank amplitude and this sector's `H_eff` to `opts.work_dir`, per the
/// `<letter><rank>c.dg`/`veff<h><p>.dg` on-disk naming convention.
fn flush(registry: &mut Registry, opts: &SolverOptions, sector: Sector, ranks: &[usize]) -> Result<()> {
    std::fs::create_dir_all(&opts.work_dir)
        .map_err(|source| Error::Storage { path: opts.work_dir.display().to_string(), source })?;
    for &rank in ranks {
        let amp = sector.amplitude_name(rank);
        persistence::write(registry, &amp, &opts.work_dir.join(sector.amplitude_file(rank)))?;
    }
    if registry.get(&sector.heff_name()).is_some() {
        persistence::write(registry, &sector.heff_name(), &opts.work_dir.join(sector.heff_file()))?;
    }
    Ok(())
}

/// Solves every sector in `opts.requested_sectors`, in [`Sector::solve_order`] (each
/// sector's folded diagrams depend only on sectors solved earlier in this order).
///
/// # Errors
///
/// The first sector to fail propagates its error; later requested sectors are not attempted.
pub fn run(
    registry: &mut Registry,
    symmetry: &SymmetryTable,
    spinors: &SpinorSpace,
    opts: &SolverOptions,
) -> Result<Vec<SectorReport>> {
    opts.validate()?;
    let requested: std::collections::HashSet<Sector> =
        opts.requested_sectors.iter().map(|&(h, p)| Sector::new(h, p)).collect();

    let mut reports = Vec::new();
    for sector in Sector::solve_order() {
        if !requested.contains(&sector) {
            continue;
        }
        let report = solve_sector(registry, symmetry, spinors, sector, opts.model, opts)?;
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinor::{Occupancy, Spinor};
    use crate::symmetry::Irrep;

    fn toy_spinors() -> SpinorSpace {
        SpinorSpace::new(
            vec![
                Spinor { index: 0, energy: -1.0, irrep: Irrep(0), occupancy: Occupancy::Hole, active: true },
                Spinor { index: 1, energy: -0.9, irrep: Irrep(0), occupancy: Occupancy::Hole, active: true },
                Spinor { index: 2, energy: 0.5, irrep: Irrep(0), occupancy: Occupancy::Particle, active: true },
                Spinor { index: 3, energy: 0.6, irrep: Irrep(0), occupancy: Occupancy::Particle, active: true },
            ],
            2,
        )
    }

    #[test]
    fn unknown_sector_is_rejected() {
        assert!(equations(Sector::new(9, 9)).is_err());
    }

    #[test]
    fn diis_pair_reflects_active_ranks() {
        let sector = Sector::new(0, 2);
        assert!(diis_pair(sector, &[T2], T1).is_none());
        let (nw, old) = diis_pair(sector, &[T2], T2).unwrap();
        assert_eq!(nw, "x2nw");
        assert_eq!(old, "x2c");
    }

    #[test]
    fn run_rejects_unconfigured_sector_request() {
        let mut registry = Registry::new(1 << 20, None);
        let symmetry = SymmetryTable::abelian_product(&[1]);
        let spinors = toy_spinors();
        let opts = SolverOptions { requested_sectors: vec![(9, 9)], ..SolverOptions::default() };
        assert!(run(&mut registry, &symmetry, &spinors, &opts).is_err());
    }
}
