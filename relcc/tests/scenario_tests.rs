//! End-to-end scenarios, exercised through the public driver API rather than the catalogue
//! routines directly.

use relcc::block::StorageMode;
use relcc::diagram::AnyDiagram;
use relcc::driver;
use relcc::kernels::{self, ElementType};
use relcc::options::SolverOptions;
use relcc::persistence;
use relcc::registry::Registry;
use relcc::spinor::{ClassLetter, Occupancy, Spinor, SpinorSpace};
use relcc::symmetry::{Irrep, SymmetryTable};
use std::path::Path;

fn scenario_one() -> (SymmetryTable, SpinorSpace) {
    let symmetry = SymmetryTable::abelian_product(&[1]);
    let spinors = SpinorSpace::new(
        vec![
            Spinor { index: 0, energy: -0.5, irrep: Irrep(0), occupancy: Occupancy::Hole, active: false },
            Spinor { index: 0, energy: 0.5, irrep: Irrep(0), occupancy: Occupancy::Particle, active: false },
        ],
        2,
    );
    (symmetry, spinors)
}

fn empty(registry: &mut Registry, symmetry: &SymmetryTable, spinors: &SpinorSpace, name: &str, classes: &[ClassLetter]) {
    let mask = vec![false; classes.len()];
    kernels::tmplt(registry, symmetry, spinors, name, classes, &mask, None, true, ElementType::Real, StorageMode::Memory)
        .unwrap();
}

fn two_electron_integrals(registry: &mut Registry, symmetry: &SymmetryTable, spinors: &SpinorSpace) {
    use ClassLetter::{H, P};
    empty(registry, symmetry, spinors, "hp", &[H, P]);
    empty(registry, symmetry, spinors, "ph", &[P, H]);
    empty(registry, symmetry, spinors, "pp", &[P, P]);
    empty(registry, symmetry, spinors, "hh", &[H, H]);
    empty(registry, symmetry, spinors, "hhpp", &[H, H, P, P]);
    empty(registry, symmetry, spinors, "pphh", &[P, P, H, H]);
    empty(registry, symmetry, spinors, "ppppr", &[P, P, P, P]);
    empty(registry, symmetry, spinors, "hhhh", &[H, H, H, H]);
    empty(registry, symmetry, spinors, "phhp", &[P, H, H, P]);
    empty(registry, symmetry, spinors, "phpp", &[P, H, P, P]);
    empty(registry, symmetry, spinors, "hhhp", &[H, H, H, P]);

    for name in ["hhpp", "pphh"] {
        let AnyDiagram::Real(d) = registry.require_mut(name).unwrap() else { unreachable!() };
        let key = vec![Irrep(0); 4];
        let mut block = ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 1, 1, 1]));
        block[[0, 0, 0, 0]] = 0.25;
        d.blocks.put(key, block);
    }
}

/// A two-electron two-spinor closed-shell model, ε = (-0.5, +0.5), a single
/// two-body integral (12|12) = 0.25. Driven through [`driver::run`] rather than calling the
/// catalogue routines directly, this checks the whole `SORTING -> ... -> BUILD_HEFF` state
/// machine, not just the residual formulas.
#[test]
fn scenario_one_ground_state_energy_via_driver() {
    let (symmetry, spinors) = scenario_one();
    let mut registry = Registry::new(1 << 30, None);
    two_electron_integrals(&mut registry, &symmetry, &spinors);

    let work_dir = tempfile::tempdir().unwrap();
    let opts = SolverOptions {
        requested_sectors: vec![(0, 0)],
        work_dir: work_dir.path().to_path_buf(),
        ..SolverOptions::default()
    };

    let reports = driver::run(&mut registry, &symmetry, &spinors, &opts).unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    let energy = report.final_energy.expect("0h0p sector carries a correlation energy");
    assert!((energy - (-0.125 / 1.25)).abs() < 1e-9, "E_corr = {energy}, expected -0.1");
}

/// The primitive kernel round-trip: writing a diagram to disk
/// and reading it back under a different name reproduces it element-wise.
#[test]
fn persistence_round_trip_preserves_a_diagram() {
    let (symmetry, spinors) = scenario_one();
    let mut registry = Registry::new(1 << 30, None);
    two_electron_integrals(&mut registry, &symmetry, &spinors);

    kernels::copy(&mut registry, "hhpp", "hhpp_copy").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path: &Path = &dir.path().join("hhpp.dg");
    persistence::write(&mut registry, "hhpp", path).unwrap();
    registry.erase("hhpp");

    let name = persistence::read(&mut registry, path, Some("hhpp_reloaded")).unwrap();
    assert_eq!(name, "hhpp_reloaded");

    let diff = kernels::diffmax(&mut registry, "hhpp_copy", "hhpp_reloaded").unwrap();
    assert!((diff - 0.0).abs() < 1e-12);

    let original = registry.require("hhpp_copy").unwrap().as_real().unwrap();
    let reloaded = registry.require("hhpp_reloaded").unwrap().as_real().unwrap();
    assert_eq!(original.classes, reloaded.classes);
}
