//! The spinor-index-space/symmetry-table input file the CLI loads before handing control to the
//! solver driver.
//!
//! Parsing molecular-geometry/basis input and producing the partitioned-spinor
//! description is an external collaborator's job. This module only deserialises the *already
//! computed* partition (energies, irreps, occupancy, active flag) and the abelian group's cyclic
//! factors from a small TOML file, grounded in the `SubgridParams`-style config structs of
//! `relcc::options` and in `core_config::load_from` (`examples/freddiehaddad-oxidized/crates/
//! core-config/src/lib.rs`) for the "deserialise a TOML file into a typed config" idiom.

use anyhow::{Context, Result};
use relcc::spinor::{Occupancy, Spinor, SpinorSpace};
use relcc::symmetry::{Irrep, SymmetryTable};
use serde::Deserialize;
use std::path::Path;

/// One spinor record as it appears in the system file.
#[derive(Clone, Copy, Debug, Deserialize)]
struct SpinorRecord {
    energy: f64,
    irrep: u16,
    occupied: bool,
    active: bool,
}

/// The on-disk system description: the abelian double group's cyclic factors and the full
/// spinor partition.
#[derive(Clone, Debug, Deserialize)]
struct SystemFile {
    /// Cyclic factors of the abelian double group, e.g. `[2, 2, 2]` for `D2h`.
    symmetry_factors: Vec<u16>,
    /// Number of electrons in the closed-shell Fermi vacuum.
    num_electrons: usize,
    /// One entry per spinor.
    spinors: Vec<SpinorRecord>,
}

/// Loads the symmetry table and spinor space from `path` (a TOML system file).
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or describes no spinors.
pub fn load(path: &Path) -> Result<(SymmetryTable, SpinorSpace)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading system file {}", path.display()))?;
    let parsed: SystemFile =
        toml::from_str(&text).with_context(|| format!("parsing system file {}", path.display()))?;
    anyhow::ensure!(!parsed.spinors.is_empty(), "system file {} describes no spinors", path.display());

    let symmetry = SymmetryTable::abelian_product(&parsed.symmetry_factors);
    let spinors = parsed
        .spinors
        .into_iter()
        .map(|r| Spinor {
            index: 0,
            energy: r.energy,
            irrep: Irrep(r.irrep),
            occupancy: if r.occupied { Occupancy::Hole } else { Occupancy::Particle },
            active: r.active,
        })
        .collect::<Vec<_>>();
    Ok((symmetry, SpinorSpace::new(spinors, parsed.num_electrons)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_two_spinor_system() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.toml");
        std::fs::write(
            &path,
            r#"
symmetry_factors = [1]
num_electrons = 2

[[spinors]]
energy = -0.5
irrep = 0
occupied = true
active = false

[[spinors]]
energy = 0.5
irrep = 0
occupied = false
active = false
"#,
        )
        .unwrap();
        let (symmetry, spinors) = load(&path).unwrap();
        assert_eq!(symmetry.len(), 1);
        assert_eq!(spinors.spinor_count(), 2);
    }
}
