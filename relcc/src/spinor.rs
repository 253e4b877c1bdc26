//! The spinor index space: read-only after construction.

use crate::symmetry::Irrep;

/// Occupancy of a spinor relative to the Fermi vacuum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Occupancy {
    /// Occupied in the Fermi-vacuum determinant.
    Hole,
    /// Unoccupied in the Fermi-vacuum determinant.
    Particle,
}

/// The four diagram-name class letters: `h` inactive hole, `p` inactive particle, `v` active
/// particle, `g` active hole.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum ClassLetter {
    /// Inactive hole.
    H,
    /// Inactive particle.
    P,
    /// Active particle (valence particle, part of the model space).
    V,
    /// Active hole (valence hole, part of the model space).
    G,
}

impl ClassLetter {
    /// Derive the class letter from occupancy and active flag.
    #[must_use]
    pub const fn of(occupancy: Occupancy, active: bool) -> Self {
        match (occupancy, active) {
            (Occupancy::Hole, false) => Self::H,
            (Occupancy::Particle, false) => Self::P,
            (Occupancy::Particle, true) => Self::V,
            (Occupancy::Hole, true) => Self::G,
        }
    }

    /// The character used in diagram-name and class-string encodings.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::H => 'h',
            Self::P => 'p',
            Self::V => 'v',
            Self::G => 'g',
        }
    }

    /// Parse a single class letter.
    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'h' => Some(Self::H),
            'p' => Some(Self::P),
            'v' => Some(Self::V),
            'g' => Some(Self::G),
            _ => None,
        }
    }

    /// Whether this class is allowed to host the "outgoing" (creation-line) half of a diagram.
    /// Holes (`h`, `g`) are annihilated on the bra side and created on the ket side, so in the
    /// canonical ordering outgoing lines are the created ones; both hole and particle classes are
    /// valid on either side, this exists purely to document the convention for callers building
    /// custom catalogue routines.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::V | Self::G)
    }

    /// The underlying occupancy (hole/particle) regardless of activity.
    #[must_use]
    pub const fn occupancy(self) -> Occupancy {
        match self {
            Self::H | Self::G => Occupancy::Hole,
            Self::P | Self::V => Occupancy::Particle,
        }
    }
}

/// A single-particle basis state.
#[derive(Clone, Debug)]
pub struct Spinor {
    /// Dense, 0-based index in the master spinor order.
    pub index: usize,
    /// One-particle energy.
    pub energy: f64,
    /// Symmetry irrep label.
    pub irrep: Irrep,
    /// Occupancy relative to the Fermi vacuum.
    pub occupancy: Occupancy,
    /// Whether this spinor belongs to the active (model) space.
    pub active: bool,
}

impl Spinor {
    /// This spinor's diagram-name class letter.
    #[must_use]
    pub const fn class(&self) -> ClassLetter {
        ClassLetter::of(self.occupancy, self.active)
    }
}

/// Read-only partitioning of the one-particle basis into `{h, p, v, g}` classes, in the master
/// spinor order (the concatenation order used by every diagram).
pub struct SpinorSpace {
    spinors: Vec<Spinor>,
    by_class: [Vec<usize>; 4],
    num_electrons: usize,
}

impl SpinorSpace {
    /// Builds the space from a flat list of spinors (any order) and the number of electrons in
    /// the closed-shell Fermi vacuum. Spinors are re-indexed densely by class in `{h, p, v, g}`
    /// order; `index` on the input spinors is ignored.
    #[must_use]
    pub fn new(mut spinors: Vec<Spinor>, num_electrons: usize) -> Self {
        spinors.sort_by_key(|s| {
            let class = s.class();
            (
                [ClassLetter::H, ClassLetter::P, ClassLetter::V, ClassLetter::G]
                    .iter()
                    .position(|c| *c == class)
                    .unwrap(),
                s.irrep.0,
            )
        });

        let mut by_class: [Vec<usize>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        for (dense_index, spinor) in spinors.iter_mut().enumerate() {
            spinor.index = dense_index;
            let slot = match spinor.class() {
                ClassLetter::H => 0,
                ClassLetter::P => 1,
                ClassLetter::V => 2,
                ClassLetter::G => 3,
            };
            by_class[slot].push(dense_index);
        }

        Self {
            spinors,
            by_class,
            num_electrons,
        }
    }

    /// Total number of spinors.
    #[must_use]
    pub fn spinor_count(&self) -> usize {
        self.spinors.len()
    }

    /// Number of electrons in the closed-shell Fermi vacuum.
    #[must_use]
    pub const fn num_electrons(&self) -> usize {
        self.num_electrons
    }

    /// Metadata for a single spinor.
    #[must_use]
    pub fn info(&self, i: usize) -> &Spinor {
        &self.spinors[i]
    }

    /// Dense spinor indices belonging to the given class, in ascending irrep order.
    #[must_use]
    pub fn indices_of(&self, class: ClassLetter) -> &[usize] {
        match class {
            ClassLetter::H => &self.by_class[0],
            ClassLetter::P => &self.by_class[1],
            ClassLetter::V => &self.by_class[2],
            ClassLetter::G => &self.by_class[3],
        }
    }

    /// Number of spinors of the given class.
    #[must_use]
    pub fn class_count(&self, class: ClassLetter) -> usize {
        self.indices_of(class).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symmetry::Irrep;

    fn spinor(energy: f64, occ: Occupancy, active: bool) -> Spinor {
        Spinor {
            index: 0,
            energy,
            irrep: Irrep(0),
            occupancy: occ,
            active,
        }
    }

    #[test]
    fn partitions_by_class() {
        let space = SpinorSpace::new(
            vec![
                spinor(-0.5, Occupancy::Hole, false),
                spinor(0.5, Occupancy::Particle, false),
                spinor(1.5, Occupancy::Particle, true),
                spinor(-1.5, Occupancy::Hole, true),
            ],
            2,
        );

        assert_eq!(space.spinor_count(), 4);
        assert_eq!(space.class_count(ClassLetter::H), 1);
        assert_eq!(space.class_count(ClassLetter::P), 1);
        assert_eq!(space.class_count(ClassLetter::V), 1);
        assert_eq!(space.class_count(ClassLetter::G), 1);
        assert_eq!(space.num_electrons(), 2);
    }

    #[test]
    fn class_letter_roundtrip() {
        for c in [ClassLetter::H, ClassLetter::P, ClassLetter::V, ClassLetter::G] {
            assert_eq!(ClassLetter::from_char(c.as_char()), Some(c));
        }
    }
}
