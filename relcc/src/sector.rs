//! Fock-space sector identity and the `<letter><rank>c.dg` persistence naming convention
//!.

use std::fmt;

/// A Fock-space sector `(h, p)`: `h` valence holes and `p` valence particles relative to the
/// closed-shell Fermi vacuum.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Sector {
    /// Number of valence holes.
    pub h: u8,
    /// Number of valence particles.
    pub p: u8,
}

impl Sector {
    /// Builds a sector `(h, p)`.
    #[must_use]
    pub const fn new(h: u8, p: u8) -> Self {
        Self { h, p }
    }

    /// The fixed solve order: ground state first, then increasing total valence rank,
    /// ionisations/attachments before simultaneous ones at the same total rank.
    #[must_use]
    pub const fn solve_order() -> [Self; 8] {
        [
            Self::new(0, 0),
            Self::new(0, 1),
            Self::new(1, 0),
            Self::new(0, 2),
            Self::new(2, 0),
            Self::new(1, 1),
            Self::new(0, 3),
            Self::new(1, 2),
        ]
    }

    /// The single-letter family identifying this sector's amplitude/H_eff diagram names
    ///: `t/s/h/x/g/e/z/m` for `(0,0)/(0,1)/(1,0)/(0,2)/(2,0)/(1,1)/(0,3)/(1,2)`.
    ///
    /// # Panics
    ///
    /// Panics if `(h, p)` is not one of the eight sectors this engine implements.
    #[must_use]
    pub const fn letter(self) -> char {
        match (self.h, self.p) {
            (0, 0) => 't',
            (0, 1) => 's',
            (1, 0) => 'h',
            (0, 2) => 'x',
            (2, 0) => 'g',
            (1, 1) => 'e',
            (0, 3) => 'z',
            (1, 2) => 'm',
            _ => panic!("unsupported Fock-space sector"),
        }
    }

    /// Name of the current-amplitude diagram of rank `rank` (2, 4 or 6), e.g. `t2c`, `s4c`.
    #[must_use]
    pub fn amplitude_name(self, rank: usize) -> String {
        format!("{}{rank}c", self.letter())
    }

    /// Name of the next-iterate residual diagram of rank `rank`, e.g. `t2nw`.
    #[must_use]
    pub fn residual_name(self, rank: usize) -> String {
        format!("{}{rank}nw", self.letter())
    }

    /// Name of the constant (amplitude-independent) part of rank `rank`, e.g. `t2_0`.
    #[must_use]
    pub fn constant_name(self, rank: usize) -> String {
        format!("{}{rank}_0", self.letter())
    }

    /// Name of this sector's effective-Hamiltonian diagram, e.g. `veff01` for `(0, 1)`.
    #[must_use]
    pub fn heff_name(self) -> String {
        format!("veff{}{}", self.h, self.p)
    }

    /// File name for this sector's amplitude of rank `rank` under the persistence convention.
    #[must_use]
    pub fn amplitude_file(self, rank: usize) -> String {
        format!("{}.dg", self.amplitude_name(rank))
    }

    /// File name for this sector's H_eff diagram.
    #[must_use]
    pub fn heff_file(self) -> String {
        format!("{}.dg", self.heff_name())
    }

    /// Total valence rank `h + p`, used to order sectors by "distance" from the reference.
    #[must_use]
    pub const fn total(self) -> u8 {
        self.h + self.p
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h{}p", self.h, self.p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_match_convention() {
        assert_eq!(Sector::new(0, 0).letter(), 't');
        assert_eq!(Sector::new(1, 2).letter(), 'm');
    }

    #[test]
    fn names_follow_convention() {
        let s = Sector::new(0, 1);
        assert_eq!(s.amplitude_name(2), "s2c");
        assert_eq!(s.heff_name(), "veff01");
        assert_eq!(s.heff_file(), "veff01.dg");
    }

    #[test]
    fn solve_order_starts_at_ground_state() {
        assert_eq!(Sector::solve_order()[0], Sector::new(0, 0));
    }
}
