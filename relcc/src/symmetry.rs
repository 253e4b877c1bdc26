//! The symmetry engine: multiplication table for an abelian double group.

use serde::{Deserialize, Serialize};

/// Opaque irrep label; an index into a [`SymmetryTable`]'s multiplication table.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Irrep(pub u16);

/// The multiplication table of an abelian (double) group, precomputed once and shared read-only
/// for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct SymmetryTable {
    table: Vec<Vec<Irrep>>,
    identity: Irrep,
}

impl SymmetryTable {
    /// Builds a table from an explicit `n x n` multiplication matrix; `table[a][b]` must equal
    /// `irrep_product(a, b)`. `identity` is the totally-symmetric irrep.
    ///
    /// # Panics
    ///
    /// Panics if `table` is not square or `identity` is out of range.
    #[must_use]
    pub fn new(table: Vec<Vec<Irrep>>, identity: Irrep) -> Self {
        let n = table.len();
        assert!(table.iter().all(|row| row.len() == n), "table must be square");
        assert!((identity.0 as usize) < n, "identity irrep out of range");

        Self { table, identity }
    }

    /// Builds the table for an abelian group that is the direct product of cyclic factors
    /// `Z_{n_1} x Z_{n_2} x ...`, with irreps enumerated as mixed-radix digits and multiplication
    /// performed digit-wise modulo each factor. This covers every abelian point-group double group
    /// used in practice (e.g. `C1` is `[1]`, `Ci`/`C2`/`Cs` are `[2]`, `D2h` is `[2, 2, 2]`).
    #[must_use]
    pub fn abelian_product(factors: &[u16]) -> Self {
        let n: usize = factors.iter().map(|&f| f as usize).product();
        let mut digits = Vec::with_capacity(n);
        let mut cur = vec![0u16; factors.len()];
        for _ in 0..n {
            digits.push(cur.clone());
            for (d, &f) in cur.iter_mut().zip(factors) {
                *d += 1;
                if *d == f {
                    *d = 0;
                } else {
                    break;
                }
            }
        }

        let index_of = |digs: &[u16]| -> usize {
            digits.iter().position(|d| d == digs).expect("digit tuple must be enumerated")
        };

        let mut table = vec![vec![Irrep(0); n]; n];
        for (a, da) in digits.iter().enumerate() {
            for (b, db) in digits.iter().enumerate() {
                let prod: Vec<u16> = da
                    .iter()
                    .zip(db)
                    .zip(factors)
                    .map(|((&x, &y), &f)| (x + y) % f)
                    .collect();
                table[a][b] = Irrep(index_of(&prod) as u16);
            }
        }

        Self::new(table, Irrep(0))
    }

    /// The abelian product `a (x) b`.
    #[must_use]
    pub fn irrep_product(&self, a: Irrep, b: Irrep) -> Irrep {
        self.table[a.0 as usize][b.0 as usize]
    }

    /// The totally-symmetric irrep.
    #[must_use]
    pub const fn identity(&self) -> Irrep {
        self.identity
    }

    /// Number of irreps in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the group has no irreps (never true for a constructed table).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether the product of `irreps` (in order, left-folded) equals the totally-symmetric
    /// irrep. An empty slice is vacuously totally symmetric.
    #[must_use]
    pub fn is_totally_symmetric(&self, irreps: &[Irrep]) -> bool {
        irreps
            .iter()
            .copied()
            .fold(self.identity, |acc, x| self.irrep_product(acc, x))
            == self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c1_is_trivial() {
        let table = SymmetryTable::abelian_product(&[1]);
        assert_eq!(table.len(), 1);
        assert!(table.is_totally_symmetric(&[Irrep(0), Irrep(0), Irrep(0)]));
    }

    #[test]
    fn c2_multiplication() {
        let table = SymmetryTable::abelian_product(&[2]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.irrep_product(Irrep(1), Irrep(1)), Irrep(0));
        assert_eq!(table.irrep_product(Irrep(1), Irrep(0)), Irrep(1));
        assert!(table.is_totally_symmetric(&[Irrep(1), Irrep(1)]));
        assert!(!table.is_totally_symmetric(&[Irrep(1), Irrep(0)]));
    }

    #[test]
    fn d2h_has_eight_irreps_and_is_self_inverse() {
        let table = SymmetryTable::abelian_product(&[2, 2, 2]);
        assert_eq!(table.len(), 8);
        for a in 0..8u16 {
            assert_eq!(table.irrep_product(Irrep(a), Irrep(a)), table.identity());
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn abelian_product_is_commutative_associative_and_unital(
            factors in prop::collection::vec(1u16..=4, 1..=3),
            i in 0usize..64,
            j in 0usize..64,
            k in 0usize..64,
        ) {
            let table = SymmetryTable::abelian_product(&factors);
            let n = table.len();
            let a = Irrep((i % n) as u16);
            let b = Irrep((j % n) as u16);
            let c = Irrep((k % n) as u16);

            prop_assert_eq!(table.irrep_product(a, b), table.irrep_product(b, a));
            prop_assert_eq!(
                table.irrep_product(table.irrep_product(a, b), c),
                table.irrep_product(a, table.irrep_product(b, c)),
            );
            prop_assert_eq!(table.irrep_product(a, table.identity()), a);
            prop_assert_eq!(table.is_totally_symmetric(&[a, b]), table.irrep_product(a, b) == table.identity());
        }
    }
}
