//! DIIS extrapolation, grounded in `examples/original_source/src/methods/diis.c`:
//! a bounded queue of amplitude/error-vector pairs, Pulay-matrix construction summed across every
//! enabled cluster rank into a single scalar per `(i, j)`, normalised by the matrix's abs-max
//! entry, solved by dense Gaussian elimination with partial pivoting.

use crate::error::Result;
use crate::kernels;
use crate::registry::Registry;
use std::collections::VecDeque;

/// Which cluster ranks this sector's DIIS queue extrapolates. Mirrors `diis.c`'s
/// `do_t1`/`do_t2`/`do_t3` flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnabledRanks {
    /// Extrapolate `T1`-type amplitudes.
    pub t1: bool,
    /// Extrapolate `T2`-type amplitudes.
    pub t2: bool,
    /// Extrapolate `T3`-type amplitudes.
    pub t3: bool,
}

/// One queue entry: the amplitude snapshot and error vector (`new - old`) for each enabled rank,
/// named uniquely so successive iterations don't collide in the registry.
struct Entry {
    t1: Option<(String, String)>,
    t2: Option<(String, String)>,
    t3: Option<(String, String)>,
}

/// Maintains up to `max_dim` amplitude/error-vector pairs and solves the Pulay system on demand.
pub struct DiisQueue {
    enabled: EnabledRanks,
    entries: VecDeque<Entry>,
    /// Disabled for the remainder of the sector once a Pulay matrix turns out singular
    /// (a singular Pulay matrix is recovered locally, not fatal).
    disabled: bool,
    next_id: usize,
}

impl DiisQueue {
    /// A fresh, empty queue for the given enabled ranks.
    #[must_use]
    pub fn new(enabled: EnabledRanks) -> Self {
        Self { enabled, entries: VecDeque::new(), disabled: false, next_id: 0 }
    }

    /// Whether DIIS is still active (not yet disabled by a singular Pulay matrix).
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// `diis_put`: stores a snapshot of the new amplitudes and their error vectors
    /// `new - old` for every enabled rank.
    ///
    /// # Errors
    ///
    /// Propagates kernel errors (missing diagrams, shape mismatches).
    pub fn put(
        &mut self,
        registry: &mut Registry,
        t1_new: Option<&str>,
        t1_old: Option<&str>,
        t2_new: Option<&str>,
        t2_old: Option<&str>,
        t3_new: Option<&str>,
        t3_old: Option<&str>,
    ) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let store_rank = |registry: &mut Registry, tag: &str, new: &str, old: &str| -> Result<(String, String)> {
            let amp = format!("__diis_{tag}_{id}");
            let err = format!("__diis_e{tag}_{id}");
            kernels::copy(registry, new, &amp)?;
            kernels::copy(registry, new, &err)?;
            kernels::update(registry, &err, -1.0, old)?;
            Ok((amp, err))
        };

        let t1 = match (self.enabled.t1, t1_new, t1_old) {
            (true, Some(n), Some(o)) => Some(store_rank(registry, "t1", n, o)?),
            _ => None,
        };
        let t2 = match (self.enabled.t2, t2_new, t2_old) {
            (true, Some(n), Some(o)) => Some(store_rank(registry, "t2", n, o)?),
            _ => None,
        };
        let t3 = match (self.enabled.t3, t3_new, t3_old) {
            (true, Some(n), Some(o)) => Some(store_rank(registry, "t3", n, o)?),
            _ => None,
        };
        self.entries.push_back(Entry { t1, t2, t3 });
        Ok(())
    }

    /// `diis_truncate`: evicts the oldest entries down to `len`, freeing their
    /// registry diagrams.
    pub fn truncate(&mut self, registry: &mut Registry, len: usize) {
        while self.entries.len() > len {
            if let Some(entry) = self.entries.pop_front() {
                for pair in [entry.t1, entry.t2, entry.t3].into_iter().flatten() {
                    kernels::erase(registry, &pair.0);
                    kernels::erase(registry, &pair.1);
                }
            }
        }
    }

    /// `diis_extrapolate`: solves the shared Pulay system (error-vector dot products
    /// summed across every enabled rank into one scalar per `(i, j)`, per `diis.c`) and writes
    /// `sum_i c_i * T_i` into `extrap_t1`/`extrap_t2`/`extrap_t3` for every enabled rank present.
    /// On a singular Pulay matrix, disables DIIS for the rest of the sector and leaves the
    /// `extrap_*` targets untouched (caller should fall back to the plain `T_new`).
    ///
    /// # Errors
    ///
    /// Propagates kernel errors other than Pulay-matrix singularity.
    pub fn extrapolate(
        &mut self,
        registry: &mut Registry,
        extrap_t1: Option<&str>,
        extrap_t2: Option<&str>,
        extrap_t3: Option<&str>,
    ) -> Result<bool> {
        if self.disabled || self.entries.is_empty() {
            return Ok(false);
        }
        let dim = self.entries.len();
        let bdim = dim + 1;
        let mut b = vec![vec![0.0_f64; bdim]; bdim];

        for i in 0..dim {
            for j in i..dim {
                let mut s = 0.0;
                if let (Some(ei), Some(ej)) = (&self.entries[i].t1, &self.entries[j].t1) {
                    s += kernels::scalar_product(registry, true, false, &ei.1, &ej.1)?;
                }
                if let (Some(ei), Some(ej)) = (&self.entries[i].t2, &self.entries[j].t2) {
                    s += kernels::scalar_product(registry, true, false, &ei.1, &ej.1)?;
                }
                if let (Some(ei), Some(ej)) = (&self.entries[i].t3, &self.entries[j].t3) {
                    s += kernels::scalar_product(registry, true, false, &ei.1, &ej.1)?;
                }
                b[i][j] = s;
                b[j][i] = s;
            }
            b[i][dim] = -1.0;
            b[dim][i] = -1.0;
        }
        b[dim][dim] = 0.0;

        let absmax = b.iter().take(dim).flat_map(|row| row.iter().take(dim)).fold(0.0_f64, |m, &x| m.max(x.abs()));
        if absmax > 0.0 {
            for row in b.iter_mut().take(dim) {
                for x in row.iter_mut().take(dim) {
                    *x /= absmax;
                }
            }
        }

        let mut rhs = vec![0.0; bdim];
        rhs[bdim - 1] = -1.0;

        let Some(coeffs) = solve_dense(&b, &rhs) else {
            self.disabled = true;
            return Ok(false);
        };

        if let Some(target) = extrap_t1 {
            if self.enabled.t1 {
                self.blend(registry, target, &coeffs, |e| e.t1.as_ref())?;
            }
        }
        if let Some(target) = extrap_t2 {
            if self.enabled.t2 {
                self.blend(registry, target, &coeffs, |e| e.t2.as_ref())?;
            }
        }
        if let Some(target) = extrap_t3 {
            if self.enabled.t3 {
                self.blend(registry, target, &coeffs, |e| e.t3.as_ref())?;
            }
        }
        Ok(true)
    }

    fn blend(
        &self,
        registry: &mut Registry,
        target: &str,
        coeffs: &[f64],
        select: impl Fn(&Entry) -> Option<&(String, String)>,
    ) -> Result<()> {
        let first = self.entries.iter().zip(coeffs).find_map(|(e, &c)| select(e).map(|p| (p, c)));
        let Some(((first_name, _), first_coeff)) = first else { return Ok(()) };
        kernels::copy(registry, first_name, target)?;
        kernels::clear(registry, target)?;
        kernels::update(registry, target, first_coeff, first_name)?;
        for (entry, &c) in self.entries.iter().zip(coeffs).skip(1) {
            if let Some((name, _)) = select(entry) {
                kernels::update(registry, target, c, name)?;
            }
        }
        Ok(())
    }
}

/// Solves `b * x = rhs` by Gaussian elimination with partial pivoting. Returns `None` if `b` is
/// (numerically) singular, which the caller treats as the recoverable `DIISSingular` condition of
/// a warning rather than propagating an error.
fn solve_dense(b: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = rhs.len();
    let mut a: Vec<Vec<f64>> = b.to_vec();
    let mut x = rhs.to_vec();

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&r1, &r2| a[r1][col].abs().partial_cmp(&a[r2][col].abs()).unwrap())?;
        if a[pivot_row][col].abs() < 1e-14 {
            return None;
        }
        a.swap(col, pivot_row);
        x.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            x[row] -= factor * x[col];
        }
    }

    let mut solution = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = x[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * solution[k];
        }
        if a[row][row].abs() < 1e-14 {
            return None;
        }
        solution[row] = sum / a[row][row];
    }
    Some(solution)
}

/// Message logged (as a `tracing::warn!`) when a singular Pulay matrix disables DIIS for the
/// remainder of a sector (recovered locally, not fatal).
#[must_use]
pub fn diis_disabled_warning(sector: &str) -> String {
    format!("DIIS Pulay matrix was singular in sector {sector}; DIIS disabled for the remainder of this sector")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_dense_identity() {
        let b = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let rhs = vec![3.0, 4.0];
        let sol = solve_dense(&b, &rhs).unwrap();
        assert!((sol[0] - 3.0).abs() < 1e-12);
        assert!((sol[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn solve_dense_detects_singular() {
        let b = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        let rhs = vec![1.0, 1.0];
        assert!(solve_dense(&b, &rhs).is_none());
    }
}
