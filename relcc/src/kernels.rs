//! The primitive tensor kernels: the only code that ever touches a block's raw
//! elements. Everything in [`crate::catalogue`] is a straight-line composition of these calls.
//!
//! Every kernel takes diagram *names* and looks them up in the [`Registry`]; this mirrors the
//! free-function, name-keyed style of the EXP-T kernel set (`reorder("t2c", "r1", "3412")`, ...)
//! while replacing the process-wide globals with an explicit registry argument.

use crate::block::{IrrepKey, StorageMode};
use crate::diagram::{AnyDiagram, Diagram, Order};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::scalar::Scalar;
use crate::spinor::{ClassLetter, SpinorSpace};
use crate::symmetry::{Irrep, SymmetryTable};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use tracing::warn;

/// Denominator magnitude below which `diveps` treats a block element as an intruder state:
/// the orbital-energy gap nearly vanishes, so the divided amplitude blows up. Division still
/// proceeds (the sector's own `findmax`/divergence check catches a genuinely runaway amplitude);
/// this only surfaces the condition in the logs, per the solver's non-fatal `IntruderWarning`.
const INTRUDER_THRESHOLD: f64 = 1e-6;

/// Whether newly created diagrams hold real or complex elements.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElementType {
    /// `f64`.
    Real,
    /// [`num_complex::Complex64`].
    Complex,
}

/// Parses a class string such as `"hhpp"` into class letters.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if any character is not one of `h`, `p`, `v`, `g`.
pub fn parse_classes(classes: &str) -> Result<Vec<ClassLetter>> {
    classes
        .chars()
        .map(|c| {
            ClassLetter::from_char(c)
                .ok_or_else(|| Error::Configuration(format!("unknown class letter '{c}' in '{classes}'")))
        })
        .collect()
}

/// Parses an order string such as `"1234"` (1-based) into a 0-based [`Order`].
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the string is not a permutation of `1..=len`.
pub fn parse_order(order: &str, op: &'static str) -> Result<Order> {
    let digits: Result<Vec<usize>> = order
        .chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as usize - 1)
                .ok_or_else(|| Error::ShapeMismatch { op, detail: format!("bad digit in order '{order}'") })
        })
        .collect();
    let digits = digits?;
    validate_permutation(&digits, op)?;
    Ok(digits)
}

fn validate_permutation(perm: &[usize], op: &'static str) -> Result<()> {
    let n = perm.len();
    let mut seen = vec![false; n];
    for &p in perm {
        if p >= n || seen[p] {
            return Err(Error::ShapeMismatch { op, detail: format!("{perm:?} is not a permutation of 0..{n}") });
        }
        seen[p] = true;
    }
    Ok(())
}

fn identity_order(rank: usize) -> Order {
    (0..rank).collect()
}

/// An owned, self-contained snapshot of a diagram's metadata and (fully loaded) blocks. Taking a
/// snapshot ends the registry borrow, so a kernel that needs two diagrams at once (`mult`, `add`)
/// can snapshot each in turn without holding two live mutable borrows into the registry's map.
struct Snapshot<S> {
    classes: Vec<ClassLetter>,
    valence_mask: Vec<bool>,
    order: Order,
    perm_unique: bool,
    mode: StorageMode,
    blocks: Vec<(IrrepKey, ArrayD<S>)>,
}

impl<S: Scalar> Snapshot<S> {
    fn rank(&self) -> usize {
        self.classes.len()
    }

    fn is_canonical_order(&self) -> bool {
        self.order.iter().enumerate().all(|(i, &o)| i == o)
    }

    fn get(&self, key: &IrrepKey) -> Option<&ArrayD<S>> {
        self.blocks.iter().find(|(k, _)| k == key).map(|(_, b)| b)
    }
}

fn snapshot_real(registry: &mut Registry, name: &str) -> Result<Snapshot<f64>> {
    let AnyDiagram::Real(d) = registry.require_mut(name)? else {
        return Err(Error::ShapeMismatch { op: "snapshot", detail: format!("'{name}' is not a real diagram") });
    };
    take_snapshot(d)
}

fn snapshot_complex(registry: &mut Registry, name: &str) -> Result<Snapshot<num_complex::Complex64>> {
    let AnyDiagram::Complex(d) = registry.require_mut(name)? else {
        return Err(Error::ShapeMismatch { op: "snapshot", detail: format!("'{name}' is not a complex diagram") });
    };
    take_snapshot(d)
}

fn take_snapshot<S: Scalar>(d: &mut Diagram<S>) -> Result<Snapshot<S>> {
    Ok(Snapshot {
        classes: d.classes.clone(),
        valence_mask: d.valence_mask.clone(),
        order: d.order.clone(),
        perm_unique: d.perm_unique,
        mode: d.blocks.mode(),
        blocks: d.blocks.enumerate_cloned()?,
    })
}

fn diagram_from_blocks<S: Scalar>(
    name: &str,
    classes: Vec<ClassLetter>,
    valence_mask: Vec<bool>,
    order: Order,
    perm_unique: bool,
    mode: StorageMode,
    blocks: Vec<(IrrepKey, ArrayD<S>)>,
) -> Diagram<S> {
    let mut d = Diagram::new(name.to_owned(), classes, valence_mask, order, perm_unique, mode, None);
    for (key, block) in blocks {
        d.blocks.put(key, block);
    }
    d
}

/// `tmplt`: allocates a zero diagram with the given line classes, materialising a
/// zero block for every irrep tuple whose product is totally symmetric (invariant I1).
///
/// # Errors
///
/// [`Error::AlreadyExists`] if `name` is already registered.
#[allow(clippy::too_many_arguments)]
pub fn tmplt(
    registry: &mut Registry,
    symmetry: &SymmetryTable,
    spinors: &SpinorSpace,
    name: &str,
    classes: &[ClassLetter],
    valence_mask: &[bool],
    order: Option<&Order>,
    perm_unique: bool,
    element_type: ElementType,
    mode: StorageMode,
) -> Result<()> {
    let rank = classes.len();
    let order = order.cloned().unwrap_or_else(|| identity_order(rank));
    let path = registry.spill_path(name);
    let diagram = match element_type {
        ElementType::Real => {
            let mut d: Diagram<f64> = Diagram::new(
                name.to_owned(),
                classes.to_vec(),
                valence_mask.to_vec(),
                order,
                perm_unique,
                mode,
                path,
            );
            fill_zero_blocks(&mut d, symmetry, spinors);
            AnyDiagram::Real(d)
        }
        ElementType::Complex => {
            let mut d: Diagram<num_complex::Complex64> = Diagram::new(
                name.to_owned(),
                classes.to_vec(),
                valence_mask.to_vec(),
                order,
                perm_unique,
                mode,
                path,
            );
            fill_zero_blocks(&mut d, symmetry, spinors);
            AnyDiagram::Complex(d)
        }
    };
    registry.insert(diagram)
}

/// Dimensions of each irrep-subspace of `class`, indexed by [`Irrep`].
fn irrep_dims(spinors: &SpinorSpace, class: ClassLetter, num_irreps: u16) -> Vec<usize> {
    let mut dims = vec![0usize; num_irreps as usize];
    for &idx in spinors.indices_of(class) {
        dims[spinors.info(idx).irrep.0 as usize] += 1;
    }
    dims
}

fn fill_zero_blocks<S: Scalar>(diagram: &mut Diagram<S>, symmetry: &SymmetryTable, spinors: &SpinorSpace) {
    let n_irr = symmetry.len() as u16;
    let per_line_dims: Vec<Vec<usize>> =
        diagram.classes.iter().map(|&c| irrep_dims(spinors, c, n_irr)).collect();
    for key in enumerate_symmetric_keys(symmetry, n_irr, diagram.rank()) {
        let shape: Vec<usize> = key.iter().zip(&per_line_dims).map(|(irr, dims)| dims[irr.0 as usize]).collect();
        if shape.iter().any(|&d| d == 0) {
            continue;
        }
        diagram.blocks.put(key, ArrayD::zeros(IxDyn(&shape)));
    }
}

/// Enumerates every irrep tuple of length `rank` whose left-folded product under `symmetry` is
/// totally symmetric (only these tuples may host blocks, invariant I1).
fn enumerate_symmetric_keys(symmetry: &SymmetryTable, n_irr: u16, rank: usize) -> Vec<IrrepKey> {
    if rank == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    let mut tuple = vec![Irrep(0); rank];
    enumerate_rec(symmetry, n_irr, &mut tuple, 0, &mut out);
    out
}

fn enumerate_rec(symmetry: &SymmetryTable, n_irr: u16, tuple: &mut Vec<Irrep>, pos: usize, out: &mut Vec<IrrepKey>) {
    if pos == tuple.len() {
        if symmetry.is_totally_symmetric(tuple) {
            out.push(tuple.clone());
        }
        return;
    }
    for i in 0..n_irr {
        tuple[pos] = Irrep(i);
        enumerate_rec(symmetry, n_irr, tuple, pos + 1, out);
    }
}

/// `copy`: structural copy of `src` into `dst`, overwriting `dst` if it exists.
///
/// # Errors
///
/// [`Error::NotFound`] if `src` does not exist.
pub fn copy(registry: &mut Registry, src: &str, dst: &str) -> Result<()> {
    if src == dst {
        return Ok(());
    }
    registry.erase(dst);
    let copied = match registry.require_mut(src)? {
        AnyDiagram::Real(d) => AnyDiagram::Real(d.structural_copy(dst.to_owned())?),
        AnyDiagram::Complex(d) => AnyDiagram::Complex(d.structural_copy(dst.to_owned())?),
    };
    registry.insert(copied)
}

/// `erase`: unconditionally removes a diagram. A no-op if `name` doesn't exist.
pub fn erase(registry: &mut Registry, name: &str) {
    registry.erase(name);
}

/// `clear`: zeroes every resident block of `name` in place, keeping its structure.
///
/// # Errors
///
/// [`Error::NotFound`] if `name` does not exist.
pub fn clear(registry: &mut Registry, name: &str) -> Result<()> {
    match registry.require_mut(name)? {
        AnyDiagram::Real(d) => clear_generic(d),
        AnyDiagram::Complex(d) => clear_generic(d),
    }
}

fn clear_generic<S: Scalar>(d: &mut Diagram<S>) -> Result<()> {
    let keys = d.blocks.keys().to_vec();
    for key in keys {
        if let Some(block) = d.blocks.get_mut(&key)? {
            block.fill(S::default());
        }
    }
    Ok(())
}

/// `reorder`: writes `dst` as `src` with its external lines permuted by `perm`
/// (`perm[i]` is the source line now occupying slot `i`). For rank 2, `perm = [1, 0]` is
/// transpose.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `perm` is not a permutation of `0..rank`, [`Error::NotFound`] if
/// `src` does not exist.
pub fn reorder(registry: &mut Registry, src: &str, dst: &str, perm: &[usize]) -> Result<()> {
    validate_permutation(perm, "reorder")?;
    let is_real = matches!(registry.require(src)?, AnyDiagram::Real(_));
    let result = if is_real {
        let snap = snapshot_real(registry, src)?;
        AnyDiagram::Real(reorder_generic(&snap, dst, perm)?)
    } else {
        let snap = snapshot_complex(registry, src)?;
        AnyDiagram::Complex(reorder_generic(&snap, dst, perm)?)
    };
    registry.erase(dst);
    registry.insert(result)
}

fn reorder_generic<S: Scalar>(src: &Snapshot<S>, dst: &str, perm: &[usize]) -> Result<Diagram<S>> {
    if perm.len() != src.rank() {
        return Err(Error::ShapeMismatch {
            op: "reorder",
            detail: format!("perm has length {} but source has rank {}", perm.len(), src.rank()),
        });
    }
    let classes: Vec<_> = perm.iter().map(|&p| src.classes[p]).collect();
    let valence_mask: Vec<_> = perm.iter().map(|&p| src.valence_mask[p]).collect();
    let order: Order = perm.iter().map(|&p| src.order[p]).collect();
    let mut blocks = Vec::with_capacity(src.blocks.len());
    for (key, block) in &src.blocks {
        let new_key: IrrepKey = perm.iter().map(|&p| key[p]).collect();
        let permuted = block.clone().permuted_axes(IxDyn(perm)).as_standard_layout().to_owned();
        blocks.push((new_key, permuted));
    }
    Ok(diagram_from_blocks(dst, classes, valence_mask, order, src.perm_unique, src.mode, blocks))
}

/// `mult`: contracts the last `k` lines of `a` against the first `k` lines of `b`;
/// the remaining lines of `a` (in order) followed by the remaining lines of `b` become the
/// external lines of `c`. `c` is auto-allocated (overwriting any existing diagram of that name) —
/// this implementation picks the "auto-allocate" branch of the two documented behaviours.
///
/// # Errors
///
/// [`Error::RankUnderflow`] if `k` exceeds either operand's rank, [`Error::IncompatibleClasses`]
/// if a contracted line pair doesn't share an occupancy class (hole contracts with hole, particle
/// with particle).
pub fn mult(registry: &mut Registry, a: &str, b: &str, c: &str, k: usize, symmetry: &SymmetryTable) -> Result<()> {
    let a_is_real = matches!(registry.require(a)?, AnyDiagram::Real(_));
    let b_is_real = matches!(registry.require(b)?, AnyDiagram::Real(_));
    if a_is_real != b_is_real {
        return Err(Error::IncompatibleClasses {
            a: a.to_owned(),
            b: b.to_owned(),
            detail: "one operand is real and the other complex".into(),
        });
    }
    let result = if a_is_real {
        let sa = snapshot_real(registry, a)?;
        let sb = snapshot_real(registry, b)?;
        AnyDiagram::Real(mult_generic(&sa, a, &sb, b, c, k, symmetry)?)
    } else {
        let sa = snapshot_complex(registry, a)?;
        let sb = snapshot_complex(registry, b)?;
        AnyDiagram::Complex(mult_generic(&sa, a, &sb, b, c, k, symmetry)?)
    };
    registry.erase(c);
    registry.insert(result)
}

#[allow(clippy::too_many_arguments)]
fn mult_generic<S: Scalar>(
    a: &Snapshot<S>,
    a_name: &str,
    b: &Snapshot<S>,
    b_name: &str,
    c: &str,
    k: usize,
    symmetry: &SymmetryTable,
) -> Result<Diagram<S>> {
    if k > a.rank() {
        return Err(Error::RankUnderflow { k, rank: a.rank() });
    }
    if k > b.rank() {
        return Err(Error::RankUnderflow { k, rank: b.rank() });
    }
    if !a.is_canonical_order() || !b.is_canonical_order() {
        return Err(Error::ShapeMismatch {
            op: "mult",
            detail: format!("operands '{a_name}'/'{b_name}' must be in canonical order before contraction"),
        });
    }

    let a_contract = &a.classes[a.rank() - k..];
    let b_contract = &b.classes[..k];
    for (ca, cb) in a_contract.iter().zip(b_contract) {
        if ca.occupancy() != cb.occupancy() {
            return Err(Error::IncompatibleClasses {
                a: a_name.to_owned(),
                b: b_name.to_owned(),
                detail: format!("cannot contract {ca:?} ({:?}) with {cb:?} ({:?})", ca.occupancy(), cb.occupancy()),
            });
        }
    }

    let a_ext = a.rank() - k;
    let classes: Vec<_> = a.classes[..a_ext].iter().chain(&b.classes[k..]).copied().collect();
    let valence_mask: Vec<_> = a.valence_mask[..a_ext].iter().chain(&b.valence_mask[k..]).copied().collect();
    let rank = classes.len();

    let n_irr = symmetry.len() as u16;
    // Each symmetry-allowed `a` block independently scans `b` for matching contraction irreps
    // (the diagrams this solver handles carry far more blocks than spinors per irrep), so the
    // per-`a_key` work fans out across `rayon`'s pool the same way `pineappl_cli` parallelises its
    // per-bin accumulation (`examples/NNPDF-pineappl/pineappl_cli/src/uncert.rs`); only the final
    // merge into `accum` is sequential.
    let partials: Vec<(IrrepKey, ArrayD<S>)> = a
        .blocks
        .par_iter()
        .flat_map_iter(|(a_key, a_block)| {
            let a_contract_irr = &a_key[a_ext..];
            b.blocks.iter().filter_map(move |(b_key, b_block)| {
                if &b_key[..k] != a_contract_irr {
                    return None;
                }
                let out_key: IrrepKey = a_key[..a_ext].iter().chain(&b_key[k..]).copied().collect();
                Some((out_key, contract_blocks(a_block, b_block, k)))
            })
        })
        .collect();

    let mut accum: rustc_hash::FxHashMap<IrrepKey, ArrayD<S>> = rustc_hash::FxHashMap::default();
    for (out_key, contribution) in partials {
        accum
            .entry(out_key)
            .and_modify(|existing| *existing = &*existing + &contribution)
            .or_insert(contribution);
    }
    let mut blocks = Vec::new();
    for key in enumerate_symmetric_keys(symmetry, n_irr, rank) {
        if let Some(block) = accum.remove(&key) {
            blocks.push((key, block));
        }
    }
    Ok(diagram_from_blocks(c, classes, valence_mask, identity_order(rank), true, a.mode, blocks))
}

/// Straightforward (unparenthesised) nested-loop contraction of the last `k` axes of `a` against
/// the first `k` axes of `b`.
fn contract_blocks<S: Scalar>(a: &ArrayD<S>, b: &ArrayD<S>, k: usize) -> ArrayD<S> {
    let a_ext_shape = &a.shape()[..a.ndim() - k];
    let b_ext_shape = &b.shape()[k..];
    let contract_shape = &a.shape()[a.ndim() - k..];
    let contract_len: usize = contract_shape.iter().product();

    let a_ext_len: usize = a_ext_shape.iter().product();
    let b_ext_len: usize = b_ext_shape.iter().product();

    let a_mat = a
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((a_ext_len, contract_len))
        .expect("contiguous reshape");
    let b_mat = b
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((contract_len, b_ext_len))
        .expect("contiguous reshape");
    let c_mat = a_mat.dot(&b_mat);

    let mut out_shape = a_ext_shape.to_vec();
    out_shape.extend_from_slice(b_ext_shape);
    c_mat.into_shape_with_order(IxDyn(&out_shape)).expect("matches product of dims")
}

/// `add`: `c := alpha*a + beta*b`. Requires identical classes; the kernel reorders
/// operands to canonical order internally when needed — here both are read in whatever order
/// they're stored and keyed by their (already line-order-consistent) irrep tuples, which is valid
/// because `add`/`update` never mix diagrams of differing `order`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `a` and `b` have different classes.
pub fn add(registry: &mut Registry, alpha: f64, a: &str, beta: f64, b: &str, c: &str) -> Result<()> {
    let a_is_real = matches!(registry.require(a)?, AnyDiagram::Real(_));
    let b_is_real = matches!(registry.require(b)?, AnyDiagram::Real(_));
    if a_is_real != b_is_real {
        return Err(Error::ShapeMismatch { op: "add", detail: "operands must share the same element type".into() });
    }
    let result = if a_is_real {
        let sa = snapshot_real(registry, a)?;
        let sb = snapshot_real(registry, b)?;
        AnyDiagram::Real(add_generic(alpha, &sa, beta, &sb, c)?)
    } else {
        let alpha = num_complex::Complex64::new(alpha, 0.0);
        let beta = num_complex::Complex64::new(beta, 0.0);
        let sa = snapshot_complex(registry, a)?;
        let sb = snapshot_complex(registry, b)?;
        AnyDiagram::Complex(add_generic(alpha, &sa, beta, &sb, c)?)
    };
    registry.erase(c);
    registry.insert(result)
}

fn add_generic<S: Scalar>(alpha: S, a: &Snapshot<S>, beta: S, b: &Snapshot<S>, c: &str) -> Result<Diagram<S>> {
    if a.classes != b.classes {
        return Err(Error::ShapeMismatch { op: "add", detail: "operands have different line classes".into() });
    }
    let mut merged: rustc_hash::FxHashMap<IrrepKey, ArrayD<S>> = rustc_hash::FxHashMap::default();
    for (key, block) in &a.blocks {
        merged.insert(key.clone(), block.mapv(|x| x * alpha));
    }
    for (key, block) in &b.blocks {
        merged
            .entry(key.clone())
            .and_modify(|existing| *existing = &*existing + &block.mapv(|x| x * beta))
            .or_insert_with(|| block.mapv(|x| x * beta));
    }
    Ok(diagram_from_blocks(
        c,
        a.classes.clone(),
        a.valence_mask.clone(),
        a.order.clone(),
        a.perm_unique,
        a.mode,
        merged.into_iter().collect(),
    ))
}

/// `update`: `c := c + alpha*a` in place.
///
/// # Errors
///
/// [`Error::NotFound`] if either diagram is missing, [`Error::ShapeMismatch`] on class mismatch.
pub fn update(registry: &mut Registry, c: &str, alpha: f64, a: &str) -> Result<()> {
    let tmp = format!("__update_tmp_{c}");
    add(registry, 1.0, c, alpha, a, &tmp)?;
    copy(registry, &tmp, c)?;
    erase(registry, &tmp);
    Ok(())
}

/// A signed line permutation, as produced by parsing a `perm` group specification.
struct SignedPerm {
    perm: Order,
    sign: f64,
}

/// Parses a `perm` group specification such as `"(1/23)"` or `"(12|34)"` into the
/// list of independent pipe-separated groups, each itself a list of slash-separated line-index
/// blocks (converted to 0-based).
fn parse_perm_spec(spec: &str, op: &'static str) -> Result<Vec<Vec<Vec<usize>>>> {
    let trimmed = spec.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::ShapeMismatch { op, detail: format!("perm spec '{spec}' must be parenthesised") })?;
    inner
        .split('|')
        .map(|group| {
            group
                .split('/')
                .map(|block| {
                    block
                        .chars()
                        .map(|c| {
                            c.to_digit(10)
                                .map(|d| d as usize - 1)
                                .ok_or_else(|| Error::ShapeMismatch { op, detail: format!("bad index in '{spec}'") })
                        })
                        .collect::<Result<Vec<usize>>>()
                })
                .collect::<Result<Vec<Vec<usize>>>>()
        })
        .collect()
}

/// Enumerates every riffle-shuffle merge of `blocks` (each block's internal order preserved) with
/// the sign of the permutation relative to the identity concatenation. This realises the
/// antisymmetriser over a partition into already-antisymmetric blocks: e.g. blocks
/// `[[0], [1, 2]]` yields the three permutations of `P(0/12) = 1 - P_01 - P_02`.
fn riffle_shuffles(blocks: &[Vec<usize>]) -> Vec<SignedPerm> {
    let total: usize = blocks.iter().map(Vec::len).sum();
    let mut out = Vec::new();
    let mut cursors = vec![0usize; blocks.len()];
    riffle_rec(blocks, &mut cursors, &mut Vec::with_capacity(total), &mut out);
    out
}

fn riffle_rec(blocks: &[Vec<usize>], cursors: &mut [usize], acc: &mut Order, out: &mut Vec<SignedPerm>) {
    if cursors.iter().zip(blocks).all(|(&c, b)| c == b.len()) {
        let identity_order: Order = blocks.iter().flatten().copied().collect();
        out.push(SignedPerm { perm: acc.clone(), sign: permutation_sign(&identity_order, acc) });
        return;
    }
    for (i, block) in blocks.iter().enumerate() {
        if cursors[i] < block.len() {
            acc.push(block[cursors[i]]);
            cursors[i] += 1;
            riffle_rec(blocks, cursors, acc, out);
            cursors[i] -= 1;
            acc.pop();
        }
    }
}

/// Sign of the permutation carrying `from` to `to` (both are orderings of the same index set).
fn permutation_sign(from: &[usize], to: &[usize]) -> f64 {
    let pos_in_from: std::collections::HashMap<usize, usize> =
        from.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    let mapped: Vec<usize> = to.iter().map(|v| pos_in_from[v]).collect();
    let mut seen = vec![false; mapped.len()];
    let mut sign = 1.0;
    for start in 0..mapped.len() {
        if seen[start] {
            continue;
        }
        let mut len = 0;
        let mut j = start;
        while !seen[j] {
            seen[j] = true;
            j = mapped[j];
            len += 1;
        }
        if len % 2 == 0 {
            sign = -sign;
        }
    }
    sign
}

/// `perm`: rebuilds `name` in place as the antisymmetrised sum described by `spec`
/// (e.g. `"(1/23)"`, `"(12|34)"`). Independent pipe-separated groups are applied successively
/// (they act on disjoint line sets, so they commute).
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `spec` doesn't parse or doesn't cover `name`'s rank exactly once.
pub fn perm(registry: &mut Registry, name: &str, spec: &str) -> Result<()> {
    let rank = registry.require(name)?.rank();
    let groups = parse_perm_spec(spec, "perm")?;
    for (gi, blocks) in groups.iter().enumerate() {
        let covered: usize = blocks.iter().map(Vec::len).sum();
        if covered != rank {
            return Err(Error::ShapeMismatch {
                op: "perm",
                detail: format!("group {gi} of '{spec}' covers {covered} lines, diagram has rank {rank}"),
            });
        }
        let shuffles = riffle_shuffles(blocks);
        let accum = format!("__perm_accum_{gi}");
        for (i, shuffle) in shuffles.iter().enumerate() {
            let piece = format!("__perm_piece_{gi}_{i}");
            reorder(registry, name, &piece, &shuffle.perm)?;
            if i == 0 {
                copy(registry, &piece, &accum)?;
                scale_in_place(registry, &accum, shuffle.sign)?;
            } else {
                update(registry, &accum, shuffle.sign, &piece)?;
            }
            erase(registry, &piece);
        }
        copy(registry, &accum, name)?;
        erase(registry, &accum);
    }
    Ok(())
}

fn scale_in_place(registry: &mut Registry, name: &str, factor: f64) -> Result<()> {
    match registry.require_mut(name)? {
        AnyDiagram::Real(d) => scale_generic(d, factor),
        AnyDiagram::Complex(d) => scale_generic(d, num_complex::Complex64::new(factor, 0.0)),
    }
}

fn scale_generic<S: Scalar>(d: &mut Diagram<S>, factor: S) -> Result<()> {
    let keys = d.blocks.keys().to_vec();
    for key in keys {
        if let Some(block) = d.blocks.get_mut(&key)? {
            block.mapv_inplace(|x| x * factor);
        }
    }
    Ok(())
}

/// `diveps`: divides every element of `name` by its Møller-Plesset-style energy
/// denominator `sum(eps_occupied) - sum(eps_virtual)`, using the canonical line ordering (first
/// half outgoing/created, second half incoming).
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `name`'s `order` is not canonical (invariant I4).
pub fn diveps(registry: &mut Registry, name: &str, spinors: &SpinorSpace) -> Result<()> {
    match registry.require_mut(name)? {
        AnyDiagram::Real(d) => diveps_generic(d, spinors),
        AnyDiagram::Complex(d) => diveps_generic(d, spinors),
    }
}

fn diveps_generic<S: Scalar>(d: &mut Diagram<S>, spinors: &SpinorSpace) -> Result<()> {
    if !d.is_canonical_order() {
        return Err(Error::ShapeMismatch {
            op: "diveps",
            detail: format!("'{}' must be in canonical order before denominator division", d.name),
        });
    }
    let rank = d.rank();
    let half = rank / 2;
    let classes = d.classes.clone();
    let name = d.name.clone();
    let keys = d.blocks.keys().to_vec();
    for key in keys {
        let Some(block) = d.blocks.get_mut(&key)? else { continue };
        let shape = block.shape().to_vec();
        for (flat, elem) in block.iter_mut().enumerate() {
            let multi = unravel(flat, &shape);
            let mut denom = 0.0;
            for (line, &spinor_local) in multi.iter().enumerate() {
                let class = classes[line];
                let global = spinor_index_for(spinors, class, key[line], spinor_local);
                let eps = spinors.info(global).energy;
                denom += if line < half { eps } else { -eps };
            }
            if denom.abs() < INTRUDER_THRESHOLD {
                warn!(diagram = %name, block = ?key, element = flat, denom, "IntruderWarning: diveps denominator near zero");
            }
            *elem = *elem * S::from_f64(1.0 / denom);
        }
    }
    Ok(())
}

fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut out = vec![0usize; shape.len()];
    for i in (0..shape.len()).rev() {
        out[i] = flat % shape[i];
        flat /= shape[i];
    }
    out
}

/// Finds the global spinor index of the `local`-th spinor of class `class` and irrep `irrep`
/// (blocks are dense in this local irrep-restricted index).
fn spinor_index_for(spinors: &SpinorSpace, class: ClassLetter, irrep: Irrep, local: usize) -> usize {
    spinors
        .indices_of(class)
        .iter()
        .filter(|&&idx| spinors.info(idx).irrep == irrep)
        .nth(local)
        .copied()
        .expect("diveps block shape must match the irrep subspace dimension")
}

/// `closed`: extracts the sub-diagram whose every line is restricted to active
/// spinors. Since every stored block is already confined to one spinor class per line (and the
/// class letter itself encodes activity), `closed` keeps only the blocks of a diagram all of
/// whose line classes are `v`/`g`, and relabels the valence mask to all-`true`.
///
/// # Errors
///
/// [`Error::NotFound`] if `src` does not exist.
pub fn closed(registry: &mut Registry, src: &str, dst: &str) -> Result<()> {
    let is_real = matches!(registry.require(src)?, AnyDiagram::Real(_));
    let result = if is_real {
        let snap = snapshot_real(registry, src)?;
        AnyDiagram::Real(closed_generic(&snap, dst))
    } else {
        let snap = snapshot_complex(registry, src)?;
        AnyDiagram::Complex(closed_generic(&snap, dst))
    };
    registry.erase(dst);
    registry.insert(result)
}

fn closed_generic<S: Scalar>(src: &Snapshot<S>, dst: &str) -> Diagram<S> {
    let all_active = src.classes.iter().all(|c| c.is_active());
    let blocks = if all_active { src.blocks.clone() } else { Vec::new() };
    diagram_from_blocks(
        dst,
        src.classes.clone(),
        vec![true; src.rank()],
        src.order.clone(),
        src.perm_unique,
        src.mode,
        blocks,
    )
}

/// `findmax`: `max |a_i|`, the winning block's irrep key, and its flat index within
/// that block.
///
/// # Errors
///
/// [`Error::NotFound`] if `name` does not exist.
pub fn findmax(registry: &mut Registry, name: &str) -> Result<(f64, IrrepKey, usize)> {
    match registry.require_mut(name)? {
        AnyDiagram::Real(d) => findmax_generic(d),
        AnyDiagram::Complex(d) => findmax_generic(d),
    }
}

fn findmax_generic<S: Scalar>(d: &mut Diagram<S>) -> Result<(f64, IrrepKey, usize)> {
    let mut best = (0.0, IrrepKey::new(), 0usize);
    for (key, block) in d.blocks.enumerate()? {
        for (idx, &val) in block.iter().enumerate() {
            let m = val.modulus();
            if m > best.0 {
                best = (m, key.clone(), idx);
            }
        }
    }
    Ok(best)
}

/// `diffmax`: `max |a_i - b_i|` across matching blocks. A block present in one
/// diagram but not the other is compared against a structural zero.
///
/// # Errors
///
/// [`Error::NotFound`] if either diagram is missing, [`Error::ShapeMismatch`] if their classes
/// differ.
pub fn diffmax(registry: &mut Registry, a: &str, b: &str) -> Result<f64> {
    let tmp = format!("__diffmax_tmp_{a}_{b}");
    add(registry, 1.0, a, -1.0, b, &tmp)?;
    let (max, _, _) = findmax(registry, &tmp)?;
    erase(registry, &tmp);
    Ok(max)
}

/// `scalar_product`: element-wise inner product with per-operand conjugation.
/// `conj_a`/`conj_b` select whether that operand is conjugated before multiplying (real mode:
/// conjugation is the identity, so `<a|b> == <b|a>`).
///
/// # Errors
///
/// [`Error::NotFound`] if either diagram is missing.
pub fn scalar_product(registry: &mut Registry, conj_a: bool, conj_b: bool, a: &str, b: &str) -> Result<f64> {
    let a_is_real = matches!(registry.require(a)?, AnyDiagram::Real(_));
    let b_is_real = matches!(registry.require(b)?, AnyDiagram::Real(_));
    if a_is_real != b_is_real {
        return Err(Error::ShapeMismatch {
            op: "scalar_product",
            detail: "operands have different element types".into(),
        });
    }
    if a_is_real {
        let sa = snapshot_real(registry, a)?;
        let sb = snapshot_real(registry, b)?;
        scalar_product_generic(&sa, conj_a, conj_b, &sb)
    } else {
        let sa = snapshot_complex(registry, a)?;
        let sb = snapshot_complex(registry, b)?;
        scalar_product_generic(&sa, conj_a, conj_b, &sb)
    }
}

fn scalar_product_generic<S: Scalar>(a: &Snapshot<S>, conj_a: bool, conj_b: bool, b: &Snapshot<S>) -> Result<f64> {
    if a.classes != b.classes {
        return Err(Error::ShapeMismatch {
            op: "scalar_product",
            detail: "operands have different line classes".into(),
        });
    }
    let mut sum = 0.0;
    for (key, a_block) in &a.blocks {
        if let Some(b_block) = b.get(key) {
            for (&x, &y) in a_block.iter().zip(b_block.iter()) {
                let x = if conj_a { x.conj() } else { x };
                let y = if conj_b { y.conj() } else { y };
                sum += (x * y).re();
            }
        }
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinor::{Occupancy, Spinor};
    use float_cmp::approx_eq;

    fn toy_space() -> SpinorSpace {
        SpinorSpace::new(
            vec![
                Spinor { index: 0, energy: -0.5, irrep: Irrep(0), occupancy: Occupancy::Hole, active: false },
                Spinor { index: 0, energy: 0.5, irrep: Irrep(0), occupancy: Occupancy::Particle, active: false },
            ],
            1,
        )
    }

    fn toy_symmetry() -> SymmetryTable {
        SymmetryTable::abelian_product(&[1])
    }

    #[test]
    fn reorder_then_inverse_is_identity() {
        let symmetry = toy_symmetry();
        let spinors = toy_space();
        let mut reg = Registry::new(1 << 30, None);
        tmplt(
            &mut reg,
            &symmetry,
            &spinors,
            "a",
            &[ClassLetter::H, ClassLetter::P],
            &[false, false],
            None,
            false,
            ElementType::Real,
            StorageMode::Memory,
        )
        .unwrap();
        {
            let AnyDiagram::Real(d) = reg.require_mut("a").unwrap() else { unreachable!() };
            let key = vec![Irrep(0), Irrep(0)];
            d.blocks.put(key, ndarray::arr2(&[[1.0]]).into_dyn());
        }
        reorder(&mut reg, "a", "a_t", &[1, 0]).unwrap();
        reorder(&mut reg, "a_t", "a_back", &[1, 0]).unwrap();
        let a = reg.require("a").unwrap().as_real().unwrap();
        let back = reg.require("a_back").unwrap().as_real().unwrap();
        assert_eq!(a.order, back.order);
        let diff = diffmax(&mut reg, "a", "a_back").unwrap();
        assert!(approx_eq!(f64, diff, 0.0, epsilon = 1e-12));
    }

    #[test]
    fn perm_of_antisymmetric_pair_is_idempotent() {
        let symmetry = toy_symmetry();
        let spinors = toy_space();
        let mut reg = Registry::new(1 << 30, None);
        tmplt(
            &mut reg,
            &symmetry,
            &spinors,
            "t2",
            &[ClassLetter::H, ClassLetter::H, ClassLetter::P, ClassLetter::P],
            &[false; 4],
            None,
            false,
            ElementType::Real,
            StorageMode::Memory,
        )
        .unwrap();
        {
            let AnyDiagram::Real(d) = reg.require_mut("t2").unwrap() else { unreachable!() };
            let key = vec![Irrep(0), Irrep(0), Irrep(0), Irrep(0)];
            let mut block = ArrayD::zeros(IxDyn(&[1, 1, 1, 1]));
            block[[0, 0, 0, 0]] = 2.0;
            d.blocks.put(key, block);
        }
        perm(&mut reg, "t2", "(12)").unwrap();
        let (before, _, _) = findmax(&mut reg, "t2").unwrap();
        perm(&mut reg, "t2", "(12)").unwrap();
        let (after, _, _) = findmax(&mut reg, "t2").unwrap();
        assert!(approx_eq!(f64, before, after, epsilon = 1e-12));
    }

    #[test]
    fn scalar_product_is_conjugate_symmetric_in_real_mode() {
        let symmetry = toy_symmetry();
        let spinors = toy_space();
        let mut reg = Registry::new(1 << 30, None);
        for name in ["a", "b"] {
            tmplt(
                &mut reg,
                &symmetry,
                &spinors,
                name,
                &[ClassLetter::H, ClassLetter::P],
                &[false, false],
                None,
                false,
                ElementType::Real,
                StorageMode::Memory,
            )
            .unwrap();
        }
        {
            let AnyDiagram::Real(d) = reg.require_mut("a").unwrap() else { unreachable!() };
            d.blocks.put(vec![Irrep(0), Irrep(0)], ndarray::arr2(&[[3.0]]).into_dyn());
        }
        {
            let AnyDiagram::Real(d) = reg.require_mut("b").unwrap() else { unreachable!() };
            d.blocks.put(vec![Irrep(0), Irrep(0)], ndarray::arr2(&[[4.0]]).into_dyn());
        }
        let ab = scalar_product(&mut reg, false, false, "a", "b").unwrap();
        let ba = scalar_product(&mut reg, false, false, "b", "a").unwrap();
        assert!(approx_eq!(f64, ab, ba, epsilon = 1e-12));
        assert!(approx_eq!(f64, ab, 12.0, epsilon = 1e-12));
    }
}

/// Property tests for the kernels' quantified invariants: block symmetry (I1), `reorder`
/// involution, `scalar_product` conjugate symmetry, and `diveps` exactness.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::spinor::{Occupancy, Spinor};
    use float_cmp::approx_eq;
    use proptest::prelude::*;

    fn two_spinor_space(hole_energy: f64, particle_energy: f64) -> SpinorSpace {
        SpinorSpace::new(
            vec![
                Spinor { index: 0, energy: hole_energy, irrep: Irrep(0), occupancy: Occupancy::Hole, active: false },
                Spinor {
                    index: 0,
                    energy: particle_energy,
                    irrep: Irrep(0),
                    occupancy: Occupancy::Particle,
                    active: false,
                },
            ],
            1,
        )
    }

    fn rank2_diagram(reg: &mut Registry, symmetry: &SymmetryTable, spinors: &SpinorSpace, name: &str, value: f64) {
        tmplt(
            reg,
            symmetry,
            spinors,
            name,
            &[ClassLetter::H, ClassLetter::P],
            &[false, false],
            None,
            false,
            ElementType::Real,
            StorageMode::Memory,
        )
        .unwrap();
        let AnyDiagram::Real(d) = reg.require_mut(name).unwrap() else { unreachable!() };
        d.blocks.put(vec![Irrep(0), Irrep(0)], ndarray::arr2(&[[value]]).into_dyn());
    }

    proptest! {
        #[test]
        fn reorder_then_inverse_is_identity_for_any_value(value in -1.0e6_f64..1.0e6) {
            let symmetry = SymmetryTable::abelian_product(&[1]);
            let spinors = two_spinor_space(-0.5, 0.5);
            let mut reg = Registry::new(1 << 30, None);
            rank2_diagram(&mut reg, &symmetry, &spinors, "a", value);
            reorder(&mut reg, "a", "a_t", &[1, 0]).unwrap();
            reorder(&mut reg, "a_t", "a_back", &[1, 0]).unwrap();
            let diff = diffmax(&mut reg, "a", "a_back").unwrap();
            prop_assert!(approx_eq!(f64, diff, 0.0, epsilon = 1e-9));
        }

        #[test]
        fn scalar_product_is_conjugate_symmetric_for_any_values(a_val in -1.0e3_f64..1.0e3, b_val in -1.0e3_f64..1.0e3) {
            let symmetry = SymmetryTable::abelian_product(&[1]);
            let spinors = two_spinor_space(-0.5, 0.5);
            let mut reg = Registry::new(1 << 30, None);
            rank2_diagram(&mut reg, &symmetry, &spinors, "a", a_val);
            rank2_diagram(&mut reg, &symmetry, &spinors, "b", b_val);
            let ab = scalar_product(&mut reg, false, false, "a", "b").unwrap();
            let ba = scalar_product(&mut reg, false, false, "b", "a").unwrap();
            prop_assert!(approx_eq!(f64, ab, ba, epsilon = 1e-6));
        }

        #[test]
        fn diveps_divides_by_the_exact_denominator(
            value in -1.0e3_f64..1.0e3,
            hole_energy in -2.0_f64..-0.1,
            particle_energy in 0.1_f64..2.0,
        ) {
            let symmetry = SymmetryTable::abelian_product(&[1]);
            let spinors = two_spinor_space(hole_energy, particle_energy);
            let mut reg = Registry::new(1 << 30, None);
            rank2_diagram(&mut reg, &symmetry, &spinors, "a", value);
            diveps(&mut reg, "a", &spinors).unwrap();
            let expected = value / (hole_energy - particle_energy);
            let AnyDiagram::Real(d) = reg.require_mut("a").unwrap() else { unreachable!() };
            let block = d.blocks.get(&vec![Irrep(0), Irrep(0)]).unwrap().unwrap();
            prop_assert!(approx_eq!(f64, block[[0, 0]], expected, epsilon = 1e-9));
        }

        #[test]
        fn tmplt_only_allocates_totally_symmetric_blocks(factors in prop::collection::vec(1u16..=3, 1..=3)) {
            let symmetry = SymmetryTable::abelian_product(&factors);
            let spinors = two_spinor_space(-0.5, 0.5);
            let mut reg = Registry::new(1 << 30, None);
            tmplt(
                &mut reg,
                &symmetry,
                &spinors,
                "a",
                &[ClassLetter::H, ClassLetter::P],
                &[false, false],
                None,
                false,
                ElementType::Real,
                StorageMode::Memory,
            )
            .unwrap();
            let d = reg.require("a").unwrap().as_real().unwrap();
            for key in d.blocks.keys() {
                prop_assert!(symmetry.is_totally_symmetric(key));
            }
        }
    }
}
