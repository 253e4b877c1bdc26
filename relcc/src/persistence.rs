//! Diagram persistence: the `write`/`read` kernels and the on-disk layout they use.
//!
//! Layout: a fixed-size header (name, rank, class string, valence mask, storage order, element
//! type, block count) followed by one record per block: its irrep tuple, its dimensions, then its
//! raw little-endian IEEE-754 doubles (pairs of doubles for complex elements).

use crate::diagram::{AnyDiagram, Diagram};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::scalar::Scalar;
use crate::spinor::ClassLetter;
use crate::symmetry::Irrep;
use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"RCC1";
const ELEM_REAL: u8 = 0;
const ELEM_COMPLEX: u8 = 1;

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Storage { path: path.display().to_string(), source }
}

fn write_string(w: &mut impl Write, s: &str, path: &Path) -> Result<()> {
    let bytes = s.as_bytes();
    w.write_all(&(bytes.len() as u32).to_le_bytes()).map_err(|e| io_err(path, e))?;
    w.write_all(bytes).map_err(|e| io_err(path, e))
}

fn read_string(r: &mut impl Read, path: &Path) -> Result<String> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(|e| io_err(path, e))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
    String::from_utf8(buf)
        .map_err(|e| Error::Codec { path: path.display().to_string(), source: Box::new(bincode::ErrorKind::Custom(e.to_string())) })
}

/// `write`: serialises `name` to `path`.
///
/// # Errors
///
/// [`Error::NotFound`] if `name` is not registered, [`Error::Storage`] on I/O failure.
pub fn write(registry: &mut Registry, name: &str, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| io_err(path, e))?;
    let mut w = BufWriter::new(file);

    let diagram = registry.require(name)?;
    write_string(&mut w, name, path)?;
    w.write_all(MAGIC).map_err(|e| io_err(path, e))?;
    w.write_all(&[match diagram {
        AnyDiagram::Real(_) => ELEM_REAL,
        AnyDiagram::Complex(_) => ELEM_COMPLEX,
    }])
    .map_err(|e| io_err(path, e))?;

    let classes: String = diagram.classes().iter().map(|c| c.as_char()).collect();
    write_string(&mut w, &classes, path)?;

    match registry.require_mut(name)? {
        AnyDiagram::Real(d) => write_body(&mut w, d, path),
        AnyDiagram::Complex(d) => write_body(&mut w, d, path),
    }
}

fn write_body<S: Scalar + LittleEndianCodec>(w: &mut impl Write, d: &mut Diagram<S>, path: &Path) -> Result<()> {
    let rank = d.rank();
    w.write_all(&(rank as u32).to_le_bytes()).map_err(|e| io_err(path, e))?;
    for &v in &d.valence_mask {
        w.write_all(&[u8::from(v)]).map_err(|e| io_err(path, e))?;
    }
    for &o in &d.order {
        w.write_all(&(o as u32).to_le_bytes()).map_err(|e| io_err(path, e))?;
    }
    w.write_all(&[u8::from(d.perm_unique)]).map_err(|e| io_err(path, e))?;

    let blocks = d.blocks.enumerate_cloned()?;
    w.write_all(&(blocks.len() as u64).to_le_bytes()).map_err(|e| io_err(path, e))?;
    for (key, block) in blocks {
        for irrep in &key {
            w.write_all(&irrep.0.to_le_bytes()).map_err(|e| io_err(path, e))?;
        }
        w.write_all(&(block.ndim() as u32).to_le_bytes()).map_err(|e| io_err(path, e))?;
        for &dim in block.shape() {
            w.write_all(&(dim as u64).to_le_bytes()).map_err(|e| io_err(path, e))?;
        }
        for value in block.iter() {
            value.write_le(w, path)?;
        }
    }
    Ok(())
}

/// `read`: deserialises a diagram from `path`, registering it under its persisted
/// name (or `override_name` if given, e.g. to load a foreign sector's H_eff under a local alias).
///
/// # Errors
///
/// [`Error::Storage`]/[`Error::Codec`] on I/O or format failure, [`Error::AlreadyExists`] if the
/// resolved name is already registered.
pub fn read(registry: &mut Registry, path: &Path, override_name: Option<&str>) -> Result<String> {
    let file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut r = BufReader::new(file);

    let persisted_name = read_string(&mut r, path)?;
    let name = override_name.map_or(persisted_name, str::to_owned);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|e| io_err(path, e))?;
    if &magic != MAGIC {
        return Err(Error::Codec {
            path: path.display().to_string(),
            source: Box::new(bincode::ErrorKind::Custom("bad magic".into())),
        });
    }
    let mut elem_tag = [0u8; 1];
    r.read_exact(&mut elem_tag).map_err(|e| io_err(path, e))?;

    let classes_str = read_string(&mut r, path)?;
    let classes: Vec<ClassLetter> = classes_str
        .chars()
        .map(|c| {
            ClassLetter::from_char(c).ok_or_else(|| Error::Codec {
                path: path.display().to_string(),
                source: Box::new(bincode::ErrorKind::Custom(format!("bad class letter '{c}'"))),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let diagram = match elem_tag[0] {
        ELEM_REAL => AnyDiagram::Real(read_body::<f64>(&mut r, &name, classes, path)?),
        ELEM_COMPLEX => AnyDiagram::Complex(read_body::<Complex64>(&mut r, &name, classes, path)?),
        other => {
            return Err(Error::Codec {
                path: path.display().to_string(),
                source: Box::new(bincode::ErrorKind::Custom(format!("bad element tag {other}"))),
            })
        }
    };
    registry.insert(diagram)?;
    Ok(name)
}

fn read_body<S: Scalar + LittleEndianCodec>(
    r: &mut impl Read,
    name: &str,
    classes: Vec<ClassLetter>,
    path: &Path,
) -> Result<Diagram<S>> {
    let mut u32buf = [0u8; 4];
    r.read_exact(&mut u32buf).map_err(|e| io_err(path, e))?;
    let rank = u32::from_le_bytes(u32buf) as usize;

    let mut valence_mask = Vec::with_capacity(rank);
    for _ in 0..rank {
        let mut b = [0u8; 1];
        r.read_exact(&mut b).map_err(|e| io_err(path, e))?;
        valence_mask.push(b[0] != 0);
    }
    let mut order = Vec::with_capacity(rank);
    for _ in 0..rank {
        r.read_exact(&mut u32buf).map_err(|e| io_err(path, e))?;
        order.push(u32::from_le_bytes(u32buf) as usize);
    }
    let mut perm_unique_buf = [0u8; 1];
    r.read_exact(&mut perm_unique_buf).map_err(|e| io_err(path, e))?;
    let perm_unique = perm_unique_buf[0] != 0;

    let mut u64buf = [0u8; 8];
    r.read_exact(&mut u64buf).map_err(|e| io_err(path, e))?;
    let block_count = u64::from_le_bytes(u64buf);

    let mut diagram = Diagram::new(
        name.to_owned(),
        classes,
        valence_mask,
        order,
        perm_unique,
        crate::block::StorageMode::Memory,
        None,
    );

    for _ in 0..block_count {
        let mut key = Vec::with_capacity(rank);
        for _ in 0..rank {
            let mut irr_buf = [0u8; 2];
            r.read_exact(&mut irr_buf).map_err(|e| io_err(path, e))?;
            key.push(Irrep(u16::from_le_bytes(irr_buf)));
        }
        r.read_exact(&mut u32buf).map_err(|e| io_err(path, e))?;
        let ndim = u32::from_le_bytes(u32buf) as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            r.read_exact(&mut u64buf).map_err(|e| io_err(path, e))?;
            shape.push(u64::from_le_bytes(u64buf) as usize);
        }
        let total: usize = shape.iter().product();
        let mut values = Vec::with_capacity(total);
        for _ in 0..total {
            values.push(S::read_le(r, path)?);
        }
        let array = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| Error::ShapeMismatch { op: "persistence::read", detail: e.to_string() })?;
        diagram.blocks.put(key, array);
    }
    Ok(diagram)
}

/// Raw little-endian IEEE-754 encode/decode, implemented per [`Scalar`] concrete type (real:
/// one `f64`; complex: a pair of `f64`s, real part first).
pub trait LittleEndianCodec: Sized {
    /// Writes this value's raw little-endian representation.
    fn write_le(self, w: &mut impl Write, path: &Path) -> Result<()>;
    /// Reads one value's raw little-endian representation.
    fn read_le(r: &mut impl Read, path: &Path) -> Result<Self>;
}

impl LittleEndianCodec for f64 {
    fn write_le(self, w: &mut impl Write, path: &Path) -> Result<()> {
        w.write_all(&self.to_le_bytes()).map_err(|e| io_err(path, e))
    }

    fn read_le(r: &mut impl Read, path: &Path) -> Result<Self> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
        Ok(Self::from_le_bytes(buf))
    }
}

impl LittleEndianCodec for Complex64 {
    fn write_le(self, w: &mut impl Write, path: &Path) -> Result<()> {
        self.re.write_le(w, path)?;
        self.im.write_le(w, path)
    }

    fn read_le(r: &mut impl Read, path: &Path) -> Result<Self> {
        let re = f64::read_le(r, path)?;
        let im = f64::read_le(r, path)?;
        Ok(Self::new(re, im))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::StorageMode;
    use crate::kernels::{self, ElementType};
    use crate::spinor::{Occupancy, Spinor, SpinorSpace};
    use crate::symmetry::SymmetryTable;
    use float_cmp::approx_eq;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_diagram() {
        let symmetry = SymmetryTable::abelian_product(&[1]);
        let spinors = SpinorSpace::new(
            vec![
                Spinor { index: 0, energy: -0.5, irrep: Irrep(0), occupancy: Occupancy::Hole, active: false },
                Spinor { index: 0, energy: 0.5, irrep: Irrep(0), occupancy: Occupancy::Particle, active: false },
            ],
            1,
        );
        let mut reg = Registry::new(1 << 30, None);
        kernels::tmplt(
            &mut reg,
            &symmetry,
            &spinors,
            "t2c",
            &[ClassLetter::H, ClassLetter::H, ClassLetter::P, ClassLetter::P],
            &[false; 4],
            None,
            false,
            ElementType::Real,
            StorageMode::Memory,
        )
        .unwrap();
        {
            let AnyDiagram::Real(d) = reg.require_mut("t2c").unwrap() else { unreachable!() };
            let mut block = ArrayD::zeros(IxDyn(&[1, 1, 1, 1]));
            block[[0, 0, 0, 0]] = 0.125;
            d.blocks.put(vec![Irrep(0); 4], block);
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("t2c.dg");
        write(&mut reg, "t2c", &path).unwrap();
        kernels::erase(&mut reg, "t2c");
        let name = read(&mut reg, &path, None).unwrap();
        assert_eq!(name, "t2c");

        let (max, _, _) = kernels::findmax(&mut reg, "t2c").unwrap();
        assert!(approx_eq!(f64, max, 0.125, epsilon = 1e-12));
    }
}
