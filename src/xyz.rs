//! Extended-XYZ reader/writer.
//!
//! Format: atom count, a comment line carrying `Lattice="lx 0 0 0 ly 0 0 0
//! lz"` plus a `Properties=species:S:1:pos:R:3:frozen:I:1` tag, then one
//! line per atom: `symbol x y z frozen`. `frozen=1` atoms load as
//! [`Phase::Boundary`], `frozen=0` as [`Phase::Active`]; [`Phase::Vacant`]
//! atoms are never present in an input file.

use crate::colour::{Phase, SpeciesTable};
use crate::errors::DriverError;
use crate::supercell::{AtomState, Simbox, Supercell};
use crate::Vec3;
use std::fmt::Write as _;
use std::path::Path;

/// Reads an extended-XYZ file into a [`Supercell`], mapping element symbols
/// through `species` and taking box periodicity from `periodic`.
pub fn read(path: &Path, species: &SpeciesTable, periodic: (bool, bool, bool)) -> Result<Supercell, DriverError> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();

    let n: usize = lines
        .next()
        .ok_or_else(|| DriverError::Persist("empty xyz file".into()))?
        .trim()
        .parse()
        .map_err(|e| DriverError::Persist(format!("bad atom count: {e}")))?;

    let comment = lines
        .next()
        .ok_or_else(|| DriverError::Persist("xyz file missing comment/lattice line".into()))?;

    let simbox = parse_lattice(comment)?;
    let mut cell = Supercell::new(simbox);

    for (i, line) in lines.enumerate() {
        if i >= n {
            break;
        }
        let mut tok = line.split_whitespace();
        let symbol = tok.next().ok_or_else(|| DriverError::Persist(format!("xyz line {i}: missing symbol")))?;
        let x: f64 = parse_field(&mut tok, i, "x")?;
        let y: f64 = parse_field(&mut tok, i, "y")?;
        let z: f64 = parse_field(&mut tok, i, "z")?;
        let frozen: i32 = tok.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        let mut colour = species
            .lookup(symbol)
            .ok_or_else(|| DriverError::Persist(format!("xyz line {i}: unknown species symbol '{symbol}'")))?;
        if frozen != 0 {
            colour.phase = Phase::Boundary;
        }

        let atom = AtomState { pos: Vec3::new(x, y, z), colour };
        match colour.phase {
            Phase::Boundary => cell.boundary.push(atom),
            _ => cell.active.push(atom),
        }
    }

    if cell.active.len() + cell.boundary.len() != n {
        return Err(DriverError::Persist(format!(
            "xyz header declared {n} atoms but {} were read",
            cell.active.len() + cell.boundary.len()
        )));
    }

    cell.simbox.px = periodic.0;
    cell.simbox.py = periodic.1;
    cell.simbox.pz = periodic.2;

    Ok(cell)
}

fn parse_field(tok: &mut std::str::SplitWhitespace, line: usize, name: &str) -> Result<f64, DriverError> {
    tok.next()
        .ok_or_else(|| DriverError::Persist(format!("xyz line {line}: missing {name}")))?
        .parse()
        .map_err(|e| DriverError::Persist(format!("xyz line {line}: bad {name}: {e}")))
}

fn parse_lattice(comment: &str) -> Result<Simbox, DriverError> {
    let key = "Lattice=\"";
    let start = comment.find(key).ok_or_else(|| DriverError::Persist("comment line missing Lattice=\"...\"".into()))?
        + key.len();
    let rest = &comment[start..];
    let end = rest.find('"').ok_or_else(|| DriverError::Persist("unterminated Lattice=\"...\"".into()))?;
    let nums: Vec<f64> = rest[..end]
        .split_whitespace()
        .map(|t| t.parse())
        .collect::<Result<_, _>>()
        .map_err(|e: std::num::ParseFloatError| DriverError::Persist(format!("bad Lattice entry: {e}")))?;
    if nums.len() != 9 {
        return Err(DriverError::Persist(format!("Lattice must have 9 entries, found {}", nums.len())));
    }
    // Orthorhombic only: off-diagonal entries must be zero.
    Ok(Simbox { lx: nums[0], ly: nums[4], lz: nums[8], px: true, py: true, pz: true })
}

/// Writes `cell` to `path` in the same format, tagging active atoms
/// `frozen=0` and boundary atoms `frozen=1`. `comment` must not contain a
/// newline.
pub fn write(path: &Path, cell: &Supercell, comment: &str) -> Result<(), DriverError> {
    assert!(!comment.contains('\n'), "xyz comment line may not contain a newline");

    let mut out = String::new();
    let _ = writeln!(out, "{}", cell.active.len() + cell.boundary.len());
    let _ = writeln!(
        out,
        "{comment} Lattice=\"{} 0 0 0 {} 0 0 0 {}\" Properties=species:S:1:pos:R:3:frozen:I:1",
        cell.simbox.lx, cell.simbox.ly, cell.simbox.lz
    );

    for a in cell.active.iter().chain(cell.boundary.iter()) {
        let frozen = i32::from(a.colour.phase != Phase::Active);
        let _ = writeln!(out, "{}\t{}\t{}\t{}\t{}", a.colour.species_idx, a.pos.x, a.pos.y, a.pos.z, frozen);
    }

    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::Colour;

    fn species() -> SpeciesTable {
        SpeciesTable::from_map(&[("Fe".to_string(), 0, 'A'), ("Fe_fixed".to_string(), 0, 'B')])
    }

    #[test]
    fn read_then_write_round_trips_atom_count_and_box() {
        let dir = std::env::temp_dir().join(format!("otfkmc_xyz_test_{:x}", std::ptr::addr_of!(species) as usize));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cell.xyz");

        std::fs::write(
            &path,
            "2\ntest frame Lattice=\"10 0 0 0 10 0 0 0 10\" Properties=species:S:1:pos:R:3:frozen:I:1\n\
             Fe\t0.0\t0.0\t0.0\t0\n\
             Fe_fixed\t1.0\t0.0\t0.0\t1\n",
        )
        .unwrap();

        let cell = read(&path, &species(), (true, true, true)).unwrap();
        assert_eq!(cell.active.len(), 1);
        assert_eq!(cell.boundary.len(), 1);
        assert!((cell.simbox.lx - 10.0).abs() < 1e-9);
        assert_eq!(cell.active[0].colour, Colour::new(0, Phase::Active));

        let out_path = dir.join("out.xyz");
        write(&out_path, &cell, "round trip").unwrap();
        let reread = read(&out_path, &species(), (true, true, true)).unwrap();
        assert_eq!(reread.active.len() + reread.boundary.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_missing_lattice_tag() {
        let dir = std::env::temp_dir().join("otfkmc_xyz_test_bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.xyz");
        std::fs::write(&path, "1\nno lattice here\nFe 0 0 0 0\n").unwrap();
        assert!(read(&path, &species(), (true, true, true)).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
