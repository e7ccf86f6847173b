//! Harmonic transition-state-theory rate prefactor (Vineyard's formula)
//! from the mass-weighted Hessian eigenvalues at a basin minimum and its
//! adjoining saddle.
//!
//! Unlike the reference this crate's prefactor is derived from, mass
//! weighting here uses each atom's own species mass rather than assuming
//! every atom weighs exactly one atomic mass unit — the earlier
//! implementation's hardcoded `1 amu` divisor under-weighted anything
//! heavier than hydrogen.

use crate::errors::SearchError;
use crate::supercell::Supercell;
use crate::traits::Potential;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

const AMU_TO_KG: f64 = 1.660_539_066_60e-27;
const EV_TO_J: f64 = 1.602_176_634e-19;
const ANGSTROM_TO_M: f64 = 1e-10;

/// Converts `sqrt(eV / (amu * Angstrom^2))` to rad/s.
fn rad_per_s_per_unit() -> f64 {
    (EV_TO_J / (AMU_TO_KG * ANGSTROM_TO_M * ANGSTROM_TO_M)).sqrt()
}

/// Eigenvalues of the mass-weighted Hessian at a minimum, below which a
/// mode is treated as numerically zero (translations/rotations) rather than
/// genuinely negative (an unstable direction).
#[derive(Clone, Copy, Debug)]
pub struct VineyardTol(pub f64);

/// Holds the eigen-spectra of a basin/saddle pair and derives their
/// harmonic rate prefactor.
pub struct Vineyard {
    tol: f64,
    ev_basin: Option<DVector<f64>>,
    ev_sp: Option<DVector<f64>>,
}

fn mass_weight(hessian: &DMatrix<f64>, masses_per_atom: &[f64]) -> DMatrix<f64> {
    let n = masses_per_atom.len();
    assert_eq!(hessian.nrows(), n * 3);
    let mut out = hessian.clone();
    for i in 0..n {
        for di in 0..3 {
            for j in 0..n {
                for dj in 0..3 {
                    let scale = 1.0 / (masses_per_atom[i] * masses_per_atom[j]).sqrt();
                    out[(3 * i + di, 3 * j + dj)] *= scale;
                }
            }
        }
    }
    out
}

fn eigenvalues(cell: &Supercell, potential: &dyn Potential) -> Result<DVector<f64>, SearchError> {
    let hessian = potential.hessian(cell)?;
    let masses = potential.masses();
    let per_atom: Vec<f64> = cell.active.iter().map(|a| masses[a.colour.species_idx]).collect();
    let weighted = mass_weight(&hessian, &per_atom);
    let eig = SymmetricEigen::new(weighted);
    Ok(eig.eigenvalues)
}

impl Vineyard {
    pub fn new(tol: VineyardTol) -> Self {
        Self { tol: tol.0, ev_basin: None, ev_sp: None }
    }

    /// Primes the basin spectrum; errors if any mode is more negative than
    /// `-tol` (the configuration isn't actually a minimum).
    pub fn load_basin(&mut self, cell: &Supercell, potential: &dyn Potential) -> Result<(), SearchError> {
        let ev = eigenvalues(cell, potential)?;
        let order = ev.iter().filter(|&&v| v < -self.tol).count();
        if order != 0 {
            return Err(SearchError::BadSaddleOrder(order));
        }
        self.ev_basin = Some(ev);
        Ok(())
    }

    /// Primes the saddle spectrum. Returns `Ok(true)` iff it is first-order
    /// (exactly one mode below `-tol`); `Ok(false)` for a minimum or a
    /// higher-order stationary point — both are recoverable, the caller
    /// should discard and retry rather than treat it as an error.
    pub fn load_sp(&mut self, cell: &Supercell, potential: &dyn Potential) -> Result<bool, SearchError> {
        let ev = eigenvalues(cell, potential)?;
        let order = ev.iter().filter(|&&v| v < -self.tol).count();
        self.ev_sp = Some(ev);
        Ok(order == 1)
    }

    /// Harmonic TST rate prefactor, in Hz, from the primed basin/saddle
    /// spectra: `sqrt(prod(basin positive modes) / prod(saddle positive
    /// modes)) / (2*pi)`, expressed in the cell's native eV/amu/Angstrom
    /// units and converted to SI.
    pub fn prefactor(&self) -> f64 {
        let basin = self.ev_basin.as_ref().expect("Vineyard not primed with load_basin");
        let sp = self.ev_sp.as_ref().expect("Vineyard not primed with load_sp");
        assert_eq!(basin.len(), sp.len(), "basin/saddle spectra must have equal dimension");

        let mut ratio = 1.0;
        for &lambda in basin.iter() {
            if lambda > self.tol {
                ratio *= lambda;
            }
        }
        for &lambda in sp.iter() {
            if lambda > self.tol {
                ratio /= lambda;
            }
        }

        (ratio.sqrt() * rad_per_s_per_unit()) / (2.0 * std::f64::consts::PI)
    }
}
