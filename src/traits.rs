//! External-collaborator interfaces.
//!
//! The numerics that actually drive an atomistic simulation — interatomic
//! potentials, minimisers, saddle-point search, and neighbour lists — are
//! out of scope here and specified only by these traits, exactly as the
//! collaborator it's adapted from treats them as customisation points
//! selected at configuration time (see `load_potential`/`load_minimiser` in
//! the reference implementation). Each trait ships one minimal concrete
//! implementation so the crate is runnable end-to-end on a toy system and
//! so the driver's tests don't need a real forcefield.

use crate::errors::SearchError;
use crate::supercell::Supercell;
use crate::Vec3;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

/// An interatomic potential: energy, gradient, and (optionally) a
/// mass-weighted Hessian over a cell's active coordinates.
pub trait Potential: Send + Sync {
    /// Cutoff radius beyond which atoms never interact.
    fn rcut(&self) -> f64;

    fn energy(&self, cell: &Supercell) -> f64;

    /// Gradient of energy with respect to active-atom coordinates, flattened
    /// `3 * n_active`.
    fn gradient(&self, cell: &Supercell) -> DVector<f64>;

    /// Mass-weighted Hessian over active coordinates. Only required by
    /// [`crate::vineyard`]; potentials that don't support it may error.
    fn hessian(&self, _cell: &Supercell) -> Result<DMatrix<f64>, SearchError> {
        Err(SearchError::PotentialFault("hessian not implemented for this potential".into()))
    }

    /// Per-species mass table, `species_idx -> mass (amu)`.
    fn masses(&self) -> &[f64];
}

/// Drives a cell's active coordinates to a nearby local minimum.
pub trait Minimiser: Send + Sync {
    fn minimise(&self, potential: &dyn Potential, cell: &mut Supercell) -> Result<f64, SearchError>;
}

/// Result of a successful saddle-point search: the converged state is left
/// in `cell`; `mode` is the eigenvector of the unstable mode at the saddle
/// (used to perturb off the saddle towards each adjoining basin).
pub struct SaddleResult {
    pub activation_energy: f64,
    pub mode: DVector<f64>,
}

/// Searches for a first-order saddle point near a cell's current (already
/// perturbed) configuration, starting from an initial direction guess.
pub trait SaddleSearch: Send + Sync {
    fn find_saddle(
        &self,
        potential: &dyn Potential,
        cell: &mut Supercell,
        initial_direction: &DVector<f64>,
    ) -> Result<SaddleResult, SearchError>;
}

/// One neighbour of a queried atom: position relative to the queried atom
/// under minimum-image convention, its colour, and its index into the
/// owning cell's `active` (if `is_boundary` is false) or `boundary` array.
#[derive(Clone, Copy, Debug)]
pub struct Neighbour {
    pub rel_pos: Vec3,
    pub colour: crate::colour::Colour,
    pub index: usize,
    pub is_boundary: bool,
}

/// Builds and queries a spatial acceleration structure over a cell.
pub trait NeighbourList: Send + Sync {
    fn rebuild(&mut self, cell: &Supercell, r_cut: f64);

    /// Neighbours of active atom `i` within the cutoff passed to the last
    /// `rebuild`, excluding `i` itself.
    fn neighbours_of(&self, cell: &Supercell, i: usize) -> Vec<Neighbour>;
}

/// Harmonic test potential: independent springs pulling every active atom
/// back to its starting position. Has a trivially analytic Hessian, which
/// makes it useful for exercising [`crate::vineyard`] without a real
/// forcefield.
pub struct HarmonicPotential {
    pub k: f64,
    pub reference: DVector<f64>,
    pub masses: Vec<f64>,
    pub rcut: f64,
}

impl Potential for HarmonicPotential {
    fn rcut(&self) -> f64 {
        self.rcut
    }

    fn energy(&self, cell: &Supercell) -> f64 {
        let state = cell.active_state();
        0.5 * self.k * (&state - &self.reference).norm_squared()
    }

    fn gradient(&self, cell: &Supercell) -> DVector<f64> {
        let state = cell.active_state();
        self.k * (&state - &self.reference)
    }

    fn hessian(&self, cell: &Supercell) -> Result<DMatrix<f64>, SearchError> {
        let n = cell.active.len() * 3;
        Ok(DMatrix::identity(n, n) * self.k)
    }

    fn masses(&self) -> &[f64] {
        &self.masses
    }
}

/// Steepest-descent minimiser: fixed-step gradient descent until the force
/// norm drops below `f_tol` or `max_iter` is exhausted.
pub struct SteepestDescent {
    pub step: f64,
    pub f_tol: f64,
    pub max_iter: usize,
}

impl Minimiser for SteepestDescent {
    fn minimise(&self, potential: &dyn Potential, cell: &mut Supercell) -> Result<f64, SearchError> {
        for _ in 0..self.max_iter {
            let grad = potential.gradient(cell);
            if grad.norm() < self.f_tol {
                return Ok(potential.energy(cell));
            }
            let state = cell.active_state();
            cell.set_active_state(&(state - self.step * &grad));
        }
        let grad = potential.gradient(cell);
        if grad.norm() < self.f_tol {
            Ok(potential.energy(cell))
        } else {
            Err(SearchError::NotConverged)
        }
    }
}

/// Brute-force O(n^2) neighbour list; adequate for the small test cells
/// this crate ships with, not for production-scale simulation.
#[derive(Default)]
pub struct BruteForceNeighbourList {
    r_cut: f64,
}

impl NeighbourList for BruteForceNeighbourList {
    fn rebuild(&mut self, _cell: &Supercell, r_cut: f64) {
        self.r_cut = r_cut;
    }

    fn neighbours_of(&self, cell: &Supercell, i: usize) -> Vec<Neighbour> {
        let centre = cell.active[i].pos;
        let mut out = Vec::new();

        for (j, a) in cell.active.iter().enumerate() {
            if i == j {
                continue;
            }
            let rel = cell.min_image(a.pos, centre);
            if rel.norm() <= self.r_cut {
                out.push(Neighbour { rel_pos: rel, colour: a.colour, index: j, is_boundary: false });
            }
        }
        for (j, a) in cell.boundary.iter().enumerate() {
            let rel = cell.min_image(a.pos, centre);
            if rel.norm() <= self.r_cut {
                out.push(Neighbour { rel_pos: rel, colour: a.colour, index: j, is_boundary: true });
            }
        }
        out
    }
}

/// Deterministic saddle stand-in: steps a fixed fraction along the initial
/// direction and reports a fixed activation energy. Only useful for driving
/// the control flow in tests; never mistake this for a real saddle search.
pub struct ScriptedSaddleSearch {
    pub activation_energy: f64,
    pub step_fraction: f64,
}

impl SaddleSearch for ScriptedSaddleSearch {
    fn find_saddle(
        &self,
        _potential: &dyn Potential,
        cell: &mut Supercell,
        initial_direction: &DVector<f64>,
    ) -> Result<SaddleResult, SearchError> {
        let state = cell.active_state();
        let dir = if initial_direction.norm() > 0.0 {
            initial_direction / initial_direction.norm()
        } else {
            return Err(SearchError::DegenerateMinimum(0.0));
        };
        cell.set_active_state(&(state + self.step_fraction * &dir));
        Ok(SaddleResult { activation_energy: self.activation_energy, mode: dir })
    }
}

/// Species-index to mass table built from a config's `[potential].masses`
/// map; used by concrete `Potential` loaders.
pub fn masses_from_map(map: &HashMap<String, f64>, species_order: &[String]) -> Vec<f64> {
    species_order.iter().map(|s| map.get(s).copied().unwrap_or(1.0)).collect()
}
