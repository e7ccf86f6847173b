//! Catalogue entries: a canonical reference geometry plus its known escape
//! mechanisms.
//!
//! A [`Mechanism`] is a state-to-state transition represented as per-atom
//! displacement vectors (in the canonical geometry's frame) together with
//! an activation energy, a reverse-barrier delta, and a rate prefactor. A
//! [`ProtoMech`] is the same data before it has been localised onto a
//! reference geometry: its displacement spans every active atom of the
//! (sub)cell the saddle search ran in.

use crate::geometry::Geometry;
use crate::Vec3;
use serde::{Deserialize, Serialize};

/// Tolerances controlling whether two mechanisms (or proto-mechanisms) are
/// considered the same escape pathway.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MechanismTolerances {
    /// L2 distance between concatenated displacements, in Angstrom.
    pub r_tol: f64,
    /// Absolute energy tolerance, in eV.
    pub energy_abs_tol: f64,
    /// Fractional energy tolerance.
    pub energy_frac_tol: f64,
    /// Minimum fraction of a proto-mechanism's displacement that must be
    /// captured by localisation for the result to be trusted.
    pub rel_cap_tol: f64,
}

fn within_energy_tol(a: f64, b: f64, abs_tol: f64, frac_tol: f64) -> bool {
    (a - b).abs() <= (abs_tol).max(frac_tol * a.abs())
}

/// A localised mechanism: per-active-atom Cartesian displacement in the
/// canonical geometry's frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mechanism {
    pub activation_energy: f64,
    pub delta_energy: f64,
    pub prefactor: f64,
    pub displacement: Vec<Vec3>,
    /// L2 norm of the displacement that was actually captured during
    /// localisation (see `Packager::unpack`).
    pub abs_cap: f64,
    /// Fraction of the originating proto-mechanism's displacement captured.
    pub rel_cap: f64,
}

impl Mechanism {
    pub fn within_tol(&self, other: &Mechanism, tol: &MechanismTolerances) -> bool {
        if !within_energy_tol(self.activation_energy, other.activation_energy, tol.energy_abs_tol, tol.energy_frac_tol) {
            return false;
        }
        if !within_energy_tol(self.delta_energy, other.delta_energy, tol.energy_abs_tol, tol.energy_frac_tol) {
            return false;
        }
        let mut sum_sq = 0.0;
        if self.displacement.len() != other.displacement.len() {
            return false;
        }
        for (a, b) in self.displacement.iter().zip(&other.displacement) {
            sum_sq += (a - b).norm_squared();
        }
        sum_sq.sqrt() <= tol.r_tol
    }
}

/// A mechanism before localisation: a flat global displacement over every
/// active atom of the cell the saddle search ran in.
#[derive(Clone, Debug)]
pub struct ProtoMech {
    pub activation_energy: f64,
    pub delta_energy: f64,
    pub prefactor: f64,
    pub displacement: nalgebra::DVector<f64>,
}

impl ProtoMech {
    pub fn within_tol(&self, other: &ProtoMech, tol: &MechanismTolerances) -> bool {
        if !within_energy_tol(self.activation_energy, other.activation_energy, tol.energy_abs_tol, tol.energy_frac_tol) {
            return false;
        }
        if !within_energy_tol(self.delta_energy, other.delta_energy, tol.energy_abs_tol, tol.energy_frac_tol) {
            return false;
        }
        if self.displacement.len() != other.displacement.len() {
            return false;
        }
        (&self.displacement - &other.displacement).norm() <= tol.r_tol
    }

    /// The active atom (by index into the cell's active array) with the
    /// largest displacement magnitude — defines the mechanism's centre.
    pub fn find_centre(&self) -> usize {
        let n = self.displacement.len() / 3;
        let mut best = 0usize;
        let mut best_norm = f64::NEG_INFINITY;
        for i in 0..n {
            let v = Vec3::new(self.displacement[3 * i], self.displacement[3 * i + 1], self.displacement[3 * i + 2]);
            let ns = v.norm_squared();
            if ns > best_norm {
                best_norm = ns;
                best = i;
            }
        }
        best
    }

    pub fn norm(&self) -> f64 {
        self.displacement.norm()
    }
}

/// A catalogue entry: the canonical reference geometry, the matching radius
/// currently trusted, and every mechanism discovered from it.
///
/// Invariants: every mechanism's active-atom count equals the number of
/// active atoms in the reference geometry; `delta` only shrinks after
/// construction (refinement never grows it).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub geometry: Geometry,
    pub delta: f64,
    pub mechanisms: Vec<Mechanism>,
    pub freq: u64,
    pub refine_count: u64,
}

impl Environment {
    pub fn new(geometry: Geometry, delta: f64) -> Self {
        Self { geometry, delta, mechanisms: Vec::new(), freq: 0, refine_count: 0 }
    }

    /// Inserts `m` unless an equivalent mechanism (under `tol`) already
    /// exists, in which case the existing one is kept. Returns `true` if
    /// `m` was inserted.
    pub fn try_push_mech(&mut self, m: Mechanism, tol: &MechanismTolerances) -> bool {
        if self.mechanisms.iter().any(|existing| existing.within_tol(&m, tol)) {
            return false;
        }
        self.mechanisms.push(m);
        true
    }
}
