//! Real-space point sets, canonical ordering, Kabsch rotor alignment, and
//! the rotation/permutation-invariant fingerprint used as a fast pre-filter.
//!
//! ## Invariants (enforced only after [`Geometry::finalise`])
//!
//! - `atoms[0]` is the central atom; `atoms[1..]` are sorted by
//!   `(colour, |pos|^2)`.
//! - The centroid of every atom (including the centre) is translated to
//!   the origin.
//! - [`Fingerprint`] is derived and kept in sync; it is never recomputed
//!   lazily, to keep `equiv`/`chebyshev_norm` allocation-free on the hot
//!   path.
//!
//! Two geometries are *equal* modulo rotation + permutation of equal-colour
//! atoms; that notion of equality is [`Geometry::permute_onto`], the
//! innermost hot path of the whole crate. Its correctness hinges on the
//! sort-order invariant above and the `sqrt(2) * delta` prune bound used by
//! [`Fingerprint::equivalent`]: two points each perturbed by at most `delta`
//! can move apart by at most `sqrt(2) * delta`.

use crate::{colour::Colour, Mat3, Vec3};
use serde::{Deserialize, Serialize};

/// Maximum number of already-placed atoms checked when pruning a candidate
/// permutation in [`Geometry::permute_onto`] ("max coplanar atoms" guard).
pub const MAX_COPLANAR_ATOMS: usize = 6;

const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// One atom inside a [`Geometry`]: position relative to the geometry's
/// centroid, its colour, and a back-reference to the real atom it was
/// built from (used to write mechanisms back onto the owning supercell;
/// ghost atoms introduced by periodic reduction carry their owning atom's
/// real index here, not a synthetic ghost index).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoAtom {
    pub pos: Vec3,
    pub colour: Colour,
    pub backref: usize,
}

/// Rotation/permutation-invariant summary of intra-atomic distances.
///
/// `r0j` holds the sorted distances from the centre to every other atom;
/// `rij` holds the sorted distances between every distinct pair of
/// non-central atoms. Both are non-decreasing by construction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub r0j: Vec<f64>,
    pub rij: Vec<f64>,
}

impl Fingerprint {
    fn build(atoms: &[GeoAtom]) -> Self {
        let mut r0j: Vec<f64> = atoms[1..].iter().map(|a| (a.pos - atoms[0].pos).norm()).collect();
        let mut rij = Vec::with_capacity(atoms.len().saturating_sub(1) * atoms.len().saturating_sub(2) / 2);
        for i in 1..atoms.len() {
            for j in (i + 1)..atoms.len() {
                rij.push((atoms[i].pos - atoms[j].pos).norm());
            }
        }
        r0j.sort_by(|a, b| a.partial_cmp(b).unwrap());
        rij.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Self { r0j, rij }
    }

    /// `r_min = min(min r0j, min rij)`, the smallest pairwise distance
    /// present anywhere in the geometry.
    pub fn r_min(&self) -> f64 {
        let a = self.r0j.iter().cloned().fold(f64::INFINITY, f64::min);
        let b = self.rij.iter().cloned().fold(f64::INFINITY, f64::min);
        a.min(b)
    }

    /// True iff both sequences have equal length and every pairwise element
    /// differs by at most `tol` (callers pass `sqrt(2) * delta` to use this
    /// as a sound pre-filter for [`Geometry::permute_onto`]).
    pub fn equivalent(&self, other: &Fingerprint, tol: f64) -> bool {
        if self.r0j.len() != other.r0j.len() || self.rij.len() != other.rij.len() {
            return false;
        }
        self.r0j.iter().zip(&other.r0j).all(|(a, b)| (a - b).abs() <= tol)
            && self.rij.iter().zip(&other.rij).all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Chebyshev (L-infinity) distance between two fingerprints of equal
    /// shape; used by the catalogue's best-match bucket search.
    pub fn chebyshev(&self, other: &Fingerprint) -> f64 {
        assert_eq!(self.r0j.len(), other.r0j.len(), "fingerprints have different #atoms");
        assert_eq!(self.rij.len(), other.rij.len(), "fingerprints have different #atoms");
        let mut max = 0.0f64;
        for (a, b) in self.r0j.iter().zip(&other.r0j) {
            max = max.max((a - b).abs());
        }
        for (a, b) in self.rij.iter().zip(&other.rij) {
            max = max.max((a - b).abs());
        }
        max
    }
}

/// Result of a successful [`Geometry::permute_onto`]: the achieved L2 norm
/// and the rotation required to align `this` onto the reference.
#[derive(Clone, Copy, Debug)]
pub struct PermuteResult {
    pub dr: f64,
    pub rotor: Mat3,
}

/// An ordered, centre-first sequence of atoms within a local region.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Geometry {
    atoms: Vec<GeoAtom>,
    fingerprint: Fingerprint,
}

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.atoms.clear();
        self.fingerprint = Fingerprint::default();
    }

    pub fn append(&mut self, pos: Vec3, colour: Colour, backref: usize) {
        self.atoms.push(GeoAtom { pos, colour, backref });
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn atoms(&self) -> &[GeoAtom] {
        &self.atoms
    }

    /// Must be called after all atoms are appended. Computes the centroid,
    /// translates it to the origin, sorts non-centre atoms by
    /// `(colour, |pos|^2)`, and (re)builds the fingerprint.
    pub fn finalise(&mut self) {
        assert!(!self.atoms.is_empty(), "too few atoms in geometry");

        let com: Vec3 = self.atoms.iter().map(|a| a.pos).fold(Vec3::zeros(), |acc, p| acc + p)
            / self.atoms.len() as f64;
        for a in self.atoms.iter_mut() {
            a.pos -= com;
        }

        self.atoms[1..].sort_by(|a, b| {
            a.colour
                .cmp(&b.colour)
                .then_with(|| a.pos.norm_squared().partial_cmp(&b.pos.norm_squared()).unwrap())
        });

        self.fingerprint = Fingerprint::build(&self.atoms);
    }

    pub fn equiv(&self, tol: f64, other: &Geometry) -> bool {
        self.fingerprint.equivalent(&other.fingerprint, tol)
    }

    pub fn chebyshev_norm(&self, other: &Geometry) -> f64 {
        self.fingerprint.chebyshev(&other.fingerprint)
    }

    /// The Kabsch-optimal orthogonal matrix `R` minimising
    /// `sum_i |R * self[i] - other[i]|^2`. Reflections are accepted (no
    /// sign correction): the catalogue treats mirror images of an
    /// environment as equivalent, so this is a property, not a bug.
    pub fn rotor_onto(&self, other: &Geometry) -> Mat3 {
        assert_eq!(self.len(), other.len(), "can't rotate geometries of different sizes");

        let mut h = Mat3::zeros();
        for (a, b) in self.atoms.iter().zip(&other.atoms) {
            h += a.pos * b.pos.transpose();
        }

        let svd = nalgebra::SVD::new(h, true, true);
        let u = svd.u.expect("full U");
        let v_t = svd.v_t.expect("full V^T");
        v_t.transpose() * u.transpose()
    }

    /// Attempts to reorder `self` (a mutable working copy) so that, after
    /// rotation, its L2 distance to `reference` is `< delta`. Recursive
    /// backtracking over positions `1..size`; position 0 (the centre) is
    /// never moved.
    ///
    /// Returns `None` if no permutation achieves the tolerance. Mutates
    /// `self`'s atom order even on failure is avoided: every tentative swap
    /// is undone before returning.
    pub fn permute_onto(&mut self, delta: f64, reference: &Geometry) -> Option<PermuteResult> {
        assert_eq!(self.len(), reference.len(), "wrong number of atoms in reference");
        permute_rec(reference, self, delta, 1)
    }
}

fn within_tol_up_to(reference: &Geometry, candidate: &Geometry, tol: f64, n: usize) -> bool {
    let bound = n.min(MAX_COPLANAR_ATOMS);
    for i in 0..bound {
        let d_ref = (reference.atoms[n].pos - reference.atoms[i].pos).norm();
        let d_mut = (candidate.atoms[n].pos - candidate.atoms[i].pos).norm();
        if (d_ref - d_mut).abs() > tol {
            return false;
        }
    }
    true
}

fn permute_rec(reference: &Geometry, mutable: &mut Geometry, delta: f64, n: usize) -> Option<PermuteResult> {
    if n >= mutable.len() {
        let rotor = mutable.rotor_onto(reference);
        let mut sum_sq = 0.0;
        for i in 0..mutable.len() {
            let rotated = rotor * mutable.atoms[i].pos;
            sum_sq += (reference.atoms[i].pos - rotated).norm_squared();
        }
        return if sum_sq < delta * delta {
            Some(PermuteResult { dr: sum_sq.sqrt(), rotor })
        } else {
            None
        };
    }

    for i in n..reference.len() {
        if mutable.atoms[i].colour == reference.atoms[n].colour {
            mutable.atoms.swap(n, i);

            if within_tol_up_to(reference, mutable, SQRT_2 * delta, n) {
                if let Some(res) = permute_rec(reference, mutable, delta, n + 1) {
                    return Some(res);
                }
            }

            mutable.atoms.swap(n, i);
        }
    }

    None
}
