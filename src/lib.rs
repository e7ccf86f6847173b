//! Crate root: public surface, core aliases, and protocol-wide invariants.
//!
//! This module is the single canonical entry point for downstream users of
//! the library. It centralizes the spatial-vector aliases, the small index
//! newtypes, shared error categories, and re-exports the submodules that
//! implement an on-the-fly kinetic Monte Carlo (OTF-KMC) driver for rare
//! atomistic events.
//!
//! ## Invariants
//!
//! - **Geometry.** Every [`geometry::Geometry`] is canonical only after
//!   [`geometry::Geometry::finalise`] has run: centre-of-mass at the origin,
//!   non-centre atoms sorted by `(colour, |pos|^2)`, fingerprint in sync.
//! - **Catalogue ownership.** [`catalogue::Catalogue`] exclusively owns all
//!   [`environment::Environment`]s. Handles into it ([`catalogue::EnvId`])
//!   are bucket-key + offset pairs, never raw pointers; they are
//!   invalidated by [`catalogue::Catalogue::optimize`] (documented there).
//! - **Concurrency.** Parallel work only happens inside
//!   [`mechanism::find_mechanisms_batch`]; catalogue mutation happens
//!   exclusively on the calling thread between parallel batches.
//! - **No unsafe.** This crate forbids `unsafe` throughout.

#![forbid(unsafe_code)]
#![allow(clippy::too_many_arguments)]

/// Spatial vector used throughout the crate (Cartesian, Angstrom-scaled).
pub type Vec3 = nalgebra::Vector3<f64>;
/// 3x3 rotation/alignment matrix.
pub type Mat3 = nalgebra::Matrix3<f64>;

/// Index of an atom within a supercell's active-atom array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AtomIdx(pub usize);
impl AtomIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Index of a classified site (one per mobile/active atom in the current cell).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteIdx(pub usize);

/// Index of a mechanism within an [`environment::Environment`]'s mechanism list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct MechIdx(pub usize);

/// Colour (species, phase) pair and the discrete-histogram key built from it.
pub mod colour;
/// Real-space point sets, canonical ordering, Kabsch rotor alignment, fingerprinting.
pub mod geometry;
/// Coarse histogram-based bucketing key.
pub mod discrete_key;
/// Catalogue entries: reference geometry, matching radius, known mechanisms.
pub mod environment;
/// Map `DiscreteKey -> bucket of Environment`; canonical insert/lookup; persistence.
pub mod catalogue;
/// Simulation-cell data model (colours, periodic box, active/boundary atoms).
pub mod supercell;
/// Builds `(DiscreteKey, Geometry)` pairs for every mobile atom via a neighbour list.
pub mod classify;
/// Carves focused subcells and projects mechanisms between global/local frames.
pub mod package;
/// Harmonic transition-state-theory prefactor (Vineyard).
pub mod vineyard;
/// Saddle-point finder control loop.
pub mod mechanism;
/// Basin / superbasin / super-cache kinetic Monte Carlo engine.
pub mod kinetics;
/// External-collaborator interfaces: potentials, minimisers, neighbour lists, saddle search.
pub mod traits;
/// Extended-XYZ reader/writer.
pub mod xyz;
/// TOML configuration document and validation.
pub mod config;
/// Top-level driver loop.
pub mod driver;
/// Crate-wide error taxonomy.
pub mod errors;

pub use colour::{Colour, Phase};
pub use errors::{DriverError, KmcError, SearchError};
