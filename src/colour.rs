//! Atom colour: a `(species, phase)` pair, and its index projection.
//!
//! A [`Colour`] is the compact label every atom carries. For a fixed
//! species-set size `S` it projects into `[0, S*3)`, giving an array- or
//! histogram-indexable integer without a hash lookup on the hot path.

use serde::{Deserialize, Serialize};

/// Mobility state of an atom.
///
/// Only [`Phase::Active`] atoms move during minimisation; [`Phase::Boundary`]
/// atoms contribute forces but are pinned; [`Phase::Vacant`] marks an
/// unoccupied lattice site (discrete-lattice variant only — carried in the
/// data model for forward-compatibility, see `DESIGN.md`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Active,
    Boundary,
    Vacant,
}

impl Phase {
    /// Number of distinct phases; used to size colour histograms.
    pub const COUNT: usize = 3;

    #[inline]
    fn index(self) -> usize {
        match self {
            Phase::Active => 0,
            Phase::Boundary => 1,
            Phase::Vacant => 2,
        }
    }
}

/// A `(atomic-number, phase)` pair.
///
/// `species_idx` is a compact index into the simulation's species table
/// (not the raw atomic number), so that [`Colour::index`] can be used
/// directly as an array offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Colour {
    pub species_idx: usize,
    pub phase: Phase,
}

impl Colour {
    pub fn new(species_idx: usize, phase: Phase) -> Self {
        Self { species_idx, phase }
    }

    /// Projects this colour to an integer in `[0, n_species * 3)`.
    #[inline]
    pub fn index(&self, n_species: usize) -> usize {
        self.phase.index() * n_species + self.species_idx
    }

    /// Inverse of [`Colour::index`].
    #[inline]
    pub fn from_index(idx: usize, n_species: usize) -> Self {
        let phase = match idx / n_species {
            0 => Phase::Active,
            1 => Phase::Boundary,
            _ => Phase::Vacant,
        };
        Self { species_idx: idx % n_species, phase }
    }
}

/// Maps element symbols from an input XYZ file to `(species_idx, Phase)`.
///
/// Mirrors the `[supercell].element_map = [[name, species, "A"|"B"], ...]`
/// configuration table: `"A"` (active) or `"B"` (boundary) selects the
/// phase at load time; vacancies are never present in input files and are
/// only ever introduced by the discrete-lattice projection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpeciesTable {
    /// `name -> (species_idx, phase)`.
    entries: std::collections::BTreeMap<String, (usize, Phase)>,
    pub n_species: usize,
}

impl SpeciesTable {
    pub fn from_map(rows: &[(String, usize, char)]) -> Self {
        let mut entries = std::collections::BTreeMap::new();
        let mut n_species = 0usize;
        for (name, species, tag) in rows {
            let phase = match tag {
                'A' => Phase::Active,
                'B' => Phase::Boundary,
                other => panic!("invalid element_map phase tag '{other}' (expected A or B)"),
            };
            entries.insert(name.clone(), (*species, phase));
            n_species = n_species.max(species + 1);
        }
        Self { entries, n_species }
    }

    pub fn lookup(&self, symbol: &str) -> Option<Colour> {
        self.entries.get(symbol).map(|&(species_idx, phase)| Colour::new(species_idx, phase))
    }
}
