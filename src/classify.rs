//! Maps a cell onto per-active-atom `(DiscreteKey, Geometry)` pairs: the
//! catalogue's classification step.

use crate::colour::Colour;
use crate::discrete_key::DiscreteKey;
use crate::geometry::Geometry;
use crate::supercell::Supercell;
use crate::traits::NeighbourList;

/// Builds a local environment around every active atom of a cell.
pub struct Classify {
    r_env: f64,
    n_species: usize,
}

impl Classify {
    pub fn new(r_env: f64, n_species: usize) -> Self {
        Self { r_env, n_species }
    }

    /// For each active atom `i`, builds `keys[i]` (coarse bucket) and
    /// `geos[i]` (finalised local geometry centred on `i`) from its
    /// neighbours within `r_env`.
    pub fn classify(
        &self,
        cell: &Supercell,
        neighbours: &mut dyn NeighbourList,
    ) -> (Vec<DiscreteKey>, Vec<Geometry>) {
        neighbours.rebuild(cell, self.r_env);

        let mut keys = Vec::with_capacity(cell.active.len());
        let mut geos = Vec::with_capacity(cell.active.len());

        for i in 0..cell.active.len() {
            let centre_colour: Colour = cell.active[i].colour;
            let mut key = DiscreteKey::new(self.n_species * crate::colour::Phase::COUNT, centre_colour);

            let mut geo = Geometry::new();
            geo.append(nalgebra::Vector3::zeros(), centre_colour, i);

            for n in neighbours.neighbours_of(cell, i) {
                key.increment(n.colour, self.n_species);
                geo.append(n.rel_pos, n.colour, n.index);
            }

            geo.finalise();

            keys.push(key);
            geos.push(geo);
        }

        (keys, geos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::Phase;
    use crate::supercell::{AtomState, Simbox};
    use crate::traits::BruteForceNeighbourList;
    use crate::Vec3;

    fn cell() -> Supercell {
        let mut c = Supercell::new(Simbox { lx: 20.0, ly: 20.0, lz: 20.0, px: true, py: true, pz: true });
        c.active.push(AtomState { pos: Vec3::new(0.0, 0.0, 0.0), colour: Colour::new(0, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(2.0, 0.0, 0.0), colour: Colour::new(1, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(0.0, 2.0, 0.0), colour: Colour::new(1, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(10.0, 10.0, 10.0), colour: Colour::new(1, Phase::Active) });
        c
    }

    #[test]
    fn classify_builds_one_entry_per_active_atom() {
        let cell = cell();
        let classify = Classify::new(3.0, 2);
        let mut nl = BruteForceNeighbourList::default();
        let (keys, geos) = classify.classify(&cell, &mut nl);
        assert_eq!(keys.len(), cell.active.len());
        assert_eq!(geos.len(), cell.active.len());

        // Atom 3 is isolated: only itself in its geometry.
        assert_eq!(geos[3].len(), 1);
        // Atom 0 sees atoms 1 and 2 within r_env=3.
        assert_eq!(geos[0].len(), 3);
    }

    #[test]
    fn isolated_atoms_with_same_colour_get_equal_keys() {
        let cell = cell();
        let classify = Classify::new(3.0, 2);
        let mut nl = BruteForceNeighbourList::default();
        let (keys, _) = classify.classify(&cell, &mut nl);
        // atom 1 and atom 2 are symmetric images of each other around atom 0.
        assert_eq!(keys[1].centre_colour, keys[2].centre_colour);
    }
}
