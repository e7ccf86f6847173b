//! Coarse histogram-based key used to bucket environments in the catalogue.
//!
//! Two sites only need a full [`crate::geometry::Geometry::permute_onto`]
//! comparison if they already agree on centre colour and species histogram;
//! [`DiscreteKey`] is that cheap pre-filter, ordered so it can key a
//! `BTreeMap`.

use crate::colour::Colour;
use serde::{Deserialize, Serialize};

/// `(centre_colour, histogram[colour -> count])`, strict-weak-ordered
/// lexicographically on that pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscreteKey {
    pub centre_colour: Colour,
    pub histogram: Vec<i32>,
}

impl DiscreteKey {
    pub fn new(n_colours: usize, centre_colour: Colour) -> Self {
        Self { centre_colour, histogram: vec![0; n_colours] }
    }

    pub fn increment(&mut self, colour: Colour, n_species: usize) {
        self.histogram[colour.index(n_species)] += 1;
    }
}
