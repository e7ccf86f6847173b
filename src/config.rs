//! Top-level TOML configuration.
//!
//! Every section below borrows its shape directly from the struct it
//! configures (`catalogue`, `packager`, `mechanism`, `basin`, `supercache`
//! all derive `Deserialize` already) rather than re-parsing a generic TOML
//! table by hand; `[potential]`/`[minimiser]`/`[saddle_search]` configure the
//! concrete stand-ins in [`crate::traits`] since this crate ships no real
//! forcefield.

use crate::catalogue::CatalogueConfig;
use crate::colour::SpeciesTable;
use crate::errors::ConfigError;
use crate::kinetics::{BasinConfig, SuperCacheConfig};
use crate::mechanism::MechanismFinderConfig;
use crate::package::PackagerConfig;
use crate::traits::{masses_from_map, BruteForceNeighbourList, HarmonicPotential, ScriptedSaddleSearch, SteepestDescent};
use nalgebra::DVector;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
pub struct PotentialConfig {
    pub spring_constant: f64,
    pub rcut: f64,
    /// Species name (as used in `element_map`) -> mass in amu. Species
    /// without an entry default to 1.0 amu.
    #[serde(default)]
    pub masses: HashMap<String, f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MinimiserConfig {
    pub step: f64,
    pub f_tol: f64,
    pub max_iter: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SaddleSearchConfig {
    pub activation_energy: f64,
    pub step_fraction: f64,
}

fn default_periodic() -> [bool; 3] {
    [true, true, true]
}

#[derive(Clone, Debug, Deserialize)]
pub struct SupercellConfig {
    pub xyz_file: String,
    #[serde(default = "default_periodic")]
    pub periodic: [bool; 3],
    /// `[symbol, species_idx, "A"|"B"]` rows, fed straight to
    /// [`SpeciesTable::from_map`].
    pub element_map: Vec<(String, usize, char)>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClassifyConfig {
    pub r_env: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    /// Simulated time (seconds) at which the run stops.
    pub time_lim: f64,
    /// `rel_cap` at or below which a captured mechanism is flagged as
    /// under-captured.
    pub capt_tol: f64,
    pub seed: u64,
    /// Retries of `update_catalogue` (with a position jitter) before a
    /// reconstruction inconsistency is surfaced as an error.
    pub max_retries: usize,
    pub jitter_stddev: f64,
    /// Stream a cell dump every N accepted steps; 0 disables.
    #[serde(default)]
    pub dump_every: usize,
    #[serde(default = "default_dump_prefix")]
    pub dump_prefix: String,
}

fn default_dump_prefix() -> String {
    "dump".into()
}

/// The full run configuration, assembled from one TOML document.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub supercell: SupercellConfig,
    pub potential: PotentialConfig,
    pub minimiser: MinimiserConfig,
    pub saddle_search: SaddleSearchConfig,
    pub classify: ClassifyConfig,
    pub catalogue: CatalogueConfig,
    pub packager: PackagerConfig,
    pub mechanism: MechanismFinderConfig,
    pub basin: BasinConfig,
    pub supercache: SuperCacheConfig,
    pub driver: DriverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    pub fn species_table(&self) -> SpeciesTable {
        SpeciesTable::from_map(&self.supercell.element_map)
    }

    pub fn n_species(&self) -> usize {
        self.species_table().n_species
    }

    /// The canonical symbol for each species index (the first `element_map`
    /// row naming it), used to look `[potential].masses` up per index.
    fn canonical_species_names(&self) -> Result<Vec<String>, ConfigError> {
        let mut names: Vec<Option<String>> = vec![None; self.n_species()];
        for (name, idx, _tag) in &self.supercell.element_map {
            if names[*idx].is_none() {
                names[*idx] = Some(name.clone());
            }
        }
        names
            .into_iter()
            .enumerate()
            .map(|(i, n)| {
                n.ok_or(ConfigError::InvalidValue {
                    section: "supercell",
                    field: "element_map",
                    reason: format!("species index {i} has no entry"),
                })
            })
            .collect()
    }

    pub fn build_potential(&self, reference: DVector<f64>) -> Result<HarmonicPotential, ConfigError> {
        let species_order = self.canonical_species_names()?;
        let masses = masses_from_map(&self.potential.masses, &species_order);
        Ok(HarmonicPotential { k: self.potential.spring_constant, reference, masses, rcut: self.potential.rcut })
    }

    pub fn build_minimiser(&self) -> SteepestDescent {
        SteepestDescent { step: self.minimiser.step, f_tol: self.minimiser.f_tol, max_iter: self.minimiser.max_iter }
    }

    pub fn build_saddle_search(&self) -> ScriptedSaddleSearch {
        ScriptedSaddleSearch {
            activation_energy: self.saddle_search.activation_energy,
            step_fraction: self.saddle_search.step_fraction,
        }
    }

    pub fn build_neighbour_list(&self) -> BruteForceNeighbourList {
        BruteForceNeighbourList::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
        [supercell]
        xyz_file = "init.xyz"
        element_map = [["Fe", 0, 'A'], ["FeB", 0, 'B']]

        [potential]
        spring_constant = 5.0
        rcut = 4.0
        [potential.masses]
        Fe = 55.845

        [minimiser]
        step = 0.1
        f_tol = 1e-6
        max_iter = 500

        [saddle_search]
        activation_energy = 0.5
        step_fraction = 0.3

        [classify]
        r_env = 4.0

        [catalogue]
        r_env = 4.0
        delta = 0.2
        match_best = false
        format = "json"
        fname = "cat.json"

        [packager]
        mode = "local"
        unpack_tol = 0.1
        r_active = 5.0
        r_boundary = 8.0
        require_centre = true
        [packager.mech_tol]
        r_tol = 0.01
        energy_abs_tol = 0.01
        energy_frac_tol = 0.01
        rel_cap_tol = 0.5

        [mechanism]
        consecutive = 20
        max_search = 200
        vineyard = true
        vine_zero_tol = 1e-6
        r_perturbation = 3.0
        stddev = 0.2
        nudge = 0.5
        basin_tol = 0.05
        const_pre_factor = 1e13
        [mechanism.proto_tol]
        r_tol = 0.01
        energy_abs_tol = 0.01
        energy_frac_tol = 0.01
        rel_cap_tol = 0.5

        [basin]
        temperature = 300.0
        max_barrier = 5.0

        [supercache]
        state_tol = 0.01
        barrier_tol = 1.0
        cache_size = 8
        dynamic_tol = false
        max_superbasin_size = 64
        tol_grow = 1.2
        tol_shrink = 0.8
        [supercache.basin]
        temperature = 300.0
        max_barrier = 5.0

        [driver]
        time_lim = 1.0
        capt_tol = 0.1
        seed = 42
        max_retries = 3
        jitter_stddev = 0.03
    "#;

    #[test]
    fn parses_a_complete_config_document() {
        let cfg: Config = toml::from_str(TOML).unwrap();
        assert_eq!(cfg.n_species(), 1);
        assert_eq!(cfg.driver.dump_prefix, "dump");
        assert_eq!(cfg.driver.dump_every, 0);
    }

    #[test]
    fn build_potential_picks_up_named_mass() {
        let cfg: Config = toml::from_str(TOML).unwrap();
        let pot = cfg.build_potential(DVector::zeros(3)).unwrap();
        assert!((pot.masses[0] - 55.845).abs() < 1e-9);
    }

    #[test]
    fn load_reports_a_config_error_for_missing_file() {
        let err = Config::load(Path::new("/nonexistent/path/does/not/exist.toml"));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }
}
