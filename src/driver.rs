//! The top-level on-the-fly KMC loop: select a mechanism, advance time,
//! reconstruct it onto the live cell, re-minimise, refresh the catalogue
//! around the new state, and connect the superbasin accordingly.
//!
//! Grounded directly on the reference driver's per-iteration structure:
//! `select_mech -> advance time -> (if the basin changed) reclassify and
//! dump -> reconstruct -> minimise -> refresh the catalogue -> connect_via`,
//! with the reference's jitter-and-retry fallback reframed around
//! [`crate::kinetics::basin::LocalMech::onto`]'s fallible reconstruction
//! instead of a caught exception (see `DESIGN.md` for why).

use crate::catalogue::{Catalogue, EnvId};
use crate::classify::Classify;
use crate::config::Config;
use crate::environment::Mechanism;
use crate::errors::DriverError;
use crate::geometry::Geometry;
use crate::kinetics::{LocalMech, SuperCache};
use crate::mechanism::{find_mechanisms_batch, sample_normal};
use crate::package::Packager;
use crate::supercell::Supercell;
use crate::traits::{Minimiser, NeighbourList, Potential, SaddleSearch};
use crate::xyz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Classifies `cell`, canonicalises it into `cat`, and for every
/// newly-seen environment runs a saddle-point search batch and files the
/// mechanisms it finds. Returns the per-atom `(EnvId, Geometry)` the cell
/// just classified into.
#[allow(clippy::too_many_arguments)]
fn update_catalogue_impl(
    classify: &Classify,
    packager: &Packager,
    mechanism_cfg: &crate::mechanism::MechanismFinderConfig,
    potential: &(dyn Potential + Sync),
    minimiser: &(dyn Minimiser + Sync),
    saddle_search: &(dyn SaddleSearch + Sync),
    neighbours: &mut dyn NeighbourList,
    cell: &Supercell,
    cat: &mut Catalogue,
    rng: &mut StdRng,
) -> (Vec<EnvId>, Vec<Geometry>) {
    let (keys, mut geos) = classify.classify(cell, neighbours);
    let (env_ids, first_seen) = cat.canon_update(&keys, &mut geos);

    if !first_seen.is_empty() {
        let mut pkgs = packager.pack(cell, &first_seen);
        let empty = find_mechanisms_batch(mechanism_cfg, &mut pkgs, potential, minimiser, saddle_search, rng.gen());
        if empty > 0 {
            tracing::debug!(empty, total = first_seen.len(), "some newly catalogued environments found no mechanisms");
        }
        packager.unpack(pkgs, &geos, &env_ids, cat);
        if let Err(e) = cat.write() {
            tracing::warn!(error = %e, "failed to persist catalogue");
        }
    }

    (env_ids, geos)
}

fn jitter_all(rng: &mut StdRng, cell: &mut Supercell, stddev: f64) {
    for a in cell.active.iter_mut() {
        a.pos.x += sample_normal(rng, 0.0, stddev);
        a.pos.y += sample_normal(rng, 0.0, stddev);
        a.pos.z += sample_normal(rng, 0.0, stddev);
    }
}

/// Owns the live cell, catalogue, and active superbasin, and drives them
/// forward in simulated time.
pub struct KMCDriver {
    config: Config,
    potential: Box<dyn Potential + Sync>,
    minimiser: Box<dyn Minimiser + Sync>,
    saddle_search: Box<dyn SaddleSearch + Sync>,
    neighbours: Box<dyn NeighbourList>,
    classify: Classify,
    packager: Packager,
    cat: Catalogue,
    cell: Supercell,
    geos: Vec<Geometry>,
    env_ids: Vec<EnvId>,
    super_cache: SuperCache,
    rng: StdRng,
    time: f64,
    iteration: u64,
}

impl KMCDriver {
    /// Assembles a driver from a validated configuration: reads the initial
    /// cell, builds the concrete potential/minimiser/saddle-search/neighbour
    /// stand-ins it configures, and loads (or starts) the catalogue.
    pub fn from_config(config: Config) -> Result<Self, DriverError> {
        let species = config.species_table();
        let p = config.supercell.periodic;
        let cell = xyz::read(Path::new(&config.supercell.xyz_file), &species, (p[0], p[1], p[2]))?;

        let potential = Box::new(config.build_potential(cell.active_state())?) as Box<dyn Potential + Sync>;
        let minimiser = Box::new(config.build_minimiser()) as Box<dyn Minimiser + Sync>;
        let saddle_search = Box::new(config.build_saddle_search()) as Box<dyn SaddleSearch + Sync>;
        let neighbours = Box::new(config.build_neighbour_list()) as Box<dyn NeighbourList>;
        let cat = Catalogue::load(config.catalogue.clone())?;

        Self::new(config, cell, potential, minimiser, saddle_search, neighbours, cat)
    }

    /// Builds a driver from already-constructed collaborators. Minimises
    /// `cell` and runs an initial catalogue pass before constructing the
    /// active superbasin, matching the reference driver's startup sequence.
    pub fn new(
        config: Config,
        mut cell: Supercell,
        potential: Box<dyn Potential + Sync>,
        minimiser: Box<dyn Minimiser + Sync>,
        saddle_search: Box<dyn SaddleSearch + Sync>,
        mut neighbours: Box<dyn NeighbourList>,
        mut cat: Catalogue,
    ) -> Result<Self, DriverError> {
        minimiser.minimise(potential.as_ref(), &mut cell)?;

        let classify = Classify::new(config.classify.r_env, config.n_species());
        let packager = Packager::new(config.packager.clone());
        let mut rng = StdRng::seed_from_u64(config.driver.seed);

        let (env_ids, geos) = update_catalogue_impl(
            &classify,
            &packager,
            &config.mechanism,
            potential.as_ref(),
            minimiser.as_ref(),
            saddle_search.as_ref(),
            neighbours.as_mut(),
            &cell,
            &mut cat,
            &mut rng,
        );

        let super_cache = SuperCache::new(config.supercache.clone(), &cell, &env_ids, &cat);

        Ok(Self {
            config,
            potential,
            minimiser,
            saddle_search,
            neighbours,
            classify,
            packager,
            cat,
            cell,
            geos,
            env_ids,
            super_cache,
            rng,
            time: 0.0,
            iteration: 0,
        })
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn cell(&self) -> &Supercell {
        &self.cell
    }

    /// Runs until simulated time reaches `config.driver.time_lim`, then
    /// writes the catalogue one final time.
    pub fn run(&mut self) -> Result<(), DriverError> {
        while self.time < self.config.driver.time_lim {
            self.step()?;
        }
        self.cat.write()?;
        Ok(())
    }

    fn refresh_catalogue(&mut self) {
        let (env_ids, geos) = update_catalogue_impl(
            &self.classify,
            &self.packager,
            &self.config.mechanism,
            self.potential.as_ref(),
            self.minimiser.as_ref(),
            self.saddle_search.as_ref(),
            self.neighbours.as_mut(),
            &self.cell,
            &mut self.cat,
            &mut self.rng,
        );
        self.env_ids = env_ids;
        self.geos = geos;
    }

    /// Applies `local`'s catalogued displacement onto the live cell,
    /// jittering and reclassifying up to `max_retries` times if the live
    /// geometry no longer aligns with the one it was catalogued against.
    fn reconstruct_with_retry(&mut self, local: LocalMech) -> Result<Mechanism, DriverError> {
        for attempt in 0..=self.config.driver.max_retries {
            if let Some(mech) = local.onto(&mut self.cell, &mut self.geos, &self.cat) {
                return Ok(mech);
            }
            if attempt == self.config.driver.max_retries {
                break;
            }
            tracing::warn!(attempt, "reconstruction geometry mismatch, jittering and retrying");
            jitter_all(&mut self.rng, &mut self.cell, self.config.driver.jitter_stddev);
            let (_, geos) = self.classify.classify(&self.cell, self.neighbours.as_mut());
            self.geos = geos;
        }
        Err(DriverError::ReconstructionInconsistent)
    }

    fn dump(&self) -> Result<(), DriverError> {
        let path = format!("{}_{:08}.xyz", self.config.driver.dump_prefix, self.iteration);
        let comment = format!("iteration={} time={:.6e}", self.iteration, self.time);
        xyz::write(Path::new(&path), &self.cell, &comment)
    }

    /// Persists the cell whose accepted mechanism fell at or below
    /// `capt_tol`, so an under-captured event can be inspected after the
    /// fact instead of only being logged.
    fn dump_undercaptured(&self) -> Result<(), DriverError> {
        let path = format!("{}_{:08}_undercaptured.xyz", self.config.driver.dump_prefix, self.iteration);
        let comment = format!("iteration={} time={:.6e} undercaptured", self.iteration, self.time);
        xyz::write(Path::new(&path), &self.cell, &comment)
    }

    /// Runs a single accepted KMC move: select, advance time, (re)construct,
    /// minimise, refresh the catalogue, connect.
    fn step(&mut self) -> Result<(), DriverError> {
        let choice = self.super_cache.select_mech(&mut self.rng)?;
        self.time += choice.delta_t;
        self.iteration += 1;

        if choice.basin_changed {
            let state = self.super_cache.current_basin().state().clone();
            self.cell.set_active_state(&state);
            self.refresh_catalogue();
            if self.config.driver.dump_every > 0 && self.iteration % self.config.driver.dump_every as u64 == 0 {
                self.dump()?;
            }
        }

        let local = self.super_cache.reconstruct(choice.mech).clone();
        let mech = self.reconstruct_with_retry(local)?;

        self.minimiser.minimise(self.potential.as_ref(), &mut self.cell)?;
        self.refresh_catalogue();

        tracing::info!(
            iteration = self.iteration,
            time = self.time,
            dt = choice.delta_t,
            activation_energy = mech.activation_energy,
            delta_energy = mech.delta_energy,
            rel_cap = mech.rel_cap,
            "accepted kmc step"
        );

        if mech.rel_cap <= self.config.driver.capt_tol {
            tracing::warn!(
                rel_cap = mech.rel_cap,
                capt_tol = self.config.driver.capt_tol,
                "mechanism capture quality below tolerance"
            );
            self.dump_undercaptured()?;
        }

        self.super_cache.connect_via(choice.mech, &self.cell, &self.env_ids, &self.cat);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path) -> Config {
        let xyz_path = dir.join("init.xyz");
        std::fs::write(
            &xyz_path,
            "1\nfixture Lattice=\"20 0 0 0 20 0 0 0 20\" Properties=species:S:1:pos:R:3:frozen:I:1\n\
             Fe\t0.0\t0.0\t0.0\t0\n",
        )
        .unwrap();

        let cat_path = dir.join("cat.json");
        let toml = format!(
            r#"
            [supercell]
            xyz_file = "{xyz}"
            element_map = [["Fe", 0, 'A']]

            [potential]
            spring_constant = 5.0
            rcut = 4.0
            [potential.masses]
            Fe = 1.0

            [minimiser]
            step = 0.2
            f_tol = 1e-6
            max_iter = 500

            [saddle_search]
            activation_energy = 0.3
            step_fraction = 0.5

            [classify]
            r_env = 4.0

            [catalogue]
            r_env = 4.0
            delta = 0.2
            match_best = false
            format = "json"
            fname = "{cat}"

            [packager]
            mode = "global"
            unpack_tol = 1.0
            r_active = 0.0
            r_boundary = 0.0
            require_centre = false
            [packager.mech_tol]
            r_tol = 0.05
            energy_abs_tol = 0.05
            energy_frac_tol = 0.05
            rel_cap_tol = 0.5

            [mechanism]
            consecutive = 2
            max_search = 3
            vineyard = false
            vine_zero_tol = 1e-6
            r_perturbation = 3.0
            stddev = 0.2
            nudge = 0.5
            basin_tol = 0.01
            const_pre_factor = 1e13
            [mechanism.proto_tol]
            r_tol = 0.05
            energy_abs_tol = 0.05
            energy_frac_tol = 0.05
            rel_cap_tol = 0.5

            [basin]
            temperature = 300.0
            max_barrier = 5.0

            [supercache]
            state_tol = 0.01
            barrier_tol = 1.0
            cache_size = 4
            dynamic_tol = false
            max_superbasin_size = 64
            tol_grow = 1.2
            tol_shrink = 0.8
            [supercache.basin]
            temperature = 300.0
            max_barrier = 5.0

            [driver]
            time_lim = 0.0
            capt_tol = 0.1
            seed = 11
            max_retries = 3
            jitter_stddev = 0.03
            "#,
            xyz = xyz_path.display(),
            cat = cat_path.display(),
        );

        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn from_config_builds_initial_catalogue_and_supercache() {
        let dir = std::env::temp_dir().join("otfkmc_driver_test_init");
        std::fs::create_dir_all(&dir).unwrap();
        let config = write_fixture(&dir);

        let driver = KMCDriver::from_config(config).expect("driver should build from a valid config");
        assert_eq!(driver.iteration(), 0);
        assert_eq!(driver.time(), 0.0);
        assert_eq!(driver.cell().active.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn run_with_zero_time_limit_writes_catalogue_without_stepping() {
        let dir = std::env::temp_dir().join("otfkmc_driver_test_noop");
        std::fs::create_dir_all(&dir).unwrap();
        let config = write_fixture(&dir);
        let cat_path = Path::new(&config.catalogue.fname).to_path_buf();

        let mut driver = KMCDriver::from_config(config).unwrap();
        driver.run().expect("zero time_lim should return immediately");
        assert_eq!(driver.iteration(), 0);
        assert!(cat_path.exists(), "catalogue should have been written at least once");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
