//! A superbasin: a collection of basins connected by low-barrier
//! mechanisms, treated as a single absorbing-Markov-chain state for the
//! purpose of escape-time statistics ("modified mean-rate method").
//!
//! Mechanisms that stay inside the superbasin ([`connect_from`]) are
//! excluded from [`Basin::kmc_choice`]'s own accounting (`exit_mech` is
//! cleared) and folded instead into the transition probability matrix here,
//! so that fast back-and-forth hopping between catalogued basins doesn't
//! dominate the simulated clock with physically uninteresting moves.

use super::basin::{Basin, Choice};
use crate::errors::KmcError;
use crate::supercell::Supercell;
use nalgebra::{DMatrix, DVector};
use rand::{Rng, RngCore};

/// A collection of low-barrier-linked [`Basin`]s, one of which is "occupied"
/// (matches the live cell's current active-atom state).
pub struct Superbasin {
    super_: Vec<Basin>,
    occupied: usize,
    /// Transition probability matrix: `prob[(occupied, i)]` is the
    /// probability that an exit from basin `i` lands back in the basin that
    /// was occupied at the time the edge was recorded.
    prob: DMatrix<f64>,
}

impl Superbasin {
    /// Starts a superbasin containing just `basin`, occupied.
    pub fn new(basin: Basin) -> Self {
        let mut sb = Self { super_: Vec::new(), occupied: 0, prob: DMatrix::zeros(0, 0) };
        sb.expand_occupy(basin);
        sb
    }

    pub fn len(&self) -> usize {
        self.super_.len()
    }

    pub fn is_empty(&self) -> bool {
        self.super_.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// The basin matching the live cell's current state.
    pub fn current(&self) -> &Basin {
        &self.super_[self.occupied]
    }

    pub fn get(&self, i: usize) -> &Basin {
        &self.super_[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut Basin {
        &mut self.super_[i]
    }

    /// Records that basin `basin`'s mechanism `mech` leads into the
    /// currently occupied basin, folding it into the transition matrix and
    /// marking it as an internal (non-exit) move.
    pub fn connect_from(&mut self, basin: usize, mech: usize) {
        let rate = self.super_[basin].get(mech).rate;
        let rate_sum = self.super_[basin].rate_sum();
        self.prob[(self.occupied, basin)] = rate / rate_sum;
        self.super_[basin].get_mut(mech).exit_mech = false;
        self.super_[basin].connected = true;
    }

    /// Adds `basin` to the superbasin and makes it the occupied one.
    /// Returns the index of the previously occupied basin.
    pub fn expand_occupy(&mut self, basin: Basin) -> usize {
        self.super_.push(basin);
        let n = self.len();

        let mut grown = DMatrix::zeros(n, n);
        for i in 0..self.prob.nrows() {
            for j in 0..self.prob.ncols() {
                grown[(i, j)] = self.prob[(i, j)];
            }
        }
        self.prob = grown;

        std::mem::replace(&mut self.occupied, n - 1)
    }

    /// If some basin already in the superbasin matches `cell`'s active-atom
    /// state within `tol` (L2 norm), makes it occupied and returns the
    /// index of the previously occupied basin.
    pub fn find_occupy(&mut self, cell: &Supercell, tol: f64) -> Option<usize> {
        for i in 0..self.len() {
            if cell.active_disp_norm(self.super_[i].state()) < tol {
                return Some(std::mem::replace(&mut self.occupied, i));
            }
        }
        None
    }

    /// Mean residence time in each basin, weighted by visit probability
    /// from the occupied basin (`(I - P) tau = theta_occupied`, then
    /// normalised per-basin by its own total exit rate).
    fn compute_tau(&self) -> Result<DVector<f64>, KmcError> {
        let n = self.len();
        let mut theta = DVector::zeros(n);
        theta[self.occupied] = 1.0;

        let identity = DMatrix::<f64>::identity(n, n);
        let a = &identity - &self.prob;

        let mut tau = a
            .lu()
            .solve(&theta)
            .ok_or_else(|| KmcError::TauSolveFailed("(I - P) is singular".into()))?;

        for i in 0..n {
            tau[i] /= self.super_[i].rate_sum();
        }

        Ok(tau)
    }

    /// Modified mean-rate-method selection: weighs every exit mechanism in
    /// every basin of the superbasin by that basin's mean occupation time,
    /// so a mechanism reached only through a rarely-visited basin fires
    /// proportionally rarely even though its own local rate may be large.
    ///
    /// The chosen mechanism may belong to a basin other than the one
    /// currently occupied; when it does, `choice.basin_changed` is set and
    /// the occupied basin is updated to match before returning.
    pub fn kmc_choice(&mut self, rng: &mut dyn RngCore) -> Result<Choice, KmcError> {
        let tau = self.compute_tau()?;

        let mut count = 0usize;
        let mut r_sum = 0.0;
        for i in 0..self.len() {
            let mut basin_exit_sum = 0.0;
            for m in self.super_[i].iter() {
                if m.exit_mech {
                    count += 1;
                    basin_exit_sum += m.rate;
                }
            }
            r_sum += tau[i] * basin_exit_sum;
        }

        if count == 0 {
            return Err(KmcError::EmptyBasin(0.0));
        }
        if r_sum <= 0.0 {
            return Err(KmcError::EmptyBasin(r_sum));
        }

        let u: f64 = rng.gen();
        let lim = u * r_sum;

        let mut sum = 0.0;
        let mut chosen = None;
        'search: for i in 0..self.len() {
            for j in 0..self.super_[i].len() {
                if self.super_[i].get(j).exit_mech {
                    sum += tau[i] * self.super_[i].get(j).rate;
                    if sum > lim {
                        chosen = Some((i, j));
                        break 'search;
                    }
                }
            }
        }

        let (basin, mech) = chosen.ok_or(KmcError::ChoiceOverrun(self.len()))?;
        let old_basin = std::mem::replace(&mut self.occupied, basin);

        let inv_tau = 1.0 / tau.sum();
        let u2: f64 = rng.gen();

        Ok(Choice {
            basin_changed: old_basin != basin,
            mech,
            delta_t: -u2.ln() / (r_sum * inv_tau),
            basin: self.occupied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Catalogue, CatalogueConfig, CatalogueFormat, EnvId};
    use crate::colour::{Colour, Phase};
    use crate::discrete_key::DiscreteKey;
    use crate::environment::Mechanism;
    use crate::geometry::Geometry;
    use crate::kinetics::basin::BasinConfig;
    use crate::supercell::{AtomState, Simbox};
    use crate::Vec3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn one_atom_cell() -> Supercell {
        let mut cell = Supercell::new(Simbox { lx: 10.0, ly: 10.0, lz: 10.0, px: true, py: true, pz: true });
        cell.active.push(AtomState { pos: Vec3::zeros(), colour: Colour::new(0, Phase::Active) });
        cell
    }

    fn catalogue_with_mech(rate: f64) -> (Catalogue, EnvId) {
        let mut geo = Geometry::new();
        geo.append(Vec3::zeros(), Colour::new(0, Phase::Active), 0);
        geo.finalise();

        let mut cat = Catalogue::new(CatalogueConfig {
            r_env: 3.0,
            delta: 0.2,
            match_best: false,
            format: CatalogueFormat::Json,
            fname: "x".into(),
        });
        let key = DiscreteKey::new(3, Colour::new(0, Phase::Active));
        let (env_id, _) = cat.canon_try_emplace(key, &mut geo);
        cat.get_mut(&env_id).mechanisms.push(Mechanism {
            activation_energy: 0.5,
            delta_energy: -0.1,
            prefactor: rate,
            displacement: vec![Vec3::zeros()],
            abs_cap: 0.0,
            rel_cap: 1.0,
        });
        (cat, env_id)
    }

    fn basin_config() -> BasinConfig {
        BasinConfig { temperature: 300.0, max_barrier: 10.0 }
    }

    #[test]
    fn expand_occupy_grows_matrix_and_returns_old_occupied() {
        let cell = one_atom_cell();
        let (cat, env_id) = catalogue_with_mech(1e13);
        let b0 = Basin::new(&basin_config(), &cell, &[env_id.clone()], &cat);
        let mut sb = Superbasin::new(b0);
        assert_eq!(sb.len(), 1);
        assert_eq!(sb.occupied(), 0);

        let b1 = Basin::new(&basin_config(), &cell, &[env_id], &cat);
        let old = sb.expand_occupy(b1);
        assert_eq!(old, 0);
        assert_eq!(sb.occupied(), 1);
        assert_eq!(sb.len(), 2);
    }

    #[test]
    fn find_occupy_matches_existing_state_and_switches() {
        let cell = one_atom_cell();
        let (cat, env_id) = catalogue_with_mech(1e13);
        let b0 = Basin::new(&basin_config(), &cell, &[env_id.clone()], &cat);

        let mut shifted = cell.clone();
        shifted.active[0].pos = Vec3::new(1.0, 0.0, 0.0);
        let b1 = Basin::new(&basin_config(), &shifted, &[env_id], &cat);

        let mut sb = Superbasin::new(b0);
        sb.expand_occupy(b1);
        assert_eq!(sb.occupied(), 1);

        // cell (unshifted) matches basin 0's recorded state.
        let old = sb.find_occupy(&cell, 1e-6);
        assert_eq!(old, Some(1));
        assert_eq!(sb.occupied(), 0);
    }

    #[test]
    fn connect_from_clears_exit_flag_and_marks_connected() {
        let cell = one_atom_cell();
        let (cat, env_id) = catalogue_with_mech(1e13);
        let b0 = Basin::new(&basin_config(), &cell, &[env_id.clone()], &cat);
        let b1 = Basin::new(&basin_config(), &cell, &[env_id], &cat);

        let mut sb = Superbasin::new(b0);
        sb.expand_occupy(b1);
        sb.connect_from(0, 0);

        assert!(!sb.get(0).get(0).exit_mech);
        assert!(sb.get(0).connected);
    }

    #[test]
    fn kmc_choice_fails_closed_when_every_mechanism_is_internal() {
        let cell = one_atom_cell();
        let (cat, env_id) = catalogue_with_mech(1e13);
        let b0 = Basin::new(&basin_config(), &cell, &[env_id], &cat);
        let mut sb = Superbasin::new(b0);
        sb.connect_from(0, 0);

        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(sb.kmc_choice(&mut rng), Err(KmcError::EmptyBasin(_))));
    }

    #[test]
    fn kmc_choice_returns_basin_changed_for_cross_basin_mechanism() {
        let cell = one_atom_cell();
        let (cat, env_id) = catalogue_with_mech(1e13);
        let b0 = Basin::new(&basin_config(), &cell, &[env_id.clone()], &cat);
        let b1 = Basin::new(&basin_config(), &cell, &[env_id], &cat);

        let mut sb = Superbasin::new(b0);
        sb.expand_occupy(b1);
        // basin 0's only mechanism still exits (never connected), so a choice
        // landing on it from occupied basin 1 must report basin_changed.
        let mut rng = StdRng::seed_from_u64(3);
        let mut saw_change = false;
        for _ in 0..50 {
            sb.occupied = 1;
            let choice = sb.kmc_choice(&mut rng).unwrap();
            if choice.basin == 0 {
                assert!(choice.basin_changed);
                saw_change = true;
            }
        }
        assert!(saw_change, "expected at least one choice to land on basin 0 over 50 draws");
    }
}
