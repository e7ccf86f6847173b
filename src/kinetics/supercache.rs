//! Manages the active superbasin plus a bounded cache of dormant ones.
//!
//! A run spends most of its time inside one superbasin, hopping between its
//! basins over low barriers. When a high-barrier mechanism fires, the whole
//! superbasin is set aside (cached) in case the same region of configuration
//! space is revisited later, and a fresh superbasin is grown around the new
//! state.

use super::basin::{Basin, BasinConfig, Choice};
use super::superbasin::Superbasin;
use crate::catalogue::{Catalogue, EnvId};
use crate::errors::KmcError;
use crate::supercell::Supercell;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuperCacheConfig {
    /// (Angstrom) L2 norm between active-atom states for two basins to be
    /// considered the same.
    pub state_tol: f64,
    /// (eV) mechanisms with max(forward, reverse) barrier below this stay
    /// inside the active superbasin rather than triggering a cache swap.
    pub barrier_tol: f64,
    /// Number of dormant superbasins retained.
    pub cache_size: usize,
    /// If true, `barrier_tol` is adjusted at runtime to bound superbasin size.
    pub dynamic_tol: bool,
    /// Superbasin size above which `barrier_tol` is shrunk (only read when
    /// `dynamic_tol` is set).
    pub max_superbasin_size: usize,
    /// Multiplier applied to `barrier_tol` when the cache is repeatedly
    /// missed (only read when `dynamic_tol` is set).
    pub tol_grow: f64,
    /// Multiplier applied to `barrier_tol` when a superbasin overflows
    /// `max_superbasin_size` (only read when `dynamic_tol` is set).
    pub tol_shrink: f64,
    pub basin: BasinConfig,
}

/// The active superbasin plus a small LRU-ish ring of dormant ones.
pub struct SuperCache {
    opt: SuperCacheConfig,
    sb: Superbasin,
    cache: VecDeque<Superbasin>,
    /// Consecutive high-barrier escapes since the active superbasin was
    /// last served from cache (reset to 0 on a cache hit, not touched on a
    /// low-barrier expansion).
    in_cache_count: usize,
}

impl SuperCache {
    pub fn new(opt: SuperCacheConfig, cell: &Supercell, env_ids: &[EnvId], cat: &Catalogue) -> Self {
        let basin = Basin::new(&opt.basin, cell, env_ids, cat);
        let sb = Superbasin::new(basin);
        Self { opt, sb, cache: VecDeque::new(), in_cache_count: 0 }
    }

    pub fn size(&self) -> usize {
        1 + self.cache.len()
    }

    /// Fetches mechanism `mech` from the active superbasin's currently
    /// occupied basin.
    pub fn reconstruct(&self, mech: usize) -> &super::basin::LocalMech {
        self.sb.current().get(mech)
    }

    pub fn current_basin(&self) -> &Basin {
        self.sb.current()
    }

    /// Selects a mechanism from the active superbasin using the appropriate
    /// KMC rule: the modified mean-rate method if the occupied basin is
    /// connected to others in the superbasin, plain n-fold-way otherwise.
    ///
    /// Precondition: the occupied basin's state matches `cell`.
    pub fn select_mech(&mut self, rng: &mut dyn RngCore) -> Result<Choice, KmcError> {
        if self.sb.current().connected {
            self.sb.kmc_choice(rng)
        } else {
            let occupied = self.sb.occupied();
            self.sb.current().kmc_choice(rng, occupied)
        }
    }

    /// Connects the active superbasin's occupied basin to the basin `cell`
    /// is now in via mechanism `mech`, following the caching and
    /// dynamic-tolerance rules below. Postcondition: the active
    /// superbasin's occupied basin matches `cell`.
    pub fn connect_via(&mut self, mech: usize, cell: &Supercell, env_ids: &[EnvId], cat: &Catalogue) {
        if let Some(basin) = self.sb.find_occupy(cell, self.opt.state_tol) {
            self.sb.connect_from(basin, mech);
            tracing::debug!(size = self.sb.len(), "existing basin in superbasin");
            return;
        }

        if self.sb.current().get(mech).barrier < self.opt.barrier_tol {
            if self.opt.dynamic_tol && self.sb.len() >= self.opt.max_superbasin_size {
                self.opt.barrier_tol = (self.opt.barrier_tol * self.opt.tol_shrink).max(0.0);
                self.sb = Superbasin::new(Basin::new(&self.opt.basin, cell, env_ids, cat));
                self.cache.clear();
                tracing::info!(barrier_tol = self.opt.barrier_tol, "shrinking barrier tolerance, superbasin overflowed");
            } else {
                let old = self.sb.expand_occupy(Basin::new(&self.opt.basin, cell, env_ids, cat));
                self.sb.connect_from(old, mech);
                tracing::debug!(size = self.sb.len(), "new basin added to superbasin");
            }
            return;
        }

        // Followed a high-barrier mechanism out of the active superbasin.
        let mut hit = None;
        for (i, cached) in self.cache.iter_mut().enumerate() {
            if cached.find_occupy(cell, self.opt.state_tol).is_some() {
                hit = Some(i);
                break;
            }
        }

        if let Some(i) = hit {
            let revived = self.cache.remove(i).expect("index just found by position scan");
            let stale = std::mem::replace(&mut self.sb, revived);
            self.push_cache(stale);
            self.in_cache_count += 1;
            tracing::info!(cache_size = self.size(), "revisited cached superbasin");
        } else {
            let fresh = Superbasin::new(Basin::new(&self.opt.basin, cell, env_ids, cat));
            let stale = std::mem::replace(&mut self.sb, fresh);
            self.push_cache(stale);
            self.in_cache_count = 0;
            tracing::info!(cache_size = self.size(), "started new superbasin");
        }

        if self.opt.dynamic_tol && self.in_cache_count > self.opt.cache_size {
            self.opt.barrier_tol *= self.opt.tol_grow;
            self.sb = Superbasin::new(Basin::new(&self.opt.basin, cell, env_ids, cat));
            self.cache.clear();
            tracing::info!(barrier_tol = self.opt.barrier_tol, "growing barrier tolerance, cache thrashing");
        }
    }

    fn push_cache(&mut self, basin: Superbasin) {
        self.cache.push_front(basin);
        if self.cache.len() > self.opt.cache_size {
            self.cache.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{CatalogueConfig, CatalogueFormat};
    use crate::colour::{Colour, Phase};
    use crate::discrete_key::DiscreteKey;
    use crate::environment::Mechanism;
    use crate::geometry::Geometry;
    use crate::supercell::{AtomState, Simbox};
    use crate::Vec3;

    fn cell_at(x: f64) -> Supercell {
        let mut cell = Supercell::new(Simbox { lx: 10.0, ly: 10.0, lz: 10.0, px: true, py: true, pz: true });
        cell.active.push(AtomState { pos: Vec3::new(x, 0.0, 0.0), colour: Colour::new(0, Phase::Active) });
        cell
    }

    fn catalogue_with_mech(activation_energy: f64, rate: f64) -> (Catalogue, EnvId) {
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
            activation_energy,
            delta_energy: -0.05,
            prefactor: rate,
            displacement: vec![Vec3::zeros()],
            abs_cap: 0.0,
            rel_cap: 1.0,
        });
        (cat, env_id)
    }

    fn config(barrier_tol: f64, cache_size: usize) -> SuperCacheConfig {
        SuperCacheConfig {
            state_tol: 1e-3,
            barrier_tol,
            cache_size,
            dynamic_tol: false,
            max_superbasin_size: usize::MAX,
            tol_grow: 1.0,
            tol_shrink: 1.0,
            basin: BasinConfig { temperature: 300.0, max_barrier: 10.0 },
        }
    }

    #[test]
    fn low_barrier_mechanism_expands_active_superbasin() {
        let cell0 = cell_at(0.0);
        let (cat, env_id) = catalogue_with_mech(0.1, 1e13);
        let mut sc = SuperCache::new(config(0.5, 4), &cell0, &[env_id.clone()], &cat);
        assert_eq!(sc.size(), 1);

        let cell1 = cell_at(1.0);
        sc.connect_via(0, &cell1, &[env_id], &cat);
        assert_eq!(sc.size(), 1);
        assert_eq!(sc.sb.len(), 2, "low barrier escape should grow the active superbasin, not the cache");
    }

    #[test]
    fn high_barrier_mechanism_caches_old_superbasin_and_starts_fresh() {
        let cell0 = cell_at(0.0);
        let (cat, env_id) = catalogue_with_mech(5.0, 1e13);
        let mut sc = SuperCache::new(config(0.1, 4), &cell0, &[env_id.clone()], &cat);

        let cell1 = cell_at(1.0);
        sc.connect_via(0, &cell1, &[env_id], &cat);
        assert_eq!(sc.size(), 2, "high barrier escape must cache the old superbasin and start a new one");
    }

    #[test]
    fn revisiting_a_cached_superbasin_swaps_it_back_in() {
        let cell0 = cell_at(0.0);
        let (cat, env_id) = catalogue_with_mech(5.0, 1e13);
        let mut sc = SuperCache::new(config(0.1, 4), &cell0, &[env_id.clone()], &cat);

        let cell1 = cell_at(1.0);
        sc.connect_via(0, &cell1, &[env_id.clone()], &cat);
        assert_eq!(sc.size(), 2);

        // Revisit the original state: should pull cell0's superbasin back out
        // of the cache rather than growing a third one.
        sc.connect_via(0, &cell0, &[env_id], &cat);
        assert_eq!(sc.size(), 2, "revisiting a cached state should swap it back in, not grow the cache");
    }

    #[test]
    fn cache_is_bounded_by_cache_size() {
        let cell0 = cell_at(0.0);
        let (cat, env_id) = catalogue_with_mech(5.0, 1e13);
        let mut sc = SuperCache::new(config(0.1, 1), &cell0, &[env_id.clone()], &cat);

        sc.connect_via(0, &cell_at(1.0), &[env_id.clone()], &cat);
        sc.connect_via(0, &cell_at(2.0), &[env_id.clone()], &cat);
        sc.connect_via(0, &cell_at(3.0), &[env_id], &cat);

        assert_eq!(sc.size(), 1 + 1, "cache must never exceed cache_size entries");
    }
}
