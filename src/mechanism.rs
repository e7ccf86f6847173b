//! Saddle-point search control loop: perturbs a local environment's centre,
//! searches for a nearby first-order saddle, and walks downhill from it to
//! an adjoining basin, repeating until either a fresh mechanism is found or
//! a run of consecutive failures exhausts the search budget.

use crate::environment::{MechanismTolerances, ProtoMech};
use crate::errors::SearchError;
use crate::package::Package;
use crate::supercell::Supercell;
use crate::traits::{Minimiser, Potential, SaddleSearch};
use crate::vineyard::{Vineyard, VineyardTol};
use crate::Vec3;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MechanismFinderConfig {
    /// Consecutive failed/duplicate attempts before giving up on a centre.
    pub consecutive: usize,
    /// Hard cap on attempts regardless of `consecutive`.
    pub max_search: usize,
    /// Use Vineyard harmonic-TST prefactors instead of `const_pre_factor`.
    pub vineyard: bool,
    pub vine_zero_tol: f64,
    /// Radius of the Gaussian perturbation envelope around the centre.
    pub r_perturbation: f64,
    pub stddev: f64,
    /// Distance walked along the saddle's unstable mode before relaxing
    /// into the adjoining basin.
    pub nudge: f64,
    /// Below this L2 displacement from the initial basin, a "found"
    /// mechanism is treated as having collapsed back into its own basin.
    pub basin_tol: f64,
    pub const_pre_factor: f64,
    pub proto_tol: MechanismTolerances,
}

pub(crate) fn sample_normal(rng: &mut dyn RngCore, mean: f64, std: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-300);
    let u2: f64 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std * z
}

fn random_local_perturbation(rng: &mut dyn RngCore, cell: &mut Supercell, centre: usize, range: f64, stddev: f64) {
    let centre_pos = cell.active[centre].pos;
    let mag = sample_normal(rng, 1.0, 1.0);

    for i in 0..cell.active.len() {
        let delta = cell.min_image(cell.active[i].pos, centre_pos);
        if delta.norm_squared() > range * range {
            continue;
        }

        let mut dir = Vec3::new(
            sample_normal(rng, 0.0, 1.0),
            sample_normal(rng, 0.0, 1.0),
            sample_normal(rng, 0.0, 1.0),
        );
        let n = dir.norm();
        if n < 1e-12 {
            dir = Vec3::new(1.0, 0.0, 0.0);
        } else {
            dir /= n;
        }

        let cut = (-delta.norm_squared() / (range * range)).exp();
        let g = sample_normal(rng, 0.0, stddev);
        cell.active[i].pos += mag * cut * g * dir;
    }
}

/// Active-atom displacement `xf - xi`, corrected for centre-of-mass drift.
///
/// Skipped when boundary atoms are present (they pin the cell and prevent
/// drift). Otherwise, drift is estimated from the atoms more than 6
/// Angstrom from the most-displaced atom, under the assumption that atoms
/// that far from the event itself shouldn't have moved at all.
fn mech_disp(xi: &Supercell, xf: &Supercell) -> DVector<f64> {
    assert_eq!(xi.active.len(), xf.active.len(), "number of atoms differs between end states");

    let si = xi.active_state();
    let sf = xf.active_state();
    let mut dr = &sf - &si;

    if !xi.boundary.is_empty() {
        return dr;
    }

    let n = xi.active.len();
    let mut j = 0usize;
    let mut max_norm = f64::NEG_INFINITY;
    for i in 0..n {
        let d = Vec3::new(dr[3 * i], dr[3 * i + 1], dr[3 * i + 2]);
        let ns = d.norm_squared();
        if ns > max_norm {
            max_norm = ns;
            j = i;
        }
    }

    const FAR_FIELD: f64 = 6.0;
    let mut count = 0usize;
    let mut com_i = Vec3::zeros();
    let mut com_f = Vec3::zeros();
    for i in 0..n {
        let ni = xi.min_image(xi.active[i].pos, xi.active[j].pos).norm_squared();
        let nf = xf.min_image(xf.active[i].pos, xf.active[j].pos).norm_squared();
        if ni > FAR_FIELD * FAR_FIELD && nf > FAR_FIELD * FAR_FIELD {
            com_i += xi.active[i].pos;
            com_f += xf.active[i].pos;
            count += 1;
        }
    }

    if count == 0 {
        // No atom is far enough from the event to anchor a drift estimate;
        // leave the raw displacement uncorrected rather than fail the search.
        return dr;
    }

    let d_com = (com_f - com_i) / count as f64;
    for i in 0..n {
        dr[3 * i] -= d_com.x;
        dr[3 * i + 1] -= d_com.y;
        dr[3 * i + 2] -= d_com.z;
    }
    dr
}

fn attempt(
    config: &MechanismFinderConfig,
    init: &Supercell,
    dimer: &mut Supercell,
    potential: &dyn Potential,
    minimiser: &dyn Minimiser,
    saddle_search: &dyn SaddleSearch,
    vine: Option<&mut Vineyard>,
) -> Result<Option<ProtoMech>, SearchError> {
    let disp0 = dimer.active_state() - init.active_state();
    let saddle = saddle_search.find_saddle(potential, dimer, &disp0)?;

    let mut final_cell = dimer.clone();
    let nudged = final_cell.active_state() + config.nudge * &saddle.mode;
    final_cell.set_active_state(&nudged);
    minimiser.minimise(potential, &mut final_cell)?;

    if final_cell.active_disp_norm(&init.active_state()) < config.basin_tol {
        return Ok(None);
    }

    let prefactor = if let Some(v) = vine {
        if !v.load_sp(dimer, potential)? {
            return Ok(None);
        }
        v.prefactor()
    } else {
        config.const_pre_factor
    };

    let ei = potential.energy(init);
    let es = potential.energy(dimer);
    let ef = potential.energy(&final_cell);

    Ok(Some(ProtoMech {
        activation_energy: es - ei,
        delta_energy: ef - ei,
        prefactor,
        displacement: mech_disp(init, &final_cell),
    }))
}

/// Searches for escape mechanisms from the basin centred on active atom
/// `centre` of `init`, returning every distinct one found before the
/// consecutive-failure budget is exhausted.
pub fn find_mechanisms(
    config: &MechanismFinderConfig,
    init: &Supercell,
    centre: usize,
    potential: &dyn Potential,
    minimiser: &dyn Minimiser,
    saddle_search: &dyn SaddleSearch,
    rng: &mut dyn RngCore,
) -> Vec<ProtoMech> {
    let mut mechs: Vec<ProtoMech> = Vec::new();
    let mut count = 0usize;

    let mut vine = if config.vineyard { Some(Vineyard::new(VineyardTol(config.vine_zero_tol))) } else { None };
    if let Some(v) = vine.as_mut() {
        if let Err(e) = v.load_basin(init, potential) {
            tracing::warn!(error = %e, "vineyard load_basin failed, falling back to const_pre_factor for this centre");
            vine = None;
        }
    }

    let mut i = 0usize;
    while count < config.consecutive {
        if i >= config.max_search {
            tracing::debug!(max_search = config.max_search, "find_mechanisms hit max_search");
            break;
        }
        i += 1;

        let mut dimer = init.clone();
        random_local_perturbation(rng, &mut dimer, centre, config.r_perturbation, config.stddev);
        count += 1;

        match attempt(config, init, &mut dimer, potential, minimiser, saddle_search, vine.as_mut()) {
            Ok(Some(proto)) => {
                let duplicate = mechs.iter().any(|m| m.within_tol(&proto, &config.proto_tol));
                if !duplicate {
                    mechs.push(proto);
                    count = 0;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "search attempt failed, not counted against consecutive limit");
                count = count.saturating_sub(1);
            }
        }
    }

    mechs
}

/// Runs [`find_mechanisms`] over every package's subcell in parallel on
/// rayon's global pool, writing results into `pkg.mechs`. Returns the
/// number of packages that exhausted their search budget without finding
/// any mechanism at all (a diagnostic, not a failure).
pub fn find_mechanisms_batch(
    config: &MechanismFinderConfig,
    packages: &mut [Package],
    potential: &(dyn Potential + Sync),
    minimiser: &(dyn Minimiser + Sync),
    saddle_search: &(dyn SaddleSearch + Sync),
    seed: u64,
) -> usize {
    let results: Vec<Vec<ProtoMech>> = packages
        .par_iter()
        .enumerate()
        .map(|(i, pkg)| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            find_mechanisms(config, &pkg.subcell, pkg.centre, potential, minimiser, saddle_search, &mut rng)
        })
        .collect();

    let mut empty = 0;
    for (pkg, mechs) in packages.iter_mut().zip(results) {
        if mechs.is_empty() {
            empty += 1;
        }
        pkg.mechs = mechs;
    }
    empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::{Colour, Phase};
    use crate::supercell::{AtomState, Simbox};
    use crate::traits::{HarmonicPotential, ScriptedSaddleSearch, SteepestDescent};
    use crate::Vec3;

    fn cell() -> Supercell {
        let mut c = Supercell::new(Simbox { lx: 20.0, ly: 20.0, lz: 20.0, px: true, py: true, pz: true });
        c.active.push(AtomState { pos: Vec3::new(0.0, 0.0, 0.0), colour: Colour::new(0, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(1.5, 0.0, 0.0), colour: Colour::new(0, Phase::Active) });
        c
    }

    fn config() -> MechanismFinderConfig {
        MechanismFinderConfig {
            consecutive: 5,
            max_search: 20,
            vineyard: false,
            vine_zero_tol: 1e-6,
            r_perturbation: 3.0,
            stddev: 0.2,
            nudge: 0.5,
            basin_tol: 0.05,
            const_pre_factor: 1e13,
            proto_tol: MechanismTolerances { r_tol: 1e-2, energy_abs_tol: 1e-2, energy_frac_tol: 1e-2, rel_cap_tol: 0.5 },
        }
    }

    #[test]
    fn scripted_search_always_finds_the_same_mechanism_once() {
        let init = cell();
        let reference = init.active_state();
        let pot = HarmonicPotential { k: 1.0, reference, masses: vec![1.0], rcut: 5.0 };
        let minimiser = SteepestDescent { step: 0.2, f_tol: 1e-6, max_iter: 1000 };
        let search = ScriptedSaddleSearch { activation_energy: 0.3, step_fraction: 0.5 };

        let mut rng = StdRng::seed_from_u64(42);
        let cfg = config();
        let mechs = find_mechanisms(&cfg, &init, 0, &pot, &minimiser, &search, &mut rng);

        assert!(!mechs.is_empty(), "deterministic scripted search should find at least one mechanism");
        // every discovery after the first must be treated as a duplicate of mechs[0]
        assert_eq!(mechs.len(), 1);
    }

    #[test]
    fn mech_disp_applies_com_drift_correction_without_boundary() {
        let xi = cell();
        let mut xf = cell();
        // whole cell drifts by a uniform vector — should be fully cancelled.
        for a in xf.active.iter_mut() {
            a.pos += Vec3::new(0.3, 0.0, 0.0);
        }
        xf.active[1].pos += Vec3::new(10.0, 0.0, 0.0); // isolate the "event" atom far from atom 0... but cell is small
        let dr = mech_disp(&xi, &xf);
        // With only 2 atoms and no atom >6A from the event atom, correction is skipped (count==0),
        // so raw displacement on atom 0 should be exactly the uniform drift.
        assert!((dr[0] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn find_mechanisms_batch_reports_empty_packages() {
        let init = cell();
        let reference = init.active_state();
        let pot = HarmonicPotential { k: 1.0, reference, masses: vec![1.0], rcut: 5.0 };
        let minimiser = SteepestDescent { step: 0.2, f_tol: 1e-6, max_iter: 1000 };
        // step_fraction 0 means the "saddle" is identical to the perturbed start,
        // so final always collapses back into the initial basin -> always empty.
        let search = ScriptedSaddleSearch { activation_energy: 0.1, step_fraction: 0.0 };

        let mut cfg = config();
        cfg.consecutive = 2;
        cfg.max_search = 3;

        let mut pkgs = vec![Package { subcell: init.clone(), centre: 0, fwd_map: vec![Some(0), Some(1)], mechs: Vec::new() }];
        let empty = find_mechanisms_batch(&cfg, &mut pkgs, &pot, &minimiser, &search, 7);
        assert_eq!(empty, 1);
        assert!(pkgs[0].mechs.is_empty());
    }
}
