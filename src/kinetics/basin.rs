//! A basin of the potential energy surface: the current configuration plus
//! every mechanism reachable from it, with the standard n-fold-way KMC
//! selection rule over that list.
//!
//! Stored mechanisms are references into the catalogue ([`EnvId`] + an
//! offset into that environment's mechanism list), not copies — a basin
//! never owns geometry or mechanism data, it only indexes it.

use crate::catalogue::{Catalogue, EnvId};
use crate::colour::Phase;
use crate::environment::Mechanism;
use crate::errors::KmcError;
use crate::geometry::Geometry;
use crate::supercell::Supercell;
use nalgebra::DVector;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// `1 / k_B` in eV per Kelvin.
pub const INV_BOLTZ: f64 = 16_021_766_340.0 / 1_380_649.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BasinConfig {
    pub temperature: f64,
    /// Mechanisms with a forward barrier above this (eV) are excluded from
    /// the basin entirely.
    pub max_barrier: f64,
}

/// A single escape route out of the current configuration, localised to one
/// active atom's catalogued environment.
#[derive(Clone, Debug)]
pub struct LocalMech {
    pub rate: f64,
    /// max(forward, reverse) barrier, used by superbasin connectivity.
    pub barrier: f64,
    /// Whether this mechanism is known to lead outside the current
    /// superbasin. Mutated by [`crate::kinetics::superbasin`] bookkeeping.
    pub exit_mech: bool,
    env_id: EnvId,
    atom_idx: usize,
    mech_off: usize,
}

impl LocalMech {
    pub fn env_id(&self) -> &EnvId {
        &self.env_id
    }

    pub fn atom_idx(&self) -> usize {
        self.atom_idx
    }

    /// Reconstructs this mechanism's displacement onto `cell`, mutating its
    /// active-atom positions. `geos[atom_idx]` is permuted onto the
    /// catalogued reference geometry in place. Returns the (cloned)
    /// catalogue mechanism that was applied, or `None` if the live geometry
    /// no longer aligns with the one this mechanism was catalogued against —
    /// the caller is expected to treat that as a recoverable reconstruction
    /// inconsistency (jitter and retry), not a hard failure.
    pub fn onto(&self, cell: &mut Supercell, geos: &mut [Geometry], cat: &Catalogue) -> Option<Mechanism> {
        let env = cat.get(&self.env_id);
        let perm = geos[self.atom_idx].permute_onto(env.delta, &env.geometry)?;

        let rotor_t = perm.rotor.transpose();
        let mech = &env.mechanisms[self.mech_off];

        let mut j = 0;
        for atom in geos[self.atom_idx].atoms() {
            if atom.colour.phase == Phase::Active {
                cell.active[atom.backref].pos += rotor_t * mech.displacement[j];
                j += 1;
            }
        }

        Some(mech.clone())
    }

    /// Shrinks this mechanism's environment's matching radius and files
    /// `geo` as a new environment, since `geo` no longer matches it well
    /// enough to reconstruct onto reliably.
    pub fn refine(&self, geo: &mut Geometry, cat: &mut Catalogue) {
        cat.refine(&self.env_id, geo);
    }
}

/// Outcome of [`Basin::kmc_choice`]: which mechanism fires, the time
/// increment it costs, and (for superbasin bookkeeping) which basin it was
/// chosen from.
#[derive(Clone, Copy, Debug)]
pub struct Choice {
    pub basin_changed: bool,
    pub mech: usize,
    pub delta_t: f64,
    pub basin: usize,
}

/// All mechanisms reachable from one configuration, plus that
/// configuration's active-atom state.
pub struct Basin {
    state: DVector<f64>,
    mechs: Vec<LocalMech>,
    rate_sum: f64,
    pub connected: bool,
}

impl Basin {
    /// Builds a basin from a cell's current state and the catalogue
    /// environments its active atoms were just classified into. Mechanisms
    /// with a non-positive or over-`max_barrier` forward energy are
    /// dropped.
    pub fn new(config: &BasinConfig, cell: &Supercell, env_ids: &[EnvId], cat: &Catalogue) -> Self {
        let mut mechs = Vec::new();
        let mut rate_sum = 0.0;

        for (i, id) in env_ids.iter().enumerate() {
            let env = cat.get(id);
            for (j, m) in env.mechanisms.iter().enumerate() {
                let fwd = m.activation_energy;
                if fwd >= config.max_barrier || fwd <= 0.0 {
                    continue;
                }

                let rate = m.prefactor * (-fwd / config.temperature * INV_BOLTZ).exp();
                let rev = fwd - m.delta_energy;

                mechs.push(LocalMech {
                    rate,
                    barrier: fwd.max(rev),
                    exit_mech: true,
                    env_id: id.clone(),
                    atom_idx: i,
                    mech_off: j,
                });
                rate_sum += rate;
            }
        }

        Self { state: cell.active_state(), mechs, rate_sum, connected: false }
    }

    pub fn len(&self) -> usize {
        self.mechs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mechs.is_empty()
    }

    pub fn rate_sum(&self) -> f64 {
        self.rate_sum
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    pub fn get(&self, i: usize) -> &LocalMech {
        &self.mechs[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut LocalMech {
        &mut self.mechs[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalMech> {
        self.mechs.iter()
    }

    /// Standard n-fold-way selection among mechanisms flagged `exit_mech`
    /// (inside a superbasin, only these may fire without further
    /// bookkeeping). Fails closed with [`KmcError::EmptyBasin`] if no rate
    /// is available, or [`KmcError::ChoiceOverrun`] if floating-point
    /// rounding walks the cumulative sum past every candidate.
    pub fn kmc_choice(&self, rng: &mut dyn RngCore, basin: usize) -> Result<Choice, KmcError> {
        if self.rate_sum <= 0.0 {
            return Err(KmcError::EmptyBasin(self.rate_sum));
        }

        let u: f64 = rng.gen();
        let lim = (u * self.rate_sum).min(self.rate_sum * (1.0 - f64::EPSILON.sqrt()));

        let mut sum = 0.0;
        let mut chosen = None;
        for (i, m) in self.mechs.iter().enumerate() {
            if m.exit_mech {
                sum += m.rate;
                if sum > lim {
                    chosen = Some(i);
                    break;
                }
            }
        }

        let mech = chosen.ok_or(KmcError::ChoiceOverrun(self.mechs.len()))?;

        let u2: f64 = rng.gen();
        Ok(Choice { basin_changed: false, mech, delta_t: -u2.ln() / self.rate_sum, basin })
    }
}
