//! Carves subcells for saddle-point search around candidate centres, and
//! localises the resulting proto-mechanisms back onto canonical catalogue
//! geometries.

use crate::catalogue::{Catalogue, EnvId};
use crate::colour::Phase;
use crate::environment::{Mechanism, MechanismTolerances, ProtoMech};
use crate::geometry::Geometry;
use crate::supercell::{AtomState, Supercell};
use serde::{Deserialize, Serialize};

/// Whether saddle search runs over the whole cell, or a locally-carved
/// subcell around each centre.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageMode {
    Global,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackagerConfig {
    pub mode: PackageMode,
    /// Maximum L2 deviation between a proto-mechanism's centre geometry and
    /// its catalogue reference for localisation to be trusted.
    pub unpack_tol: f64,
    /// Radius within which atoms are free to move during search (local mode only).
    pub r_active: f64,
    /// Radius for inclusion as pinned boundary atoms (local mode only).
    pub r_boundary: f64,
    /// If true, a proto-mechanism is only kept when its largest-displacement
    /// atom coincides with the subcell's designated centre.
    pub require_centre: bool,
    pub mech_tol: MechanismTolerances,
}

/// Work unit handed to the saddle-point search: a (sub)cell plus the
/// bookkeeping needed to map its proto-mechanisms back onto the supercell.
pub struct Package {
    pub subcell: Supercell,
    /// Index, in `subcell.active`, of the designated search centre.
    pub centre: usize,
    /// `supercell active index -> subcell active index`, `None` if not
    /// included. Identity (trivially `Some(i) == i`) in global mode.
    pub fwd_map: Vec<Option<usize>>,
    pub mechs: Vec<ProtoMech>,
}

pub struct Packager {
    config: PackagerConfig,
}

impl Packager {
    pub fn new(config: PackagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PackagerConfig {
        &self.config
    }

    fn pack_full(&self, cell: &Supercell, centre: usize) -> Package {
        Package {
            subcell: cell.clone(),
            centre,
            fwd_map: (0..cell.active.len()).map(Some).collect(),
            mechs: Vec::new(),
        }
    }

    fn pack_local(&self, cell: &Supercell, centre: usize) -> Package {
        let mut subcell = Supercell::new(cell.simbox);
        let mut fwd_map = vec![None; cell.active.len()];
        let cen_pos = cell.active[centre].pos;

        for (i, a) in cell.active.iter().enumerate() {
            let dr = cell.min_image(a.pos, cen_pos).norm();
            if dr < self.config.r_active {
                fwd_map[i] = Some(subcell.active.len());
                subcell.active.push(AtomState { pos: a.pos, colour: a.colour });
            } else if dr < self.config.r_boundary {
                subcell.boundary.push(AtomState { pos: a.pos, colour: a.colour });
            }
        }
        for a in &cell.boundary {
            let dr = cell.min_image(cen_pos, a.pos).norm();
            if dr < self.config.r_boundary {
                subcell.boundary.push(AtomState { pos: a.pos, colour: a.colour });
            }
        }

        let sub_centre = fwd_map[centre].expect("centre atom outside its own r_active radius");

        Package { subcell, centre: sub_centre, fwd_map, mechs: Vec::new() }
    }

    /// Builds one [`Package`] per centre (each a global index into
    /// `cell.active`).
    pub fn pack(&self, cell: &Supercell, centres: &[usize]) -> Vec<Package> {
        centres
            .iter()
            .map(|&c| match self.config.mode {
                PackageMode::Global => self.pack_full(cell, c),
                PackageMode::Local => self.pack_local(cell, c),
            })
            .collect()
    }

    fn quality(proto: &ProtoMech, disp: &[crate::Vec3]) -> (f64, f64) {
        let cap: f64 = disp.iter().map(|d| d.norm_squared()).sum::<f64>().sqrt();
        let tot = proto.norm();
        (cap, if tot > 0.0 { cap / tot } else { 0.0 })
    }

    fn unpack_full(&self, pkg: Package, geos: &[Geometry], env_ids: &[EnvId], cat: &mut Catalogue) {
        for proto in pkg.mechs {
            let centre = proto.find_centre();
            let geo = &geos[centre];
            let env = cat.get(&env_ids[centre]);
            let rotor = geo.rotor_onto(&env.geometry);

            if l2_similarity(geo, &rotor, &env.geometry) > self.config.unpack_tol {
                continue;
            }

            let mut disp = Vec::new();
            for atom in geo.atoms() {
                if atom.colour.phase == Phase::Active {
                    let delta = crate::Vec3::new(
                        proto.displacement[3 * atom.backref],
                        proto.displacement[3 * atom.backref + 1],
                        proto.displacement[3 * atom.backref + 2],
                    );
                    disp.push(rotor * delta);
                }
            }

            let (abs_cap, rel_cap) = Self::quality(&proto, &disp);
            let mech = Mechanism {
                activation_energy: proto.activation_energy,
                delta_energy: proto.delta_energy,
                prefactor: proto.prefactor,
                displacement: disp,
                abs_cap,
                rel_cap,
            };

            cat.get_mut(&env_ids[centre]).try_push_mech(mech, &self.config.mech_tol);
        }
    }

    fn unpack_local(&self, pkg: Package, geos: &[Geometry], env_ids: &[EnvId], cat: &mut Catalogue) {
        for proto in pkg.mechs {
            let mech_centre = proto.find_centre();

            if self.config.require_centre && mech_centre != pkg.centre {
                continue;
            }

            let Some(super_centre) = pkg.fwd_map.iter().position(|m| *m == Some(mech_centre)) else {
                tracing::warn!("could not find proto-mechanism centre in package map, skipping");
                continue;
            };

            let geo = &geos[super_centre];
            let env = cat.get(&env_ids[super_centre]);
            let rotor = geo.rotor_onto(&env.geometry);

            if l2_similarity(geo, &rotor, &env.geometry) > self.config.unpack_tol {
                continue;
            }

            let mut disp = Vec::new();
            let mut complete = true;
            for atom in geo.atoms() {
                if atom.colour.phase != Phase::Active {
                    continue;
                }
                match pkg.fwd_map[atom.backref] {
                    Some(j) => {
                        let delta = crate::Vec3::new(
                            proto.displacement[3 * j],
                            proto.displacement[3 * j + 1],
                            proto.displacement[3 * j + 2],
                        );
                        disp.push(rotor * delta);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }

            if !complete {
                tracing::warn!(require_centre = self.config.require_centre, "subcell does not envelope geometry");
                continue;
            }

            let (abs_cap, rel_cap) = Self::quality(&proto, &disp);
            let mech = Mechanism {
                activation_energy: proto.activation_energy,
                delta_energy: proto.delta_energy,
                prefactor: proto.prefactor,
                displacement: disp,
                abs_cap,
                rel_cap,
            };

            cat.get_mut(&env_ids[super_centre]).try_push_mech(mech, &self.config.mech_tol);
        }
    }

    /// Localises every package's proto-mechanisms onto the catalogue entry
    /// matching its centre's canonical geometry.
    pub fn unpack(&self, pkgs: Vec<Package>, geos: &[Geometry], env_ids: &[EnvId], cat: &mut Catalogue) {
        for pkg in pkgs {
            match self.config.mode {
                PackageMode::Global => self.unpack_full(pkg, geos, env_ids, cat),
                PackageMode::Local => self.unpack_local(pkg, geos, env_ids, cat),
            }
        }
    }
}

fn l2_similarity(geo: &Geometry, rotor: &crate::Mat3, reference: &Geometry) -> f64 {
    assert_eq!(geo.len(), reference.len());
    let mut sum_sq = 0.0;
    for (a, b) in geo.atoms().iter().zip(reference.atoms()) {
        sum_sq += (b.pos - rotor * a.pos).norm_squared();
    }
    sum_sq.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{CatalogueConfig, CatalogueFormat};
    use crate::classify::Classify;
    use crate::colour::Colour;
    use crate::supercell::Simbox;
    use crate::traits::BruteForceNeighbourList;
    use crate::Vec3;

    fn cell() -> Supercell {
        let mut c = Supercell::new(Simbox { lx: 30.0, ly: 30.0, lz: 30.0, px: true, py: true, pz: true });
        c.active.push(AtomState { pos: Vec3::new(0.0, 0.0, 0.0), colour: Colour::new(0, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(2.0, 0.0, 0.0), colour: Colour::new(1, Phase::Active) });
        c.active.push(AtomState { pos: Vec3::new(0.0, 2.0, 0.0), colour: Colour::new(1, Phase::Active) });
        c
    }

    fn mech_tol() -> MechanismTolerances {
        MechanismTolerances { r_tol: 1e-2, energy_abs_tol: 1e-2, energy_frac_tol: 1e-2, rel_cap_tol: 0.5 }
    }

    #[test]
    fn global_pack_includes_whole_cell() {
        let cell = cell();
        let packager = Packager::new(PackagerConfig {
            mode: PackageMode::Global,
            unpack_tol: 0.1,
            r_active: 0.0,
            r_boundary: 0.0,
            require_centre: false,
            mech_tol: mech_tol(),
        });
        let pkgs = packager.pack(&cell, &[0]);
        assert_eq!(pkgs[0].subcell.active.len(), cell.active.len());
        assert_eq!(pkgs[0].centre, 0);
    }

    #[test]
    fn local_pack_carves_radii() {
        let cell = cell();
        let packager = Packager::new(PackagerConfig {
            mode: PackageMode::Local,
            unpack_tol: 0.1,
            r_active: 2.5,
            r_boundary: 10.0,
            require_centre: false,
            mech_tol: mech_tol(),
        });
        let pkgs = packager.pack(&cell, &[0]);
        // atoms 1, 2 are within r_active=2.5 of atom 0; nothing is boundary-only here.
        assert_eq!(pkgs[0].subcell.active.len(), 3);
        assert_eq!(pkgs[0].centre, 0);
    }

    #[test]
    fn global_unpack_localises_and_stores_mechanism() {
        let cell = cell();
        let classify = Classify::new(3.0, 2);
        let mut nl = BruteForceNeighbourList::default();
        let (keys, mut geos) = classify.classify(&cell, &mut nl);

        let mut cat = Catalogue::new(CatalogueConfig { r_env: 3.0, delta: 0.2, match_best: false, format: CatalogueFormat::Json, fname: "unused.cat".into() });
        let (env_ids, _) = cat.canon_update(&keys, &mut geos);

        let packager = Packager::new(PackagerConfig {
            mode: PackageMode::Global,
            unpack_tol: 1.0,
            r_active: 0.0,
            r_boundary: 0.0,
            require_centre: false,
            mech_tol: mech_tol(),
        });

        let mut pkgs = packager.pack(&cell, &[0]);
        let mut disp = nalgebra::DVector::zeros(cell.active.len() * 3);
        disp[0] = 0.1;
        pkgs[0].mechs.push(ProtoMech { activation_energy: 0.5, delta_energy: -0.1, prefactor: 1e13, displacement: disp });

        packager.unpack(pkgs, &geos, &env_ids, &mut cat);

        assert_eq!(cat.get(&env_ids[0]).mechanisms.len(), 1);
    }
}
