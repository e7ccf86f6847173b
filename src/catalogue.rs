//! The mechanism catalogue: a persistent map from coarse [`DiscreteKey`]
//! buckets to canonical [`Environment`]s, each carrying its own known
//! mechanisms.
//!
//! Handles into the catalogue are [`EnvId`] values (a bucket key plus an
//! offset into that bucket's `Vec`), never raw pointers or iterators: the
//! catalogue owns every `Environment` in a `BTreeMap<DiscreteKey,
//! Vec<Environment>>`, and [`Catalogue::optimize`] reorders buckets by
//! descending frequency, which would invalidate anything pointer-like.
//! Callers that hold an `EnvId` across an `optimize()` call get stale data;
//! this is documented, not guarded against, exactly as in the upstream
//! design it's adapted from.

use crate::discrete_key::DiscreteKey;
use crate::environment::Environment;
use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk/in-memory serialisation format for the catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogueFormat {
    Binary,
    PortableBinary,
    Json,
    Xml,
}

impl std::str::FromStr for CatalogueFormat {
    type Err = crate::errors::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(Self::Binary),
            "portable_binary" => Ok(Self::PortableBinary),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            other => Err(crate::errors::ConfigError::InvalidValue {
                section: "catalogue",
                field: "format",
                reason: format!("unknown format '{other}', expected binary|portable_binary|json|xml"),
            }),
        }
    }
}

/// Matching radius, whether to prefer first- or best-match, and persistence
/// settings for a [`Catalogue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogueConfig {
    pub r_env: f64,
    pub delta: f64,
    pub match_best: bool,
    pub format: CatalogueFormat,
    pub fname: String,
}

/// A handle to one environment inside a [`Catalogue`]: its bucket key and
/// offset within that bucket. Stable until the next [`Catalogue::optimize`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnvId {
    pub key: DiscreteKey,
    pub offset: usize,
}

/// A map from coarse bucket keys to the environments sharing that key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Catalogue {
    config: CatalogueConfig,
    size: usize,
    buckets: BTreeMap<DiscreteKey, Vec<Environment>>,
}

/// Finds the bucket entry matching `mut_geo`, canonicalising it (via
/// `permute_onto`) onto the match in place. Returns the matched index
/// within `bucket`, or `None`. A free function (rather than a `Catalogue`
/// method) so callers can hold a `&mut` borrow into `self.buckets` at the
/// same time as this only touches the `match_best` flag.
fn lin_search(match_best: bool, bucket: &[Environment], mut_geo: &mut Geometry) -> Option<usize> {
    if match_best {
        let mut best: Option<(usize, f64)> = None;
        for (i, env) in bucket.iter().enumerate() {
            let proj = env.geometry.chebyshev_norm(mut_geo);
            if best.map_or(true, |(_, p)| proj < p) {
                best = Some((i, proj));
            }
        }
        let (i, _) = best?;
        mut_geo.permute_onto(bucket[i].delta, &bucket[i].geometry).map(|_| i)
    } else {
        bucket.iter().position(|env| {
            env.geometry.equiv(env.delta, mut_geo) && mut_geo.permute_onto(env.delta, &env.geometry).is_some()
        })
    }
}

impl Catalogue {
    pub fn new(config: CatalogueConfig) -> Self {
        Self { config, size: 0, buckets: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn config(&self) -> &CatalogueConfig {
        &self.config
    }

    pub fn get(&self, id: &EnvId) -> &Environment {
        &self.buckets[&id.key][id.offset]
    }

    pub fn get_mut(&mut self, id: &EnvId) -> &mut Environment {
        self.buckets.get_mut(&id.key).expect("stale EnvId: bucket missing")
            .get_mut(id.offset).expect("stale EnvId: offset out of range")
    }

    /// Shrinks the matching radius of the environment at `id` to half the
    /// distance at which `geo` was found not to match it, then inserts
    /// `geo` as a new, separate environment in the same bucket. Returns the
    /// new environment's id.
    ///
    /// `geo` is expected to have already failed to match at `id`'s current
    /// delta (that's what makes refinement necessary); a generously widened
    /// tolerance is used just for this call so a `dr` can be measured to
    /// shrink by. If even that fails to align the two geometries, the delta
    /// is simply halved with no distance estimate.
    ///
    /// Note: like the design this is adapted from, a caller holding `id`
    /// across a `refine` (or any other bucket-growing call) does not get it
    /// updated — `id` still names the just-shrunk environment, not the new
    /// one.
    pub fn refine(&mut self, id: &EnvId, geo: &mut Geometry) -> EnvId {
        const WIDEN: f64 = 10.0;

        let bucket = self.buckets.get_mut(&id.key).expect("stale EnvId: bucket missing");
        let existing_delta = bucket[id.offset].delta;

        let new_delta = match geo.permute_onto(existing_delta * WIDEN, &bucket[id.offset].geometry) {
            Some(perm) => perm.dr / 2.0,
            None => existing_delta / 2.0,
        };

        bucket[id.offset].delta = new_delta;
        bucket[id.offset].refine_count += 1;

        bucket.push(Environment::new(geo.clone(), new_delta));
        self.size += 1;

        EnvId { key: id.key.clone(), offset: bucket.len() - 1 }
    }

    /// Sorts every bucket into descending-frequency order. Invalidates every
    /// [`EnvId`] issued before this call.
    pub fn optimize(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.sort_by(|a, b| b.freq.cmp(&a.freq));
        }
    }

    pub fn reset_counts(&mut self) {
        for bucket in self.buckets.values_mut() {
            for env in bucket.iter_mut() {
                env.freq = 0;
            }
        }
    }

    /// Canonicalises `geo` onto its bucket's matching environment, inserting
    /// a new environment if none matches. Returns the [`EnvId`] and whether
    /// it was newly inserted.
    pub fn canon_try_emplace(&mut self, key: DiscreteKey, geo: &mut Geometry) -> (EnvId, bool) {
        let match_best = self.config.match_best;
        let delta = self.config.delta;
        let bucket = self.buckets.entry(key.clone()).or_default();

        if let Some(offset) = lin_search(match_best, bucket, geo) {
            return (EnvId { key, offset }, false);
        }

        bucket.push(Environment::new(geo.clone(), delta));
        self.size += 1;
        (EnvId { key, offset: bucket.len() - 1 }, true)
    }

    /// Canonicalises every `(key, geo)` pair, inserting new environments as
    /// needed, and returns the indices whose environment's frequency just
    /// transitioned from zero (i.e. newly-seen-this-round environments).
    pub fn canon_update(&mut self, keys: &[DiscreteKey], geos: &mut [Geometry]) -> (Vec<EnvId>, Vec<usize>) {
        assert_eq!(keys.len(), geos.len());
        let mut ids = Vec::with_capacity(keys.len());
        let mut first_seen = Vec::new();

        for (i, (key, geo)) in keys.iter().cloned().zip(geos.iter_mut()).enumerate() {
            let (id, _inserted) = self.canon_try_emplace(key, geo);
            let env = self.get_mut(&id);
            if env.freq == 0 {
                first_seen.push(i);
            }
            env.freq += 1;
            ids.push(id);
        }

        (ids, first_seen)
    }

    /// Canonicalises every `(key, geo)` pair against *existing* entries only;
    /// returns `None` (instead of inserting) the moment any pair has no
    /// match.
    pub fn try_canon(&mut self, keys: &[DiscreteKey], geos: &mut [Geometry]) -> Option<Vec<EnvId>> {
        assert_eq!(keys.len(), geos.len());
        let mut ids = Vec::with_capacity(keys.len());

        let match_best = self.config.match_best;
        for (key, geo) in keys.iter().zip(geos.iter_mut()) {
            let bucket = self.buckets.get(key)?;
            let offset = lin_search(match_best, bucket, geo)?;
            ids.push(EnvId { key: key.clone(), offset });
        }

        Some(ids)
    }

    pub fn write(&self) -> Result<(), crate::errors::DriverError> {
        use crate::errors::DriverError;
        let path = Path::new(&self.config.fname);
        match self.config.format {
            CatalogueFormat::Binary | CatalogueFormat::PortableBinary => {
                let bytes = bincode::serialize(self).map_err(|e| DriverError::Persist(e.to_string()))?;
                std::fs::write(path, bytes)?;
            }
            CatalogueFormat::Json => {
                let text = serde_json::to_string_pretty(self).map_err(|e| DriverError::Persist(e.to_string()))?;
                std::fs::write(path, text)?;
            }
            CatalogueFormat::Xml => {
                return Err(DriverError::Persist("xml catalogue format is not yet implemented".into()));
            }
        }
        Ok(())
    }

    pub fn load(config: CatalogueConfig) -> Result<Self, crate::errors::DriverError> {
        use crate::errors::DriverError;
        let path = Path::new(&config.fname);
        if !path.exists() {
            tracing::info!(path = %config.fname, "no catalogue on disk, starting empty");
            return Ok(Self::new(config));
        }

        let loaded: Catalogue = match config.format {
            CatalogueFormat::Binary | CatalogueFormat::PortableBinary => {
                let bytes = std::fs::read(path)?;
                bincode::deserialize(&bytes).map_err(|e| DriverError::Persist(e.to_string()))?
            }
            CatalogueFormat::Json => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text).map_err(|e| DriverError::Persist(e.to_string()))?
            }
            CatalogueFormat::Xml => {
                return Err(DriverError::Persist("xml catalogue format is not yet implemented".into()));
            }
        };

        if (loaded.config.r_env - config.r_env).abs() > 1e-12 {
            return Err(DriverError::Persist("catalogue on disk incompatible with catalogue.r_env".into()));
        }
        if (loaded.config.delta - config.delta).abs() > 1e-12 {
            return Err(DriverError::Persist("catalogue on disk incompatible with catalogue.delta".into()));
        }

        let mut cat = loaded;
        cat.config = config;
        cat.optimize();
        Ok(cat)
    }

    pub fn report(&self) {
        for (key, bucket) in &self.buckets {
            let freqs: Vec<u64> = bucket.iter().map(|e| e.freq).collect();
            tracing::info!(centre = ?key.centre_colour, histogram = ?key.histogram, freqs = ?freqs);
        }
        tracing::info!(unique = self.size, bins = self.buckets.len(), "catalogue summary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::{Colour, Phase};
    use crate::Vec3;

    fn cfg(match_best: bool) -> CatalogueConfig {
        CatalogueConfig { r_env: 4.0, delta: 0.2, match_best, format: CatalogueFormat::Json, fname: "unused.cat".into() }
    }

    fn tetra(scale: f64) -> Geometry {
        let mut g = Geometry::new();
        let c0 = Colour::new(0, Phase::Active);
        let c1 = Colour::new(1, Phase::Active);
        g.append(Vec3::new(0.0, 0.0, 0.0), c0, 0);
        g.append(Vec3::new(scale, 0.0, 0.0), c1, 1);
        g.append(Vec3::new(0.0, scale, 0.0), c1, 2);
        g.append(Vec3::new(0.0, 0.0, scale), c1, 3);
        g.finalise();
        g
    }

    fn key() -> DiscreteKey {
        let c0 = Colour::new(0, Phase::Active);
        let mut k = DiscreteKey::new(4, c0);
        k.increment(c0, 2);
        let c1 = Colour::new(1, Phase::Active);
        k.increment(c1, 2);
        k.increment(c1, 2);
        k.increment(c1, 2);
        k
    }

    #[test]
    fn repeated_canon_reuses_environment() {
        let mut cat = Catalogue::new(cfg(false));
        let k = key();

        let mut g1 = tetra(1.0);
        let (id1, inserted1) = cat.canon_try_emplace(k.clone(), &mut g1);
        assert!(inserted1);

        let mut g2 = tetra(1.0001);
        let (id2, inserted2) = cat.canon_try_emplace(k, &mut g2);
        assert!(!inserted2, "near-identical geometry should match existing environment");
        assert_eq!(id1, id2);
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn canon_update_tracks_first_seen() {
        let mut cat = Catalogue::new(cfg(false));
        let k = key();
        let mut geos = vec![tetra(1.0), tetra(1.0001), tetra(1.0)];
        let keys = vec![k.clone(), k.clone(), k];
        let (ids, first_seen) = cat.canon_update(&keys, &mut geos);
        assert_eq!(ids.len(), 3);
        assert_eq!(first_seen, vec![0]);
        assert_eq!(cat.get(&ids[0]).freq, 3);
    }

    #[test]
    fn try_canon_fails_closed_on_missing_bucket() {
        let mut cat = Catalogue::new(cfg(false));
        let k = key();
        let mut geos = vec![tetra(1.0)];
        assert!(cat.try_canon(&[k], &mut geos).is_none());
    }

    #[test]
    fn optimize_orders_buckets_by_descending_freq() {
        let mut cat = Catalogue::new(cfg(true));
        let k = key();
        let mut g1 = tetra(1.0);
        let (id1, _) = cat.canon_try_emplace(k.clone(), &mut g1);
        let mut g2 = tetra(2.0);
        let (id2, _) = cat.canon_try_emplace(k, &mut g2);
        assert_ne!(id1.offset, id2.offset);

        cat.get_mut(&id2).freq = 5;
        cat.get_mut(&id1).freq = 1;
        cat.optimize();

        let bucket = &cat.buckets[&id1.key];
        assert_eq!(bucket[0].freq, 5);
        assert_eq!(bucket[1].freq, 1);
    }

    #[test]
    fn refine_shrinks_existing_and_inserts_new() {
        let mut cat = Catalogue::new(cfg(false));
        let k = key();
        let mut g1 = tetra(1.0);
        let (id1, _) = cat.canon_try_emplace(k.clone(), &mut g1);
        let original_delta = cat.get(&id1).delta;

        let mut g2 = tetra(1.0 + original_delta * 10.0);
        let id2 = cat.refine(&id1, &mut g2);

        assert!(cat.get(&id1).delta < original_delta, "refine must shrink the matching radius");
        assert_ne!(id1, id2);
        assert_eq!(cat.len(), 2);
    }
}
