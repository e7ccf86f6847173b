//! The kinetic Monte Carlo layer proper: basins of catalogued mechanisms,
//! superbasins of low-barrier-linked basins, and the bounded cache of
//! dormant superbasins that sits above them.

pub mod basin;
pub mod superbasin;
pub mod supercache;

pub use basin::{Basin, BasinConfig, Choice, LocalMech};
pub use supercache::{SuperCache, SuperCacheConfig};
pub use superbasin::Superbasin;
