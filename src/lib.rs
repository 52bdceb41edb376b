//! Parallel memory bandwidth and latency sweeps.
//!
//! A sweep runs every kernel of a [`Catalog`] over a list of array sizes and
//! thread counts, inside one large pre-faulted [`BackingRegion`], and appends
//! one `RESULT` line per accepted measurement through a [`ResultWriter`].

pub mod error;
pub mod kernel;
pub mod memory;
pub mod permutation;
pub mod report;
pub mod sweep;
pub mod system;

pub use error::{BenchError, Result};
pub use kernel::{Catalog, Kernel, KernelFn};
pub use memory::{AllocOptions, BackingRegion, RegionLayout};
pub use report::{OutputFormat, ResultRecord, ResultWriter};
pub use sweep::{Sweep, SweepSettings};
