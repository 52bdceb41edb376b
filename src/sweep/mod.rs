//! Sweep over thread counts and array sizes for each kernel.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::memory::{BackingRegion, RegionLayout};
use crate::report::{ResultRecord, ResultWriter};
use crate::system::cpu_info::FeatureProbe;

pub mod pool;
mod settings;

pub use settings::{parse_size, SweepSettings};

use pool::{run_pool, Job, Master};

pub(crate) const KIB: u64 = 1024;
pub(crate) const MIB: u64 = 1024 * KIB;
pub(crate) const GIB: u64 = 1024 * MIB;

/// Array sizes, dense around typical L1/L2/L3 boundaries.
pub const AREA_SIZES: &[u64] = &[
    KIB,
    2 * KIB,
    3 * KIB,
    4 * KIB,
    6 * KIB,
    8 * KIB,
    12 * KIB,
    16 * KIB,
    20 * KIB,
    24 * KIB,
    28 * KIB,
    32 * KIB,
    40 * KIB,
    48 * KIB,
    64 * KIB,
    96 * KIB,
    128 * KIB,
    192 * KIB,
    256 * KIB,
    384 * KIB,
    512 * KIB,
    768 * KIB,
    MIB,
    MIB + 256 * KIB,
    MIB + 512 * KIB,
    MIB + 768 * KIB,
    2 * MIB,
    2 * MIB + 256 * KIB,
    2 * MIB + 512 * KIB,
    2 * MIB + 768 * KIB,
    3 * MIB,
    4 * MIB,
    5 * MIB,
    6 * MIB,
    7 * MIB,
    8 * MIB,
    9 * MIB,
    10 * MIB,
    12 * MIB,
    14 * MIB,
    16 * MIB,
    20 * MIB,
    24 * MIB,
    28 * MIB,
    32 * MIB,
    64 * MIB,
    128 * MIB,
    256 * MIB,
    512 * MIB,
    GIB,
    2 * GIB,
    4 * GIB,
    8 * GIB,
    16 * GIB,
    32 * GIB,
    64 * GIB,
    128 * GIB,
    256 * GIB,
    512 * GIB,
    1024 * GIB,
];

/// Minimum distance between the starts of two threads' areas.
pub const MIN_THREAD_SPACING: u64 = 4 * MIB + 16 * KIB;

/// Starting guess for bytes processed per second.
pub const INITIAL_FACTOR: u64 = 1 << 30;

pub fn size_in_range(size: u64, min: u64, max: u64) -> bool {
    (min == 0 || size >= min) && (max == 0 || size <= max)
}

pub fn sizes_in_range(sizes: &[u64], min: u64, max: u64) -> impl Iterator<Item = u64> + '_ {
    sizes
        .iter()
        .copied()
        .filter(move |&s| size_in_range(s, min, max))
}

/// Thread counts from `start` up to and including `max`, stepping by one or
/// doubling. The last step is clamped to `max`.
#[derive(Clone, Debug)]
pub struct ThreadProgression {
    next: Option<usize>,
    max: usize,
    geometric: bool,
}

impl ThreadProgression {
    pub fn new(min: usize, max: usize, geometric: bool) -> Self {
        ThreadProgression {
            next: Some(min.max(1)),
            max: max.max(1),
            geometric,
        }
    }

    pub fn from_settings(settings: &SweepSettings, cpus: usize) -> Self {
        let max = if settings.max_threads == 0 {
            cpus + 2
        } else {
            settings.max_threads
        };
        ThreadProgression::new(settings.min_threads, max, settings.geometric)
    }
}

impl Iterator for ThreadProgression {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = if current >= self.max {
            None
        } else if self.geometric {
            Some((current * 2).min(self.max))
        } else {
            Some(current + 1)
        };
        Some(current)
    }
}

/// Per-thread sizing of one (kernel, threads, array size) configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub thread_size: u64,
    pub spaced: u64,
}

impl Placement {
    pub fn test_size(&self, nthreads: usize) -> u64 {
        self.thread_size * nthreads as u64
    }
}

/// Splits `area_size` over `nthreads`, rounding each share up to the
/// kernel's alignment, and checks that all spaced areas fit. `None` means
/// the configuration is skipped.
pub fn plan(kernel: &Kernel, nthreads: usize, area_size: u64, layout: RegionLayout) -> Option<Placement> {
    let nthreads = nthreads.max(1) as u64;
    let unit = kernel.alignment();
    let thread_size = (area_size / nthreads).div_ceil(unit).max(1) * unit;

    if thread_size.checked_mul(nthreads)? > layout.total_bytes() {
        return None;
    }
    if thread_size > layout.per_node_bytes {
        return None;
    }

    let spaced = thread_size.max(MIN_THREAD_SPACING);
    let per_node = nthreads.div_ceil(layout.nodes.max(1) as u64);
    if spaced.checked_mul(per_node)? > layout.per_node_bytes {
        return None;
    }
    Some(Placement { thread_size, spaced })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Rerun,
}

/// Running estimate of bytes per second driving the repeat count.
#[derive(Clone, Debug)]
pub struct RepeatFactor {
    factor: u64,
    min_time: f64,
    target_time: f64,
}

impl RepeatFactor {
    pub fn new(min_time: f64, target_time: f64) -> Self {
        RepeatFactor {
            factor: INITIAL_FACTOR,
            min_time,
            target_time,
        }
    }

    pub fn factor(&self) -> u64 {
        self.factor
    }

    pub fn repeats_for(&self, thread_size: u64) -> u64 {
        self.factor.div_ceil(thread_size.max(1)).max(1)
    }

    /// Rescales the factor so the next run takes about `target_time`, and
    /// tells whether this run was long enough to keep.
    pub fn observe(&mut self, thread_size: u64, repeats: u64, elapsed: f64) -> Verdict {
        let elapsed = elapsed.max(1e-9);
        let scaled = (thread_size as f64) * (repeats as f64) * self.target_time / elapsed;
        // float-to-int casts saturate
        self.factor = (scaled as u64).max(1);
        if elapsed < self.min_time {
            Verdict::Rerun
        } else {
            Verdict::Accept
        }
    }
}

/// Everything needed to describe one measurement.
#[derive(Clone, Copy, Debug)]
pub struct RunConfig<'k> {
    pub kernel: &'k Kernel,
    pub nthreads: usize,
    pub area_size: u64,
    pub placement: Placement,
    pub repeats: u64,
}

impl RunConfig<'_> {
    pub fn test_size(&self) -> u64 {
        self.placement.test_size(self.nthreads)
    }

    /// Bytes actually read or written.
    pub fn test_volume(&self) -> u64 {
        let v = self.test_size() as u128 * self.repeats as u128 * self.kernel.bytes_per_access as u128
            / self.kernel.access_offset as u128;
        v as u64
    }

    pub fn test_accesses(&self) -> u64 {
        (self.test_size() as u128 * self.repeats as u128 / self.kernel.access_offset as u128) as u64
    }

    pub fn job(&self, hop: usize) -> Job {
        Job {
            kernel: *self.kernel,
            thread_size: self.placement.thread_size,
            spaced: self.placement.spaced,
            repeats: self.repeats,
            hop,
        }
    }

    pub fn record(&self, elapsed: f64, host: &str, numahop: Option<usize>) -> ResultRecord {
        let testvol = self.test_volume();
        let testaccess = self.test_accesses();
        ResultRecord {
            datetime: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            host: host.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            funcname: self.kernel.name.to_string(),
            nthreads: self.nthreads as u64,
            numahop: numahop.map(|h| h as u64),
            areasize: self.area_size,
            threadsize: self.placement.thread_size,
            testsize: self.test_size(),
            repeats: self.repeats,
            testvol,
            testaccess,
            time: elapsed,
            bandwidth: testvol as f64 / elapsed,
            rate: elapsed / testaccess as f64,
        }
    }
}

/// Drives the sweep for any number of kernels over one backing region.
pub struct Sweep<'a> {
    settings: &'a SweepSettings,
    backing: &'a BackingRegion,
    writer: &'a mut ResultWriter,
    host: String,
    cpus: Vec<usize>,
    sizes: &'a [u64],
}

impl<'a> Sweep<'a> {
    pub fn new(
        settings: &'a SweepSettings,
        backing: &'a BackingRegion,
        writer: &'a mut ResultWriter,
        host: String,
        cpus: Vec<usize>,
    ) -> Self {
        Sweep {
            settings,
            backing,
            writer,
            host,
            cpus,
            sizes: AREA_SIZES,
        }
    }

    /// Replaces the built-in size list.
    pub fn with_sizes(mut self, sizes: &'a [u64]) -> Self {
        self.sizes = sizes;
        self
    }

    /// Runs every kernel the CPU supports; returns the number of results.
    pub fn run_all(&mut self, kernels: &[&Kernel], probe: &dyn FeatureProbe) -> Result<usize> {
        let mut results = 0;
        for kernel in kernels {
            if !probe.supports(kernel.required_feature) {
                if let Some(feature) = kernel.required_feature {
                    warn!("Skipping {} test due to missing CPU feature '{feature}'.", kernel.name);
                }
                continue;
            }
            results += self.run(kernel)?;
        }
        Ok(results)
    }

    /// Full thread-count and size sweep for one kernel.
    pub fn run(&mut self, kernel: &Kernel) -> Result<usize> {
        self.settings.validate()?;
        let mut results = 0;
        for nthreads in ThreadProgression::from_settings(self.settings, self.cpus.len()) {
            results += self.run_threads(kernel, nthreads)?;
        }
        Ok(results)
    }

    fn run_threads(&mut self, kernel: &Kernel, nthreads: usize) -> Result<usize> {
        let settings = self.settings;
        let layout = self.backing.layout();
        let numa = self.backing.is_numa();
        let hops = if numa && settings.numa_hops { layout.nodes } else { 1 };
        let sizes = self.sizes;
        let host = self.host.as_str();
        let writer = &mut *self.writer;

        run_pool(
            self.backing,
            nthreads,
            &self.cpus,
            settings.verify_permutation,
            move |master: &mut Master<'_>| {
                let mut factor = RepeatFactor::new(settings.min_time, settings.target_time);
                let mut emitted = 0;
                for area_size in sizes_in_range(sizes, settings.size_min, settings.size_max) {
                    let Some(placement) = plan(kernel, master.threads(), area_size, layout) else {
                        debug!("Skipping {} test with {area_size} array size, does not fit.", kernel.name);
                        continue;
                    };
                    for hop in 0..hops {
                        loop {
                            let config = RunConfig {
                                kernel,
                                nthreads: master.threads(),
                                area_size,
                                placement,
                                repeats: factor.repeats_for(placement.thread_size),
                            };
                            info!(
                                "Running nthreads={} factor={} areasize={} thrsize={} testsize={} repeats={} testvol={} testaccess={}",
                                config.nthreads,
                                factor.factor(),
                                area_size,
                                placement.thread_size,
                                config.test_size(),
                                config.repeats,
                                config.test_volume(),
                                config.test_accesses(),
                            );

                            let elapsed = master.execute(config.job(hop))?;
                            match factor.observe(placement.thread_size, config.repeats, elapsed) {
                                Verdict::Rerun => {
                                    info!(
                                        "run time = {elapsed} -> rerunning test with repeat factor={}",
                                        factor.factor()
                                    );
                                }
                                Verdict::Accept => {
                                    info!(
                                        "run time = {elapsed} -> next test with repeat factor={}",
                                        factor.factor()
                                    );
                                    let hop_field = numa.then_some(hop);
                                    writer.write(&config.record(elapsed, host, hop_field))?;
                                    emitted += 1;
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(emitted)
            },
        )
    }
}
