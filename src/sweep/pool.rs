//! Barrier-synchronized thread pool for one thread count.
//!
//! Thread 0 is the master: it runs the caller's sweep closure and takes part
//! in every measurement. Threads 1.. are workers that loop on the barrier.
//! Per job, all threads pass three barriers:
//!
//! ```text
//!  master: publish job -> [B1] -> prepare -> [B2] -> t0, run -> [B3] -> t1
//!  worker:                [B1] -> prepare -> [B2] ->     run -> [B3]
//! ```
//!
//! After the sweep the master publishes `Stop` and passes B1 once more.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::kernel::Kernel;
use crate::memory::BackingRegion;
use crate::permutation::build_in_area;
use crate::system::platform::pin_current_thread;

/// What every thread runs for one measurement.
#[derive(Clone, Copy, Debug)]
pub struct Job {
    pub kernel: Kernel,
    /// Bytes each thread works on.
    pub thread_size: u64,
    /// Distance between the starts of neighbouring threads' areas.
    pub spaced: u64,
    pub repeats: u64,
    /// Node offset between a thread's home node and the memory it uses.
    pub hop: usize,
}

#[derive(Clone, Copy, Debug)]
enum Command {
    Run(Job),
    Stop,
}

struct Shared<'a> {
    backing: &'a BackingRegion,
    barrier: Barrier,
    command: Mutex<Command>,
    failed: AtomicBool,
    failure: Mutex<Option<BenchError>>,
    nthreads: usize,
    verify_permutation: bool,
}

impl Shared<'_> {
    /// Node and byte offset of `thread`'s area. Threads are spread round-robin
    /// over nodes and stacked `spaced` apart within a node.
    fn area(&self, thread: usize, job: &Job) -> *mut u8 {
        let nodes = self.backing.layout().nodes;
        let node = (thread % nodes + job.hop) % nodes;
        let offset = (thread / nodes) as u64 * job.spaced;
        self.backing.sub_region(node, offset, job.thread_size)
    }

    /// Prepare, run and collect. Called by every thread right after B1;
    /// returns the time between B2 and B3 as seen by this thread.
    fn run_phases(&self, thread: usize, job: &Job) -> f64 {
        let area = self.area(thread, job);

        if job.kernel.make_permutation && !self.failed.load(Ordering::Acquire) {
            // SAFETY: `area` is this thread's disjoint, usize-aligned slice.
            let built = unsafe { build_in_area(area, job.thread_size as usize, self.verify_permutation) };
            match built {
                Ok(cycle) => debug!(thread, cycle, "permutation ready"),
                Err(e) => {
                    self.failed.store(true, Ordering::Release);
                    self.failure.lock().get_or_insert(e);
                }
            }
        }

        self.barrier.wait();
        let start = Instant::now();
        if !self.failed.load(Ordering::Acquire) {
            // SAFETY: the planner sized `thread_size` as a multiple of the
            // kernel's alignment and the area lies inside the backing region.
            unsafe {
                (job.kernel.func)(area, job.thread_size as usize, job.repeats.max(1) as usize)
            };
        }
        self.barrier.wait();
        start.elapsed().as_secs_f64()
    }
}

/// Handle the sweep closure uses to trigger measurements.
pub struct Master<'s> {
    shared: &'s Shared<'s>,
}

impl Master<'_> {
    pub fn threads(&self) -> usize {
        self.shared.nthreads
    }

    /// Runs `job` on all threads and returns the elapsed wall time in seconds.
    pub fn execute(&mut self, job: Job) -> Result<f64> {
        *self.shared.command.lock() = Command::Run(job);
        self.shared.barrier.wait();
        let elapsed = self.shared.run_phases(0, &job);
        if let Some(err) = self.shared.failure.lock().take() {
            return Err(err);
        }
        Ok(elapsed)
    }
}

impl Drop for Master<'_> {
    // Runs on early return and on unwinding, so workers are always released.
    fn drop(&mut self) {
        *self.shared.command.lock() = Command::Stop;
        self.shared.barrier.wait();
    }
}

fn pin(thread: usize, cpu: Option<usize>) {
    let Some(cpu) = cpu else {
        return;
    };
    if pin_current_thread(cpu) {
        debug!(thread, cpu, "pinned");
    } else {
        warn!("could not pin thread {thread} to CPU {cpu}");
    }
}

/// CPU for `thread`: round-robin over NUMA nodes when present, otherwise
/// the `i`-th allowed CPU (wrapping past the last one). `None` leaves the
/// thread unpinned.
pub fn cpu_for_thread(backing: &BackingRegion, thread: usize, cpus: &[usize]) -> Option<usize> {
    match backing.topology() {
        Some(topology) => Some(topology.cpu_for_thread(thread)),
        None if cpus.is_empty() => None,
        None => Some(cpus[thread % cpus.len()]),
    }
}

/// Spawns `nthreads` pinned threads, runs `sweep` on the master and joins
/// everyone before returning its result.
pub fn run_pool<T, F>(
    backing: &BackingRegion,
    nthreads: usize,
    cpus: &[usize],
    verify_permutation: bool,
    sweep: F,
) -> Result<T>
where
    T: Send,
    F: FnOnce(&mut Master<'_>) -> Result<T> + Send,
{
    let nthreads = nthreads.max(1);
    let shared = Shared {
        backing,
        barrier: Barrier::new(nthreads),
        command: Mutex::new(Command::Stop),
        failed: AtomicBool::new(false),
        failure: Mutex::new(None),
        nthreads,
        verify_permutation,
    };
    let shared = &shared;

    thread::scope(|s| {
        for thread in 1..nthreads {
            let cpu = cpu_for_thread(backing, thread, cpus);
            s.spawn(move || {
                pin(thread, cpu);
                loop {
                    shared.barrier.wait();
                    let job = match *shared.command.lock() {
                        Command::Run(job) => job,
                        Command::Stop => break,
                    };
                    shared.run_phases(thread, &job);
                }
            });
        }

        let cpu = cpu_for_thread(backing, 0, cpus);
        let master = s.spawn(move || {
            pin(0, cpu);
            let mut master = Master { shared };
            sweep(&mut master)
        });
        match master.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
