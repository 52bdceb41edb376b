//! The large backing allocation that hosts every per-thread test area.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::system::numa::NumaTopology;
use crate::system::platform::pin_current_thread;

/// Alignment of every region. Page alignment also satisfies aligned
/// 128-bit and 256-bit moves.
pub const REGION_ALIGN: usize = 4096;

/// Byte written to every page before measuring so first-touch faults are
/// not timed.
pub const FILL_BYTE: u8 = 0x01;

/// Extra bytes per CPU for rounding per-thread sizes upward.
pub const SLACK_PER_CPU: u64 = 256;

#[derive(Debug)]
enum Origin {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mapped,
}

/// One contiguous allocation, owned until drop.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

// SAFETY: the region is plain memory; concurrent access is coordinated by the
// sweep, which hands each thread a disjoint sub-range.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn heap(len: usize) -> Result<Self> {
        let oom = || BenchError::OutOfMemory {
            bytes: len as u64,
            node: None,
        };
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGN).map_err(|_| oom())?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc(layout) }).ok_or_else(oom)?;
        Ok(Region {
            ptr,
            len,
            origin: Origin::Heap(layout),
        })
    }

    #[cfg(target_os = "linux")]
    fn mapped_on_node(len: usize, node: usize, os_node: usize) -> Result<Self> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(BenchError::OutOfMemory {
                bytes: len as u64,
                node: Some(node),
            });
        }
        let region = Region {
            ptr: NonNull::new(addr.cast()).ok_or(BenchError::OutOfMemory {
                bytes: len as u64,
                node: Some(node),
            })?,
            len,
            origin: Origin::Mapped,
        };
        bind_to_node(addr, len, os_node)?;
        Ok(region)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn fill(&self, byte: u8) {
        // SAFETY: we own `len` bytes starting at `ptr` and nobody else is
        // using them yet.
        unsafe { std::ptr::write_bytes(self.as_ptr(), byte, self.len) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.origin {
            // SAFETY: allocated by `alloc` with exactly this layout.
            Origin::Heap(layout) => unsafe { dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Origin::Mapped => {
                // SAFETY: mapped by `mmap` with exactly this length.
                let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
                if rc != 0 {
                    warn!("munmap failed: {}", std::io::Error::last_os_error());
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_to_node(addr: *mut libc::c_void, len: usize, os_node: usize) -> Result<()> {
    const MPOL_BIND: libc::c_int = 2;
    const MPOL_MF_STRICT: libc::c_uint = 1;
    const BITS: usize = libc::c_ulong::BITS as usize;

    let mut mask = vec![0 as libc::c_ulong; os_node / BITS + 1];
    mask[os_node / BITS] |= 1 << (os_node % BITS);
    // SAFETY: `addr..addr+len` is a mapping we own; the mask outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            (mask.len() * BITS + 1) as libc::c_ulong,
            MPOL_MF_STRICT,
        )
    };
    if rc != 0 {
        return Err(BenchError::Numa(format!(
            "mbind to node {os_node} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Largest power of two not above `bytes` (0 stays 0).
pub fn round_down_power_of_two(bytes: u64) -> u64 {
    if bytes == 0 {
        0
    } else {
        1 << (63 - bytes.leading_zeros())
    }
}

/// Size of the single backing region: the largest power of two within
/// `min(physical, limit)` plus per-CPU slack. `limit == 0` means no cap.
pub fn backing_size(physical: u64, limit: u64, cpus: usize) -> u64 {
    let budget = if limit != 0 { physical.min(limit) } else { physical };
    round_down_power_of_two(budget) + cpus as u64 * SLACK_PER_CPU
}

/// Size of each per-node region: the least free memory over all nodes,
/// optionally capped, rounded down to whole pages.
pub fn per_node_size(topology: &NumaTopology, limit: u64) -> u64 {
    let mut per_node = topology.min_free_bytes();
    if limit != 0 {
        per_node = per_node.min(limit);
    }
    per_node / REGION_ALIGN as u64 * REGION_ALIGN as u64
}

#[derive(Clone, Debug)]
pub struct AllocOptions {
    /// User cap in bytes; 0 lifts it.
    pub limit_bytes: u64,
    pub physical_memory: u64,
    pub cpus: usize,
    /// Allocate one region per node when set.
    pub topology: Option<NumaTopology>,
}

/// Shape of the backing memory as seen by the sweep planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub nodes: usize,
    pub per_node_bytes: u64,
}

impl RegionLayout {
    pub fn single(bytes: u64) -> Self {
        RegionLayout {
            nodes: 1,
            per_node_bytes: bytes,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.nodes as u64 * self.per_node_bytes
    }
}

/// One region, or one region per NUMA node.
#[derive(Debug)]
pub struct BackingRegion {
    regions: Vec<Region>,
    topology: Option<NumaTopology>,
}

impl BackingRegion {
    pub fn allocate(opts: &AllocOptions) -> Result<Self> {
        match &opts.topology {
            Some(topology) => Self::allocate_numa(topology.clone(), opts.limit_bytes),
            None => Self::allocate_single(backing_size(
                opts.physical_memory,
                opts.limit_bytes,
                opts.cpus,
            )),
        }
    }

    pub fn allocate_single(bytes: u64) -> Result<Self> {
        let len = usize::try_from(bytes).map_err(|_| BenchError::OutOfMemory { bytes, node: None })?;
        info!("Allocating {} MiB for testing.", bytes / 1024 / 1024);
        let region = Region::heap(len)?;
        region.fill(FILL_BYTE);
        Ok(BackingRegion {
            regions: vec![region],
            topology: None,
        })
    }

    #[cfg(target_os = "linux")]
    fn allocate_numa(topology: NumaTopology, limit: u64) -> Result<Self> {
        let per_node = per_node_size(&topology, limit);
        if per_node == 0 {
            return Err(BenchError::InvalidLayout("no free memory on some NUMA node".into()));
        }
        let len = usize::try_from(per_node).map_err(|_| BenchError::OutOfMemory {
            bytes: per_node,
            node: None,
        })?;
        info!(
            "Allocating {} MiB on each of {} NUMA nodes.",
            per_node / 1024 / 1024,
            topology.numa_nodes()
        );

        let regions = (0..topology.numa_nodes())
            .map(|n| Region::mapped_on_node(len, n, topology.node(n).id))
            .collect::<Result<Vec<_>>>()?;

        // First touch happens on the node itself, all nodes at once.
        thread::scope(|s| {
            for (n, region) in regions.iter().enumerate() {
                let cpu = topology.cpus_on_node(n)[0];
                s.spawn(move || {
                    if !pin_current_thread(cpu) {
                        warn!("could not pin filler for node {n} to CPU {cpu}");
                    }
                    region.fill(FILL_BYTE);
                    debug!("node {n} filled");
                });
            }
        });

        Ok(BackingRegion {
            regions,
            topology: Some(topology),
        })
    }

    /// One plain heap region per node of `topology`, without binding. Lets
    /// the multi-node placement run on any machine.
    #[cfg(test)]
    pub(crate) fn heap_per_node(topology: NumaTopology, per_node: u64) -> Result<Self> {
        let regions = (0..topology.numa_nodes())
            .map(|_| {
                let region = Region::heap(per_node as usize)?;
                region.fill(FILL_BYTE);
                Ok(region)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BackingRegion {
            regions,
            topology: Some(topology),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate_numa(_topology: NumaTopology, _limit: u64) -> Result<Self> {
        Err(BenchError::Numa("NUMA allocation is only supported on Linux".into()))
    }

    pub fn topology(&self) -> Option<&NumaTopology> {
        self.topology.as_ref()
    }

    pub fn is_numa(&self) -> bool {
        self.topology.is_some()
    }

    pub fn layout(&self) -> RegionLayout {
        RegionLayout {
            nodes: self.regions.len(),
            per_node_bytes: self.regions.iter().map(|r| r.len() as u64).min().unwrap_or(0),
        }
    }

    pub fn region(&self, node: usize) -> &Region {
        &self.regions[node]
    }

    /// Start of `len` bytes at `offset` inside node `node`'s region.
    ///
    /// # Panics
    /// If the range does not lie inside the region.
    pub fn sub_region(&self, node: usize, offset: u64, len: u64) -> *mut u8 {
        let region = &self.regions[node];
        assert!(
            offset + len <= region.len() as u64,
            "sub-region {offset}+{len} outside region of {} bytes",
            region.len()
        );
        // SAFETY: bounds checked above.
        unsafe { region.as_ptr().add(offset as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::numa::NumaNode;

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(round_down_power_of_two(0), 0);
        assert_eq!(round_down_power_of_two(1), 1);
        assert_eq!(round_down_power_of_two(1 << 30), 1 << 30);
        assert_eq!(round_down_power_of_two((1 << 30) + 1), 1 << 30);
        assert_eq!(round_down_power_of_two(3 * (1 << 30)), 1 << 31);
    }

    #[test]
    fn backing_size_honours_cap_and_adds_slack() {
        let gib = 1u64 << 30;
        assert_eq!(backing_size(12 * gib, 0, 4), 8 * gib + 4 * 256);
        assert_eq!(backing_size(12 * gib, 3 * gib, 2), 2 * gib + 512);
        assert_eq!(backing_size(gib, 64 * gib, 1), gib + 256);
    }

    #[test]
    fn per_node_uses_smallest_free() {
        let node = |id, free| NumaNode {
            id,
            size_bytes: 1 << 34,
            free_bytes: free,
            cpus: vec![id],
        };
        let topo = NumaTopology::new(vec![node(0, (5 << 30) + 123), node(1, 7 << 30)]);
        assert_eq!(per_node_size(&topo, 0), 5 << 30);
        assert_eq!(per_node_size(&topo, 1 << 30), 1 << 30);
    }

    #[test]
    fn single_region_is_aligned_and_filled() {
        let backing = BackingRegion::allocate_single(1 << 20).unwrap();
        let region = backing.region(0);
        assert_eq!(region.as_ptr() as usize % 32, 0);
        assert_eq!(backing.layout(), RegionLayout::single(1 << 20));
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == FILL_BYTE));
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn sub_region_bounds_are_checked() {
        let backing = BackingRegion::allocate_single(4096).unwrap();
        backing.sub_region(0, 2048, 4096);
    }
}
