use std::path::Path;

use tracing::debug;

use crate::error::{BenchError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaNode {
    /// Kernel node id, used for `mbind`.
    pub id: usize,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub cpus: Vec<usize>,
}

/// Nodes are indexed densely from 0 in the order the kernel lists them;
/// `NumaNode::id` keeps the OS numbering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
}

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

impl NumaTopology {
    pub fn new(nodes: Vec<NumaNode>) -> Self {
        NumaTopology { nodes }
    }

    /// Reads the live topology. `None` unless at least two nodes with CPUs exist.
    pub fn detect() -> Option<Self> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        match Self::from_sysfs(Path::new(SYSFS_NODE_ROOT)) {
            Ok(topo) if topo.numa_nodes() >= 2 => Some(topo),
            Ok(_) => None,
            Err(e) => {
                debug!("no NUMA topology: {e}");
                None
            }
        }
    }

    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let dir = root.join(format!("node{id}"));
            let cpus = parse_cpulist(std::fs::read_to_string(dir.join("cpulist"))?.trim())?;
            if cpus.is_empty() {
                debug!("NUMA node {id} has no CPUs, ignoring it");
                continue;
            }
            let meminfo = std::fs::read_to_string(dir.join("meminfo"))?;
            let (size_bytes, free_bytes) = parse_meminfo(&meminfo)?;
            nodes.push(NumaNode {
                id,
                size_bytes,
                free_bytes,
                cpus,
            });
        }
        Ok(NumaTopology { nodes })
    }

    pub fn numa_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, n: usize) -> &NumaNode {
        &self.nodes[n]
    }

    pub fn node_size_bytes(&self, n: usize) -> u64 {
        self.nodes[n].size_bytes
    }

    pub fn node_free_bytes(&self, n: usize) -> u64 {
        self.nodes[n].free_bytes
    }

    pub fn cpus_on_node(&self, n: usize) -> &[usize] {
        &self.nodes[n].cpus
    }

    /// CPU for thread `thread`: round-robin over nodes, then over each node's CPUs.
    pub fn cpu_for_thread(&self, thread: usize) -> usize {
        let nodes = self.numa_nodes();
        let cpus = self.cpus_on_node(thread % nodes);
        cpus[(thread / nodes) % cpus.len()]
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.nodes.iter().map(|n| n.free_bytes).min().unwrap_or(0)
    }
}

/// Parses the kernel's cpulist syntax, e.g. `0-3,8,10-11`.
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let bad = || BenchError::Numa(format!("unparseable cpulist '{list}'"));
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| bad())?;
                let hi: usize = hi.parse().map_err(|_| bad())?;
                if hi < lo {
                    return Err(bad());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| bad())?),
        }
    }
    Ok(cpus)
}

/// Extracts `(MemTotal, MemFree)` in bytes from a per-node meminfo file.
pub fn parse_meminfo(text: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut free = None;
    for line in text.lines() {
        // "Node 0 MemTotal:       32768000 kB"
        let mut fields = line.split_whitespace().skip(2);
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(kib * 1024),
            "MemFree:" => free = Some(kib * 1024),
            _ => {}
        }
    }
    match (total, free) {
        (Some(t), Some(f)) => Ok((t, f)),
        _ => Err(BenchError::Numa("meminfo lacks MemTotal/MemFree".into())),
    }
}
