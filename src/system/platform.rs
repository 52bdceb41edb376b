use core_affinity::{get_core_ids, CoreId};

/// OS ids of the CPUs this process may run on, in ascending order.
pub fn cpu_ids() -> Vec<usize> {
    match get_core_ids() {
        Some(ids) if !ids.is_empty() => {
            let mut ids: Vec<usize> = ids.into_iter().map(|c| c.id).collect();
            ids.sort_unstable();
            ids
        }
        _ => {
            let n = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (0..n).collect()
        }
    }
}

/// Number of CPUs threads can be pinned to.
pub fn physical_cpus() -> usize {
    cpu_ids().len()
}

/// Installed RAM in bytes, or `None` if the OS will not tell us.
pub fn physical_memory_bytes() -> Option<u64> {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages <= 0 || page_size <= 0 {
            return None;
        }
        Some(pages as u64 * page_size as u64)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: the buffer is valid for its whole length.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..end]).into_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Pins the calling thread to `cpu`. Returns false when the OS refused.
pub fn pin_current_thread(cpu: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: cpu })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_queries_report_something() {
        assert!(physical_cpus() >= 1);
        let ids = cpu_ids();
        assert_eq!(ids.len(), physical_cpus());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(!hostname().is_empty());
        #[cfg(target_os = "linux")]
        assert!(physical_memory_bytes().unwrap() > 0);
    }
}
