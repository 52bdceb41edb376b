use serde::Serialize;
use std::mem::size_of;

use crate::system::cpu_info::{CpuFeature, FeatureProbe};

pub mod perm;
pub mod scan;
#[cfg(target_arch = "x86_64")]
pub mod simd;

/// Kernel entry point: `(area, area_bytes, repeats)`.
///
/// # Safety
/// `area` must be valid for reads and writes of `area_bytes`, aligned to the
/// kernel's access width, and `area_bytes` must be a non-zero multiple of the
/// kernel's `alignment()`. `repeats` must be at least 1. Permutation kernels
/// additionally require the area to hold a single-cycle pointer permutation.
pub type KernelFn = unsafe fn(*mut u8, usize, usize);

/// Descriptor of one micro-benchmark. Immutable once in a catalog.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Kernel {
    pub name: &'static str,
    #[serde(skip)]
    pub func: KernelFn,
    pub required_feature: Option<CpuFeature>,
    /// Bytes read or written per access.
    pub bytes_per_access: u64,
    /// Distance between consecutive accesses, at least `bytes_per_access`.
    pub access_offset: u64,
    /// Accesses per loop-bound check.
    pub unroll_factor: u64,
    /// Fill the area with a pointer cycle before each run.
    pub make_permutation: bool,
}

impl Kernel {
    /// Sequential kernel touching every `bytes` wide word.
    pub const fn scan(name: &'static str, func: KernelFn, bytes: u64, unroll: u64) -> Self {
        Kernel {
            name,
            func,
            required_feature: None,
            bytes_per_access: bytes,
            access_offset: bytes,
            unroll_factor: unroll,
            make_permutation: false,
        }
    }

    /// Kernel touching `bytes` at the start of every `offset` bytes.
    pub const fn skip(name: &'static str, func: KernelFn, bytes: u64, offset: u64) -> Self {
        Kernel {
            access_offset: offset,
            // areas must hold a whole number of strides
            unroll_factor: offset / bytes,
            ..Kernel::scan(name, func, bytes, 1)
        }
    }

    pub const fn permutation(name: &'static str, func: KernelFn, unroll: u64) -> Self {
        Kernel {
            make_permutation: true,
            ..Kernel::scan(name, func, size_of::<usize>() as u64, unroll)
        }
    }

    pub const fn requires(self, feature: CpuFeature) -> Self {
        Kernel {
            required_feature: Some(feature),
            ..self
        }
    }

    /// Every per-thread area handed to `func` is a multiple of this.
    pub fn alignment(&self) -> u64 {
        self.unroll_factor * self.bytes_per_access
    }

    pub fn matches(&self, filters: &[String]) -> bool {
        filters.is_empty() || filters.iter().any(|f| self.name.contains(f.as_str()))
    }
}

/// Ordered kernel list. Registration order is the run order and therefore
/// the order of lines in the results file.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    kernels: Vec<Kernel>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// # Panics
    /// On a duplicate name or an inconsistent descriptor.
    pub fn register(&mut self, kernel: Kernel) -> &mut Self {
        assert!(
            kernel.bytes_per_access > 0 && kernel.unroll_factor > 0,
            "kernel {} has a zero width or unroll factor",
            kernel.name
        );
        assert!(
            kernel.access_offset >= kernel.bytes_per_access,
            "kernel {} has access offset below its access width",
            kernel.name
        );
        assert!(
            self.get(kernel.name).is_none(),
            "kernel {} registered twice",
            kernel.name
        );
        self.kernels.push(kernel);
        self
    }

    pub fn all(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn get(&self, name: &str) -> Option<&Kernel> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn supported(&self, kernel: &Kernel, probe: &dyn FeatureProbe) -> bool {
        probe.supports(kernel.required_feature)
    }

    /// Kernels whose name contains any of `filters`; all of them if empty.
    pub fn filter_by_name(&self, filters: &[String]) -> Vec<&Kernel> {
        self.kernels.iter().filter(|k| k.matches(filters)).collect()
    }

    /// Every kernel compiled for this target.
    pub fn builtin() -> Self {
        let mut catalog = Catalog::new();
        catalog
            .register(Kernel::scan("ScanWrite64PtrSimpleLoop", scan::scan_write_64_ptr_simple, 8, 1))
            .register(Kernel::scan("ScanWrite64PtrUnrollLoop", scan::scan_write_64_ptr_unroll, 8, 16))
            .register(Kernel::scan("ScanRead64PtrSimpleLoop", scan::scan_read_64_ptr_simple, 8, 1))
            .register(Kernel::scan("ScanRead64PtrUnrollLoop", scan::scan_read_64_ptr_unroll, 8, 16))
            .register(Kernel::scan("ScanWrite64IndexSimpleLoop", scan::scan_write_64_index_simple, 8, 1))
            .register(Kernel::scan("ScanWrite64IndexUnrollLoop", scan::scan_write_64_index_unroll, 8, 16))
            .register(Kernel::scan("ScanRead64IndexSimpleLoop", scan::scan_read_64_index_simple, 8, 1))
            .register(Kernel::scan("ScanRead64IndexUnrollLoop", scan::scan_read_64_index_unroll, 8, 16));

        #[cfg(target_arch = "x86_64")]
        catalog
            .register(Kernel::scan("ScanWrite128PtrSimpleLoop", simd::scan_write_128_ptr_simple, 16, 1).requires(CpuFeature::Sse))
            .register(Kernel::scan("ScanWrite128PtrUnrollLoop", simd::scan_write_128_ptr_unroll, 16, 16).requires(CpuFeature::Sse))
            .register(Kernel::scan("ScanRead128PtrSimpleLoop", simd::scan_read_128_ptr_simple, 16, 1).requires(CpuFeature::Sse))
            .register(Kernel::scan("ScanRead128PtrUnrollLoop", simd::scan_read_128_ptr_unroll, 16, 16).requires(CpuFeature::Sse))
            .register(Kernel::scan("ScanWrite256PtrSimpleLoop", simd::scan_write_256_ptr_simple, 32, 1).requires(CpuFeature::Avx))
            .register(Kernel::scan("ScanWrite256PtrUnrollLoop", simd::scan_write_256_ptr_unroll, 32, 16).requires(CpuFeature::Avx))
            .register(Kernel::scan("ScanRead256PtrSimpleLoop", simd::scan_read_256_ptr_simple, 32, 1).requires(CpuFeature::Avx))
            .register(Kernel::scan("ScanRead256PtrUnrollLoop", simd::scan_read_256_ptr_unroll, 32, 16).requires(CpuFeature::Avx));

        catalog
            .register(Kernel::scan("ScanWrite32PtrSimpleLoop", scan::scan_write_32_ptr_simple, 4, 1))
            .register(Kernel::scan("ScanRead32PtrSimpleLoop", scan::scan_read_32_ptr_simple, 4, 1))
            .register(Kernel::scan("ScanWrite16PtrSimpleLoop", scan::scan_write_16_ptr_simple, 2, 1))
            .register(Kernel::scan("ScanRead16PtrSimpleLoop", scan::scan_read_16_ptr_simple, 2, 1))
            .register(Kernel::scan("ScanWrite8PtrSimpleLoop", scan::scan_write_8_ptr_simple, 1, 1))
            .register(Kernel::scan("ScanRead8PtrSimpleLoop", scan::scan_read_8_ptr_simple, 1, 1))
            .register(Kernel::skip("SkipWrite64PtrSimpleLoop", scan::skip_write_64_ptr_simple, 8, scan::SKIP_STRIDE as u64))
            .register(Kernel::skip("SkipRead64PtrSimpleLoop", scan::skip_read_64_ptr_simple, 8, scan::SKIP_STRIDE as u64));

        #[cfg(target_arch = "x86_64")]
        catalog
            .register(Kernel::skip("SkipWrite128PtrSimpleLoop", simd::skip_write_128_ptr_simple, 16, scan::SKIP_STRIDE as u64).requires(CpuFeature::Sse))
            .register(Kernel::skip("SkipRead128PtrSimpleLoop", simd::skip_read_128_ptr_simple, 16, scan::SKIP_STRIDE as u64).requires(CpuFeature::Sse));

        #[cfg(target_pointer_width = "64")]
        catalog
            .register(Kernel::permutation("PermRead64SimpleLoop", perm::perm_read_simple, 1))
            .register(Kernel::permutation("PermRead64UnrollLoop", perm::perm_read_unroll, 16));
        #[cfg(target_pointer_width = "32")]
        catalog
            .register(Kernel::permutation("PermRead32SimpleLoop", perm::perm_read_simple, 1))
            .register(Kernel::permutation("PermRead32UnrollLoop", perm::perm_read_unroll, 16));

        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::cpu_info::GenericFeatures;

    unsafe fn noop(_: *mut u8, _: usize, _: usize) {}

    #[test]
    fn builtin_is_consistent() {
        let catalog = Catalog::builtin();
        assert!(catalog.all().len() >= 18);
        for k in catalog.all() {
            assert!(k.access_offset >= k.bytes_per_access, "{}", k.name);
            assert_eq!(k.alignment() % k.bytes_per_access, 0);
            assert_eq!(k.alignment() % k.access_offset, 0, "{}", k.name);
        }
        let perm = catalog.get("PermRead64UnrollLoop").unwrap();
        assert!(perm.make_permutation);
        assert_eq!(perm.alignment(), 128);
    }

    #[test]
    fn filters_match_substrings_in_order() {
        let catalog = Catalog::builtin();
        let all = catalog.filter_by_name(&[]);
        assert_eq!(all.len(), catalog.all().len());

        let picked = catalog.filter_by_name(&["Perm".to_string(), "Skip".to_string()]);
        assert!(!picked.is_empty());
        assert!(picked.iter().all(|k| k.name.contains("Perm") || k.name.contains("Skip")));
        let first_perm = picked.iter().position(|k| k.name.contains("Perm")).unwrap();
        assert!(picked[first_perm..].iter().all(|k| k.name.contains("Perm")));
    }

    #[test]
    fn tagged_kernels_are_kept_but_unsupported_on_generic_cpus() {
        let mut catalog = Catalog::new();
        catalog
            .register(Kernel::scan("Plain", noop, 8, 1))
            .register(Kernel::scan("Wide", noop, 32, 16).requires(CpuFeature::Avx));
        let probe = GenericFeatures;
        let flags: Vec<bool> = catalog.all().iter().map(|k| catalog.supported(k, &probe)).collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_names_are_rejected() {
        let mut catalog = Catalog::new();
        catalog
            .register(Kernel::scan("Same", noop, 8, 1))
            .register(Kernel::scan("Same", noop, 8, 1));
    }

    #[test]
    fn skip_alignment_covers_whole_strides() {
        let k = Kernel::skip("S", noop, 8, 64);
        assert_eq!(k.alignment(), 64);
        assert_eq!(k.access_offset, 64);
    }
}
