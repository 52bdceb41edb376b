use serde::Serialize;
use std::fmt;

/// Instruction-set extension a kernel may depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuFeature {
    Mmx,
    Sse,
    Avx,
}

impl CpuFeature {
    pub const ALL: [CpuFeature; 3] = [CpuFeature::Mmx, CpuFeature::Sse, CpuFeature::Avx];

    pub fn as_str(self) -> &'static str {
        match self {
            CpuFeature::Mmx => "mmx",
            CpuFeature::Sse => "sse",
            CpuFeature::Avx => "avx",
        }
    }
}

impl fmt::Display for CpuFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers capability questions about the CPU we are running on.
pub trait FeatureProbe: Send + Sync {
    fn has_mmx(&self) -> bool;
    fn has_sse(&self) -> bool;
    fn has_avx(&self) -> bool;

    fn has(&self, feature: CpuFeature) -> bool {
        match feature {
            CpuFeature::Mmx => self.has_mmx(),
            CpuFeature::Sse => self.has_sse(),
            CpuFeature::Avx => self.has_avx(),
        }
    }

    /// A kernel without a requirement is always runnable.
    fn supports(&self, required: Option<CpuFeature>) -> bool {
        required.map_or(true, |feature| self.has(feature))
    }

    fn available(&self) -> Vec<CpuFeature> {
        CpuFeature::ALL
            .into_iter()
            .filter(|f| self.has(*f))
            .collect()
    }
}

/// CPUID leaf 1 flags, read once at construction.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Clone, Debug)]
pub struct X86Features {
    mmx: bool,
    sse: bool,
    avx: bool,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl X86Features {
    pub fn detect() -> Self {
        let cpuid = raw_cpuid::CpuId::new();
        match cpuid.get_feature_info() {
            Some(info) => X86Features {
                mmx: info.has_mmx(),
                sse: info.has_sse(),
                // AVX state must also be enabled by the OS
                avx: info.has_avx() && info.has_oxsave(),
            },
            None => X86Features {
                mmx: false,
                sse: false,
                avx: false,
            },
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl FeatureProbe for X86Features {
    fn has_mmx(&self) -> bool {
        self.mmx
    }
    fn has_sse(&self) -> bool {
        self.sse
    }
    fn has_avx(&self) -> bool {
        self.avx
    }
}

/// Probe for targets without the x86 extensions: only untagged kernels run.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericFeatures;

impl FeatureProbe for GenericFeatures {
    fn has_mmx(&self) -> bool {
        false
    }
    fn has_sse(&self) -> bool {
        false
    }
    fn has_avx(&self) -> bool {
        false
    }
}

pub fn detect_features() -> Box<dyn FeatureProbe> {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        Box::new(X86Features::detect())
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Box::new(GenericFeatures)
    }
}

#[derive(Clone, Debug)]
pub struct CacheLevel {
    pub level: u8,
    pub kind: &'static str,
    pub size_kib: usize,
    pub line_size: usize,
    pub sets: usize,
    pub associativity: usize,
}

/// Cache hierarchy as reported by CPUID leaf 4. Empty when unavailable.
pub fn cache_levels() -> Vec<CacheLevel> {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        use raw_cpuid::{CacheType, CpuId};

        let cpuid = CpuId::new();
        let Some(params) = cpuid.get_cache_parameters() else {
            return Vec::new();
        };
        params
            .filter(|c| c.cache_type() != CacheType::Null)
            .map(|c| CacheLevel {
                level: c.level(),
                kind: match c.cache_type() {
                    CacheType::Data => "data",
                    CacheType::Instruction => "instruction",
                    _ => "unified",
                },
                size_kib: c.sets() * c.associativity() * c.coherency_line_size() / 1024,
                line_size: c.coherency_line_size(),
                sets: c.sets(),
                associativity: c.associativity(),
            })
            .collect()
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool, bool, bool);

    impl FeatureProbe for Fixed {
        fn has_mmx(&self) -> bool {
            self.0
        }
        fn has_sse(&self) -> bool {
            self.1
        }
        fn has_avx(&self) -> bool {
            self.2
        }
    }

    #[test]
    fn generic_features_only_support_untagged() {
        let probe = GenericFeatures;
        assert!(probe.supports(None));
        for feature in CpuFeature::ALL {
            assert!(!probe.supports(Some(feature)));
        }
        assert!(probe.available().is_empty());
    }

    #[test]
    fn supports_maps_each_tag() {
        let probe = Fixed(true, true, false);
        assert!(probe.supports(Some(CpuFeature::Mmx)));
        assert!(probe.supports(Some(CpuFeature::Sse)));
        assert!(!probe.supports(Some(CpuFeature::Avx)));
        assert_eq!(probe.available(), vec![CpuFeature::Mmx, CpuFeature::Sse]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_always_has_sse() {
        assert!(X86Features::detect().has_sse());
    }
}
