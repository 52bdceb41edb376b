use crate::error::{BenchError, Result};

use super::GIB;

/// Everything the engine needs to know about what to sweep.
#[derive(Clone, Debug)]
pub struct SweepSettings {
    /// Smallest array size to run; 0 disables the bound.
    pub size_min: u64,
    /// Largest array size to run; 0 disables the bound.
    pub size_max: u64,
    /// 0 starts at one thread.
    pub min_threads: usize,
    /// 0 means `physical_cpus + 2`.
    pub max_threads: usize,
    /// Double the thread count instead of incrementing it.
    pub geometric: bool,
    /// Repeat every run for each NUMA node offset.
    pub numa_hops: bool,
    /// Measurements shorter than this are rerun with more repeats.
    pub min_time: f64,
    /// Duration the repeat count is scaled towards.
    pub target_time: f64,
    pub verify_permutation: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            size_min: 0,
            size_max: 4 * GIB,
            min_threads: 0,
            max_threads: 0,
            geometric: false,
            numa_hops: false,
            min_time: 1.0,
            target_time: 1.5,
            verify_permutation: false,
        }
    }
}

impl SweepSettings {
    /// Rejects timing combinations the adaptive repeat loop cannot satisfy:
    /// runs are scaled towards `target_time`, so one below `min_time` would
    /// rerun forever.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_time > 0.0 && self.min_time.is_finite()) {
            return Err(BenchError::InvalidSettings(format!(
                "minimum time must be positive, got {}",
                self.min_time
            )));
        }
        if !(self.target_time >= self.min_time && self.target_time.is_finite()) {
            return Err(BenchError::InvalidSettings(format!(
                "target time {} is below minimum time {}",
                self.target_time, self.min_time
            )));
        }
        Ok(())
    }
}

/// Parses `1024`, `64k`, `4M`, `2g`, `1T`. Suffixes are powers of 1024.
pub fn parse_size(text: &str) -> Result<u64> {
    let invalid = || BenchError::InvalidSize(text.to_string());
    let trimmed = text.trim();
    let (digits, shift) = match trimmed.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&trimmed[..trimmed.len() - 1], 10),
        Some('m') => (&trimmed[..trimmed.len() - 1], 20),
        Some('g') => (&trimmed[..trimmed.len() - 1], 30),
        Some('t') => (&trimmed[..trimmed.len() - 1], 40),
        _ => (trimmed, 0),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(1 << shift).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn suffixes_are_binary_and_case_insensitive() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("65536").unwrap(), 65536);
        assert_eq!(parse_size("64k").unwrap(), 65536);
        assert_eq!(parse_size("64K").unwrap(), 65536);
        assert_eq!(parse_size("3m").unwrap(), 3 << 20);
        assert_eq!(parse_size("4G").unwrap(), 4 << 30);
        assert_eq!(parse_size("1t").unwrap(), 1 << 40);
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in ["", "k", "abc", "-1", "1.5g", "12x", "99999999999t"] {
            assert!(matches!(parse_size(bad), Err(BenchError::InvalidSize(_))), "{bad}");
        }
    }

    #[test]
    fn defaults_cap_sizes_at_four_gib() {
        let settings = SweepSettings::default();
        assert_eq!(settings.size_max, 4 << 30);
        assert_eq!(settings.min_time, 1.0);
        assert!(settings.target_time > settings.min_time);
    }

    #[test]
    fn timing_must_leave_room_to_converge() {
        assert!(SweepSettings::default().validate().is_ok());

        let equal = SweepSettings {
            min_time: 0.5,
            target_time: 0.5,
            ..SweepSettings::default()
        };
        assert!(equal.validate().is_ok());

        for (min_time, target_time) in [(2.0, 1.5), (0.0, 1.5), (-1.0, 1.5), (f64::NAN, 1.5), (1.0, f64::INFINITY)] {
            let settings = SweepSettings {
                min_time,
                target_time,
                ..SweepSettings::default()
            };
            assert!(
                matches!(settings.validate(), Err(BenchError::InvalidSettings(_))),
                "{min_time} / {target_time}"
            );
        }
    }

    proptest! {
        #[test]
        fn suffix_multiplies_by_power_of_1024(n in 0u64..1_000_000, idx in 0usize..4) {
            let (suffix, shift) = [("k", 10), ("M", 20), ("g", 30), ("T", 40)][idx];
            prop_assert_eq!(parse_size(&format!("{n}{suffix}")).unwrap(), n << shift);
            prop_assert_eq!(parse_size(&n.to_string()).unwrap(), n);
        }
    }
}
