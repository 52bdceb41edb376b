//! Single-cycle pointer permutations for the latency kernels.

use std::mem::size_of;

use rand::RngCore;

use crate::error::{BenchError, Result};

/// Offset added to the region address to form the generator seed.
pub const SEED_OFFSET: u64 = 233_349_568;

/// 64-bit linear congruential generator. The constants are fixed so the
/// same region address always yields the same permutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub const MULTIPLIER: u64 = 0x27BB_2EE6_87B0_B0FD;
    pub const INCREMENT: u64 = 0xB504_F32D;

    pub fn new(seed: u64) -> Self {
        Lcg { state: seed }
    }

    /// Generator used for a region starting at `base`.
    pub fn for_address(base: usize) -> Self {
        Lcg::new((base as u64).wrapping_add(SEED_OFFSET))
    }
}

impl RngCore for Lcg {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state = Self::MULTIPLIER
            .wrapping_mul(self.state)
            .wrapping_add(Self::INCREMENT);
        self.state
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Turns `slots` into one cycle of pointers through every slot.
///
/// Each slot first points at itself; a Sattolo shuffle (swap with a strictly
/// lower index) then joins the self-loops into a single cycle. With `verify`
/// the chain is walked from slot 0 and must return after exactly
/// `slots.len()` hops. Returns the cycle length.
pub fn build_permutation(slots: &mut [usize], verify: bool) -> Result<usize> {
    let n = slots.len();
    if n == 0 {
        return Ok(0);
    }
    let base = slots.as_ptr() as usize;
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = base + i * size_of::<usize>();
    }

    let mut rng = Lcg::for_address(base);
    for len in (2..=n).rev() {
        let i = (rng.next_u64() % (len as u64 - 1)) as usize;
        slots.swap(i, len - 1);
    }

    if !verify {
        return Ok(n);
    }
    let found = cycle_length(slots);
    if found != n {
        return Err(BenchError::PermutationBroken { expected: n, found });
    }
    Ok(n)
}

/// Hops needed to get from slot 0 back to slot 0, giving up after `2 * len`.
/// A pointer leaving the slice also ends the walk.
pub fn cycle_length(slots: &[usize]) -> usize {
    let n = slots.len();
    if n == 0 {
        return 0;
    }
    let base = slots.as_ptr() as usize;
    let index_of = |addr: usize| {
        let offset = addr.checked_sub(base)?;
        let index = offset / size_of::<usize>();
        (offset % size_of::<usize>() == 0 && index < n).then_some(index)
    };

    let mut ptr = slots[0];
    let mut steps = 1;
    while ptr != base && steps < 2 * n {
        match index_of(ptr) {
            Some(i) => ptr = slots[i],
            None => return steps,
        }
        steps += 1;
    }
    steps
}

/// Builds a permutation in a raw sub-region of the backing memory.
///
/// # Safety
/// `area` must be aligned for `usize`, valid for writes of `bytes` bytes and
/// not accessed by anyone else for the duration of the call.
pub unsafe fn build_in_area(area: *mut u8, bytes: usize, verify: bool) -> Result<usize> {
    let slots = std::slice::from_raw_parts_mut(area.cast::<usize>(), bytes / size_of::<usize>());
    build_permutation(slots, verify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lcg_sequence_is_fixed() {
        let mut rng = Lcg::new(0);
        assert_eq!(rng.next_u64(), 0xB504_F32D);
        let second = Lcg::MULTIPLIER
            .wrapping_mul(0xB504_F32D)
            .wrapping_add(Lcg::INCREMENT);
        assert_eq!(rng.next_u64(), second);
    }

    #[test]
    fn lcg_seeds_from_address() {
        let mut a = Lcg::for_address(0x1000);
        let mut b = Lcg::new(0x1000 + SEED_OFFSET);
        for _ in 0..8 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn sixteen_kib_region_is_one_cycle_of_2048() {
        let mut slots = vec![0usize; 16 * 1024 / size_of::<usize>()];
        let n = build_permutation(&mut slots, true).unwrap();
        assert_eq!(n, slots.len());
        assert_eq!(cycle_length(&slots), slots.len());
    }

    #[test]
    fn single_slot_points_to_itself() {
        let mut slots = vec![0usize; 1];
        build_permutation(&mut slots, true).unwrap();
        assert_eq!(slots[0], slots.as_ptr() as usize);
    }

    #[test]
    fn broken_chain_is_reported() {
        let mut slots = vec![0usize; 8];
        build_permutation(&mut slots, false).unwrap();
        // Short-circuit slot 0 to itself.
        slots[0] = slots.as_ptr() as usize;
        assert_eq!(cycle_length(&slots), 1);
    }

    #[test]
    fn same_address_gives_same_permutation() {
        let mut slots = vec![0usize; 512];
        build_permutation(&mut slots, false).unwrap();
        let first = slots.clone();
        build_permutation(&mut slots, false).unwrap();
        assert_eq!(first, slots);
    }

    proptest! {
        #[test]
        fn every_slot_lies_on_the_cycle(n in 1usize..3000) {
            let mut slots = vec![0usize; n];
            prop_assert_eq!(build_permutation(&mut slots, true).unwrap(), n);

            let base = slots.as_ptr() as usize;
            let mut targets: Vec<usize> = slots.iter().map(|a| (a - base) / size_of::<usize>()).collect();
            targets.sort_unstable();
            prop_assert_eq!(targets, (0..n).collect::<Vec<_>>());
        }
    }
}
