//! Pointer-chasing kernels. The area must hold a single-cycle permutation of
//! pointers into itself (see `crate::permutation`); each walk starts at the
//! first slot and ends when the chain returns there.

use std::ptr;

pub unsafe fn perm_read_simple(area: *mut u8, _size: usize, repeats: usize) {
    let begin = area.cast::<usize>().cast_const();
    for _ in 0..repeats {
        let mut p = begin;
        loop {
            p = ptr::read_volatile(p) as *const usize;
            if p == begin {
                break;
            }
        }
    }
}

/// Sixteen hops per loop check; the cycle length must be a multiple of 16.
pub unsafe fn perm_read_unroll(area: *mut u8, _size: usize, repeats: usize) {
    let begin = area.cast::<usize>().cast_const();
    for _ in 0..repeats {
        let mut p = begin;
        loop {
            for _ in 0..16 {
                p = ptr::read_volatile(p) as *const usize;
            }
            if p == begin {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::build_permutation;

    #[test]
    fn walkers_terminate_on_a_built_cycle() {
        let mut slots = vec![0usize; 256];
        build_permutation(&mut slots, true).unwrap();
        let area = slots.as_mut_ptr().cast::<u8>();
        let bytes = slots.len() * std::mem::size_of::<usize>();
        unsafe {
            perm_read_simple(area, bytes, 3);
            perm_read_unroll(area, bytes, 3);
        }
    }
}
