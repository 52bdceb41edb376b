//! Portable scanning kernels built from volatile loads and stores.
//!
//! All loops are "do at least once": callers pass `repeats >= 1` and a
//! `size` that is a non-zero multiple of the kernel's alignment unit.

use std::mem::size_of;
use std::ptr;

pub const UNROLL: usize = 16;

pub const PATTERN_64: u64 = 0xC0FF_EEEE_BABE_0000;
pub const PATTERN_32: u32 = 0xC0FF_EEEE;
pub const PATTERN_16: u16 = 0xC0FF;
pub const PATTERN_8: u8 = 0xC0;

/// Bytes between accesses of the skipping kernels: one access per cache line.
pub const SKIP_STRIDE: usize = 64;

#[inline(always)]
pub(crate) unsafe fn write_ptr_simple<T: Copy>(area: *mut u8, size: usize, repeats: usize, value: T) {
    let begin = area.cast::<T>();
    let end = begin.add(size / size_of::<T>());
    for _ in 0..repeats {
        let mut p = begin;
        while p < end {
            ptr::write_volatile(p, value);
            p = p.add(1);
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn write_ptr_unroll<T: Copy>(area: *mut u8, size: usize, repeats: usize, value: T) {
    let begin = area.cast::<T>();
    let end = begin.add(size / size_of::<T>());
    for _ in 0..repeats {
        let mut p = begin;
        while p < end {
            for k in 0..UNROLL {
                ptr::write_volatile(p.add(k), value);
            }
            p = p.add(UNROLL);
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn read_ptr_simple<T: Copy>(area: *mut u8, size: usize, repeats: usize) {
    let begin = area.cast::<T>().cast_const();
    let end = begin.add(size / size_of::<T>());
    for _ in 0..repeats {
        let mut p = begin;
        while p < end {
            let _ = ptr::read_volatile(p);
            p = p.add(1);
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn read_ptr_unroll<T: Copy>(area: *mut u8, size: usize, repeats: usize) {
    let begin = area.cast::<T>().cast_const();
    let end = begin.add(size / size_of::<T>());
    for _ in 0..repeats {
        let mut p = begin;
        while p < end {
            for k in 0..UNROLL {
                let _ = ptr::read_volatile(p.add(k));
            }
            p = p.add(UNROLL);
        }
    }
}

#[inline(always)]
unsafe fn write_index_simple<T: Copy>(area: *mut u8, size: usize, repeats: usize, value: T) {
    let base = area.cast::<T>();
    let n = size / size_of::<T>();
    for _ in 0..repeats {
        for i in 0..n {
            ptr::write_volatile(base.add(i), value);
        }
    }
}

#[inline(always)]
unsafe fn write_index_unroll<T: Copy>(area: *mut u8, size: usize, repeats: usize, value: T) {
    let base = area.cast::<T>();
    let n = size / size_of::<T>();
    for _ in 0..repeats {
        let mut i = 0;
        while i < n {
            for k in 0..UNROLL {
                ptr::write_volatile(base.add(i + k), value);
            }
            i += UNROLL;
        }
    }
}

#[inline(always)]
unsafe fn read_index_simple<T: Copy>(area: *mut u8, size: usize, repeats: usize) {
    let base = area.cast::<T>().cast_const();
    let n = size / size_of::<T>();
    for _ in 0..repeats {
        for i in 0..n {
            let _ = ptr::read_volatile(base.add(i));
        }
    }
}

#[inline(always)]
unsafe fn read_index_unroll<T: Copy>(area: *mut u8, size: usize, repeats: usize) {
    let base = area.cast::<T>().cast_const();
    let n = size / size_of::<T>();
    for _ in 0..repeats {
        let mut i = 0;
        while i < n {
            for k in 0..UNROLL {
                let _ = ptr::read_volatile(base.add(i + k));
            }
            i += UNROLL;
        }
    }
}

/// One `T` at the start of every `SKIP_STRIDE` bytes.
#[inline(always)]
pub(crate) unsafe fn write_skip<T: Copy>(area: *mut u8, size: usize, repeats: usize, value: T) {
    let end = area.add(size);
    for _ in 0..repeats {
        let mut p = area;
        while p < end {
            ptr::write_volatile(p.cast::<T>(), value);
            p = p.wrapping_add(SKIP_STRIDE);
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn read_skip<T: Copy>(area: *mut u8, size: usize, repeats: usize) {
    let begin = area.cast_const();
    let end = begin.add(size);
    for _ in 0..repeats {
        let mut p = begin;
        while p < end {
            let _ = ptr::read_volatile(p.cast::<T>());
            p = p.wrapping_add(SKIP_STRIDE);
        }
    }
}

macro_rules! scan_kernels {
    ($($name:ident => $helper:ident::<$ty:ty>($($value:expr)?);)*) => {
        $(
            pub unsafe fn $name(area: *mut u8, size: usize, repeats: usize) {
                $helper::<$ty>(area, size, repeats $(, $value)?)
            }
        )*
    };
}

scan_kernels! {
    scan_write_64_ptr_simple => write_ptr_simple::<u64>(PATTERN_64);
    scan_write_64_ptr_unroll => write_ptr_unroll::<u64>(PATTERN_64);
    scan_read_64_ptr_simple => read_ptr_simple::<u64>();
    scan_read_64_ptr_unroll => read_ptr_unroll::<u64>();
    scan_write_64_index_simple => write_index_simple::<u64>(PATTERN_64);
    scan_write_64_index_unroll => write_index_unroll::<u64>(PATTERN_64);
    scan_read_64_index_simple => read_index_simple::<u64>();
    scan_read_64_index_unroll => read_index_unroll::<u64>();
    scan_write_32_ptr_simple => write_ptr_simple::<u32>(PATTERN_32);
    scan_read_32_ptr_simple => read_ptr_simple::<u32>();
    scan_write_16_ptr_simple => write_ptr_simple::<u16>(PATTERN_16);
    scan_read_16_ptr_simple => read_ptr_simple::<u16>();
    scan_write_8_ptr_simple => write_ptr_simple::<u8>(PATTERN_8);
    scan_read_8_ptr_simple => read_ptr_simple::<u8>();
    skip_write_64_ptr_simple => write_skip::<u64>(PATTERN_64);
    skip_read_64_ptr_simple => read_skip::<u64>();
}
