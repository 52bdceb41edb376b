//! 128-bit (SSE) and 256-bit (AVX) kernels for x86_64.
//!
//! Every store writes the 64-bit test pattern broadcast into all lanes.
//! The backing region is page aligned and sub-regions start at multiples
//! of the access width, so the aligned vector moves are always legal.

use std::arch::x86_64::*;
use std::ptr;

use super::scan::{
    read_ptr_simple, read_ptr_unroll, read_skip, write_ptr_simple, write_ptr_unroll, write_skip,
    PATTERN_64, UNROLL,
};

const PATTERN: i64 = PATTERN_64 as i64;

#[inline(always)]
fn pattern_128() -> __m128i {
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe { _mm_set1_epi64x(PATTERN) }
}

pub unsafe fn scan_write_128_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    write_ptr_simple::<__m128i>(area, size, repeats, pattern_128())
}

pub unsafe fn scan_write_128_ptr_unroll(area: *mut u8, size: usize, repeats: usize) {
    write_ptr_unroll::<__m128i>(area, size, repeats, pattern_128())
}

pub unsafe fn scan_read_128_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    read_ptr_simple::<__m128i>(area, size, repeats)
}

pub unsafe fn scan_read_128_ptr_unroll(area: *mut u8, size: usize, repeats: usize) {
    read_ptr_unroll::<__m128i>(area, size, repeats)
}

pub unsafe fn skip_write_128_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    write_skip::<__m128i>(area, size, repeats, pattern_128())
}

pub unsafe fn skip_read_128_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    read_skip::<__m128i>(area, size, repeats)
}

#[target_feature(enable = "avx")]
unsafe fn avx_write(area: *mut u8, size: usize, repeats: usize, unrolled: bool) {
    let value = _mm256_set1_epi64x(PATTERN);
    let begin = area.cast::<__m256i>();
    let end = begin.add(size / 32);
    for _ in 0..repeats {
        let mut p = begin;
        if unrolled {
            while p < end {
                for k in 0..UNROLL {
                    ptr::write_volatile(p.add(k), value);
                }
                p = p.add(UNROLL);
            }
        } else {
            while p < end {
                ptr::write_volatile(p, value);
                p = p.add(1);
            }
        }
    }
}

#[target_feature(enable = "avx")]
unsafe fn avx_read(area: *mut u8, size: usize, repeats: usize, unrolled: bool) {
    let begin = area.cast::<__m256i>().cast_const();
    let end = begin.add(size / 32);
    for _ in 0..repeats {
        let mut p = begin;
        if unrolled {
            while p < end {
                for k in 0..UNROLL {
                    let _ = ptr::read_volatile(p.add(k));
                }
                p = p.add(UNROLL);
            }
        } else {
            while p < end {
                let _ = ptr::read_volatile(p);
                p = p.add(1);
            }
        }
    }
}

// The catalog only hands these out when CPUID reports AVX.
pub unsafe fn scan_write_256_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    avx_write(area, size, repeats, false)
}

pub unsafe fn scan_write_256_ptr_unroll(area: *mut u8, size: usize, repeats: usize) {
    avx_write(area, size, repeats, true)
}

pub unsafe fn scan_read_256_ptr_simple(area: *mut u8, size: usize, repeats: usize) {
    avx_read(area, size, repeats, false)
}

pub unsafe fn scan_read_256_ptr_unroll(area: *mut u8, size: usize, repeats: usize) {
    avx_read(area, size, repeats, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(32))]
    struct Aligned([u64; 128]);

    #[test]
    fn sse_writer_fills_both_lanes() {
        let mut buf = Aligned([0; 128]);
        unsafe { scan_write_128_ptr_unroll(buf.0.as_mut_ptr().cast(), 1024, 1) };
        assert!(buf.0.iter().all(|&w| w == PATTERN_64));
    }

    #[test]
    fn avx_writer_when_available() {
        if !is_x86_feature_detected!("avx") {
            return;
        }
        let mut buf = Aligned([0; 128]);
        unsafe {
            scan_write_256_ptr_simple(buf.0.as_mut_ptr().cast(), 512, 1);
            scan_read_256_ptr_unroll(buf.0.as_mut_ptr().cast(), 1024, 1);
        }
        assert!(buf.0[..64].iter().all(|&w| w == PATTERN_64));
        assert!(buf.0[64..].iter().all(|&w| w == 0));
    }
}
