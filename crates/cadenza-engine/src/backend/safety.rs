//! RT-safe buffer helpers for backend process threads.
//! No allocations or locks.

#[inline(always)]
pub fn zero_f32(buf: &mut [f32]) {
    for x in buf {
        *x = 0.0;
    }
}

/// Replaces non-finite samples with silence and clamps to `[-1, 1]`.
#[inline(always)]
pub fn sanitize_f32(buf: &mut [f32]) {
    for x in buf {
        if !x.is_finite() {
            *x = 0.0;
        } else if *x > 1.0 {
            *x = 1.0;
        } else if *x < -1.0 {
            *x = -1.0;
        }
    }
}

/// Adds `src` into `dst` sample by sample over their common length.
#[inline(always)]
pub fn mix_f32(src: &[f32], dst: &mut [f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_removes_non_finite_and_clamps() {
        let mut buf = [f32::NAN, 2.0, -3.0, 0.25, f32::INFINITY];
        sanitize_f32(&mut buf);
        assert_eq!(buf, [0.0, 1.0, -1.0, 0.25, 0.0]);
    }

    #[test]
    fn mix_accumulates() {
        let mut dst = [0.5, 0.5, 0.5];
        mix_f32(&[0.25, -0.5], &mut dst);
        assert_eq!(dst, [0.75, 0.0, 0.5]);
        zero_f32(&mut dst);
        assert_eq!(dst, [0.0; 3]);
    }
}
