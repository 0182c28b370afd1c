//! Element-by-element reference kernels.
//!
//! These never look past the shortest slice they are given; callers pass
//! slices already trimmed to `n` elements.

/// `dst[i] = value`
#[inline]
pub fn fill(dst: &mut [f64], value: f64) {
    dst.iter_mut().for_each(|d| *d = value);
}

/// `dst[i] = a[i] + b[i]`
#[inline]
pub fn add(dst: &mut [f64], a: &[f64], b: &[f64]) {
    dst.iter_mut()
        .zip(a.iter().zip(b))
        .for_each(|(d, (&x, &y))| *d = x + y);
}

/// `dst[i] = a[i] * b[i]`
#[inline]
pub fn mul(dst: &mut [f64], a: &[f64], b: &[f64]) {
    dst.iter_mut()
        .zip(a.iter().zip(b))
        .for_each(|(d, (&x, &y))| *d = x * y);
}

/// Left-to-right sum.
#[inline]
pub fn sum(src: &[f64]) -> f64 {
    src.iter().fold(0.0, |acc, &x| acc + x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_respect_shortest_slice() {
        let a = [1.0, 2.0, 3.0];
        let b = [10.0, 20.0];
        let mut dst = [0.0; 3];
        add(&mut dst, &a, &b);
        assert_eq!(dst, [11.0, 22.0, 0.0]);

        mul(&mut dst[..2], &a, &b);
        assert_eq!(dst, [10.0, 40.0, 0.0]);
    }

    #[test]
    fn fill_and_sum() {
        let mut buf = [0.0; 5];
        fill(&mut buf, 1.5);
        assert_eq!(sum(&buf), 7.5);
        assert_eq!(sum(&[]), 0.0);
    }
}
