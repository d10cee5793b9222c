//! Dense f64 inner loops shared by the encoded-group kernels

use multiversion::multiversion;

/// Add a scalar to every element of a contiguous slice.
///
/// Run-length kernels hit this with whole runs at a time.
#[multiversion(targets("x86_64+avx+fma", "x86_64+avx", "x86_64+sse3"))]
pub fn add_scalar(out: &mut [f64], s: f64) {
    for o in out.iter_mut() {
        *o += s;
    }
}

/// `out += x * s` over contiguous slices of equal length.
#[multiversion(targets("x86_64+avx+fma", "x86_64+avx", "x86_64+sse3"))]
pub fn axpy(out: &mut [f64], x: &[f64], s: f64) {
    for (o, v) in out.iter_mut().zip(x) {
        *o += *v * s;
    }
}

/// Dot product of two contiguous slices of equal length.
#[multiversion(targets("x86_64+avx+fma", "x86_64+avx", "x86_64+sse3"))]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut acc = 0.0;
    for (x, y) in a.iter().zip(b) {
        acc += *x * *y;
    }
    acc
}

/// Sum of a contiguous slice.
#[multiversion(targets("x86_64+avx+fma", "x86_64+avx", "x86_64+sse3"))]
pub fn sum(a: &[f64]) -> f64 {
    let mut acc = 0.0;
    for x in a {
        acc += *x;
    }
    acc
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basics() {
        let mut out = vec![1.0, 2.0, 3.0];
        add_scalar(&mut out, 0.5);
        assert_eq!(out, vec![1.5, 2.5, 3.5]);

        let mut out = vec![0.0; 3];
        axpy(&mut out, &[1.0, 2.0, 3.0], 2.0);
        assert_eq!(out, vec![2.0, 4.0, 6.0]);

        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(sum(&[1.0, 2.0, 4.0]), 7.0);
    }
}
