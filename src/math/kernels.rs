//! Scalar kernels shared by the sensing-matrix builder and the elastic net.
//!
//! - `shrink(x, a)` is the soft-thresholding operator, the proximal map of `a·|x|`.
//! - `gamma(indices)` is the multiplicity prefactor of one stored force-constant
//!   element in the Taylor expansion of the force.

/// Soft threshold: `sign(x) · max(|x| - a, 0)`.
pub fn shrink(x: f64, a: f64) -> f64 {
    let mag = x.abs() - a;
    if mag > 0.0 { mag.copysign(x) } else { 0.0 }
}

/// `n!` as a float.
pub fn factorial(n: usize) -> f64 {
    (2..=n).fold(1.0, |acc, k| acc * k as f64)
}

/// Multiplicity prefactor of a stored element.
///
/// Each element is stored once per permutation class of its trailing indices, so
/// its contribution to `F_{i0}` must count how many of the `n!` index orderings
/// map onto it, divided by the `n!` of the Taylor term. That ratio reduces to
///
/// ```text
/// #{k : indices[k] == indices[0]} / Π_v count(v)!
/// ```
///
/// over the distinct values `v` of the full index list.
pub fn gamma(indices: &[usize]) -> f64 {
    let Some(&first) = indices.first() else {
        return 1.0;
    };
    let same_as_first = indices.iter().filter(|&&i| i == first).count();

    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    let mut denom = 1.0;
    let mut run = 1;
    for w in sorted.windows(2) {
        if w[0] == w[1] {
            run += 1;
        } else {
            denom *= factorial(run);
            run = 1;
        }
    }
    denom *= factorial(run);

    same_as_first as f64 / denom
}
