//! Regularization grid.
//!
//! The elastic-net path is evaluated on a deterministic log-spaced grid of α values,
//! walked from the largest α (sparsest model) downwards so that each fit can warm
//! start from the previous one.

use crate::error::{FitError, FitResult};

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> FitResult<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(FitError::control(format!(
            "invalid alpha range: min={min}, max={max} (must be finite, >0, and max>min)"
        )));
    }
    if steps < 2 {
        return Err(FitError::control("alpha steps must be >= 2"));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

/// α values from `alpha_max` down to `alpha_min`.
pub fn alpha_path(alpha_max: f64, alpha_min: f64, steps: usize) -> FitResult<Vec<f64>> {
    let mut values = log_space(alpha_min, alpha_max, steps)?;
    values.reverse();
    // Pin the endpoints against exp/ln round-off.
    values[0] = alpha_max;
    values[steps - 1] = alpha_min;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_space_includes_endpoints() {
        let v = log_space(0.1, 10.0, 5).unwrap();
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[v.len() - 1] - 10.0).abs() < 1e-12);
        assert!((v[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn alpha_path_descends() {
        let v = alpha_path(1.0, 1e-6, 50).unwrap();
        assert_eq!(v.len(), 50);
        assert_eq!(v[0], 1.0);
        assert_eq!(v[49], 1e-6);
        assert!(v.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn rejects_degenerate_ranges() {
        assert!(alpha_path(1.0, 2.0, 10).is_err());
        assert!(alpha_path(0.0, 1e-6, 10).is_err());
        assert!(alpha_path(1.0, 0.5, 1).is_err());
    }
}
