//! Reductions of one order's constraint block.
//!
//! Two representations are produced:
//!
//! - `rref_reduction`: Gauss–Jordan elimination with partial pivoting. Pivot columns
//!   become dependent parameters, the remaining columns are free, so the map
//!   `x = T·x_free + x0` keeps the free parameters as a subset of the originals.
//! - `explicit_reduction`: SVD of C with the full right factor. The minimum-norm
//!   solution of `C x = d` is the particular solution; the right singular vectors
//!   past the numerical rank span the null space.
//!
//! Both reject inconsistent systems. Because constraints never couple orders, the
//! global results are block-diagonal assemblies of the per-order ones.

use nalgebra::{DMatrix, DVector};

use crate::constraint::set::OrderConstraints;
use crate::error::{FitError, FitResult};
use crate::math::{null_space, solve_least_squares};

/// `x = t·x_free + x0` for one order.
#[derive(Debug, Clone)]
pub struct OrderReduction {
    pub t: DMatrix<f64>,
    pub x0: DVector<f64>,
    /// Columns (within the order) that stay free.
    pub free: Vec<usize>,
}

/// Affine map from free to full irreducible parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineMap {
    t: DMatrix<f64>,
    x0: DVector<f64>,
}

impl AffineMap {
    pub fn identity(n: usize) -> Self {
        Self {
            t: DMatrix::identity(n, n),
            x0: DVector::zeros(n),
        }
    }

    pub fn block_diagonal(blocks: &[OrderReduction]) -> Self {
        let n: usize = blocks.iter().map(|b| b.t.nrows()).sum();
        let nf: usize = blocks.iter().map(|b| b.t.ncols()).sum();
        let mut t = DMatrix::zeros(n, nf);
        let mut x0 = DVector::zeros(n);
        let (mut r0, mut c0) = (0, 0);
        for b in blocks {
            t.view_mut((r0, c0), b.t.shape()).copy_from(&b.t);
            x0.rows_mut(r0, b.x0.len()).copy_from(&b.x0);
            r0 += b.t.nrows();
            c0 += b.t.ncols();
        }
        Self { t, x0 }
    }

    pub fn n_full(&self) -> usize {
        self.t.nrows()
    }

    pub fn n_free(&self) -> usize {
        self.t.ncols()
    }

    pub fn t(&self) -> &DMatrix<f64> {
        &self.t
    }

    pub fn x0(&self) -> &DVector<f64> {
        &self.x0
    }

    pub fn expand(&self, x_free: &DVector<f64>) -> DVector<f64> {
        &self.t * x_free + &self.x0
    }
}

/// Particular solution and null-space basis of one order.
#[derive(Debug, Clone)]
pub struct OrderNullSpace {
    pub x_p: DVector<f64>,
    pub z: DMatrix<f64>,
}

/// Every solution of `C x = d` is `x_p + z·w`.
#[derive(Debug, Clone)]
pub struct NullSpaceBasis {
    pub x_p: DVector<f64>,
    pub z: DMatrix<f64>,
}

impl NullSpaceBasis {
    pub fn block_diagonal(blocks: &[OrderNullSpace]) -> Self {
        let n: usize = blocks.iter().map(|b| b.z.nrows()).sum();
        let k: usize = blocks.iter().map(|b| b.z.ncols()).sum();
        let mut z = DMatrix::zeros(n, k);
        let mut x_p = DVector::zeros(n);
        let (mut r0, mut c0) = (0, 0);
        for b in blocks {
            z.view_mut((r0, c0), b.z.shape()).copy_from(&b.z);
            x_p.rows_mut(r0, b.x_p.len()).copy_from(&b.x_p);
            r0 += b.z.nrows();
            c0 += b.z.ncols();
        }
        Self { x_p, z }
    }
}

fn feasibility_scale(d: &DVector<f64>) -> f64 {
    d.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()))
}

/// Gauss–Jordan elimination of `[C | d]` with partial pivoting.
pub fn rref_reduction(
    block: &OrderConstraints,
    pivot_tolerance: f64,
    tolerance: f64,
) -> FitResult<OrderReduction> {
    let n = block.width;
    let (c, d) = block.matrix();
    let m = c.nrows();
    if m == 0 {
        return Ok(OrderReduction {
            t: DMatrix::identity(n, n),
            x0: DVector::zeros(n),
            free: (0..n).collect(),
        });
    }

    let mut aug = DMatrix::zeros(m, n + 1);
    aug.view_mut((0, 0), (m, n)).copy_from(&c);
    aug.set_column(n, &d);

    let threshold = pivot_tolerance * c.amax().max(f64::MIN_POSITIVE);
    let mut pivots: Vec<(usize, usize)> = Vec::new();
    let mut row = 0;
    for col in 0..n {
        if row == m {
            break;
        }
        let (best, best_abs) = (row..m)
            .map(|r| (r, aug[(r, col)].abs()))
            .fold((row, -1.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        if best_abs <= threshold {
            continue;
        }
        aug.swap_rows(row, best);
        let p = aug[(row, col)];
        for j in 0..=n {
            aug[(row, j)] /= p;
        }
        for r in 0..m {
            if r == row {
                continue;
            }
            let factor = aug[(r, col)];
            if factor != 0.0 {
                for j in 0..=n {
                    aug[(r, j)] -= factor * aug[(row, j)];
                }
            }
        }
        pivots.push((row, col));
        row += 1;
    }

    let scale = feasibility_scale(&d);
    let residual = (row..m).map(|r| aug[(r, n)].abs()).fold(0.0, f64::max);
    if residual > tolerance * scale {
        return Err(FitError::constraint(format!(
            "order {}: constraints are inconsistent (residual {residual:.3e})",
            block.order
        )));
    }

    let mut is_pivot = vec![false; n];
    for &(_, col) in &pivots {
        is_pivot[col] = true;
    }
    let free: Vec<usize> = (0..n).filter(|&j| !is_pivot[j]).collect();

    let mut t = DMatrix::zeros(n, free.len());
    let mut x0 = DVector::zeros(n);
    for (k, &f) in free.iter().enumerate() {
        t[(f, k)] = 1.0;
    }
    for &(r, col) in &pivots {
        x0[col] = aug[(r, n)];
        for (k, &f) in free.iter().enumerate() {
            t[(col, k)] = -aug[(r, f)];
        }
    }

    Ok(OrderReduction { t, x0, free })
}

/// Null-space method: `x_p` is the minimum-norm solution of `C x = d` and the
/// null space of C comes from its full right singular factor.
pub fn explicit_reduction(
    block: &OrderConstraints,
    pivot_tolerance: f64,
    tolerance: f64,
) -> FitResult<OrderNullSpace> {
    let n = block.width;
    let (c, d) = block.matrix();
    if c.nrows() == 0 || n == 0 {
        return Ok(OrderNullSpace {
            x_p: DVector::zeros(n),
            z: DMatrix::identity(n, n),
        });
    }

    let ns = null_space(&c, pivot_tolerance)?;
    let x_p = solve_least_squares(&c, &d, pivot_tolerance)?.x;
    let residual = (&c * &x_p - &d).amax();
    if residual > tolerance * feasibility_scale(&d) {
        return Err(FitError::InfeasibleConstraint {
            order: block.order,
            residual,
        });
    }
    log::debug!(
        "order {}: constraint rank {}, {} null-space directions",
        block.order,
        ns.rank,
        n - ns.rank
    );

    Ok(OrderNullSpace { x_p, z: ns.basis })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::set::{ConstraintRow, FixedValue};

    fn block(rows: Vec<ConstraintRow>, fixed: Vec<FixedValue>) -> OrderConstraints {
        OrderConstraints {
            order: 1,
            width: 4,
            rows,
            fixed,
        }
    }

    fn sum_rule_block() -> OrderConstraints {
        block(
            vec![
                ConstraintRow::new(vec![1.0, 1.0, 0.0, 0.0], 0.0),
                ConstraintRow::new(vec![0.0, 0.0, 1.0, 1.0], 0.0),
                // Duplicate of the first row.
                ConstraintRow::new(vec![2.0, 2.0, 0.0, 0.0], 0.0),
            ],
            vec![FixedValue { class: 3, value: 1.5 }],
        )
    }

    #[test]
    fn rref_keeps_free_parameters_as_originals() {
        let red = rref_reduction(&sum_rule_block(), 1e-10, 1e-8).unwrap();
        assert_eq!(red.free.len(), 1);
        let free = red.free[0];
        let map = AffineMap::block_diagonal(&[red]);
        let x = map.expand(&DVector::from_element(1, 0.25));
        assert!((x[0] + x[1]).abs() < 1e-12);
        assert!((x[2] + 1.5).abs() < 1e-12);
        assert!((x[3] - 1.5).abs() < 1e-12);
        assert_eq!(x[free], 0.25);
    }

    #[test]
    fn null_space_is_orthogonal_to_constraints() {
        let b = sum_rule_block();
        let ns = explicit_reduction(&b, 1e-10, 1e-8).unwrap();
        let (c, d) = b.matrix();
        assert_eq!(ns.z.ncols(), 1);
        assert!((&c * &ns.x_p - &d).amax() < 1e-12);
        assert!((&c * &ns.z).amax() < 1e-12);
        assert!((ns.z.transpose() * &ns.x_p).amax() < 1e-12);
    }

    #[test]
    fn empty_block_is_identity() {
        let ns = explicit_reduction(&block(vec![], vec![]), 1e-10, 1e-8).unwrap();
        assert_eq!(ns.z, DMatrix::<f64>::identity(4, 4));
        let red = rref_reduction(&block(vec![], vec![]), 1e-10, 1e-8).unwrap();
        assert_eq!(red.free, vec![0, 1, 2, 3]);
    }

    #[test]
    fn fixed_value_contradicting_relation_is_rejected() {
        let b = block(
            vec![ConstraintRow::new(vec![1.0, -1.0, 0.0, 0.0], 0.0)],
            vec![FixedValue { class: 0, value: 1.0 }, FixedValue { class: 1, value: 2.0 }],
        );
        assert!(rref_reduction(&b, 1e-10, 1e-8).is_err());
        assert!(matches!(
            explicit_reduction(&b, 1e-10, 1e-8),
            Err(FitError::InfeasibleConstraint { .. })
        ));
    }
}
