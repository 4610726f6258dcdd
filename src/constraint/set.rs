//! Per-order linear constraints over the irreducible parameters.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::constraint::invariance::translational_invariance;
use crate::constraint::reduction::{AffineMap, NullSpaceBasis, explicit_reduction, rref_reduction};
use crate::domain::ClusterTables;
use crate::error::{FitError, FitResult};

/// `coefficients · x_order = rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRow {
    pub coefficients: Vec<f64>,
    pub rhs: f64,
}

impl ConstraintRow {
    pub fn new(coefficients: Vec<f64>, rhs: f64) -> Self {
        Self { coefficients, rhs }
    }

    /// Unit row pinning parameter `class` of a width-`width` order to `value`.
    pub fn unit(width: usize, class: usize, value: f64) -> Self {
        let mut coefficients = vec![0.0; width];
        coefficients[class] = 1.0;
        Self { coefficients, rhs: value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedValue {
    pub class: usize,
    pub value: f64,
}

/// Constraints of one interaction order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConstraints {
    pub order: usize,
    /// Number of irreducible parameters of this order.
    pub width: usize,
    pub rows: Vec<ConstraintRow>,
    pub fixed: Vec<FixedValue>,
}

impl OrderConstraints {
    pub fn n_rows(&self) -> usize {
        self.rows.len() + self.fixed.len()
    }

    /// `(C_k, d_k)` with fixed values appended as unit rows.
    pub fn matrix(&self) -> (DMatrix<f64>, DVector<f64>) {
        let n_rows = self.n_rows();
        let mut c = DMatrix::zeros(n_rows, self.width);
        let mut d = DVector::zeros(n_rows);
        for (i, row) in self.rows.iter().enumerate() {
            for (j, &v) in row.coefficients.iter().enumerate() {
                c[(i, j)] = v;
            }
            d[i] = row.rhs;
        }
        for (k, fixed) in self.fixed.iter().enumerate() {
            let i = self.rows.len() + k;
            c[(i, fixed.class)] = 1.0;
            d[i] = fixed.value;
        }
        (c, d)
    }
}

/// The full constraint system, block-diagonal over orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraintSet {
    orders: Vec<OrderConstraints>,
}

/// Pivot threshold of the reductions, relative to the largest constraint entry.
pub const REDUCTION_TOLERANCE: f64 = 1e-10;

impl LinearConstraintSet {
    /// An empty system shaped after `tables`.
    pub fn unconstrained(tables: &ClusterTables) -> Self {
        Self {
            orders: tables
                .orders
                .iter()
                .map(|t| OrderConstraints {
                    order: t.order,
                    width: t.classes.len(),
                    rows: Vec::new(),
                    fixed: Vec::new(),
                })
                .collect(),
        }
    }

    /// The acoustic sum rules of `tables`.
    pub fn with_translational_invariance(tables: &ClusterTables) -> FitResult<Self> {
        let mut set = Self::unconstrained(tables);
        for (order, rows) in translational_invariance(tables) {
            set.add_rows(order, rows)?;
        }
        Ok(set)
    }

    pub fn orders(&self) -> &[OrderConstraints] {
        &self.orders
    }

    pub fn n_params(&self) -> usize {
        self.orders.iter().map(|o| o.width).sum()
    }

    pub fn n_rows(&self) -> usize {
        self.orders.iter().map(|o| o.n_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    fn order_mut(&mut self, order: usize) -> FitResult<&mut OrderConstraints> {
        self.orders
            .iter_mut()
            .find(|o| o.order == order)
            .ok_or_else(|| FitError::constraint(format!("no parameters of order {order}")))
    }

    pub fn add_rows(&mut self, order: usize, rows: Vec<ConstraintRow>) -> FitResult<()> {
        let block = self.order_mut(order)?;
        for (i, row) in rows.iter().enumerate() {
            if row.coefficients.len() != block.width {
                return Err(FitError::constraint(format!(
                    "order {order} row {i}: {} coefficients, expected {}",
                    row.coefficients.len(),
                    block.width
                )));
            }
            if !(row.rhs.is_finite() && row.coefficients.iter().all(|v| v.is_finite())) {
                return Err(FitError::constraint(format!(
                    "order {order} row {i}: non-finite entries"
                )));
            }
        }
        block.rows.extend(rows);
        Ok(())
    }

    /// Pin parameter `class` of `order` to `value`.
    ///
    /// Fixing the same parameter twice is accepted only with the same value.
    pub fn fix_value(&mut self, order: usize, class: usize, value: f64) -> FitResult<()> {
        let block = self.order_mut(order)?;
        if class >= block.width {
            return Err(FitError::constraint(format!(
                "order {order}: fixed index {class} out of range ({} parameters)",
                block.width
            )));
        }
        if !value.is_finite() {
            return Err(FitError::constraint(format!(
                "order {order}: fixed value for {class} is not finite"
            )));
        }
        if let Some(prev) = block.fixed.iter().find(|f| f.class == class) {
            if prev.value != value {
                return Err(FitError::constraint(format!(
                    "order {order}: parameter {class} fixed to both {} and {value}",
                    prev.value
                )));
            }
            return Ok(());
        }
        block.fixed.push(FixedValue { class, value });
        Ok(())
    }

    /// Global `(C, d)` over all parameters.
    pub fn explicit(&self) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.n_params();
        let m = self.n_rows();
        let mut c = DMatrix::zeros(m, n);
        let mut d = DVector::zeros(m);
        let (mut row0, mut col0) = (0, 0);
        for block in &self.orders {
            let (ck, dk) = block.matrix();
            c.view_mut((row0, col0), (ck.nrows(), ck.ncols())).copy_from(&ck);
            d.rows_mut(row0, dk.len()).copy_from(&dk);
            row0 += ck.nrows();
            col0 += block.width;
        }
        (c, d)
    }

    /// Eliminate dependent parameters: `x = T·x_free + x0`.
    pub fn algebraic(&self, tolerance: f64) -> FitResult<AffineMap> {
        let blocks = self
            .orders
            .iter()
            .map(|block| rref_reduction(block, REDUCTION_TOLERANCE, tolerance))
            .collect::<FitResult<Vec<_>>>()?;
        let map = AffineMap::block_diagonal(&blocks);
        log::debug!(
            "constraint elimination: {} parameters, {} free",
            map.n_full(),
            map.n_free()
        );
        Ok(map)
    }

    /// Particular solution and null-space basis of `C x = d` from an SVD of C.
    pub fn null_space(&self, tolerance: f64) -> FitResult<NullSpaceBasis> {
        let blocks = self
            .orders
            .iter()
            .map(|block| explicit_reduction(block, REDUCTION_TOLERANCE, tolerance))
            .collect::<FitResult<Vec<_>>>()?;
        Ok(NullSpaceBasis::block_diagonal(&blocks))
    }

    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        let mut worst = 0.0_f64;
        let mut col0 = 0;
        for block in &self.orders {
            let xk = x.rows(col0, block.width);
            for row in &block.rows {
                let lhs: f64 = row.coefficients.iter().zip(xk.iter()).map(|(c, v)| c * v).sum();
                worst = worst.max((lhs - row.rhs).abs());
            }
            for fixed in &block.fixed {
                worst = worst.max((xk[fixed.class] - fixed.value).abs());
            }
            col0 += block.width;
        }
        worst
    }

    pub fn satisfies(&self, x: &DVector<f64>, tolerance: f64) -> bool {
        self.max_violation(x) < tolerance
    }

    /// The same system expressed in displacements divided by `factor`.
    ///
    /// Parameters of order n scale as `factor^n`, so every right-hand side does too.
    pub fn scaled(&self, factor: f64) -> Self {
        let orders = self
            .orders
            .iter()
            .map(|block| {
                let s = factor.powi(block.order as i32);
                OrderConstraints {
                    order: block.order,
                    width: block.width,
                    rows: block
                        .rows
                        .iter()
                        .map(|r| ConstraintRow::new(r.coefficients.clone(), r.rhs * s))
                        .collect(),
                    fixed: block
                        .fixed
                        .iter()
                        .map(|f| FixedValue {
                            class: f.class,
                            value: f.value * s,
                        })
                        .collect(),
                }
            })
            .collect();
        Self { orders }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FcClass, FcElement, OrderTable};

    fn three_param_tables() -> ClusterTables {
        let class = |i: usize| FcClass::new(vec![FcElement::new(vec![i, i], 1.0)]);
        ClusterTables::new(1, vec![OrderTable {
            order: 1,
            classes: vec![class(0), class(1), class(2)],
        }])
    }

    #[test]
    fn rejects_malformed_input() {
        let tables = three_param_tables();
        let mut set = LinearConstraintSet::unconstrained(&tables);
        assert!(set.add_rows(1, vec![ConstraintRow::new(vec![1.0, 1.0], 0.0)]).is_err());
        assert!(set.add_rows(2, vec![]).is_err());
        assert!(set.fix_value(1, 3, 1.0).is_err());

        set.fix_value(1, 0, 1.0).unwrap();
        set.fix_value(1, 0, 1.0).unwrap();
        let err = set.fix_value(1, 0, 2.0).unwrap_err();
        assert!(matches!(err, FitError::Constraint(_)));
        assert_eq!(set.n_rows(), 1);
    }

    #[test]
    fn algebraic_map_satisfies_constraints() {
        let tables = three_param_tables();
        let mut set = LinearConstraintSet::unconstrained(&tables);
        set.add_rows(1, vec![ConstraintRow::new(vec![1.0, 1.0, 1.0], 0.0)]).unwrap();
        set.fix_value(1, 2, 0.5).unwrap();

        let map = set.algebraic(1e-8).unwrap();
        assert_eq!(map.n_full(), 3);
        assert_eq!(map.n_free(), 1);
        for z in [-2.0, 0.0, 3.5] {
            let x = map.expand(&DVector::from_element(1, z));
            assert!(set.max_violation(&x) < 1e-12);
            assert!(set.satisfies(&x, 1e-10));
        }
        assert!(!set.satisfies(&DVector::from_row_slice(&[1.0, 1.0, 1.0]), 1e-10));
    }

    #[test]
    fn explicit_matrix_is_block_diagonal() {
        let tables = three_param_tables();
        let mut set = LinearConstraintSet::unconstrained(&tables);
        set.add_rows(1, vec![ConstraintRow::new(vec![1.0, -1.0, 0.0], 0.0)]).unwrap();
        set.fix_value(1, 1, 2.0).unwrap();
        let (c, d) = set.explicit();
        assert_eq!(c.shape(), (2, 3));
        assert_eq!(c[(1, 1)], 1.0);
        assert_eq!(d[1], 2.0);
    }

    #[test]
    fn inconsistent_rows_are_reported() {
        let tables = three_param_tables();
        let mut set = LinearConstraintSet::unconstrained(&tables);
        set.add_rows(1, vec![
            ConstraintRow::new(vec![1.0, 1.0, 0.0], 0.0),
            ConstraintRow::new(vec![2.0, 2.0, 0.0], 1.0),
        ])
        .unwrap();
        assert!(matches!(set.algebraic(1e-8), Err(FitError::Constraint(_))));
        assert!(matches!(
            set.null_space(1e-8),
            Err(FitError::InfeasibleConstraint { order: 1, .. })
        ));
    }

    #[test]
    fn scaling_multiplies_rhs_by_power_of_order() {
        let tables = three_param_tables();
        let mut set = LinearConstraintSet::unconstrained(&tables);
        set.fix_value(1, 0, 3.0).unwrap();
        let scaled = set.scaled(2.0);
        assert_eq!(scaled.orders()[0].fixed[0].value, 6.0);
    }
}
