//! From fitted coefficients back to force constants.
//!
//! A fit produces coefficients in its own basis: free parameters (algebraic
//! elimination) and, on the elastic-net path, for displacements divided by the
//! normalization factor `s`. `ParameterRecovery` maps them to the full irreducible
//! vector in physical units; `expand_to_elements` then replicates each irreducible
//! value onto every member of its class.

use nalgebra::DVector;

use crate::constraint::AffineMap;
use crate::domain::{ClusterTables, FcValues, OrderValues};
use crate::error::{FitError, FitResult};

#[derive(Debug, Clone)]
pub struct ParameterRecovery {
    map: AffineMap,
    /// Position in `tables.orders` of every full column.
    column_orders: Vec<usize>,
    /// `s^order` of every full column.
    column_scale: Vec<f64>,
    n_orders: usize,
}

impl ParameterRecovery {
    pub fn new(tables: &ClusterTables, map: AffineMap, normalization: f64) -> FitResult<Self> {
        if map.n_full() != tables.n_params() {
            return Err(FitError::dimension(format!(
                "affine map covers {} parameters, tables define {}",
                map.n_full(),
                tables.n_params()
            )));
        }
        let mut column_orders = Vec::with_capacity(tables.n_params());
        let mut column_scale = Vec::with_capacity(tables.n_params());
        for (k, table) in tables.orders.iter().enumerate() {
            let s = normalization.powi(table.order as i32);
            for _ in &table.classes {
                column_orders.push(k);
                column_scale.push(s);
            }
        }
        Ok(Self {
            map,
            column_orders,
            column_scale,
            n_orders: tables.orders.len(),
        })
    }

    pub fn map(&self) -> &AffineMap {
        &self.map
    }

    /// Full irreducible vector in physical units.
    pub fn to_full(&self, x_fit: &DVector<f64>) -> DVector<f64> {
        let mut x = self.map.expand(x_fit);
        for (v, s) in x.iter_mut().zip(&self.column_scale) {
            *v /= s;
        }
        x
    }

    /// Coefficients with `|x| > threshold`, per order.
    pub fn nonzeros_per_order(&self, x_full: &DVector<f64>, threshold: f64) -> Vec<usize> {
        let mut counts = vec![0; self.n_orders];
        for (v, &k) in x_full.iter().zip(&self.column_orders) {
            if v.abs() > threshold {
                counts[k] += 1;
            }
        }
        counts
    }
}

/// Per-element values `value · sign`, ordered by class then member.
pub fn expand_to_elements(tables: &ClusterTables, x_full: &DVector<f64>) -> FitResult<FcValues> {
    if x_full.len() != tables.n_params() {
        return Err(FitError::dimension(format!(
            "expected {} irreducible parameters, got {}",
            tables.n_params(),
            x_full.len()
        )));
    }
    let mut col = 0;
    let mut orders = Vec::with_capacity(tables.orders.len());
    for table in &tables.orders {
        let mut values = Vec::new();
        let mut nequiv = Vec::with_capacity(table.classes.len());
        for class in &table.classes {
            let v = x_full[col];
            values.extend(class.members.iter().map(|m| v * m.sign));
            nequiv.push(class.members.len());
            col += 1;
        }
        orders.push(OrderValues {
            order: table.order,
            values,
            nequiv,
        });
    }
    Ok(FcValues { orders })
}

/// Class means of `value / sign`; the inverse of `expand_to_elements` on
/// replicated values.
pub fn collapse_to_classes(tables: &ClusterTables, fc: &FcValues) -> FitResult<DVector<f64>> {
    if fc.orders.len() != tables.orders.len() {
        return Err(FitError::dimension(format!(
            "expected values for {} orders, got {}",
            tables.orders.len(),
            fc.orders.len()
        )));
    }
    let mut out = Vec::with_capacity(tables.n_params());
    for (table, values) in tables.orders.iter().zip(&fc.orders) {
        let expected: usize = table.classes.iter().map(|c| c.members.len()).sum();
        if values.values.len() != expected {
            return Err(FitError::dimension(format!(
                "order {}: expected {expected} element values, got {}",
                table.order,
                values.values.len()
            )));
        }
        let mut pos = 0;
        for class in &table.classes {
            let sum: f64 = class
                .members
                .iter()
                .enumerate()
                .map(|(i, m)| values.values[pos + i] / m.sign)
                .sum();
            out.push(sum / class.members.len() as f64);
            pos += class.members.len();
        }
    }
    Ok(DVector::from_vec(out))
}
