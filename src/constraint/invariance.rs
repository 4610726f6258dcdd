//! Translational invariance (acoustic sum rules).
//!
//! Rigidly shifting the crystal must not produce forces, which for every order
//! requires
//!
//! ```text
//! Σ_j Φ(iα, jβ, R) = 0
//! ```
//!
//! for each force index `iα`, each remaining index multiset `R` and each component
//! `β`. In terms of stored elements: removing one tail index with component β from
//! an element leaves the key `(first, R, β)`; all elements sharing a key are summed,
//! each contributing its sign to the column of its class.

use std::collections::BTreeMap;

use crate::constraint::set::ConstraintRow;
use crate::domain::ClusterTables;

const ZERO_COEFFICIENT: f64 = 1e-12;

type SumRuleKey = (usize, Vec<usize>, usize);

/// Sum-rule rows for every order of `tables`, as `(order, rows)`.
pub fn translational_invariance(tables: &ClusterTables) -> Vec<(usize, Vec<ConstraintRow>)> {
    tables
        .orders
        .iter()
        .map(|table| {
            let width = table.classes.len();
            let mut rows: BTreeMap<SumRuleKey, Vec<f64>> = BTreeMap::new();

            for (ic, class) in table.classes.iter().enumerate() {
                for member in &class.members {
                    let first = member.indices[0];
                    let tail = &member.indices[1..];
                    for p in 0..tail.len() {
                        // Equal tail indices give the same key; count each once.
                        if p > 0 && tail[p] == tail[p - 1] {
                            continue;
                        }
                        let mut rest = tail.to_vec();
                        let removed = rest.remove(p);
                        let key = (first, rest, removed % 3);
                        rows.entry(key).or_insert_with(|| vec![0.0; width])[ic] += member.sign;
                    }
                }
            }

            let rows: Vec<ConstraintRow> = rows
                .into_values()
                .filter(|coefficients| coefficients.iter().any(|c| c.abs() > ZERO_COEFFICIENT))
                .map(|coefficients| ConstraintRow::new(coefficients, 0.0))
                .collect();
            log::debug!(
                "translational invariance: order {} -> {} rows over {width} parameters",
                table.order,
                rows.len()
            );
            (table.order, rows)
        })
        .collect()
}
