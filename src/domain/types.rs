//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be:
//!
//! - handed in by the symmetry/cluster collaborator
//! - used in-memory during fitting
//! - exported to JSON for inspection

use serde::{Deserialize, Serialize};

use crate::domain::SparseSolver;
use crate::error::{FitError, FitResult};

/// Displacement/force samples, one flat `3·nat` vector per configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplacementDataset {
    pub displacements: Vec<Vec<f64>>,
    pub forces: Vec<Vec<f64>>,
}

impl DisplacementDataset {
    pub fn new(displacements: Vec<Vec<f64>>, forces: Vec<Vec<f64>>) -> Self {
        Self {
            displacements,
            forces,
        }
    }

    pub fn len(&self) -> usize {
        self.displacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displacements.is_empty()
    }

    /// Check that both sequences agree with each other and with `nat`.
    pub fn validate(&self, nat: usize) -> FitResult<()> {
        if self.displacements.len() != self.forces.len() {
            return Err(FitError::dimension(format!(
                "{} displacement samples but {} force samples",
                self.displacements.len(),
                self.forces.len()
            )));
        }
        if self.is_empty() {
            return Err(FitError::dimension("dataset contains no samples"));
        }
        let expected = 3 * nat;
        for (i, (u, f)) in self.displacements.iter().zip(self.forces.iter()).enumerate() {
            if u.len() != expected || f.len() != expected {
                return Err(FitError::dimension(format!(
                    "sample {i}: expected vectors of length {expected} (3 x {nat} atoms), got u={} f={}",
                    u.len(),
                    f.len()
                )));
            }
            if u.iter().chain(f.iter()).any(|v| !v.is_finite()) {
                return Err(FitError::dimension(format!(
                    "sample {i} contains non-finite values"
                )));
            }
        }
        Ok(())
    }

    /// Euclidean norm of all force components.
    pub fn force_norm(&self) -> f64 {
        self.forces
            .iter()
            .flat_map(|f| f.iter())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }

    /// Copy with every displacement divided by `factor`.
    pub fn with_scaled_displacements(&self, factor: f64) -> Self {
        Self {
            displacements: self
                .displacements
                .iter()
                .map(|u| u.iter().map(|v| v / factor).collect())
                .collect(),
            forces: self.forces.clone(),
        }
    }
}

/// One member of a force-constant equivalence class.
///
/// `indices` are flattened Cartesian indices `3·atom + xyz`. The first entry is the
/// force component the term contributes to; the remaining entries are stored in
/// ascending order (one representative per permutation of the tail).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcElement {
    pub indices: Vec<usize>,
    /// Relation to the class representative (normally `±1`).
    pub sign: f64,
}

impl FcElement {
    pub fn new(indices: Vec<usize>, sign: f64) -> Self {
        Self { indices, sign }
    }

    pub fn first_atom(&self) -> usize {
        self.indices[0] / 3
    }
}

/// A symmetry-equivalence class; the first member is the representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcClass {
    pub members: Vec<FcElement>,
}

impl FcClass {
    pub fn new(members: Vec<FcElement>) -> Self {
        Self { members }
    }
}

/// All irreducible classes of one interaction order (1 = harmonic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTable {
    pub order: usize,
    pub classes: Vec<FcClass>,
}

/// Symmetry/cluster data supplied by the cluster-enumeration collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTables {
    /// Number of atoms in the supercell.
    pub nat: usize,
    /// Atoms whose force components form the rows of the sensing matrix.
    pub reference_atoms: Vec<usize>,
    /// Per-order class tables, ascending in order.
    pub orders: Vec<OrderTable>,
    /// Pure-translation atom permutations (identity excluded) used for data
    /// multiplication.
    #[serde(default)]
    pub translations: Vec<Vec<usize>>,
}

impl ClusterTables {
    /// Tables with every atom as a reference atom and no translations.
    pub fn new(nat: usize, orders: Vec<OrderTable>) -> Self {
        Self {
            nat,
            reference_atoms: (0..nat).collect(),
            orders,
            translations: Vec::new(),
        }
    }

    pub fn with_reference_atoms(mut self, atoms: Vec<usize>) -> Self {
        self.reference_atoms = atoms;
        self
    }

    pub fn with_translations(mut self, translations: Vec<Vec<usize>>) -> Self {
        self.translations = translations;
        self
    }

    /// Number of irreducible parameters over all orders.
    pub fn n_params(&self) -> usize {
        self.orders.iter().map(|o| o.classes.len()).sum()
    }

    /// Rows contributed by one configuration before data multiplication.
    pub fn rows_per_replica(&self) -> usize {
        3 * self.reference_atoms.len()
    }

    /// Number of replicas per configuration (identity plus translations).
    pub fn n_replicas(&self, multiply: bool) -> usize {
        if multiply { 1 + self.translations.len() } else { 1 }
    }

    pub fn validate(&self) -> FitResult<()> {
        if self.nat == 0 {
            return Err(FitError::dimension("cluster tables declare zero atoms"));
        }
        if self.reference_atoms.is_empty() {
            return Err(FitError::dimension("no reference atoms"));
        }
        let mut seen = vec![false; self.nat];
        for &a in &self.reference_atoms {
            if a >= self.nat {
                return Err(FitError::dimension(format!(
                    "reference atom {a} out of range (nat={})",
                    self.nat
                )));
            }
            if seen[a] {
                return Err(FitError::dimension(format!("reference atom {a} listed twice")));
            }
            seen[a] = true;
        }

        let mut prev_order = 0;
        for table in &self.orders {
            if table.order <= prev_order {
                return Err(FitError::dimension(format!(
                    "orders must be >= 1 and strictly ascending (found {} after {prev_order})",
                    table.order
                )));
            }
            prev_order = table.order;
            for (ic, class) in table.classes.iter().enumerate() {
                if class.members.is_empty() {
                    return Err(FitError::dimension(format!(
                        "order {} class {ic} has no members",
                        table.order
                    )));
                }
                for member in &class.members {
                    self.validate_element(table.order, ic, member)?;
                }
            }
        }

        for (it, map) in self.translations.iter().enumerate() {
            if map.len() != self.nat {
                return Err(FitError::dimension(format!(
                    "translation {it} maps {} atoms, expected {}",
                    map.len(),
                    self.nat
                )));
            }
            let mut hit = vec![false; self.nat];
            for &j in map {
                if j >= self.nat || hit[j] {
                    return Err(FitError::dimension(format!(
                        "translation {it} is not a permutation of the atoms"
                    )));
                }
                hit[j] = true;
            }
        }
        Ok(())
    }

    fn validate_element(&self, order: usize, class: usize, member: &FcElement) -> FitResult<()> {
        if member.indices.len() != order + 1 {
            return Err(FitError::dimension(format!(
                "order {order} class {class}: element has {} indices, expected {}",
                member.indices.len(),
                order + 1
            )));
        }
        if member.indices.iter().any(|&i| i >= 3 * self.nat) {
            return Err(FitError::dimension(format!(
                "order {order} class {class}: index out of range for {} atoms",
                self.nat
            )));
        }
        if member.indices[1..].windows(2).any(|w| w[0] > w[1]) {
            return Err(FitError::dimension(format!(
                "order {order} class {class}: trailing indices must be ascending"
            )));
        }
        if !(member.sign.is_finite() && member.sign != 0.0) {
            return Err(FitError::dimension(format!(
                "order {order} class {class}: sign must be finite and non-zero"
            )));
        }
        Ok(())
    }
}

/// Force-constant values of one order, ordered by class then member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderValues {
    pub order: usize,
    pub values: Vec<f64>,
    /// Number of members of each class (the equivalence counts).
    pub nequiv: Vec<usize>,
}

/// Per-element force constants handed to external writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FcValues {
    pub orders: Vec<OrderValues>,
}

/// How a fit terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// Direct (factorization-based) solve.
    Solved,
    /// Iterative solve met its tolerance.
    Converged,
    /// Iterative solve stopped at the sweep limit; best iterate returned.
    MaxIterationsReached,
}

/// Non-fatal conditions surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitWarning {
    RankDeficient { rank: usize, cols: usize },
    MaxIterationsReached { alpha: f64, iterations: usize },
    CholeskyFallback { reason: String },
    SparseSolverFallback { solver: SparseSolver, reason: String },
    FoldFailed { fold: usize, alpha: f64, reason: String },
    PathStoppedEarly { fold: usize, alpha_index: usize },
}

/// Rank of the matrix actually factorized by a direct solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: usize,
    pub cols: usize,
}

impl RankInfo {
    pub fn is_deficient(&self) -> bool {
        self.rank < self.cols
    }
}

/// Everything a caller may want to script decisions on after a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub status: FitStatus,
    /// `||Ax - b|| / ||f||` on the training data.
    pub training_error: f64,
    /// Same on the validation data, when one was supplied.
    pub validation_error: Option<f64>,
    pub rank: Option<RankInfo>,
    /// `max |Cx - d|` of the returned parameters.
    pub constraint_violation: f64,
    pub iterations: Option<usize>,
    pub warnings: Vec<FitWarning>,
    pub cv: Option<crate::fit::cv::CvSummary>,
}

impl FitDiagnostics {
    pub fn rank_deficient(&self) -> bool {
        self.rank.is_some_and(|r| r.is_deficient())
    }
}
