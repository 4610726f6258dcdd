//! Sensing-matrix assembly.
//!
//! Each configuration contributes one block of rows per replica (the identity plus
//! one per translation when data multiplication is on). Within a replica, row
//! `3·slot + xyz` holds the force on reference atom `reference_atoms[slot]`.
//! Every stored element `(i0; i1..in)` of class `c` adds
//!
//! ```text
//! A[row(i0), c] -= Γ(indices) · sign · Π_{k≥1} u[i_k]
//! ```
//!
//! and `b[row(i0)] = f[i0]`. Blocks are independent, so they are filled in parallel
//! and stacked in sample order.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use sprs::TriMat;

use crate::constraint::AffineMap;
use crate::domain::{ClusterTables, DisplacementDataset};
use crate::error::{FitError, FitResult};
use crate::math::gamma;
use crate::sensing::design::{Design, SensingMatrix};

/// Parameter basis of the sensing-matrix columns.
#[derive(Debug, Clone, Copy)]
pub enum ColumnBasis<'a> {
    /// One column per irreducible parameter.
    Full,
    /// One column per free parameter of the affine map.
    Compact(&'a AffineMap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Dense,
    /// Compressed sparse column.
    Sparse,
}

/// Non-zero `(row, column, value)` entries of one configuration (all replicas).
#[derive(Debug, Clone)]
pub struct SampleEntries {
    pub entries: Vec<(usize, usize, f64)>,
    pub b: DVector<f64>,
    pub force_sq: f64,
}

/// Rows of one configuration (all replicas).
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    /// `||f||²` of the raw force rows, before any compact-basis shift.
    pub force_sq: f64,
}

pub struct SensingMatrixBuilder<'a> {
    tables: &'a ClusterTables,
    /// Γ per order, class and member.
    gammas: Vec<Vec<Vec<f64>>>,
    /// Row slot of every atom, `None` for non-reference atoms.
    slots: Vec<Option<usize>>,
    multiply: bool,
}

impl<'a> SensingMatrixBuilder<'a> {
    pub fn new(tables: &'a ClusterTables) -> FitResult<Self> {
        tables.validate()?;
        let gammas = tables
            .orders
            .iter()
            .map(|t| {
                t.classes
                    .iter()
                    .map(|c| c.members.iter().map(|m| gamma(&m.indices)).collect())
                    .collect()
            })
            .collect();
        let mut slots = vec![None; tables.nat];
        for (slot, &atom) in tables.reference_atoms.iter().enumerate() {
            slots[atom] = Some(slot);
        }
        Ok(Self {
            tables,
            gammas,
            slots,
            multiply: false,
        })
    }

    pub fn with_data_multiplier(mut self, multiply: bool) -> Self {
        self.multiply = multiply;
        self
    }

    pub fn tables(&self) -> &ClusterTables {
        self.tables
    }

    pub fn rows_per_sample(&self) -> usize {
        self.tables.rows_per_replica() * self.tables.n_replicas(self.multiply)
    }

    /// The identity copy of `(u, f)` followed by one translated copy per
    /// translation permutation: `u'[3·p(j)+k] = u[3·j+k]`.
    pub fn replicate(&self, u: &[f64], f: &[f64]) -> Vec<(Vec<f64>, Vec<f64>)> {
        let mut out = Vec::with_capacity(self.tables.n_replicas(self.multiply));
        out.push((u.to_vec(), f.to_vec()));
        if self.multiply {
            for map in &self.tables.translations {
                let mut up = vec![0.0; u.len()];
                let mut fp = vec![0.0; f.len()];
                for (j, &pj) in map.iter().enumerate() {
                    for k in 0..3 {
                        up[3 * pj + k] = u[3 * j + k];
                        fp[3 * pj + k] = f[3 * j + k];
                    }
                }
                out.push((up, fp));
            }
        }
        out
    }

    fn fill_targets(&self, f: &[f64], b: &mut DVector<f64>, base: usize) {
        for (slot, &atom) in self.tables.reference_atoms.iter().enumerate() {
            for k in 0..3 {
                b[base + 3 * slot + k] = f[3 * atom + k];
            }
        }
    }

    /// Calls `emit(row, column, value)` once per stored element whose leading atom
    /// is a reference atom. The same `(row, column)` may be emitted more than once.
    fn for_each_entry(&self, u: &[f64], base: usize, mut emit: impl FnMut(usize, usize, f64)) {
        let mut col = 0;
        for (ko, table) in self.tables.orders.iter().enumerate() {
            for (ic, class) in table.classes.iter().enumerate() {
                for (im, member) in class.members.iter().enumerate() {
                    let Some(slot) = self.slots[member.first_atom()] else {
                        continue;
                    };
                    let row = base + 3 * slot + member.indices[0] % 3;
                    let prod: f64 = member.indices[1..].iter().map(|&i| u[i]).product();
                    emit(row, col, -(self.gammas[ko][ic][im] * member.sign * prod));
                }
                col += 1;
            }
        }
    }

    /// Rows of one configuration in the requested basis.
    pub fn sample_block(&self, u: &[f64], f: &[f64], basis: ColumnBasis<'_>) -> SampleBlock {
        let rows = self.rows_per_sample();
        let per_replica = self.tables.rows_per_replica();
        let mut a = DMatrix::zeros(rows, self.tables.n_params());
        let mut b = DVector::zeros(rows);
        for (r, (ur, fr)) in self.replicate(u, f).iter().enumerate() {
            self.fill_targets(fr, &mut b, r * per_replica);
            self.for_each_entry(ur, r * per_replica, |row, col, v| a[(row, col)] += v);
        }
        let force_sq = b.norm_squared();

        match basis {
            ColumnBasis::Full => SampleBlock { a, b, force_sq },
            ColumnBasis::Compact(map) => {
                let shift = &a * map.x0();
                SampleBlock {
                    a: &a * map.t(),
                    b: b - shift,
                    force_sq,
                }
            }
        }
    }

    /// Non-zero entries of one configuration, with rows local to the sample.
    pub fn sample_entries(&self, u: &[f64], f: &[f64], basis: ColumnBasis<'_>) -> SampleEntries {
        let rows = self.rows_per_sample();
        let per_replica = self.tables.rows_per_replica();
        let mut entries = Vec::new();
        let mut b = DVector::zeros(rows);
        for (r, (ur, fr)) in self.replicate(u, f).iter().enumerate() {
            self.fill_targets(fr, &mut b, r * per_replica);
            self.for_each_entry(ur, r * per_replica, |row, col, v| {
                if v != 0.0 {
                    entries.push((row, col, v));
                }
            });
        }
        let force_sq = b.norm_squared();

        match basis {
            ColumnBasis::Full => SampleEntries { entries, b, force_sq },
            ColumnBasis::Compact(map) => {
                let mut rows_t = DMatrix::zeros(rows, map.n_free());
                for &(row, col, v) in &entries {
                    b[row] -= v * map.x0()[col];
                    rows_t.row_mut(row).zip_apply(&map.t().row(col), |y, x| *y += v * x);
                }
                let mut compact = Vec::with_capacity(entries.len());
                for (col, column) in rows_t.column_iter().enumerate() {
                    for (row, &v) in column.iter().enumerate() {
                        if v != 0.0 {
                            compact.push((row, col, v));
                        }
                    }
                }
                SampleEntries {
                    entries: compact,
                    b,
                    force_sq,
                }
            }
        }
    }

    fn check(&self, dataset: &DisplacementDataset, basis: ColumnBasis<'_>) -> FitResult<()> {
        dataset.validate(self.tables.nat)?;
        if let ColumnBasis::Compact(map) = basis {
            if map.n_full() != self.tables.n_params() {
                return Err(FitError::dimension(format!(
                    "affine map covers {} parameters, tables define {}",
                    map.n_full(),
                    self.tables.n_params()
                )));
            }
        }
        Ok(())
    }

    pub fn n_columns(&self, basis: ColumnBasis<'_>) -> usize {
        match basis {
            ColumnBasis::Full => self.tables.n_params(),
            ColumnBasis::Compact(map) => map.n_free(),
        }
    }

    /// Blocks of every sample, in sample order.
    pub fn blocks(&self, dataset: &DisplacementDataset, basis: ColumnBasis<'_>) -> FitResult<Vec<SampleBlock>> {
        self.check(dataset, basis)?;
        Ok(dataset
            .displacements
            .par_iter()
            .zip(dataset.forces.par_iter())
            .map(|(u, f)| self.sample_block(u, f, basis))
            .collect())
    }

    /// Assemble `A` and `b` for the whole dataset.
    ///
    /// Sparse storage goes straight from per-sample entries to triplets; no dense
    /// block of the whole design is formed.
    pub fn build(
        &self,
        dataset: &DisplacementDataset,
        basis: ColumnBasis<'_>,
        storage: Storage,
    ) -> FitResult<SensingMatrix> {
        self.check(dataset, basis)?;
        let rps = self.rows_per_sample();
        let ncols = self.n_columns(basis);
        let n_samples = dataset.len();
        let nrows = rps * n_samples;
        let mut target = DVector::zeros(nrows);
        let mut sample_force_sq = Vec::with_capacity(n_samples);

        let design = match storage {
            Storage::Dense => {
                let blocks = self.blocks(dataset, basis)?;
                let mut a = DMatrix::zeros(nrows, ncols);
                for (s, block) in blocks.iter().enumerate() {
                    a.view_mut((s * rps, 0), (rps, ncols)).copy_from(&block.a);
                    target.rows_mut(s * rps, rps).copy_from(&block.b);
                    sample_force_sq.push(block.force_sq);
                }
                Design::Dense(a)
            }
            Storage::Sparse => {
                let samples: Vec<SampleEntries> = dataset
                    .displacements
                    .par_iter()
                    .zip(dataset.forces.par_iter())
                    .map(|(u, f)| self.sample_entries(u, f, basis))
                    .collect();
                let nnz = samples.iter().map(|e| e.entries.len()).sum();
                let mut tri = TriMat::with_capacity((nrows, ncols), nnz);
                for (s, sample) in samples.into_iter().enumerate() {
                    for (r, c, v) in sample.entries {
                        tri.add_triplet(s * rps + r, c, v);
                    }
                    target.rows_mut(s * rps, rps).copy_from(&sample.b);
                    sample_force_sq.push(sample.force_sq);
                }
                Design::Sparse(tri.to_csc())
            }
        };

        log::debug!("sensing matrix: {nrows} x {ncols} ({n_samples} samples, {rps} rows each)");
        Ok(SensingMatrix::new(design, target, sample_force_sq, rps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FcClass, FcElement, OrderTable};

    fn cubic_tables() -> ClusterTables {
        let harmonic = vec![FcClass::new(vec![
            FcElement::new(vec![0, 3], 1.0),
            FcElement::new(vec![3, 0], 1.0),
        ])];
        let cubic = vec![FcClass::new(vec![FcElement::new(vec![0, 0, 0], 1.0)])];
        ClusterTables::new(2, vec![
            OrderTable { order: 1, classes: harmonic },
            OrderTable { order: 2, classes: cubic },
        ])
    }

    #[test]
    fn entries_follow_taylor_prefactors() {
        let tables = cubic_tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let u = [0.2, 0.0, 0.0, -0.1, 0.0, 0.0];
        let f = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let block = builder.sample_block(&u, &f, ColumnBasis::Full);

        assert_eq!(block.a.shape(), (6, 2));
        // F_0x = -Φ(0x,1x) u_1x - (1/2) Ψ(0x,0x,0x) u_0x²
        assert!((block.a[(0, 0)] - 0.1).abs() < 1e-15);
        assert!((block.a[(0, 1)] + 0.5 * 0.04).abs() < 1e-15);
        // F_1x = -Φ(1x,0x) u_0x
        assert!((block.a[(3, 0)] + 0.2).abs() < 1e-15);
        assert_eq!(block.b.as_slice(), &f);
        assert!((block.force_sq - 91.0).abs() < 1e-12);
    }

    #[test]
    fn non_reference_atoms_are_skipped() {
        let tables = cubic_tables().with_reference_atoms(vec![1]);
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let u = [0.2, 0.0, 0.0, -0.1, 0.0, 0.0];
        let f = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let block = builder.sample_block(&u, &f, ColumnBasis::Full);
        assert_eq!(block.a.nrows(), 3);
        assert!((block.a[(0, 0)] + 0.2).abs() < 1e-15);
        assert_eq!(block.a[(0, 1)], 0.0);
        assert_eq!(block.b[0], 4.0);
    }

    #[test]
    fn translation_replica_permutes_atoms() {
        let tables = cubic_tables().with_translations(vec![vec![1, 0]]);
        let builder = SensingMatrixBuilder::new(&tables).unwrap().with_data_multiplier(true);
        assert_eq!(builder.rows_per_sample(), 12);
        let u = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let reps = builder.replicate(&u, &u);
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[1].0, vec![4.0, 5.0, 6.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn dense_and_sparse_storage_agree() {
        let tables = cubic_tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = DisplacementDataset::new(
            vec![vec![0.1, 0.0, 0.0, 0.2, 0.0, 0.0], vec![-0.3, 0.0, 0.0, 0.1, 0.0, 0.0]],
            vec![vec![0.5; 6], vec![-0.5; 6]],
        );
        let dense = builder.build(&data, ColumnBasis::Full, Storage::Dense).unwrap();
        let sparse = builder.build(&data, ColumnBasis::Full, Storage::Sparse).unwrap();
        assert_eq!(dense.design.to_dense(), sparse.design.to_dense());
        assert_eq!(dense.target, sparse.target);
        assert_eq!(dense.n_samples(), 2);
    }

    #[test]
    fn sparse_compact_build_matches_dense() {
        let tables = cubic_tables();
        let mut set = crate::constraint::LinearConstraintSet::unconstrained(&tables);
        set.fix_value(2, 0, 2.0).unwrap();
        let map = set.algebraic(1e-8).unwrap();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = DisplacementDataset::new(
            vec![vec![0.1, 0.0, 0.0, 0.2, 0.0, 0.0], vec![-0.3, 0.0, 0.0, 0.1, 0.0, 0.0]],
            vec![vec![0.5; 6], vec![-0.5; 6]],
        );
        let dense = builder.build(&data, ColumnBasis::Compact(&map), Storage::Dense).unwrap();
        let sparse = builder.build(&data, ColumnBasis::Compact(&map), Storage::Sparse).unwrap();
        assert!(matches!(sparse.design, Design::Sparse(_)));
        assert_eq!(sparse.design.ncols(), 1);
        assert!((dense.design.to_dense() - sparse.design.to_dense()).amax() < 1e-15);
        assert!((&dense.target - &sparse.target).amax() < 1e-15);
        // Only rows with a non-zero displacement product are stored.
        assert_eq!(sparse.design.nnz(), dense.design.nnz());
    }

    #[test]
    fn compact_basis_shifts_target() {
        let tables = cubic_tables();
        let mut set = crate::constraint::LinearConstraintSet::unconstrained(&tables);
        set.fix_value(2, 0, 2.0).unwrap();
        let map = set.algebraic(1e-8).unwrap();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let u = [0.2, 0.0, 0.0, -0.1, 0.0, 0.0];
        let f = [1.0; 6];
        let full = builder.sample_block(&u, &f, ColumnBasis::Full);
        let compact = builder.sample_block(&u, &f, ColumnBasis::Compact(&map));
        assert_eq!(compact.a.ncols(), 1);
        // b - A x0 with x0 = (0, 2)
        assert!((compact.b[0] - (1.0 - full.a[(0, 1)] * 2.0)).abs() < 1e-15);
    }

    #[test]
    fn rejects_wrong_vector_length() {
        let tables = cubic_tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = DisplacementDataset::new(vec![vec![0.0; 5]], vec![vec![0.0; 6]]);
        assert!(matches!(
            builder.build(&data, ColumnBasis::Full, Storage::Dense),
            Err(FitError::Dimension(_))
        ));
    }
}
