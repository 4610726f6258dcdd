//! Normal equations without materializing the sensing matrix.
//!
//! Samples are grouped into chunks of `chunk_size`. Each chunk builds its blocks and
//! accumulates a private `AᵀA`, `Aᵀb` and `bᵀb`. Chunks run one window of
//! `chunk_size · threads` samples at a time, and each window's partial sums are merged
//! in chunk order before the next window starts. At most one `n × n` partial per
//! worker is alive, and the result does not depend on the number of worker threads.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use sprs::CsMat;
use sprs::prod::mul_acc_mat_vec_csc;

use crate::domain::DisplacementDataset;
use crate::error::{FitError, FitResult};
use crate::sensing::builder::{ColumnBasis, SensingMatrixBuilder};

#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub ata: DMatrix<f64>,
    pub atb: DVector<f64>,
    pub btb: f64,
    /// `||f||²` over every raw force row.
    pub force_sq: f64,
    pub n_rows: usize,
}

impl NormalEquations {
    fn zeros(n: usize) -> Self {
        Self {
            ata: DMatrix::zeros(n, n),
            atb: DVector::zeros(n),
            btb: 0.0,
            force_sq: 0.0,
            n_rows: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.ata += other.ata;
        self.atb += other.atb;
        self.btb += other.btb;
        self.force_sq += other.force_sq;
        self.n_rows += other.n_rows;
        self
    }

    /// `||A x - b|| / ||f||` from `xᵀAᵀAx - 2xᵀAᵀb + bᵀb`.
    pub fn relative_error(&self, x: &DVector<f64>) -> f64 {
        let r2 = (x.transpose() * &self.ata * x)[(0, 0)] - 2.0 * x.dot(&self.atb) + self.btb;
        let r = r2.max(0.0).sqrt();
        let norm = self.force_sq.sqrt();
        if norm > 0.0 { r / norm } else { r }
    }
}

impl SensingMatrixBuilder<'_> {
    pub fn normal_equations(
        &self,
        dataset: &DisplacementDataset,
        basis: ColumnBasis<'_>,
        chunk_size: usize,
    ) -> FitResult<NormalEquations> {
        if chunk_size == 0 {
            return Err(FitError::control("chunk_size must be > 0"));
        }
        dataset.validate(self.tables().nat)?;
        let n = self.n_columns(basis);
        if let ColumnBasis::Compact(map) = basis {
            if map.n_full() != self.tables().n_params() {
                return Err(FitError::dimension(format!(
                    "affine map covers {} parameters, tables define {}",
                    map.n_full(),
                    self.tables().n_params()
                )));
            }
        }

        let window = chunk_size.saturating_mul(rayon::current_num_threads().max(1));
        let samples: Vec<usize> = (0..dataset.len()).collect();
        let mut out = NormalEquations::zeros(n);
        let mut n_chunks = 0;
        for group in samples.chunks(window) {
            let partials: Vec<NormalEquations> = group
                .par_chunks(chunk_size)
                .map(|chunk| {
                    let mut acc = NormalEquations::zeros(n);
                    for &s in chunk {
                        let block =
                            self.sample_block(&dataset.displacements[s], &dataset.forces[s], basis);
                        acc.ata += block.a.tr_mul(&block.a);
                        acc.atb += block.a.tr_mul(&block.b);
                        acc.btb += block.b.norm_squared();
                        acc.force_sq += block.force_sq;
                        acc.n_rows += block.a.nrows();
                    }
                    acc
                })
                .collect();
            n_chunks += partials.len();
            out = partials.into_iter().fold(out, NormalEquations::merge);
        }
        log::debug!(
            "normal equations: {n} columns from {} rows in {n_chunks} chunks",
            out.n_rows
        );
        Ok(out)
    }
}

/// `AᵀA` (compressed column) and `Aᵀb` of a sparse design.
pub fn sparse_normal_equations(a: &CsMat<f64>, b: &DVector<f64>) -> (CsMat<f64>, DVector<f64>) {
    let at = a.transpose_view().to_csc();
    let ata = (&at * a).to_csc();
    let mut atb = DVector::zeros(a.cols());
    mul_acc_mat_vec_csc(at.view(), b.as_slice(), atb.as_mut_slice());
    (ata, atb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterTables, FcClass, FcElement, OrderTable};
    use crate::sensing::builder::Storage;
    use crate::sensing::design::Design;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tables() -> ClusterTables {
        let classes = (0..3)
            .map(|k| {
                FcClass::new(vec![
                    FcElement::new(vec![k, k], 1.0),
                    FcElement::new(vec![3 + k, 3 + k], 1.0),
                ])
            })
            .chain((0..3).map(|k| {
                FcClass::new(vec![
                    FcElement::new(vec![k, 3 + k], 1.0),
                    FcElement::new(vec![3 + k, k], 1.0),
                ])
            }))
            .collect();
        ClusterTables::new(2, vec![OrderTable { order: 1, classes }])
    }

    fn dataset(n: usize) -> DisplacementDataset {
        let mut rng = StdRng::seed_from_u64(3);
        let draw = |rng: &mut StdRng| (0..6).map(|_| rng.gen_range(-0.1..0.1)).collect::<Vec<f64>>();
        let u: Vec<Vec<f64>> = (0..n).map(|_| draw(&mut rng)).collect();
        let f: Vec<Vec<f64>> = (0..n).map(|_| draw(&mut rng)).collect();
        DisplacementDataset::new(u, f)
    }

    #[test]
    fn chunked_accumulation_matches_explicit_product() {
        let tables = tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = dataset(7);
        let full = builder.build(&data, ColumnBasis::Full, Storage::Dense).unwrap();
        let a = full.design.to_dense();

        for chunk in [1, 3, 100] {
            let ne = builder.normal_equations(&data, ColumnBasis::Full, chunk).unwrap();
            assert!((&ne.ata - a.tr_mul(&a)).amax() < 1e-14);
            assert!((&ne.atb - a.tr_mul(&full.target)).amax() < 1e-14);
            assert_eq!(ne.n_rows, a.nrows());
        }
    }

    #[test]
    fn residual_from_normal_equations_matches_direct() {
        let tables = tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = dataset(5);
        let full = builder.build(&data, ColumnBasis::Full, Storage::Dense).unwrap();
        let ne = builder.normal_equations(&data, ColumnBasis::Full, 2).unwrap();
        let x = DVector::from_row_slice(&[0.3, -0.2, 0.1, 0.05, 0.0, -0.4]);
        assert!((ne.relative_error(&x) - full.relative_error(&x)).abs() < 1e-10);
    }

    #[test]
    fn sparse_normal_equations_match_dense() {
        let tables = tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = dataset(4);
        let sparse = builder.build(&data, ColumnBasis::Full, Storage::Sparse).unwrap();
        let Design::Sparse(a) = &sparse.design else {
            panic!("expected sparse storage");
        };
        let (ata, atb) = sparse_normal_equations(a, &sparse.target);
        let dense = sparse.design.to_dense();
        let ata_dense = Design::Sparse(ata).to_dense();
        assert!((ata_dense - dense.tr_mul(&dense)).amax() < 1e-14);
        assert!((atb - dense.tr_mul(&sparse.target)).amax() < 1e-14);
    }

    #[test]
    fn accumulation_is_identical_across_thread_counts() {
        let tables = tables();
        let builder = SensingMatrixBuilder::new(&tables).unwrap();
        let data = dataset(23);
        let run = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| builder.normal_equations(&data, ColumnBasis::Full, 2).unwrap())
        };
        let single = run(1);
        let many = run(4);
        assert_eq!(single.ata, many.ata);
        assert_eq!(single.atb, many.atb);
        assert_eq!(single.btb.to_bits(), many.btb.to_bits());
        assert_eq!(single.force_sq.to_bits(), many.force_sq.to_bits());
        assert_eq!(single.n_rows, many.n_rows);
    }
}
