//! CV score exports.
//!
//! - CSV: one row per α with fold mean/std, easy to plot
//! - text: the table from `report::format_cv_table`
//! - JSON: the full `CvSummary` (per-fold points included)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;

use crate::error::{FitError, FitResult};
use crate::fit::CvSummary;
use crate::report::format_cv_table;

fn create(path: &Path) -> FitResult<BufWriter<File>> {
    let file = File::create(path)
        .map_err(|e| FitError::Io(format!("failed to create '{}': {e}", path.display())))?;
    Ok(BufWriter::new(file))
}

/// Write the aggregated CV scores as CSV. Unscored α rows keep empty fields.
pub fn write_cvscore_csv(path: &Path, summary: &CvSummary) -> FitResult<()> {
    let mut w = create(path)?;
    writeln!(
        w,
        "alpha,training_mean,training_std,validation_mean,validation_std,n_folds,selected"
    )?;
    for (i, (alpha, score)) in summary.alphas.iter().zip(&summary.scores).enumerate() {
        let selected = u8::from(i == summary.selected_index);
        match score {
            Some(s) => writeln!(
                w,
                "{alpha:.10e},{:.10e},{:.10e},{:.10e},{:.10e},{},{selected}",
                s.training_mean, s.training_std, s.validation_mean, s.validation_std, s.n_folds
            )?,
            None => writeln!(w, "{alpha:.10e},,,,,0,{selected}")?,
        }
    }
    w.flush()?;
    Ok(())
}

/// Write the CV table as text, stamped with the current UTC time.
pub fn write_cvscore_text(path: &Path, summary: &CvSummary) -> FitResult<()> {
    let mut w = create(path)?;
    w.write_all(format_cv_table(summary, Utc::now()).as_bytes())?;
    w.flush()?;
    Ok(())
}

pub fn write_cvscore_json(path: &Path, summary: &CvSummary) -> FitResult<()> {
    let w = create(path)?;
    serde_json::to_writer_pretty(w, summary)?;
    Ok(())
}

pub fn read_cvscore_json(path: &Path) -> FitResult<CvSummary> {
    let file = File::open(path)
        .map_err(|e| FitError::Io(format!("failed to open '{}': {e}", path.display())))?;
    Ok(serde_json::from_reader(file)?)
}
