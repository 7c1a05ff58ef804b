//! # Block Jackknife
//!
//! Delete-a-group jackknife over the whole estimation pipeline. Observations are
//! shuffled and cut into `B` contiguous, non-empty blocks; the pipeline is re-run
//! once per left-out block, and every reported quantity gets the standard error
//! `sqrt(B - 1) * std(estimates)` with the population divisor.
//!
//! Blocks are independent: each one receives its own [`PipelineContext`] and its
//! own scratch directory, so they can run on a dedicated `rayon` pool without
//! sharing any mutable state. Results are always collected in block order.

use crate::data::{PersonId, RegressionData};
use crate::errors::{PipelineError, QualityWarning};
use crate::pipeline::{EstimateRecord, JackknifeConfig, PipelineContext, estimate};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::fs;
use std::io::IsTerminal;

/// Fewer blocks than this raises a data-quality warning.
pub const MIN_RECOMMENDED_BLOCKS: usize = 20;

pub const DEFAULT_NUM_BLOCKS: usize = 100;

/// Per-block estimates, one row per block in block order.
#[derive(Debug, Clone, PartialEq)]
pub struct JackknifeTable {
    /// `h2`, `R2`, `rho`, then `uncorr_<v>` and `corr_<v>` for every variable.
    pub columns: Vec<String>,
    pub rows: Array2<f64>,
}

impl JackknifeTable {
    pub fn num_blocks(&self) -> usize {
        self.rows.nrows()
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        jackknife_standard_errors(self.rows.view())
    }
}

/// Jackknife standard errors split by the quantity they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct JackknifeErrors {
    pub h2: f64,
    pub r2: f64,
    pub rho: f64,
    pub raw: Array1<f64>,
    pub corrected: Array1<f64>,
}

impl JackknifeErrors {
    /// Splits a standard error vector laid out like a [`JackknifeTable`] row.
    fn from_row(errors: &Array1<f64>, variables: usize) -> Self {
        Self {
            h2: errors[0],
            r2: errors[1],
            rho: errors[2],
            raw: errors.slice(s![3..3 + variables]).to_owned(),
            corrected: errors.slice(s![3 + variables..3 + 2 * variables]).to_owned(),
        }
    }
}

/// Column-wise `sqrt(B - 1) * std_pop` over `B` rows of estimates.
pub fn jackknife_standard_errors(estimates: ArrayView2<f64>) -> Array1<f64> {
    let b = estimates.nrows();
    if b == 0 {
        return Array1::from_elem(estimates.ncols(), f64::NAN);
    }
    estimates.std_axis(Axis(0), 0.0) * ((b - 1) as f64).sqrt()
}

/// Shuffles `0..n` and cuts it into `num_blocks` contiguous chunks.
///
/// Chunk sizes differ by at most one, so every block is non-empty whenever
/// `2 <= num_blocks <= n`.
pub fn assign_blocks(
    n: usize,
    num_blocks: usize,
    seed: Option<u64>,
) -> Result<Vec<Vec<usize>>, PipelineError> {
    if num_blocks < 2 {
        return Err(PipelineError::TooFewBlocks(num_blocks));
    }
    if num_blocks > n {
        return Err(PipelineError::TooManyBlocks {
            blocks: num_blocks,
            observations: n,
        });
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);

    let base = n / num_blocks;
    let larger = n % num_blocks;
    let mut blocks = Vec::with_capacity(num_blocks);
    let mut start = 0;
    for block in 0..num_blocks {
        let len = base + usize::from(block < larger);
        blocks.push(order[start..start + len].to_vec());
        start += len;
    }
    Ok(blocks)
}

/// Re-runs the pipeline once per left-out block and attaches the resulting
/// standard errors to `baseline`.
pub fn run_jackknife(
    ctx: &PipelineContext<'_>,
    data: &RegressionData,
    baseline: &EstimateRecord,
    config: &JackknifeConfig,
) -> Result<(JackknifeTable, EstimateRecord), PipelineError> {
    let policy = ctx.config.policy();
    if config.num_blocks < MIN_RECOMMENDED_BLOCKS {
        policy.raise(QualityWarning::FewJackknifeBlocks {
            blocks: config.num_blocks,
            recommended: MIN_RECOMMENDED_BLOCKS,
        })?;
    }

    let n = data.n();
    let blocks = assign_blocks(n, config.num_blocks, config.seed)?;
    if ctx.estimates_heritability() && data.ids.is_none() {
        return Err(PipelineError::MissingIdentifiers);
    }

    let mut membership = vec![0usize; n];
    for (block, rows) in blocks.iter().enumerate() {
        for &row in rows {
            membership[row] = block;
        }
    }

    let variables = baseline.variables.len();
    let width = 3 + 2 * variables;
    info!(
        "Running the block jackknife with {} blocks on {} threads...",
        blocks.len(),
        config.threads.max(1)
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()?;
    let pb = internal::create_progress_bar(blocks.len() as u64, "Jackknife blocks");

    let results: Vec<Array1<f64>> = pool.install(|| {
        (0..blocks.len())
            .into_par_iter()
            .map(|block| {
                let row = internal::run_block(ctx, data, &blocks[block], &membership, block);
                pb.inc(1);
                row.map_err(|source| PipelineError::Jackknife {
                    block,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()
    })?;
    pb.finish_with_message("Jackknife complete.");

    let mut rows = Array2::zeros((results.len(), width));
    for (mut target, row) in rows.axis_iter_mut(Axis(0)).zip(&results) {
        target.assign(row);
    }

    let mut columns = vec!["h2".to_string(), "R2".to_string(), "rho".to_string()];
    columns.extend(baseline.variables.iter().map(|v| format!("uncorr_{v}")));
    columns.extend(baseline.variables.iter().map(|v| format!("corr_{v}")));
    let table = JackknifeTable { columns, rows };

    let errors = JackknifeErrors::from_row(&table.standard_errors(), variables);
    let record = baseline.clone().with_jackknife(errors);
    Ok((table, record))
}

mod internal {
    use super::*;

    pub(super) fn run_block(
        ctx: &PipelineContext<'_>,
        data: &RegressionData,
        left_out: &[usize],
        membership: &[usize],
        block: usize,
    ) -> Result<Array1<f64>, PipelineError> {
        let kept: Vec<usize> = (0..data.n())
            .filter(|&row| membership[row] != block)
            .collect();
        let excluded: Vec<PersonId> = match &data.ids {
            Some(ids) => left_out.iter().map(|&row| ids[row].clone()).collect(),
            None => Vec::new(),
        };

        let block_ctx = ctx.for_block(block, excluded);
        if block_ctx.estimates_heritability() {
            fs::create_dir_all(&block_ctx.scratch_dir)?;
        }
        let record = estimate(&block_ctx, &data.select_rows(&kept))?;

        let mut row = Vec::with_capacity(3 + 2 * record.variables.len());
        row.extend([record.h2.value, record.r2.value, record.rho]);
        row.extend(record.raw_coefficients.iter().copied());
        row.extend(record.corrected_coefficients.iter().copied());
        Ok(Array1::from(row))
    }

    pub(super) fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(len), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(message.to_string());
        pb
    }
}
