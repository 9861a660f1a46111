use super::with_multilock;
use crate::analysis::overlap::{overlap_matrix, reversible_eigen};
use crate::analysis::pcca::{Pcca, PccaOptions, pcca};
use crate::analysis::symmetrize::Symmetrizer;
use crate::engine::config::AnalysisOptions;
use crate::engine::error::EngineError;
use crate::engine::pool::Pool;
use crate::engine::progress::{Progress, ProgressReporter};
use nalgebra::{DMatrix, DVector};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

pub const S_MATRIX_FILE: &str = "s_matrix.csv";
pub const S_CORRECTED_FILE: &str = "s_matrix_corrected.csv";
pub const K_MATRIX_FILE: &str = "k_matrix.csv";
pub const K_CORRECTED_FILE: &str = "k_matrix_corrected.csv";
pub const CHI_FILE: &str = "chi_matrix.csv";
pub const RATE_FILE: &str = "qc_matrix.csv";
pub const EIGENVALUES_FILE: &str = "eigenvalues.csv";
pub const WEIGHTS_FILE: &str = "node_weights.csv";

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub nodes: Vec<String>,
    pub s_matrix: DMatrix<f64>,
    pub k_matrix: DMatrix<f64>,
    pub s_corrected: DMatrix<f64>,
    pub k_corrected: DMatrix<f64>,
    pub direct_weights: DVector<f64>,
    pub corrected_weights: DVector<f64>,
    pub eigenvalues: DVector<f64>,
    pub pcca: Pcca,
}

/// Builds the overlap matrices of the reweighted partition, symmetrises them
/// and clusters the nodes with PCCA+. Matrices are written as CSV into the
/// pool's analysis directory.
#[instrument(skip_all, name = "analyze")]
pub fn run(
    pool: &mut Pool,
    options: &AnalysisOptions,
    guard: Duration,
    reporter: &ProgressReporter,
) -> Result<AnalysisResult, EngineError> {
    let partition_ids = pool.partition_ids();
    if partition_ids.is_empty() {
        return Err(EngineError::Precondition("the pool has no partition nodes".into()));
    }
    let missing: Vec<&str> = partition_ids
        .iter()
        .map(|&id| pool.node(id))
        .filter(|n| n.observables().weight_direct.is_none())
        .map(|n| n.name())
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Precondition(format!(
            "nodes have not been reweighted: {}",
            missing.join(", ")
        )));
    }

    // === Phase 1: Overlap matrices and symmetrisation ===
    reporter.report(Progress::PhaseStart {
        name: "Overlap Matrices",
    });
    let symmetrizer = Symmetrizer::new(options.tolerance, options.max_iterations);
    let (nodes, s_matrix, k_matrix, direct, s_sym, k_sym) =
        with_multilock(pool, &partition_ids, guard, true, |pool, owned| {
            let partition = pool.partition_of(owned)?;
            let trajectories = owned
                .iter()
                .map(|&id| pool.trajectory(id))
                .collect::<Result<Vec<_>, _>>()?;
            let frames: Vec<_> = trajectories.iter().map(|t| &t.frames).collect();

            let s_matrix = overlap_matrix(&partition, &frames, 0)?;
            let k_matrix = overlap_matrix(&partition, &frames, options.lag)?;
            let direct = DVector::from_iterator(
                owned.len(),
                owned
                    .iter()
                    .map(|&id| pool.node(id).observables().weight_direct.unwrap_or(0.0)),
            );

            let s_sym = symmetrizer
                .correcting_weights(options.correct_weights)
                .symmetrize(&s_matrix, &direct)?;
            let k_sym = symmetrizer.symmetrize(&k_matrix, &s_sym.weights)?;

            for (&id, &weight) in owned.iter().zip(s_sym.weights.iter()) {
                let node = pool.node_mut(id);
                let before = node.observables().weight_direct.unwrap_or(0.0);
                info!(
                    node = %node.name(),
                    direct = before,
                    corrected = weight,
                    change = (before - weight).abs(),
                    "Corrected node weight"
                );
                node.observables_mut().weight_corrected = Some(weight);
                node.save()?;
            }
            let nodes: Vec<String> = owned.iter().map(|&id| pool.node(id).name().to_string()).collect();
            Ok((nodes, s_matrix, k_matrix, direct, s_sym, k_sym))
        })?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Spectrum and PCCA+ ===
    reporter.report(Progress::PhaseStart { name: "PCCA+" });
    let spectrum = reversible_eigen(&s_sym.matrix, &s_sym.stationary)?;
    let pcca_options = PccaOptions {
        n_clusters: options.n_clusters,
        optimize: options.optimize_rotation,
        max_iterations: options.max_iterations,
    };
    let clustering = pcca(&spectrum, &s_sym.stationary, &pcca_options)?;
    reporter.report(Progress::PhaseFinish);

    let result = AnalysisResult {
        nodes,
        s_matrix,
        k_matrix,
        s_corrected: s_sym.matrix,
        k_corrected: k_sym.matrix,
        direct_weights: direct,
        corrected_weights: s_sym.weights,
        eigenvalues: spectrum.values,
        pcca: clustering,
    };
    write_results(&pool.analysis_dir(), &result)?;
    info!(
        nodes = result.nodes.len(),
        clusters = result.pcca.n_clusters,
        "Analysis complete"
    );
    Ok(result)
}

fn write_results(dir: &Path, result: &AnalysisResult) -> Result<(), EngineError> {
    let nodes = &result.nodes;
    write_matrix(&dir.join(S_MATRIX_FILE), nodes, nodes, &result.s_matrix)?;
    write_matrix(&dir.join(S_CORRECTED_FILE), nodes, nodes, &result.s_corrected)?;
    write_matrix(&dir.join(K_MATRIX_FILE), nodes, nodes, &result.k_matrix)?;
    write_matrix(&dir.join(K_CORRECTED_FILE), nodes, nodes, &result.k_corrected)?;

    let clusters: Vec<String> = (0..result.pcca.n_clusters).map(|c| format!("cluster{c}")).collect();
    write_matrix(&dir.join(CHI_FILE), nodes, &clusters, &result.pcca.chi)?;
    write_matrix(&dir.join(RATE_FILE), &clusters, &clusters, &result.pcca.rate_matrix)?;

    let path = dir.join(EIGENVALUES_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["index", "eigenvalue", "gap"])?;
    for (i, (value, gap)) in result.eigenvalues.iter().zip(&result.pcca.gaps).enumerate() {
        writer.write_record([(i + 1).to_string(), value.to_string(), gap.to_string()])?;
    }
    writer.flush().map_err(EngineError::io(&path))?;

    let path = dir.join(WEIGHTS_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["node", "weight_direct", "weight_corrected"])?;
    for ((name, direct), corrected) in nodes
        .iter()
        .zip(result.direct_weights.iter())
        .zip(result.corrected_weights.iter())
    {
        writer.write_record([name.clone(), direct.to_string(), corrected.to_string()])?;
    }
    writer.flush().map_err(EngineError::io(&path))?;
    Ok(())
}

/// Labelled matrix: a header row of column names, then one row per
/// `rows` entry.
fn write_matrix(
    path: &Path,
    rows: &[String],
    columns: &[String],
    matrix: &DMatrix<f64>,
) -> Result<(), EngineError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once("").chain(columns.iter().map(String::as_str)))?;
    for (name, row) in rows.iter().zip(matrix.row_iter()) {
        writer.write_record(std::iter::once(name.clone()).chain(row.iter().map(f64::to_string)))?;
    }
    writer.flush().map_err(EngineError::io(path))
}
