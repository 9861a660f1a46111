use super::defaults::DefaultsConfig;
use super::file::FileConfig;
use super::models::MdCommands;
use crate::cli::{AnalyzeArgs, CreateNodesArgs, CreatePoolArgs, MdrunArgs, RefineArgs, ReweightArgs};
use crate::error::{CliError, Result};
use gridfree::engine::config as core_config;
use std::str::FromStr;
use std::time::Duration;

fn parse_method<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = core_config::ConfigError>,
{
    value.parse().map_err(|e: core_config::ConfigError| CliError::Config(e.to_string()))
}

pub fn lock_guard(file: &FileConfig) -> Result<Duration> {
    let defaults = DefaultsConfig::default();
    let seconds = file
        .locks
        .as_ref()
        .and_then(|l| l.guard_seconds)
        .unwrap_or(defaults.lock_guard_seconds);
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| CliError::Config(format!("Invalid lock guard: {} seconds", seconds)))
}

pub fn build_study_config(args: &CreatePoolArgs, file: &FileConfig) -> Result<core_config::StudyConfig> {
    let defaults = DefaultsConfig::default();
    let study = file.study.clone().unwrap_or_default();
    core_config::StudyConfigBuilder::new()
        .temperature(args.temperature.or(study.temperature).unwrap_or(defaults.temperature))
        .gr_threshold(args.gr_threshold.or(study.gr_threshold).unwrap_or(defaults.gr_threshold))
        .gr_chains(args.gr_chains.or(study.gr_chains).unwrap_or(defaults.gr_chains))
        .build()
        .map_err(|e| CliError::Config(e.to_string()))
}

/// `pool_alpha` is the alpha already stored in the pool; it is kept unless
/// the arguments or the file ask for another one.
pub fn build_node_creation_config(
    args: &CreateNodesArgs,
    file: &FileConfig,
    pool_alpha: Option<f64>,
) -> Result<core_config::NodeCreationConfig> {
    let defaults = DefaultsConfig::default();
    let nodes = file.nodes.clone().unwrap_or_default();

    let seed_method = parse_method(
        args.seed_method
            .as_deref()
            .or(nodes.seed_method.as_deref())
            .unwrap_or(defaults.seed_method),
    )?;
    let fit_method = parse_method(
        args.fit_method
            .as_deref()
            .or(nodes.fit_method.as_deref())
            .unwrap_or(defaults.fit_method),
    )?;
    let alpha_method = match args.alpha.or(nodes.alpha).or(pool_alpha) {
        Some(alpha) if alpha.is_finite() && alpha > 0.0 => core_config::AlphaMethod::Fixed(alpha),
        Some(alpha) => {
            return Err(CliError::Config(format!("alpha must be positive, got {}", alpha)));
        }
        None => core_config::AlphaMethod::Theta,
    };
    let num_nodes = args.num_nodes.or(nodes.num_nodes).unwrap_or(defaults.num_nodes);
    if num_nodes == 0 {
        return Err(CliError::Config("num-nodes must be at least 1".to_string()));
    }

    Ok(core_config::NodeCreationConfig {
        parent: args.parent.clone(),
        num_nodes,
        seed_method,
        alpha_method,
        fit_method,
        max_extensions: args
            .max_extensions
            .or(nodes.max_extensions)
            .unwrap_or(defaults.max_extensions),
        extension_length: nodes.extension_length.unwrap_or(defaults.extension_length),
        sampling_length: nodes.sampling_length.unwrap_or(defaults.sampling_length),
        random_seed: args.random_seed.or(nodes.random_seed),
        kmeans_iterations: nodes.kmeans_iterations.unwrap_or(defaults.kmeans_iterations),
    })
}

pub fn build_worker_options(args: &MdrunArgs, file: &FileConfig) -> Result<core_config::WorkerOptions> {
    let defaults = DefaultsConfig::default();
    let worker = file.worker.clone().unwrap_or_default();
    Ok(core_config::WorkerOptions {
        auto_refines: args
            .auto_refines
            .or(worker.auto_refines)
            .unwrap_or(defaults.auto_refines),
        convtest_only: args.convtest_only,
        lock_guard: lock_guard(file)?,
    })
}

pub fn build_refine_options(args: &RefineArgs, file: &FileConfig) -> Result<core_config::RefineOptions> {
    let defaults = DefaultsConfig::default();
    let refine = file.refine.clone().unwrap_or_default();
    let nodes = file.nodes.clone().unwrap_or_default();
    let not_converged = parse_method(
        args.not_converged
            .as_deref()
            .or(refine.not_converged.as_deref())
            .unwrap_or(defaults.not_converged),
    )?;
    let fit_method = parse_method(nodes.fit_method.as_deref().unwrap_or(defaults.fit_method))?;
    Ok(core_config::RefineOptions {
        not_converged,
        refine_fake_converged: args.refine_fake_converged
            || refine.refine_fake_converged.unwrap_or(false),
        num_nodes: args
            .num_nodes
            .or(refine.num_nodes)
            .unwrap_or(defaults.refine_num_nodes),
        fit_method,
        random_seed: nodes.random_seed,
    })
}

/// Reweighting filters and the name of the energy column.
pub fn build_reweight_options(
    args: &ReweightArgs,
    file: &FileConfig,
) -> Result<(core_config::ReweightOptions, String)> {
    let defaults = DefaultsConfig::default();
    let reweight = file.reweight.clone().unwrap_or_default();
    let method = parse_method(
        args.method
            .as_deref()
            .or(reweight.method.as_deref())
            .unwrap_or(defaults.reweight_method),
    )?;
    let options = core_config::ReweightOptions {
        method,
        ignore_failed: args.ignore_failed || reweight.ignore_failed.unwrap_or(false),
        ignore_not_converged: args.ignore_not_converged
            || reweight.ignore_not_converged.unwrap_or(false),
    };
    let column = args
        .energy_column
        .clone()
        .or(reweight.energy_column)
        .unwrap_or_else(|| defaults.energy_column.to_string());
    Ok((options, column))
}

pub fn build_analysis_options(args: &AnalyzeArgs, file: &FileConfig) -> Result<core_config::AnalysisOptions> {
    let defaults = DefaultsConfig::default();
    let analysis = file.analysis.clone().unwrap_or_default();
    let n_clusters = args.clusters.or(analysis.clusters);
    if n_clusters == Some(0) {
        return Err(CliError::Config("clusters must be at least 1".to_string()));
    }
    Ok(core_config::AnalysisOptions {
        n_clusters,
        lag: args.lag.or(analysis.lag).unwrap_or(defaults.lag),
        tolerance: analysis.tolerance.unwrap_or(defaults.tolerance),
        optimize_rotation: analysis.optimize_rotation.unwrap_or(true),
        max_iterations: analysis.max_iterations.unwrap_or(defaults.max_iterations),
        correct_weights: !args.no_weight_correction && analysis.correct_weights.unwrap_or(true),
    })
}

pub fn build_md_commands(file: &FileConfig) -> Result<MdCommands> {
    let defaults = DefaultsConfig::default();
    let md = file.md.clone().unwrap_or_default();
    let run = md.run.ok_or_else(|| {
        CliError::Config(
            "A command template for `md.run` is required in the config file or via --set."
                .to_string(),
        )
    })?;
    Ok(MdCommands {
        shell: md.shell.unwrap_or_else(|| defaults.shell.to_string()),
        setup: md.setup,
        preprocess: md.preprocess,
        run,
        extend: md.extend,
    })
}
