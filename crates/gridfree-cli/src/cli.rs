use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Tony Kan, Ted Yu, William A. Goddard III, Victor Wai Tak Kam",
    version,
    about = "gridfree CLI - Grid-free conformational sampling with phi-function partitions and restrained MD.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Pool directory to operate on
    #[arg(short, long, global = true, value_name = "DIR", default_value = ".")]
    pub pool: PathBuf,

    /// Path to the configuration file in TOML format.
    /// Defaults to `gridfree.toml` inside the pool directory, if present.
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S worker.auto-refines=2
    #[arg(short = 'S', long = "set", global = true, value_name = "KEY=VALUE")]
    pub set_values: Vec<String>,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new pool whose root node holds a presampling trajectory.
    CreatePool(CreatePoolArgs),
    /// Discretize a node's trajectory into new partition nodes.
    CreateNodes(CreateNodesArgs),
    /// Hand created nodes to the MD engine until they are runnable.
    Prepare,
    /// Run a sampling worker until no node is left to sample.
    Mdrun(MdrunArgs),
    /// Refine or extend sampled partition nodes.
    Refine(RefineArgs),
    /// Compute direct free-energy weights of the partition nodes.
    Reweight(ReweightArgs),
    /// Build overlap matrices and cluster the partition with PCCA+.
    Analyze(AnalyzeArgs),
    /// Release stale locks and send failed nodes back to sampling.
    Recover(RecoverArgs),
    /// Delete nodes from the pool.
    Remove(RemoveArgs),
    /// Write a CSV table of all nodes.
    Export(ExportArgs),
    /// Print the number of nodes in every state.
    Status,
}

/// Arguments for the `create-pool` subcommand.
#[derive(Args, Debug, Clone)]
pub struct CreatePoolArgs {
    /// Internal-coordinate definition file.
    #[arg(short = 'i', long, required = true, value_name = "PATH")]
    pub coordinates: PathBuf,

    /// Unrestrained presampling trajectory (TRR).
    #[arg(short = 't', long, required = true, value_name = "PATH")]
    pub presampling: PathBuf,

    /// Override the temperature in Kelvin.
    #[arg(long, value_name = "FLOAT")]
    pub temperature: Option<f64>,

    /// Override the Gelman-Rubin threshold.
    #[arg(long, value_name = "FLOAT")]
    pub gr_threshold: Option<f64>,

    /// Override the number of Gelman-Rubin chains.
    #[arg(long, value_name = "INT")]
    pub gr_chains: Option<usize>,

    /// Rescale linear coordinates to the spread of the presampling.
    #[arg(long)]
    pub balance_linears: bool,
}

/// Arguments for the `create-nodes` subcommand.
#[derive(Args, Debug, Clone)]
pub struct CreateNodesArgs {
    /// Node whose trajectory is discretized ('root' for the pool root).
    #[arg(long, value_name = "NAME", default_value = "root")]
    pub parent: String,

    /// Override the number of nodes to create.
    #[arg(short, long, value_name = "INT")]
    pub num_nodes: Option<usize>,

    /// Override the seed method ('kmeans', 'equidist', 'all' or 'unrestrained').
    #[arg(long, value_name = "METHOD")]
    pub seed_method: Option<String>,

    /// Override the restraint fit method ('harmonic', 'switch' or 'leastsq').
    #[arg(long, value_name = "METHOD")]
    pub fit_method: Option<String>,

    /// Use a fixed alpha instead of deriving it from the node spacing.
    #[arg(long, value_name = "FLOAT")]
    pub alpha: Option<f64>,

    /// Override the maximum number of extensions per node.
    #[arg(long, value_name = "INT")]
    pub max_extensions: Option<u32>,

    /// Override the seed of the k-means initialisation.
    #[arg(long, value_name = "INT")]
    pub random_seed: Option<u64>,
}

/// Arguments for the `mdrun` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct MdrunArgs {
    /// Override the number of automatic refinement rounds.
    #[arg(long, value_name = "INT")]
    pub auto_refines: Option<u32>,

    /// Only rerun the convergence test on sampled nodes.
    #[arg(long)]
    pub convtest_only: bool,
}

/// Arguments for the `refine` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct RefineArgs {
    /// Override the policy for nodes that did not converge ('refine' or 'extend').
    #[arg(long, value_name = "POLICY")]
    pub not_converged: Option<String>,

    /// Also refine converged nodes whose trajectory splits into distant clusters.
    #[arg(long)]
    pub refine_fake_converged: bool,

    /// Override the number of children per refined node.
    #[arg(short, long, value_name = "INT")]
    pub num_nodes: Option<usize>,
}

/// Arguments for the `reweight` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ReweightArgs {
    /// Weighting method ('direct' or 'entropy').
    #[arg(short, long, value_name = "METHOD")]
    pub method: Option<String>,

    /// Reweight even if some nodes failed; failed nodes are left out.
    #[arg(long)]
    pub ignore_failed: bool,

    /// Reweight even if some nodes did not converge.
    #[arg(long)]
    pub ignore_not_converged: bool,

    /// Override the CSV column holding the per-frame energies.
    #[arg(long, value_name = "NAME")]
    pub energy_column: Option<String>,
}

/// Arguments for the `analyze` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct AnalyzeArgs {
    /// Fixed number of clusters; chosen from the eigenvalue gaps otherwise.
    #[arg(short = 'k', long, value_name = "INT")]
    pub clusters: Option<usize>,

    /// Override the lag in frames of the transition overlap matrix.
    #[arg(long, value_name = "INT")]
    pub lag: Option<usize>,

    /// Keep the direct weights instead of correcting them.
    #[arg(long)]
    pub no_weight_correction: bool,
}

/// Arguments for the `recover` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct RecoverArgs {
    /// Only remove stale locks.
    #[arg(long, conflicts_with = "failed_only")]
    pub locks_only: bool,

    /// Only send failed nodes back to sampling.
    #[arg(long)]
    pub failed_only: bool,
}

/// Arguments for the `remove` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RemoveArgs {
    /// Names of the nodes to remove.
    #[arg(required = true, value_name = "NAME")]
    pub nodes: Vec<String>,
}

/// Arguments for the `export` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ExportArgs {
    /// Output file; the table goes to stdout when omitted.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}
