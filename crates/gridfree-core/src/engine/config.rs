use crate::core::constants::thermo_beta;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Parameter '{name}' is out of range: {value}")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("Unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Study-wide thermodynamic and convergence parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyConfig {
    /// Sharpness of the phi functions; `None` until the first discretisation.
    pub alpha: Option<f64>,
    /// Temperature in Kelvin.
    pub temperature: f64,
    pub gr_threshold: f64,
    pub gr_chains: usize,
}

impl StudyConfig {
    pub fn beta(&self) -> f64 {
        thermo_beta(self.temperature)
    }

    /// Harmonic force constant `alpha / beta`, if alpha is known.
    pub fn force_constant(&self) -> Option<f64> {
        self.alpha.map(|a| a / self.beta())
    }
}

#[derive(Default)]
pub struct StudyConfigBuilder {
    alpha: Option<f64>,
    temperature: Option<f64>,
    gr_threshold: Option<f64>,
    gr_chains: Option<usize>,
}

impl StudyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alpha(mut self, alpha: Option<f64>) -> Self {
        self.alpha = alpha;
        self
    }
    pub fn temperature(mut self, kelvin: f64) -> Self {
        self.temperature = Some(kelvin);
        self
    }
    pub fn gr_threshold(mut self, threshold: f64) -> Self {
        self.gr_threshold = Some(threshold);
        self
    }
    pub fn gr_chains(mut self, chains: usize) -> Self {
        self.gr_chains = Some(chains);
        self
    }

    pub fn build(self) -> Result<StudyConfig, ConfigError> {
        let temperature = self
            .temperature
            .ok_or(ConfigError::MissingParameter("temperature"))?;
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "temperature",
                value: temperature,
            });
        }
        if let Some(alpha) = self.alpha {
            if !(alpha.is_finite() && alpha > 0.0) {
                return Err(ConfigError::OutOfRange {
                    name: "alpha",
                    value: alpha,
                });
            }
        }
        let gr_threshold = self
            .gr_threshold
            .ok_or(ConfigError::MissingParameter("gr_threshold"))?;
        if !(gr_threshold > 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "gr_threshold",
                value: gr_threshold,
            });
        }
        let gr_chains = self
            .gr_chains
            .ok_or(ConfigError::MissingParameter("gr_chains"))?;
        if gr_chains < 2 {
            return Err(ConfigError::OutOfRange {
                name: "gr_chains",
                value: gr_chains as f64,
            });
        }
        Ok(StudyConfig {
            alpha: self.alpha,
            temperature,
            gr_threshold,
            gr_chains,
        })
    }
}

/// Strategy turning a node's phi region into restraint parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitMethod {
    Harmonic,
    #[default]
    Switch,
    #[serde(rename = "leastsq")]
    LeastSquares,
}

/// How new node positions are picked from the parent trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedMethod {
    #[default]
    #[serde(rename = "kmeans")]
    KMeans,
    #[serde(rename = "equidist")]
    Equidistant,
    All,
    /// Evenly spaced frames become unrestrained transition nodes.
    Unrestrained,
}

/// How the partition's alpha is chosen at the first discretisation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AlphaMethod {
    Fixed(f64),
    /// Derived from the median nearest-neighbour distance of the nodes.
    #[default]
    Theta,
}

macro_rules! impl_from_str {
    ($ty:ty, $kind:literal, { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = ConfigError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($variant),)+
                    _ => Err(ConfigError::UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

impl_from_str!(FitMethod, "fit method", {
    "harmonic" => FitMethod::Harmonic,
    "switch" => FitMethod::Switch,
    "leastsq" => FitMethod::LeastSquares,
});

impl_from_str!(SeedMethod, "seed method", {
    "kmeans" => SeedMethod::KMeans,
    "equidist" => SeedMethod::Equidistant,
    "all" => SeedMethod::All,
    "unrestrained" => SeedMethod::Unrestrained,
});

/// Parameters of one discretisation round.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCreationConfig {
    /// Name of the node whose trajectory is discretised.
    pub parent: String,
    pub num_nodes: usize,
    pub seed_method: SeedMethod,
    pub alpha_method: AlphaMethod,
    pub fit_method: FitMethod,
    pub max_extensions: u32,
    /// Extension length in ps.
    pub extension_length: f64,
    /// Initial sampling length in ps.
    pub sampling_length: f64,
    /// Seed for the k-means initialisation; entropy when `None`.
    pub random_seed: Option<u64>,
    /// Maximum number of k-means iterations.
    pub kmeans_iterations: usize,
}

impl Default for NodeCreationConfig {
    fn default() -> Self {
        Self {
            parent: "root".to_string(),
            num_nodes: 10,
            seed_method: SeedMethod::default(),
            alpha_method: AlphaMethod::default(),
            fit_method: FitMethod::default(),
            max_extensions: 5,
            extension_length: 100.0,
            sampling_length: 100.0,
            random_seed: None,
            kmeans_iterations: 100,
        }
    }
}

/// Behaviour of a sampling worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Number of automatic refinement rounds once no node is runnable.
    pub auto_refines: u32,
    /// Only rerun the convergence test on already sampled nodes.
    pub convtest_only: bool,
    pub lock_guard: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            auto_refines: 0,
            convtest_only: false,
            lock_guard: Duration::from_secs(1),
        }
    }
}

/// What to do with nodes that exhausted their extension budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefinePolicy {
    #[default]
    Refine,
    Extend,
}

impl_from_str!(RefinePolicy, "refine policy", {
    "refine" => RefinePolicy::Refine,
    "extend" => RefinePolicy::Extend,
});

#[derive(Debug, Clone, PartialEq)]
pub struct RefineOptions {
    pub not_converged: RefinePolicy,
    /// Also refine converged nodes whose trajectory splits into two distant
    /// clusters.
    pub refine_fake_converged: bool,
    /// Children created per refined node.
    pub num_nodes: usize,
    pub fit_method: FitMethod,
    pub random_seed: Option<u64>,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            not_converged: RefinePolicy::default(),
            refine_fake_converged: false,
            num_nodes: 2,
            fit_method: FitMethod::default(),
            random_seed: None,
        }
    }
}

/// Parameters of the PCCA+ analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    /// Fixed number of clusters; chosen from the eigenvalue gaps when `None`.
    pub n_clusters: Option<usize>,
    /// Lag in frames for the transition overlap matrix.
    pub lag: usize,
    pub tolerance: f64,
    pub optimize_rotation: bool,
    pub max_iterations: usize,
    /// Correct the node weights while symmetrising.
    pub correct_weights: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            n_clusters: None,
            lag: 1,
            tolerance: 1e-2,
            optimize_rotation: true,
            max_iterations: 1000,
            correct_weights: true,
        }
    }
}

/// How node weights are estimated from the sampled energies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReweightMethod {
    /// Boltzmann average over reference frames near the mean energy.
    #[default]
    Direct,
    /// Free energy from the mean energy and a neighbour-count entropy.
    Entropy,
}

impl_from_str!(ReweightMethod, "reweight method", {
    "direct" => ReweightMethod::Direct,
    "entropy" => ReweightMethod::Entropy,
});

/// Filters applied before reweighting a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReweightOptions {
    pub method: ReweightMethod,
    pub ignore_failed: bool,
    pub ignore_not_converged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_reports_first_missing_parameter() {
        let err = StudyConfigBuilder::new().gr_threshold(1.1).build().unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("temperature"));
    }

    #[test]
    fn builder_rejects_non_positive_alpha() {
        let err = StudyConfigBuilder::new()
            .temperature(310.0)
            .alpha(Some(-1.0))
            .gr_threshold(1.1)
            .gr_chains(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { name: "alpha", .. }));
    }

    #[test]
    fn force_constant_is_alpha_over_beta() {
        let config = StudyConfigBuilder::new()
            .temperature(300.0)
            .alpha(Some(2.0))
            .gr_threshold(1.1)
            .gr_chains(5)
            .build()
            .unwrap();
        let k = config.force_constant().unwrap();
        assert!((k - 2.0 / config.beta()).abs() < 1e-12);
    }

    #[test]
    fn method_names_parse_from_command_line_spellings() {
        assert_eq!("leastsq".parse::<FitMethod>(), Ok(FitMethod::LeastSquares));
        assert_eq!("equidist".parse::<SeedMethod>(), Ok(SeedMethod::Equidistant));
        assert_eq!("entropy".parse::<ReweightMethod>(), Ok(ReweightMethod::Entropy));
        assert!("spline".parse::<FitMethod>().is_err());
    }

    #[test]
    fn fit_method_serializes_with_command_line_spelling() {
        #[derive(Serialize)]
        struct Wrapper {
            method: FitMethod,
        }
        let text = toml::to_string(&Wrapper {
            method: FitMethod::LeastSquares,
        })
        .unwrap();
        assert_eq!(text.trim(), "method = \"leastsq\"");
    }
}
