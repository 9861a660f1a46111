use crate::error::{CliError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileStudyConfig {
    pub temperature: Option<f64>,
    pub gr_threshold: Option<f64>,
    pub gr_chains: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileNodesConfig {
    pub num_nodes: Option<usize>,
    pub seed_method: Option<String>,
    pub fit_method: Option<String>,
    pub alpha: Option<f64>,
    pub max_extensions: Option<u32>,
    pub extension_length: Option<f64>,
    pub sampling_length: Option<f64>,
    pub random_seed: Option<u64>,
    pub kmeans_iterations: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileWorkerConfig {
    pub auto_refines: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileRefineConfig {
    pub not_converged: Option<String>,
    pub refine_fake_converged: Option<bool>,
    pub num_nodes: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileReweightConfig {
    pub method: Option<String>,
    pub energy_column: Option<String>,
    pub ignore_failed: Option<bool>,
    pub ignore_not_converged: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileAnalysisConfig {
    pub clusters: Option<usize>,
    pub lag: Option<usize>,
    pub tolerance: Option<f64>,
    pub optimize_rotation: Option<bool>,
    pub max_iterations: Option<usize>,
    pub correct_weights: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileLocksConfig {
    pub guard_seconds: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileMdConfig {
    pub shell: Option<String>,
    pub setup: Option<String>,
    pub preprocess: Option<String>,
    pub run: Option<String>,
    pub extend: Option<String>,
}

/// Contents of `gridfree.toml`. Every section and key is optional; missing
/// values fall back to command-line arguments and built-in defaults.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub study: Option<FileStudyConfig>,
    pub nodes: Option<FileNodesConfig>,
    pub worker: Option<FileWorkerConfig>,
    pub refine: Option<FileRefineConfig>,
    pub reweight: Option<FileReweightConfig>,
    pub analysis: Option<FileAnalysisConfig>,
    pub locks: Option<FileLocksConfig>,
    pub md: Option<FileMdConfig>,
}

impl FileConfig {
    /// Reads the file (if any) and applies `--set KEY=VALUE` overrides on top
    /// before the sections are checked.
    pub fn load(path: Option<&Path>, set_values: &[String]) -> Result<Self> {
        let mut table = match path {
            Some(path) => {
                debug!("Loading configuration from file: {:?}", path);
                let content = std::fs::read_to_string(path)?;
                content
                    .parse::<toml::Table>()
                    .map_err(|e| CliError::FileParsing {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })?
            }
            None => toml::Table::new(),
        };
        for kv_pair in set_values {
            apply_set_value(&mut table, kv_pair)?;
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| CliError::Config(e.to_string()))
    }
}

/// Inserts `value` at the dotted `key`, creating intermediate tables. The
/// value is read as a TOML literal and taken as a plain string otherwise.
fn apply_set_value(table: &mut toml::Table, kv_pair: &str) -> Result<()> {
    let Some((key, value_str)) = kv_pair.split_once('=') else {
        return Err(CliError::Config(format!(
            "Invalid --set format: '{}'. Expected KEY=VALUE.",
            kv_pair
        )));
    };
    let path: Vec<&str> = key.trim().split('.').collect();
    if path.iter().any(|part| part.is_empty()) {
        return Err(CliError::Config(format!("Invalid --set key: '{}'", key)));
    }
    let value = parse_value(value_str.trim());

    let (last, parents) = path.split_last().ok_or_else(|| {
        CliError::Config(format!("Invalid --set key: '{}'", key))
    })?;
    let mut current = table;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        current = entry.as_table_mut().ok_or_else(|| {
            CliError::Config(format!("'{}' in --set key '{}' is not a section", part, key))
        })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn parse_value(text: &str) -> toml::Value {
    format!("value = {text}")
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| toml::Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn file_sections_use_kebab_case_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gridfree.toml");
        fs::write(
            &path,
            r#"
            [study]
            temperature = 310.0
            gr-threshold = 1.2

            [nodes]
            seed-method = "equidist"
            num-nodes = 8

            [md]
            run = "gmx mdrun -deffnm {node}"
            "#,
        )
        .unwrap();

        let config = FileConfig::load(Some(&path), &[]).unwrap();
        let study = config.study.unwrap();
        assert_eq!(study.temperature, Some(310.0));
        assert_eq!(study.gr_threshold, Some(1.2));
        assert_eq!(study.gr_chains, None);
        let nodes = config.nodes.unwrap();
        assert_eq!(nodes.seed_method.as_deref(), Some("equidist"));
        assert_eq!(nodes.num_nodes, Some(8));
        assert_eq!(config.md.unwrap().run.as_deref(), Some("gmx mdrun -deffnm {node}"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gridfree.toml");
        fs::write(&path, "[study]\ntemprature = 300.0\n").unwrap();
        assert!(matches!(
            FileConfig::load(Some(&path), &[]),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn set_values_create_and_override_sections() {
        let config = FileConfig::load(
            None,
            &[
                "worker.auto-refines=3".to_string(),
                "refine.not-converged=extend".to_string(),
                "analysis.tolerance = 1e-4".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(config.worker.unwrap().auto_refines, Some(3));
        assert_eq!(config.refine.unwrap().not_converged.as_deref(), Some("extend"));
        assert_eq!(config.analysis.unwrap().tolerance, Some(1e-4));
    }

    #[test]
    fn malformed_set_value_is_an_error() {
        assert!(FileConfig::load(None, &["worker.auto-refines".to_string()]).is_err());
        assert!(FileConfig::load(None, &["worker..x=1".to_string()]).is_err());
    }

    #[test]
    fn set_value_cannot_descend_into_a_scalar() {
        let result = FileConfig::load(
            None,
            &["locks=1".to_string(), "locks.guard-seconds=2".to_string()],
        );
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
