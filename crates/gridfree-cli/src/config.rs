//! Configuration of the command-line tool.
//!
//! Values are resolved in the order command-line argument, `--set` override,
//! `gridfree.toml`, built-in default.

mod builder;
mod defaults;
pub mod file;
mod models;

pub use builder::{
    build_analysis_options, build_md_commands, build_node_creation_config, build_refine_options,
    build_reweight_options, build_study_config, build_worker_options, lock_guard,
};
pub use file::FileConfig;
pub use models::MdCommands;

use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "gridfree.toml";

/// The explicit path, or `gridfree.toml` in the pool directory when it exists.
pub fn locate(explicit: Option<&Path>, pool_dir: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let candidate = pool_dir.join(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        }
    }
}
