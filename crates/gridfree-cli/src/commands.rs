pub mod analysis;
pub mod nodes;
pub mod pool;
pub mod recover;
pub mod sampling;

use crate::config::FileConfig;
use crate::error::Result;
use crate::utils::progress::CliProgressHandler;
use gridfree::engine::error::EngineError;
use gridfree::engine::pool::Pool;
use gridfree::engine::progress::ProgressReporter;
use std::path::PathBuf;

/// What every subcommand needs besides its own arguments.
pub struct Context {
    pub pool_dir: PathBuf,
    pub file: FileConfig,
    pub progress: CliProgressHandler,
}

impl Context {
    pub fn reporter(&self) -> ProgressReporter<'static> {
        ProgressReporter::with_callback(self.progress.get_callback())
    }

    pub fn open_pool(&self) -> Result<Pool> {
        Ok(Pool::open(&self.pool_dir).map_err(EngineError::from)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cli::CreatePoolArgs;
    use gridfree::core::coords::{CoordinateSet, InternalCoordinate};
    use gridfree::core::io::trr::{Precision, TrrWriter};
    use nalgebra::Vector3;
    use std::fs::File;
    use std::path::Path;
    use tempfile::TempDir;

    /// Two-atom trajectory whose distances are `distances`.
    pub(crate) fn write_presampling(path: &Path, distances: &[f64]) {
        let mut writer = TrrWriter::new(File::create(path).unwrap(), Precision::Single);
        for (step, &d) in distances.iter().enumerate() {
            let positions = [Vector3::zeros(), Vector3::new(d, 0.0, 0.0)];
            writer.write_frame(step as i32, step as f64, None, &positions).unwrap();
        }
    }

    /// Input files in a scratch directory and a context pointing at a pool
    /// directory next to them.
    pub(crate) fn context_with_inputs(distances: &[f64]) -> (TempDir, Context, CreatePoolArgs) {
        let dir = tempfile::tempdir().unwrap();
        let coordinates = dir.path().join("internals.txt");
        CoordinateSet::new(vec![InternalCoordinate::linear(0, 1)])
            .unwrap()
            .write_to_path(&coordinates)
            .unwrap();
        let presampling = dir.path().join("presampling.trr");
        write_presampling(&presampling, distances);

        let context = Context {
            pool_dir: dir.path().join("pool"),
            file: FileConfig::default(),
            progress: CliProgressHandler::hidden(),
        };
        let args = CreatePoolArgs {
            coordinates,
            presampling,
            temperature: None,
            gr_threshold: None,
            gr_chains: None,
            balance_linears: false,
        };
        (dir, context, args)
    }
}
