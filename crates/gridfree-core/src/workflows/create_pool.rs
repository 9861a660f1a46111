use crate::core::coords::CoordinateSet;
use crate::engine::config::StudyConfig;
use crate::engine::error::EngineError;
use crate::engine::node::{NodeRecord, NodeState};
use crate::engine::pool::Pool;
use crate::engine::progress::{Progress, ProgressReporter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Name of the first node of every pool.
pub const ROOT_NAME: &str = "node0000";

#[derive(Debug, Clone)]
pub struct PoolSetup {
    pub dir: PathBuf,
    pub study: StudyConfig,
    pub coordinates: CoordinateSet,
    /// Unrestrained presampling trajectory the root node stands for.
    pub presampling: PathBuf,
    /// Rescale linear coordinates to the spread of the presampling.
    pub balance_linears: bool,
}

/// Creates a pool whose root node holds the presampling trajectory.
///
/// The root starts out refined: it never joins the partition, it only seeds
/// the first discretisation.
#[instrument(skip_all, name = "create_pool", fields(dir = %setup.dir.display()))]
pub fn run(setup: &PoolSetup, reporter: &ProgressReporter) -> Result<Pool, EngineError> {
    reporter.report(Progress::PhaseStart {
        name: "Creating Pool",
    });

    if !setup.presampling.exists() {
        return Err(EngineError::Precondition(format!(
            "presampling trajectory '{}' does not exist",
            setup.presampling.display()
        )));
    }

    let coordinates = if setup.balance_linears {
        let presampling = setup.coordinates.read_trajectory(&setup.presampling)?;
        let balanced = setup.coordinates.balanced(&presampling)?;
        info!("Balanced linear coordinates against the presampling");
        balanced
    } else {
        setup.coordinates.clone()
    };

    let mut study = setup.study.clone();
    study.alpha = None;
    let mut pool = Pool::create(&setup.dir, &study, &coordinates, ROOT_NAME)?;

    let root = pool.create_node(NodeRecord::new(NodeState::Refined));
    if pool.node(root).name() != ROOT_NAME {
        return Err(EngineError::Precondition(format!(
            "nodes directory of '{}' is not empty",
            setup.dir.display()
        )));
    }
    pool.node_mut(root).save()?;
    link_or_copy(&setup.presampling, &pool.node(root).trajectory_path())?;
    pool.save()?;

    info!(root = ROOT_NAME, coordinates = coordinates.len(), "Pool created");
    reporter.report(Progress::PhaseFinish);
    Ok(pool)
}

fn link_or_copy(source: &Path, target: &Path) -> Result<(), EngineError> {
    let source = fs::canonicalize(source).map_err(EngineError::io(source))?;
    if fs::hard_link(&source, target).is_err() {
        warn!(
            source = %source.display(),
            "Could not hard-link the presampling trajectory, copying it"
        );
        fs::copy(&source, target).map_err(EngineError::io(target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pool::tests::{distance_set, study, write_distances};
    use tempfile::tempdir;

    fn setup(dir: &Path, balance: bool) -> PoolSetup {
        let presampling = dir.join("presampling.trr");
        write_distances(&presampling, &[1.0, 2.0, 3.0, 2.0]);
        PoolSetup {
            dir: dir.join("pool"),
            study: study(Some(3.0)),
            coordinates: distance_set(),
            presampling,
            balance_linears: balance,
        }
    }

    #[test]
    fn root_node_holds_the_presampling() {
        let dir = tempdir().unwrap();
        let pool = run(&setup(dir.path(), false), &ProgressReporter::new()).unwrap();

        let root = pool.root().unwrap();
        let node = pool.node(root);
        assert_eq!(node.name(), ROOT_NAME);
        assert_eq!(node.state(), NodeState::Refined);
        assert!(!node.is_partition());
        assert!(node.has_trajectory());
        assert_eq!(pool.alpha(), None);
        assert!(pool.analysis_dir().is_dir());

        let reopened = Pool::open(pool.dir()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.record().root_name, ROOT_NAME);
    }

    #[test]
    fn balancing_rescales_linear_coordinates() {
        let dir = tempdir().unwrap();
        let mut pool = run(&setup(dir.path(), true), &ProgressReporter::new()).unwrap();

        let root = pool.root().unwrap();
        let frames = pool.trajectory(root).unwrap().frames.clone();
        let mean = frames.mean().unwrap().value(0, 0);
        let var = frames.var().unwrap().value(0, 0);
        assert!(mean.abs() < 1e-5);
        assert!((var - 0.5).abs() < 1e-5);
    }

    #[test]
    fn existing_pool_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let setup = setup(dir.path(), false);
        run(&setup, &ProgressReporter::new()).unwrap();
        let err = run(&setup, &ProgressReporter::new()).unwrap_err();
        assert!(matches!(err, EngineError::Pool(_)));
    }

    #[test]
    fn missing_presampling_is_rejected() {
        let dir = tempdir().unwrap();
        let mut setup = setup(dir.path(), false);
        setup.presampling = dir.path().join("absent.trr");
        assert!(matches!(
            run(&setup, &ProgressReporter::new()),
            Err(EngineError::Precondition(_))
        ));
    }
}
