use super::lock::{DistributedLock, FileLock, LivenessCheck, LockError};
use crate::core::coords::{CoordinateError, CoordinateSet, TrajectoryFrames};
use crate::core::io::traits::{SnapshotError, SnapshotFile};
use crate::core::phi::PhiError;
use crate::core::restraint::Restraint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Node '{0}' must be locked by this process")]
    NotLocked(String),

    #[error("Node '{name}': transition {from} -> {to} is not allowed")]
    InvalidTransition {
        name: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("Unknown node state '{0}'")]
    UnknownState(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Node '{0}' has no position")]
    NoPosition(String),

    #[error("Node '{name}' has no trajectory at '{path}'")]
    MissingTrajectory { name: String, path: String },

    #[error("I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Coordinates(#[from] CoordinateError),

    #[error(transparent)]
    Phi(#[from] PhiError),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> NodeError + '_ {
    move |source| NodeError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Lifecycle state of a sampling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    CreatingAPartition,
    Created,
    GromppAble,
    MdrunAble,
    Converged,
    NotConverged,
    MdrunFailed,
    Refined,
    Ready,
}

impl NodeState {
    pub const ALL: [NodeState; 9] = [
        NodeState::CreatingAPartition,
        NodeState::Created,
        NodeState::GromppAble,
        NodeState::MdrunAble,
        NodeState::Converged,
        NodeState::NotConverged,
        NodeState::MdrunFailed,
        NodeState::Refined,
        NodeState::Ready,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::CreatingAPartition => "creating-a-partition",
            NodeState::Created => "created",
            NodeState::GromppAble => "grompp-able",
            NodeState::MdrunAble => "mdrun-able",
            NodeState::Converged => "converged",
            NodeState::NotConverged => "not-converged",
            NodeState::MdrunFailed => "mdrun-failed",
            NodeState::Refined => "refined",
            NodeState::Ready => "ready",
        }
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (CreatingAPartition, Created)
                | (Created, GromppAble)
                | (GromppAble, MdrunAble)
                | (MdrunAble, MdrunAble | Converged | NotConverged | MdrunFailed | Ready)
                | (Converged, Refined | Ready)
                | (NotConverged, Refined | Ready | MdrunAble)
                | (MdrunFailed, MdrunAble)
        )
    }

    /// Sampling of the node has finished, successfully or not.
    pub fn is_sampled(self) -> bool {
        matches!(
            self,
            NodeState::Converged | NodeState::NotConverged | NodeState::Refined | NodeState::Ready
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| NodeError::UnknownState(s.to_string()))
    }
}

/// Persisted attributes of a node (`<name>_desc.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub format_version: u32,
    pub state: NodeState,
    pub parent: Option<String>,
    /// Frame of the parent trajectory the node was started from.
    pub parent_frame: Option<usize>,
    pub created: u64,
    pub extensions_counter: u32,
    pub extensions_max: u32,
    /// Extension length in ps.
    pub extensions_length: f64,
    /// Initial sampling length in ps.
    pub sampling_length: f64,
    /// Node centre in coordinate space.
    pub position: Option<Vec<f64>>,
    pub restraints: Option<Vec<Restraint>>,
}

impl NodeRecord {
    pub fn new(state: NodeState) -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            state,
            parent: None,
            parent_frame: None,
            created: unix_timestamp(),
            extensions_counter: 0,
            extensions_max: 0,
            extensions_length: 0.0,
            sampling_length: 0.0,
            position: None,
            restraints: None,
        }
    }
}

impl SnapshotFile for NodeRecord {
    const FORMAT_VERSION: u32 = 1;

    fn format_version(&self) -> u32 {
        self.format_version
    }
}

/// Derived quantities of a node (`<name>_observables.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observables {
    pub format_version: u32,
    pub weight_direct: Option<f64>,
    pub weight_corrected: Option<f64>,
    /// Mean of the phi-weighted potential energy in kJ/mol.
    pub mean_v: Option<f64>,
    pub std_v: Option<f64>,
    pub n_refpoints: Option<usize>,
    /// Entropy in kJ/(mol K), from entropy reweighting.
    pub entropy: Option<f64>,
    /// `mean_v - T S` in kJ/mol, from entropy reweighting.
    pub free_energy: Option<f64>,
    /// Gelman-Rubin shrink factors of the last convergence test.
    pub shrink_factors: Option<Vec<f64>>,
}

impl Default for Observables {
    fn default() -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            weight_direct: None,
            weight_corrected: None,
            mean_v: None,
            std_v: None,
            n_refpoints: None,
            entropy: None,
            free_energy: None,
            shrink_factors: None,
        }
    }
}

impl SnapshotFile for Observables {
    const FORMAT_VERSION: u32 = 1;

    fn format_version(&self) -> u32 {
        self.format_version
    }
}

/// Coordinate-space view of a node's trajectory with its frame weights.
#[derive(Debug, Clone)]
pub struct SampledTrajectory {
    /// Frames weighted by `phi / exp(-beta penalty)`.
    pub frames: TrajectoryFrames,
    pub phi: Vec<f64>,
    pub penalty: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct TrajectoryCache {
    pub(crate) modified: SystemTime,
    pub(crate) trajectory: std::sync::Arc<SampledTrajectory>,
}

/// One sampling unit of a pool, backed by `nodes/<name>/`.
#[derive(Debug)]
pub struct Node {
    name: String,
    dir: PathBuf,
    record: NodeRecord,
    observables: Observables,
    lock: FileLock,
    loaded_at: Option<SystemTime>,
    pub(crate) cache: Option<TrajectoryCache>,
}

impl Node {
    pub(crate) fn new(nodes_dir: &Path, name: String, record: NodeRecord) -> Self {
        let dir = nodes_dir.join(&name);
        Self {
            lock: FileLock::new(dir.join("lock")),
            name,
            dir,
            record,
            observables: Observables::default(),
            loaded_at: None,
            cache: None,
        }
    }

    pub(crate) fn load(nodes_dir: &Path, name: &str) -> Result<Self, NodeError> {
        let mut node = Self::new(nodes_dir, name.to_string(), NodeRecord::new(NodeState::Created));
        node.reload()?;
        Ok(node)
    }

    /// Re-reads both snapshots from disk.
    pub fn reload(&mut self) -> Result<(), NodeError> {
        // Filesystem timestamps have a resolution of one second.
        let started = SystemTime::now() - Duration::from_secs(1);
        self.record = NodeRecord::read_from_path(&self.desc_path())?;
        let obs_path = self.observables_path();
        self.observables = if obs_path.exists() {
            Observables::read_from_path(&obs_path)?
        } else {
            Observables::default()
        };
        self.loaded_at = Some(started);
        trace!(node = %self.name, state = %self.record.state, "Reloaded node");
        Ok(())
    }

    /// Whether the snapshot on disk changed since it was last read.
    pub fn is_outdated(&self) -> bool {
        let Some(loaded) = self.loaded_at else {
            return true;
        };
        fs::metadata(self.desc_path())
            .and_then(|m| m.modified())
            .is_ok_and(|modified| modified > loaded)
    }

    /// Persists both snapshots. Requires the lock unless the node directory
    /// does not exist yet.
    pub fn save(&mut self) -> Result<(), NodeError> {
        if self.dir.exists() {
            if !self.lock.owns()? {
                return Err(NodeError::NotLocked(self.name.clone()));
            }
        } else {
            fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        }
        self.record.write_to_path(&self.desc_path())?;
        self.observables.write_to_path(&self.observables_path())?;
        self.loaded_at = fs::metadata(self.desc_path())
            .and_then(|m| m.modified())
            .ok();
        debug!(node = %self.name, state = %self.record.state, "Saved node");
        Ok(())
    }

    pub fn lock(&self, guard: Duration) -> Result<bool, NodeError> {
        Ok(self.lock.try_acquire(guard)?)
    }

    pub fn unlock(&self) -> Result<(), NodeError> {
        Ok(self.lock.release()?)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn owns_lock(&self) -> Result<bool, NodeError> {
        Ok(self.lock.owns()?)
    }

    /// `None` when unlocked, otherwise whether the holder is still running.
    pub fn is_lock_valid(&self, check: &dyn LivenessCheck) -> Result<Option<bool>, NodeError> {
        Ok(self.lock.is_holder_alive(check)?)
    }

    pub fn file_lock(&self) -> &FileLock {
        &self.lock
    }

    /// Moves the node to `next`, refusing transitions outside the lifecycle.
    pub fn set_state(&mut self, next: NodeState) -> Result<(), NodeError> {
        let from = self.record.state;
        if !from.can_transition_to(next) {
            return Err(NodeError::InvalidTransition {
                name: self.name.clone(),
                from,
                to: next,
            });
        }
        debug!(node = %self.name, %from, to = %next, "Node state transition");
        self.record.state = next;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    pub fn state(&self) -> NodeState {
        self.record.state
    }
    pub fn record(&self) -> &NodeRecord {
        &self.record
    }
    pub fn record_mut(&mut self) -> &mut NodeRecord {
        &mut self.record
    }
    pub fn observables(&self) -> &Observables {
        &self.observables
    }
    pub fn observables_mut(&mut self) -> &mut Observables {
        &mut self.observables
    }
    pub fn parent(&self) -> Option<&str> {
        self.record.parent.as_deref()
    }

    pub fn has_restraints(&self) -> bool {
        self.record.restraints.is_some()
    }

    /// Contributes a phi function to the partition.
    pub fn is_partition(&self) -> bool {
        self.record.state == NodeState::CreatingAPartition
            || (self.has_restraints() && self.record.state != NodeState::Refined)
    }

    /// Unrestrained node, e.g. the root or a transition run.
    pub fn is_transition(&self) -> bool {
        !self.has_restraints()
    }

    pub fn is_sampled(&self) -> bool {
        self.record.state.is_sampled()
    }

    /// Runnable node that was already sampled at least once.
    pub fn is_extended(&self) -> bool {
        self.record.state == NodeState::MdrunAble && self.record.extensions_counter > 0
    }

    pub fn has_trajectory(&self) -> bool {
        self.trajectory_path().exists()
    }

    /// Position as a single frame of `coords`.
    pub fn position_frames(&self, coords: &CoordinateSet) -> Result<TrajectoryFrames, NodeError> {
        let position = self
            .record
            .position
            .as_ref()
            .ok_or_else(|| NodeError::NoPosition(self.name.clone()))?;
        Ok(TrajectoryFrames::single(coords.clone(), position)?)
    }

    pub fn desc_path(&self) -> PathBuf {
        self.dir.join(format!("{}_desc.toml", self.name))
    }
    pub fn observables_path(&self) -> PathBuf {
        self.dir.join(format!("{}_observables.toml", self.name))
    }
    pub fn trajectory_path(&self) -> PathBuf {
        self.dir.join(format!("{}.trr", self.name))
    }
    /// Single-frame trajectory the sampling starts from.
    pub fn start_frame_path(&self) -> PathBuf {
        self.dir.join(format!("{}_start.trr", self.name))
    }
    pub fn convergence_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_convergence.log", self.name))
    }
    pub fn reweighting_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_reweighting.log", self.name))
    }

    /// Appends `text` to one of the node's log files.
    pub fn append_log(&self, path: &Path, text: &str) -> Result<(), NodeError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error(path))?;
        writeln!(file, "{text}").map_err(io_error(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn saved_node(nodes_dir: &Path) -> Node {
        let mut record = NodeRecord::new(NodeState::CreatingAPartition);
        record.position = Some(vec![0.5, -1.0]);
        record.restraints = Some(vec![Restraint::Dihedral {
            atoms: vec![0, 1, 2, 3],
            phi0: 0.5,
            dphi: 0.1,
            k: 20.0,
        }]);
        record.parent = Some("node0000".to_string());
        let mut node = Node::new(nodes_dir, "node0001".to_string(), record);
        node.save().unwrap();
        node
    }

    #[test]
    fn lifecycle_allows_documented_transitions_only() {
        use NodeState::*;
        assert!(CreatingAPartition.can_transition_to(Created));
        assert!(MdrunAble.can_transition_to(MdrunAble));
        assert!(NotConverged.can_transition_to(MdrunAble));
        assert!(MdrunFailed.can_transition_to(MdrunAble));
        assert!(!Converged.can_transition_to(MdrunAble));
        assert!(!Created.can_transition_to(MdrunAble));
        assert!(!Refined.can_transition_to(Ready));
    }

    #[test]
    fn states_round_trip_through_names() {
        for state in NodeState::ALL {
            assert_eq!(state.as_str().parse::<NodeState>().unwrap(), state);
        }
        assert!("em-mdrun-able".parse::<NodeState>().is_err());
    }

    #[test]
    fn first_save_creates_directory_without_lock() {
        let dir = tempdir().unwrap();
        let node = saved_node(dir.path());
        assert!(node.desc_path().exists());
        assert!(node.observables_path().exists());
        assert!(!node.is_locked());
    }

    #[test]
    fn save_of_existing_node_requires_lock() {
        let dir = tempdir().unwrap();
        let mut node = saved_node(dir.path());
        assert!(matches!(node.save(), Err(NodeError::NotLocked(_))));
        assert!(node.lock(Duration::ZERO).unwrap());
        node.set_state(NodeState::Created).unwrap();
        node.save().unwrap();
        node.unlock().unwrap();
    }

    #[test]
    fn reload_restores_persisted_record_and_observables() {
        let dir = tempdir().unwrap();
        let mut node = saved_node(dir.path());
        assert!(node.lock(Duration::ZERO).unwrap());
        node.observables_mut().weight_direct = Some(0.25);
        node.save().unwrap();

        let loaded = Node::load(dir.path(), "node0001").unwrap();
        assert_eq!(loaded.record(), node.record());
        assert_eq!(loaded.observables().weight_direct, Some(0.25));
        node.unlock().unwrap();
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_kept() {
        let dir = tempdir().unwrap();
        let mut node = saved_node(dir.path());
        let err = node.set_state(NodeState::Converged).unwrap_err();
        assert!(matches!(err, NodeError::InvalidTransition { .. }));
        assert_eq!(node.state(), NodeState::CreatingAPartition);
    }

    #[test]
    fn predicates_follow_state_and_restraints() {
        let dir = tempdir().unwrap();
        let mut node = saved_node(dir.path());
        assert!(node.is_partition());
        assert!(!node.is_transition());
        node.record_mut().state = NodeState::Refined;
        assert!(!node.is_partition());
        assert!(node.is_sampled());

        let root = Node::new(dir.path(), "node0000".into(), NodeRecord::new(NodeState::Refined));
        assert!(root.is_transition());
        assert!(!root.is_partition());
    }

    #[test]
    fn file_layout_uses_node_name() {
        let node = Node::new(Path::new("/pool/nodes"), "node0007".into(), NodeRecord::new(NodeState::Created));
        assert_eq!(node.desc_path(), Path::new("/pool/nodes/node0007/node0007_desc.toml"));
        assert_eq!(node.trajectory_path(), Path::new("/pool/nodes/node0007/node0007.trr"));
        assert_eq!(node.file_lock().path(), Path::new("/pool/nodes/node0007/lock"));
    }

    #[test]
    fn logs_are_appended() {
        let dir = tempdir().unwrap();
        let node = saved_node(dir.path());
        let log = node.convergence_log_path();
        node.append_log(&log, "first").unwrap();
        node.append_log(&log, "second").unwrap();
        assert_eq!(fs::read_to_string(log).unwrap(), "first\nsecond\n");
    }
}
