use super::config::{ConfigError, StudyConfig, StudyConfigBuilder};
use super::node::{
    io_error, unix_timestamp, Node, NodeError, NodeRecord, NodeState, SampledTrajectory,
    TrajectoryCache,
};
use crate::core::constants::RANGE_SAMPLES;
use crate::core::coords::{CoordinateError, CoordinateSet, TrajectoryFrames};
use crate::core::io::traits::{SnapshotError, SnapshotFile};
use crate::core::phi::{PhiError, PhiPartition};
use crate::core::utils::numeric::linspace;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

new_key_type! {
    pub struct NodeId;
}

pub const POOL_FILE: &str = "pool-desc.toml";
pub const INTERNALS_FILE: &str = "internals.txt";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("A pool already exists in '{0}'")]
    AlreadyExists(String),
    #[error("Pool alpha has not been set; create the first nodes before using the partition")]
    AlphaUnset,
    #[error("Pool has no root node")]
    NoRoot,
    #[error("Node '{0}' must be locked by this process")]
    NotLocked(String),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Coordinates(#[from] CoordinateError),
    #[error(transparent)]
    Phi(#[from] PhiError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKind {
    Discretization,
    Removal,
}

/// Append-only record of a change to the partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: HistoryKind,
    /// Node that was refined or removed.
    pub node: String,
    pub node_state: NodeState,
    /// Pool size before the event.
    pub size: usize,
    /// Alpha before the event.
    pub alpha: Option<f64>,
    pub timestamp: u64,
}

/// Persisted pool attributes (`pool-desc.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub format_version: u32,
    pub alpha: Option<f64>,
    pub temperature: f64,
    pub gr_threshold: f64,
    pub gr_chains: usize,
    /// Coordinate definition file, relative to the pool directory.
    pub internals_file: String,
    pub root_name: String,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl SnapshotFile for PoolRecord {
    const FORMAT_VERSION: u32 = 1;

    fn format_version(&self) -> u32 {
        self.format_version
    }
}

/// A study directory: the pool snapshot plus every node under `nodes/`.
///
/// The directory listing is authoritative; the in-memory registry is a cache
/// brought up to date with [`Pool::reload_nodes`].
#[derive(Debug)]
pub struct Pool {
    dir: PathBuf,
    record: PoolRecord,
    coords: CoordinateSet,
    nodes: SlotMap<NodeId, Node>,
    order: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
}

impl Pool {
    /// Creates the directory layout and the pool snapshot. Nodes are added by
    /// the caller.
    pub fn create(
        dir: &Path,
        study: &StudyConfig,
        coords: &CoordinateSet,
        root_name: &str,
    ) -> Result<Self, PoolError> {
        let pool_file = dir.join(POOL_FILE);
        if pool_file.exists() {
            return Err(PoolError::AlreadyExists(dir.display().to_string()));
        }
        for sub in ["nodes", "analysis"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        coords.write_to_path(&dir.join(INTERNALS_FILE))?;
        let record = PoolRecord {
            format_version: PoolRecord::FORMAT_VERSION,
            alpha: study.alpha,
            temperature: study.temperature,
            gr_threshold: study.gr_threshold,
            gr_chains: study.gr_chains,
            internals_file: INTERNALS_FILE.to_string(),
            root_name: root_name.to_string(),
            history: Vec::new(),
        };
        record.write_to_path(&pool_file)?;
        info!(pool = %dir.display(), coordinates = coords.len(), "Created pool");
        Ok(Self {
            dir: dir.to_path_buf(),
            record,
            coords: coords.clone(),
            nodes: SlotMap::with_key(),
            order: Vec::new(),
            by_name: HashMap::new(),
        })
    }

    /// Loads the pool snapshot, the coordinate definition and all nodes.
    #[instrument(skip_all, name = "open_pool", fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self, PoolError> {
        let record = PoolRecord::read_from_path(&dir.join(POOL_FILE))?;
        let coords = CoordinateSet::read_from_path(&dir.join(&record.internals_file))?;
        let mut pool = Self {
            dir: dir.to_path_buf(),
            record,
            coords,
            nodes: SlotMap::with_key(),
            order: Vec::new(),
            by_name: HashMap::new(),
        };
        pool.reload_nodes()?;
        debug!(nodes = pool.len(), "Opened pool");
        Ok(pool)
    }

    pub fn save(&self) -> Result<(), PoolError> {
        Ok(self.record.write_to_path(&self.dir.join(POOL_FILE))?)
    }

    pub fn reload(&mut self) -> Result<(), PoolError> {
        self.record = PoolRecord::read_from_path(&self.dir.join(POOL_FILE))?;
        Ok(())
    }

    /// Rescans `nodes/`: known nodes are refreshed if their snapshot changed,
    /// new ones are added, none are dropped.
    pub fn reload_nodes(&mut self) -> Result<(), PoolError> {
        let nodes_dir = self.nodes_dir();
        let entries = fs::read_dir(&nodes_dir).map_err(io_error(&nodes_dir))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| nodes_dir.join(name).join(format!("{name}_desc.toml")).exists())
            .collect();
        names.sort();

        for name in names {
            match self.by_name.get(&name) {
                Some(&id) => {
                    let node = &mut self.nodes[id];
                    if node.is_outdated() {
                        node.reload()?;
                    }
                }
                None => {
                    let node = Node::load(&nodes_dir, &name)?;
                    self.register(node);
                }
            }
        }
        Ok(())
    }

    fn register(&mut self, node: Node) -> NodeId {
        let name = node.name().to_string();
        let id = self.nodes.insert(node);
        self.by_name.insert(name, id);
        self.order.push(id);
        let nodes = &self.nodes;
        self.order.sort_by(|a, b| nodes[*a].name().cmp(nodes[*b].name()));
        id
    }

    /// Registers a new node under the next unused `nodeNNNN` name. Nothing
    /// is written until the node is saved.
    pub fn create_node(&mut self, record: NodeRecord) -> NodeId {
        let nodes_dir = self.nodes_dir();
        let name = (0..)
            .map(|i| format!("node{i:04}"))
            .find(|name| !self.by_name.contains_key(name) && !nodes_dir.join(name).exists())
            .unwrap_or_default();
        self.register(Node::new(&nodes_dir, name, record))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
    pub fn nodes_dir(&self) -> PathBuf {
        self.dir.join("nodes")
    }
    pub fn analysis_dir(&self) -> PathBuf {
        self.dir.join("analysis")
    }
    pub fn record(&self) -> &PoolRecord {
        &self.record
    }
    pub fn coordinates(&self) -> &CoordinateSet {
        &self.coords
    }
    pub fn alpha(&self) -> Option<f64> {
        self.record.alpha
    }
    pub fn set_alpha(&mut self, alpha: f64) {
        self.record.alpha = Some(alpha);
    }
    pub fn history(&self) -> &[HistoryEvent] {
        &self.record.history
    }

    pub fn study(&self) -> Result<StudyConfig, PoolError> {
        Ok(StudyConfigBuilder::new()
            .alpha(self.record.alpha)
            .temperature(self.record.temperature)
            .gr_threshold(self.record.gr_threshold)
            .gr_chains(self.record.gr_chains)
            .build()?)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Node ids sorted by name.
    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order.iter().map(|&id| (id, &self.nodes[id]))
    }
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }
    pub fn require(&self, name: &str) -> Result<NodeId, PoolError> {
        self.get(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()).into())
    }
    pub fn root(&self) -> Option<NodeId> {
        self.get(&self.record.root_name)
    }

    /// Ids of the nodes matching `predicate`, in name order.
    pub fn select(&self, predicate: impl Fn(&Node) -> bool) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| predicate(n))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        let name = self.nodes[parent].name().to_string();
        self.select(|n| n.parent() == Some(name.as_str()))
    }

    /// Locks every currently unlocked node of `ids`, waits `guard`, and
    /// returns the nodes this process actually owns afterwards.
    pub fn multilock(&self, ids: &[NodeId], guard: Duration) -> Result<Vec<NodeId>, PoolError> {
        let mut locked = Vec::with_capacity(ids.len());
        for &id in ids {
            if self.nodes[id].is_locked() {
                continue;
            }
            match self.nodes[id].lock(Duration::ZERO) {
                Ok(true) => locked.push(id),
                Ok(false) => {}
                Err(e) => {
                    self.release_owned(&locked);
                    return Err(e.into());
                }
            }
        }
        if !locked.is_empty() && !guard.is_zero() {
            debug!(nodes = locked.len(), ?guard, "Waiting for node multilock");
            thread::sleep(guard);
        }
        let mut owned = Vec::with_capacity(locked.len());
        for &id in &locked {
            match self.nodes[id].owns_lock() {
                Ok(true) => owned.push(id),
                Ok(false) => {}
                Err(e) => {
                    self.release_owned(&locked);
                    return Err(e.into());
                }
            }
        }
        Ok(owned)
    }

    /// Best-effort release of the locks of `ids` this process still holds,
    /// used while another error is being propagated.
    pub fn release_owned(&self, ids: &[NodeId]) {
        for &id in ids {
            let node = &self.nodes[id];
            let released = node.owns_lock().and_then(|owns| if owns { node.unlock() } else { Ok(()) });
            if let Err(e) = released {
                warn!(node = %node.name(), error = %e, "Could not release node lock");
            }
        }
    }

    pub fn unlock(&self, ids: &[NodeId]) -> Result<(), PoolError> {
        for &id in ids {
            self.nodes[id].unlock()?;
        }
        Ok(())
    }

    /// Records that `node` was (or is about to be) discretised.
    pub fn record_discretization(&mut self, node: NodeId) {
        self.push_history(HistoryKind::Discretization, node);
    }

    fn push_history(&mut self, kind: HistoryKind, node: NodeId) {
        let node = &self.nodes[node];
        self.record.history.push(HistoryEvent {
            kind,
            node: node.name().to_string(),
            node_state: node.state(),
            size: self.order.len(),
            alpha: self.record.alpha,
            timestamp: unix_timestamp(),
        });
    }

    /// Deletes a node this process holds the lock of, together with its
    /// directory, and records the removal in the history.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), PoolError> {
        let node = &self.nodes[id];
        if !node.owns_lock()? {
            return Err(PoolError::NotLocked(node.name().to_string()));
        }
        let dir = node.dir().to_path_buf();
        fs::remove_dir_all(&dir).map_err(io_error(&dir))?;

        self.push_history(HistoryKind::Removal, id);
        if let Some(node) = self.nodes.remove(id) {
            self.by_name.remove(node.name());
            warn!(node = %node.name(), "Removed node");
        }
        self.order.retain(|&other| other != id);
        self.save()
    }

    /// Positions of `ids` stacked into one instance.
    pub fn positions(&self, ids: &[NodeId]) -> Result<TrajectoryFrames, PoolError> {
        let frames = ids
            .iter()
            .map(|&id| self.nodes[id].position_frames(&self.coords))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TrajectoryFrames::stack(&frames)?)
    }

    /// Ids of the nodes forming the current partition.
    pub fn partition_ids(&self) -> Vec<NodeId> {
        self.select(Node::is_partition)
    }

    /// Phi partition over the given nodes.
    pub fn partition_of(&self, ids: &[NodeId]) -> Result<PhiPartition, PoolError> {
        let alpha = self.record.alpha.ok_or(PoolError::AlphaUnset)?;
        let centres = ids
            .iter()
            .map(|&id| self.nodes[id].position_frames(&self.coords))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PhiPartition::new(alpha, centres)?)
    }

    /// Phi partition over every active node.
    pub fn partition(&self) -> Result<PhiPartition, PoolError> {
        self.partition_of(&self.partition_ids())
    }

    /// The node's trajectory in coordinate space with frame weights
    /// `phi * exp(beta * penalty)` (unit weights for unrestrained nodes).
    /// Cached until the trajectory file changes.
    pub fn trajectory(&mut self, id: NodeId) -> Result<Arc<SampledTrajectory>, PoolError> {
        let node = &self.nodes[id];
        let path = node.trajectory_path();
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|_| NodeError::MissingTrajectory {
                name: node.name().to_string(),
                path: path.display().to_string(),
            })?;
        if let Some(cache) = &node.cache {
            if cache.modified >= modified {
                return Ok(Arc::clone(&cache.trajectory));
            }
        }

        info!(node = %node.name(), path = %path.display(), "Loading trajectory");
        let frames = self.coords.read_trajectory(&path)?;
        let n_frames = frames.n_frames();
        let sampled = match (&node.record().restraints, &node.record().position) {
            (Some(restraints), Some(_)) => {
                let centre = node.position_frames(&self.coords)?;
                let phi = self.partition()?.phi(&frames, &centre)?;
                let beta = self.study()?.beta();
                let penalty: Vec<f64> = (0..n_frames)
                    .map(|f| {
                        restraints
                            .iter()
                            .enumerate()
                            .map(|(c, r)| r.energy(frames.value(f, c)))
                            .sum()
                    })
                    .collect();
                let weights = DVector::from_iterator(
                    n_frames,
                    phi.iter().zip(&penalty).map(|(p, e)| p * (beta * e).exp()),
                );
                SampledTrajectory {
                    frames: frames.with_weights(weights)?,
                    phi: phi.iter().copied().collect(),
                    penalty,
                }
            }
            _ => SampledTrajectory {
                frames: frames.with_weights(DVector::from_element(n_frames, 1.0))?,
                phi: vec![0.0; n_frames],
                penalty: vec![0.0; n_frames],
            },
        };

        let trajectory = Arc::new(sampled);
        self.nodes[id].cache = Some(TrajectoryCache {
            modified,
            trajectory: Arc::clone(&trajectory),
        });
        Ok(trajectory)
    }

    /// Sampling grid along coordinate `coord`: its natural range for
    /// dihedrals, otherwise the span of the root trajectory and all node
    /// positions, optionally widened by 10 % on both sides.
    pub fn coord_range(&mut self, coord: usize, slack: bool) -> Result<Vec<f64>, PoolError> {
        let c = self
            .coords
            .iter()
            .nth(coord)
            .ok_or(PhiError::CoordinateOutOfRange {
                index: coord,
                size: self.coords.len(),
            })?;
        if let Some((lower, upper)) = c.natural_range() {
            return Ok(linspace(lower, upper, RANGE_SAMPLES));
        }

        let root = self.root().ok_or(PoolError::NoRoot)?;
        let trajectory = self.trajectory(root)?;
        let mut values = trajectory.frames.column(coord);
        values.extend(
            self.iter()
                .filter_map(|(_, n)| n.record().position.as_ref())
                .filter_map(|p| p.get(coord).copied()),
        );
        let lower = values.iter().copied().fold(f64::INFINITY, f64::min);
        let upper = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(lower.is_finite() && upper.is_finite()) {
            return Err(CoordinateError::EmptyFrames.into());
        }
        let pad = if slack { 0.1 * (upper - lower) } else { 0.0 };
        Ok(linspace(lower - pad, upper + pad, RANGE_SAMPLES))
    }
}
