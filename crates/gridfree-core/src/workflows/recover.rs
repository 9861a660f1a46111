use super::{transition, with_multilock};
use crate::engine::error::EngineError;
use crate::engine::lock::LivenessCheck;
use crate::engine::node::NodeState;
use crate::engine::pool::{NodeId, Pool};
use crate::engine::progress::ProgressReporter;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Removes every node lock whose holder process is gone. Returns the names
/// of the freed nodes.
#[instrument(skip_all, name = "remove_stale_locks")]
pub fn remove_stale_locks(pool: &Pool, check: &dyn LivenessCheck) -> Result<Vec<String>, EngineError> {
    let mut freed = Vec::new();
    for (_, node) in pool.iter() {
        if node.file_lock().remove_if_stale(check)? {
            freed.push(node.name().to_string());
        }
    }
    if !freed.is_empty() {
        warn!(nodes = freed.len(), "Removed stale locks");
    }
    Ok(freed)
}

/// Sends failed nodes back to sampling. Nodes locked elsewhere are skipped.
#[instrument(skip_all, name = "recover_failed")]
pub fn recover_failed(
    pool: &mut Pool,
    guard: Duration,
    reporter: &ProgressReporter,
) -> Result<Vec<String>, EngineError> {
    let failed = pool.select(|n| n.state() == NodeState::MdrunFailed);
    let recovered = with_multilock(pool, &failed, guard, false, |pool, owned| {
        let mut names = Vec::with_capacity(owned.len());
        for &id in owned {
            transition(pool, id, NodeState::MdrunAble, reporter)?;
            pool.node_mut(id).save()?;
            names.push(pool.node(id).name().to_string());
        }
        Ok(names)
    })?;
    if recovered.len() < failed.len() {
        warn!(
            skipped = failed.len() - recovered.len(),
            "Some failed nodes are locked by another process"
        );
    }
    info!(nodes = recovered.len(), "Recovered failed nodes");
    Ok(recovered)
}

/// Deletes the named nodes. The root and nodes with children cannot be
/// removed, and every node must be lockable.
#[instrument(skip_all, name = "remove_nodes")]
pub fn remove_nodes(pool: &mut Pool, names: &[String], guard: Duration) -> Result<(), EngineError> {
    let ids = names
        .iter()
        .map(|name| pool.require(name))
        .collect::<Result<Vec<NodeId>, _>>()?;
    for &id in &ids {
        let node = pool.node(id);
        if Some(id) == pool.root() {
            return Err(EngineError::Precondition("the root node cannot be removed".into()));
        }
        let children = pool.children(id);
        if children.iter().any(|child| !ids.contains(child)) {
            return Err(EngineError::Precondition(format!(
                "node '{}' still has children",
                node.name()
            )));
        }
    }

    let owned = pool.multilock(&ids, guard)?;
    if owned.len() != ids.len() {
        pool.unlock(&owned)?;
        return Err(EngineError::Precondition(
            "some nodes are locked by another process".into(),
        ));
    }
    for (done, &id) in owned.iter().enumerate() {
        if let Err(e) = pool.remove_node(id) {
            pool.release_owned(&owned[done..]);
            return Err(e.into());
        }
    }
    info!(nodes = names.len(), "Removed nodes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lock::{LockSignature, ProcessTableLiveness};
    use crate::engine::pool::HistoryKind;
    use crate::engine::pool::tests::jam_directory;
    use crate::workflows::tests::{force_sampled, seeded_pool};

    struct Gone;

    impl LivenessCheck for Gone {
        fn is_alive(&self, _holder: &LockSignature) -> Result<bool, crate::engine::lock::LockError> {
            Ok(false)
        }
    }

    #[test]
    fn only_dead_holders_lose_their_locks() {
        let (_dir, pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        assert!(pool.node(ids[0]).lock(Duration::ZERO).unwrap());

        let freed = remove_stale_locks(&pool, &ProcessTableLiveness::default()).unwrap();
        assert!(freed.is_empty());
        assert!(pool.node(ids[0]).is_locked());

        let freed = remove_stale_locks(&pool, &Gone).unwrap();
        assert_eq!(freed, vec!["node0001"]);
        assert!(!pool.node(ids[0]).is_locked());
    }

    #[test]
    fn failed_nodes_become_runnable_again() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[1], NodeState::MdrunFailed, &[1.0]);
        let recovered = recover_failed(&mut pool, Duration::ZERO, &ProgressReporter::new()).unwrap();
        assert_eq!(recovered, vec!["node0002"]);
        assert_eq!(pool.node(ids[1]).state(), NodeState::MdrunAble);
        assert!(!pool.node(ids[1]).is_locked());
        assert_eq!(pool.node(ids[0]).state(), NodeState::Created);
    }

    #[test]
    fn removed_node_disappears_with_a_history_entry() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        let dir = pool.node(ids[1]).dir().to_path_buf();
        remove_nodes(&mut pool, &["node0002".to_string()], Duration::ZERO).unwrap();

        assert!(!dir.exists());
        assert_eq!(pool.len(), 2);
        let last = pool.history().last().unwrap();
        assert_eq!(last.kind, HistoryKind::Removal);
        assert_eq!(last.node, "node0002");
        assert_eq!(Pool::open(pool.dir()).unwrap().len(), 2);
    }

    #[test]
    fn failed_removal_keeps_the_pool_usable() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        let Some(_jam) = jam_directory(pool.node(ids[0]).dir()) else {
            return;
        };
        let names = vec!["node0001".to_string(), "node0002".to_string()];
        assert!(remove_nodes(&mut pool, &names, Duration::ZERO).is_err());

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.iter().count(), 3);
        assert!(pool.get("node0001").is_some());
        assert!(pool.node(ids[1]).dir().exists());
        assert!(!pool.node(ids[1]).is_locked());
        assert!(pool.history().iter().all(|e| e.kind != HistoryKind::Removal));
    }

    #[test]
    fn root_and_parents_are_protected() {
        let (_dir, mut pool, _ids) = seeded_pool(&[0.0, 1.0], 0);
        let root = vec!["node0000".to_string()];
        assert!(matches!(
            remove_nodes(&mut pool, &root, Duration::ZERO),
            Err(EngineError::Precondition(_))
        ));
        assert!(remove_nodes(&mut pool, &["node0042".to_string()], Duration::ZERO).is_err());
        assert_eq!(pool.len(), 3);
    }
}
