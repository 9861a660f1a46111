use crate::engine::error::EngineError;
use crate::engine::node::{Node, NodeState};
use crate::engine::pool::Pool;
use serde::Serialize;
use std::io::Write;
use tracing::instrument;

/// One row of the pool summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub state: NodeState,
    pub parent: Option<String>,
    pub parent_frame: Option<usize>,
    pub restrained: bool,
    pub extensions: u32,
    pub weight_direct: Option<f64>,
    pub weight_corrected: Option<f64>,
    pub mean_v: Option<f64>,
    pub std_v: Option<f64>,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        let record = node.record();
        let obs = node.observables();
        Self {
            name: node.name().to_string(),
            state: node.state(),
            parent: record.parent.clone(),
            parent_frame: record.parent_frame,
            restrained: node.has_restraints(),
            extensions: record.extensions_counter,
            weight_direct: obs.weight_direct,
            weight_corrected: obs.weight_corrected,
            mean_v: obs.mean_v,
            std_v: obs.std_v,
        }
    }
}

pub fn summaries(pool: &Pool) -> Vec<NodeSummary> {
    pool.iter().map(|(_, node)| NodeSummary::from(node)).collect()
}

/// Number of nodes in every state, in lifecycle order; empty states are
/// omitted.
pub fn state_counts(pool: &Pool) -> Vec<(NodeState, usize)> {
    NodeState::ALL
        .into_iter()
        .map(|state| (state, pool.iter().filter(|(_, n)| n.state() == state).count()))
        .filter(|&(_, count)| count > 0)
        .collect()
}

/// Writes the node table as CSV.
#[instrument(skip_all, name = "export_pool")]
pub fn write_csv<W: Write>(pool: &Pool, out: W) -> Result<(), EngineError> {
    let mut writer = csv::Writer::from_writer(out);
    for row in summaries(pool) {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|source| EngineError::Io {
        path: "<export>".to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::tests::{force_sampled, seeded_pool};

    #[test]
    fn table_lists_every_node_with_its_state() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[0], NodeState::Converged, &[0.0]);

        let mut out = Vec::new();
        write_csv(&pool, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "name,state,parent,parent_frame,restrained,extensions,weight_direct,weight_corrected,mean_v,std_v"
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("node0000,refined,,,false,0"));
        assert!(lines[2].starts_with("node0001,converged,node0000,0,true,0"));
    }

    #[test]
    fn counts_follow_lifecycle_order() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0, 2.0], 0);
        force_sampled(&mut pool, ids[2], NodeState::MdrunFailed, &[2.0]);
        assert_eq!(
            state_counts(&pool),
            vec![
                (NodeState::Created, 2),
                (NodeState::MdrunFailed, 1),
                (NodeState::Refined, 1),
            ]
        );
    }
}
