//! Table dependency ordering
//!
//! Write order must respect foreign keys: a table that reads another table's
//! populated row (a `Direct`/`Indexed` source naming that table) comes after
//! it. Within the slack the topology leaves, roles order the result: primary
//! first, standard tables next, per-target templates after them, the
//! multi-row files table last. Delete order is the exact reverse, so the
//! primary table always goes last when rows are purged.

use petgraph::graph::NodeIndex;
use petgraph::{Directed, Graph};
use std::collections::{HashMap, HashSet};

use super::{TableRole, TableSchema};

/// Error during dependency ordering
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// The schema set contains a reference cycle
    #[error("Table dependency cycle involving {0}")]
    Cycle(String),
}

fn role_rank(role: &TableRole) -> u8 {
    match role {
        TableRole::Primary { .. } => 0,
        TableRole::Standard => 1,
        TableRole::PerTarget => 2,
        TableRole::MultiRowPerSource => 3,
    }
}

/// Compute the table write order for a schema set.
///
/// Deterministic: among tables whose dependencies are satisfied, the one
/// with the lowest (role rank, name) is emitted next.
pub fn write_order<'a>(
    schemas: impl IntoIterator<Item = &'a TableSchema>,
) -> Result<Vec<String>, OrderError> {
    let schemas: Vec<&TableSchema> = schemas.into_iter().collect();
    let names: HashSet<&str> = schemas.iter().map(|s| s.name.as_str()).collect();

    // Build the dependency graph: edge A -> B when B reads from A.
    let mut graph = Graph::<&str, (), Directed>::new();
    let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();
    for schema in &schemas {
        let idx = graph.add_node(schema.name.as_str());
        node_map.insert(schema.name.as_str(), idx);
    }
    for schema in &schemas {
        let to = node_map[schema.name.as_str()];
        for row in schema.source_rows() {
            // Row names that are not tables refer to catalog-supplied rows.
            if row != schema.name && names.contains(row) {
                graph.add_edge(node_map[row], to, ());
            }
        }
    }

    let rank: HashMap<&str, u8> = schemas
        .iter()
        .map(|s| (s.name.as_str(), role_rank(&s.role)))
        .collect();

    // Kahn's algorithm, always taking the lowest (rank, name) ready node.
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, petgraph::Incoming).count()))
        .collect();
    let mut ordered = Vec::with_capacity(schemas.len());
    loop {
        let next = graph
            .node_indices()
            .filter(|idx| in_degree.get(idx) == Some(&0))
            .min_by_key(|idx| {
                let name = graph[*idx];
                (rank[name], name)
            });
        let Some(idx) = next else { break };
        in_degree.remove(&idx);
        for neighbor in graph.neighbors_directed(idx, petgraph::Outgoing) {
            if let Some(d) = in_degree.get_mut(&neighbor) {
                *d -= 1;
            }
        }
        ordered.push(graph[idx].to_string());
    }

    if ordered.len() != schemas.len() {
        let stuck = in_degree
            .keys()
            .map(|idx| graph[*idx])
            .min()
            .unwrap_or("<unknown>");
        return Err(OrderError::Cycle(stuck.to_string()));
    }
    Ok(ordered)
}

/// Delete order: reverse write order, so dependents go before the primary.
pub fn delete_order<'a>(
    schemas: impl IntoIterator<Item = &'a TableSchema>,
) -> Result<Vec<String>, OrderError> {
    let mut order = write_order(schemas)?;
    order.reverse();
    Ok(order)
}
