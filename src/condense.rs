use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{BuildError, Result};
use crate::state::{Partition, PartitionID, Trace};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CondenseReport {
    // Strongly connected groups replaced by a single partition
    pub merged_groups: usize,
    // Partitions superseded by those merges
    pub absorbed: usize,
    pub self_loops: usize,
}

impl CondenseReport {
    pub fn is_noop(&self) -> bool {
        self.merged_groups == 0 && self.self_loops == 0
    }
}

/// Graph of live partitions with an edge for every parent -> child link.
/// Self-loops are kept so that callers can see them.
pub fn partition_graph(trace: &Trace) -> (DiGraph<PartitionID, ()>, BTreeMap<PartitionID, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for (id, _) in trace.partitions.live() {
        nodes.insert(id, graph.add_node(id));
    }
    for (id, partition) in trace.partitions.live() {
        for child in &partition.children {
            let child = trace.partitions.resolve(*child);
            if let (Some(from), Some(to)) = (nodes.get(&id), nodes.get(&child)) {
                graph.update_edge(*from, *to, ());
            }
        }
    }
    (graph, nodes)
}

/// Merge every cycle of partitions into one partition so that the
/// parent/child relation becomes a DAG.
pub fn condense(trace: &mut Trace) -> Result<CondenseReport> {
    let mut report = CondenseReport::default();
    let (graph, _) = partition_graph(trace);

    for component in tarjan_scc(&graph) {
        if let [node] = component.as_slice() {
            let id = graph[*node];
            let partition = trace.partitions.get_mut(id);
            let looped = partition.children.remove(&id);
            let looped = partition.parents.remove(&id) || looped;
            if looped {
                debug!("Dropping self-loop on partition {}", id);
                report.self_loops += 1;
            }
            continue;
        }

        let mut members: Vec<PartitionID> = component.iter().map(|n| graph[*n]).collect();
        members.sort();
        let merged = merge_partitions(trace, &members)?;
        debug!("Merged cycle {:?} into partition {}", members, merged);
        report.merged_groups += 1;
        report.absorbed += members.len();
    }

    if report.merged_groups > 0 {
        resolve_edges(trace);
    }

    let (graph, _) = partition_graph(trace);
    if is_cyclic_directed(&graph) {
        return Err(BuildError::invariant(
            "partition graph still has a cycle after condensation",
        ));
    }

    info!(
        "Merged {} cycles ({} partitions), {} partitions remain",
        report.merged_groups,
        report.absorbed,
        trace.partitions.live_count()
    );
    Ok(report)
}

fn merge_partitions(trace: &mut Trace, members: &[PartitionID]) -> Result<PartitionID> {
    let member_set: BTreeSet<PartitionID> = members.iter().copied().collect();
    let mut merged = Partition::new();
    for id in members {
        let partition = trace.partitions.get(*id);
        for (process, list) in &partition.events {
            merged
                .events
                .entry(*process)
                .or_default()
                .extend(list.iter().copied());
        }
        merged.parents.extend(partition.parents.iter().copied());
        merged.children.extend(partition.children.iter().copied());
    }
    merged.parents.retain(|p| !member_set.contains(p));
    merged.children.retain(|c| !member_set.contains(c));
    merged.sort_events(&trace.events);

    let merged_id = trace.partitions.create(merged);
    for id in members {
        trace.partitions.redirect(*id, merged_id)?;
    }
    Ok(merged_id)
}

/// Point every parent/child link and every comm event at the live
/// partition it now belongs to.
fn resolve_edges(trace: &mut Trace) {
    for id in trace.partitions.live_ids() {
        let partition = trace.partitions.get(id);
        let resolve = |set: &BTreeSet<PartitionID>| -> BTreeSet<PartitionID> {
            set.iter()
                .map(|p| trace.partitions.resolve(*p))
                .filter(|p| *p != id)
                .collect()
        };
        let parents = resolve(&partition.parents);
        let children = resolve(&partition.children);
        let partition = trace.partitions.get_mut(id);
        partition.parents = parents;
        partition.children = children;
    }

    let partitions = &trace.partitions;
    for event in trace.events.iter_mut() {
        if let Some(comm) = event.comm.as_mut() {
            comm.partition = comm.partition.map(|p| partitions.resolve(p));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::build_partitions;
    use crate::serialize::{EventRecord, MessageRecord, TraceRecords};
    use crate::state::EventID;

    fn trace(events: Vec<EventRecord>, messages: Vec<(u64, u64)>) -> Trace {
        let records = TraceRecords {
            events,
            messages: messages
                .into_iter()
                .map(|(s, r)| MessageRecord::new(s, r))
                .collect(),
            aggregates: Vec::new(),
        };
        let mut trace = Trace::from_records(&records).unwrap();
        build_partitions(&mut trace, true);
        trace
    }

    fn three_cycle() -> Trace {
        trace(
            vec![
                EventRecord::send(0, 0, 0, 1).set_phase(1),
                EventRecord::recv(1, 0, 10, 11).set_phase(2),
                EventRecord::send(2, 1, 0, 1).set_phase(2),
                EventRecord::recv(3, 1, 10, 11).set_phase(3),
                EventRecord::send(4, 2, 0, 1).set_phase(3),
                EventRecord::recv(5, 2, 10, 11).set_phase(1),
            ],
            vec![(0, 5), (2, 1), (4, 3)],
        )
    }

    #[test]
    fn test_three_cycle() {
        let mut t = three_cycle();
        assert_eq!(t.partitions.live_count(), 3);
        let (graph, _) = partition_graph(&t);
        assert!(is_cyclic_directed(&graph));

        let report = condense(&mut t).unwrap();
        assert_eq!(report.merged_groups, 1);
        assert_eq!(report.absorbed, 3);
        assert_eq!(t.partitions.live_count(), 1);

        let (id, partition) = t.partitions.live().next().unwrap();
        assert_eq!(partition.num_events(), 6);
        assert!(partition.parents.is_empty());
        assert!(partition.children.is_empty());
        for event in 0..6 {
            assert_eq!(t.partition_of(EventID(event)), Some(id));
            assert_eq!(t.event(EventID(event)).partition(), Some(id));
        }
    }

    #[test]
    fn test_idempotent() {
        let mut t = three_cycle();
        condense(&mut t).unwrap();
        let report = condense(&mut t).unwrap();
        assert!(report.is_noop());
        assert_eq!(t.partitions.live_count(), 1);
    }

    #[test]
    fn test_self_loop() {
        let mut t = trace(
            vec![EventRecord::send(0, 0, 0, 1), EventRecord::recv(1, 1, 2, 3)],
            vec![(0, 1)],
        );
        let p = t.partition_of(EventID(0)).unwrap();
        t.partitions.get_mut(p).children.insert(p);
        t.partitions.get_mut(p).parents.insert(p);

        let report = condense(&mut t).unwrap();
        assert_eq!(report.self_loops, 1);
        assert_eq!(report.merged_groups, 0);
        assert!(t.partitions.is_live(p));
        assert!(!t.partitions.get(p).children.contains(&p));
    }

    #[test]
    fn test_external_edges_survive_merge() {
        // Phase 0 feeds a two-partition cycle (phases 1 and 2) on both processes
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1).set_phase(0),
                EventRecord::recv(1, 1, 0, 1).set_phase(0),
                EventRecord::send(2, 0, 2, 3).set_phase(1),
                EventRecord::recv(3, 0, 10, 11).set_phase(2),
                EventRecord::send(4, 1, 2, 3).set_phase(2),
                EventRecord::recv(5, 1, 10, 11).set_phase(1),
                EventRecord::send(6, 0, 20, 21).set_phase(3),
            ],
            vec![(0, 1), (2, 5), (4, 3)],
        );
        assert_eq!(t.partitions.live_count(), 4);
        let head = t.partition_of(EventID(0)).unwrap();
        let tail = t.partition_of(EventID(6)).unwrap();

        let report = condense(&mut t).unwrap();
        assert_eq!(report.merged_groups, 1);
        assert_eq!(t.partitions.live_count(), 3);

        let merged = t.partition_of(EventID(2)).unwrap();
        assert_eq!(t.partition_of(EventID(4)), Some(merged));
        assert_eq!(
            t.partitions.get(merged).parents.iter().copied().collect::<Vec<_>>(),
            vec![head]
        );
        assert_eq!(
            t.partitions.get(merged).children.iter().copied().collect::<Vec<_>>(),
            vec![tail]
        );
        assert!(t.partitions.get(head).children.contains(&merged));
        assert!(t.partitions.get(tail).parents.contains(&merged));
    }
}
