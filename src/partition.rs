use std::collections::BTreeMap;

use log::{debug, info};
use petgraph::unionfind::UnionFind;

use crate::state::{EventID, Partition, PartitionID, Trace};

/// Group comm events into partitions: connected components under process
/// adjacency and message edges. With `split_phases`, adjacent comm events
/// on a process are only joined when they belong to the same phase.
/// Returns the number of partitions created.
pub fn build_partitions(trace: &mut Trace, split_phases: bool) -> usize {
    let comm_ids: Vec<EventID> = trace.comm_event_ids().collect();
    let mut dense = vec![None; trace.events.len()];
    for (idx, id) in comm_ids.iter().enumerate() {
        dense[id.0] = Some(idx);
    }

    let mut sets = UnionFind::<usize>::new(comm_ids.len());
    for (idx, id) in comm_ids.iter().enumerate() {
        let event = trace.event(*id);
        let Some(comm) = &event.comm else {
            continue;
        };
        if let Some(next) = comm.comm_next {
            if !split_phases || trace.event(next).phase == event.phase {
                if let Some(other) = dense[next.0] {
                    sets.union(idx, other);
                }
            }
        }
        for message_id in &comm.messages {
            let message = trace.message(*message_id);
            if message.sender != *id {
                continue;
            }
            if let Some(other) = dense[message.receiver.0] {
                sets.union(idx, other);
            }
        }
    }

    // comm_ids is in process order, so members are appended chronologically
    let mut components: BTreeMap<usize, PartitionID> = BTreeMap::new();
    for (idx, id) in comm_ids.iter().enumerate() {
        let root = sets.find(idx);
        let partition_id = *components
            .entry(root)
            .or_insert_with(|| trace.partitions.create(Partition::new()));
        let process = trace.event(*id).process;
        trace
            .partitions
            .get_mut(partition_id)
            .add_event(process, *id);
        if let Some(comm) = trace.comm_mut(*id) {
            comm.partition = Some(partition_id);
        }
    }

    link_partitions(trace);

    info!(
        "Built {} partitions from {} communication events",
        components.len(),
        comm_ids.len()
    );
    components.len()
}

/// Recompute parent/child sets of every live partition from the events:
/// a cross-partition message or process-order step from A to B makes A a
/// parent of B.
pub fn link_partitions(trace: &mut Trace) {
    for id in trace.partitions.live_ids() {
        let partition = trace.partitions.get_mut(id);
        partition.parents.clear();
        partition.children.clear();
    }

    let mut edges = Vec::new();
    for id in trace.comm_event_ids() {
        let Some(from) = trace.partition_of(id) else {
            continue;
        };
        let Some(comm) = trace.comm(id) else {
            continue;
        };
        if let Some(to) = comm.comm_next.and_then(|next| trace.partition_of(next)) {
            edges.push((from, to));
        }
        for message_id in &comm.messages {
            let message = trace.message(*message_id);
            if message.sender != id {
                continue;
            }
            if let Some(to) = trace.partition_of(message.receiver) {
                edges.push((from, to));
            }
        }
    }

    for (from, to) in edges {
        if from == to {
            continue;
        }
        trace.partitions.get_mut(from).children.insert(to);
        trace.partitions.get_mut(to).parents.insert(from);
        debug!("Partition {} is a parent of {}", from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{EventRecord, MessageRecord, TraceRecords};
    use crate::state::ProcessID;

    fn trace(events: Vec<EventRecord>, messages: Vec<(u64, u64)>) -> Trace {
        let records = TraceRecords {
            events,
            messages: messages
                .into_iter()
                .map(|(s, r)| MessageRecord::new(s, r))
                .collect(),
            aggregates: Vec::new(),
        };
        Trace::from_records(&records).unwrap()
    }

    #[test]
    fn test_single_message() {
        let mut t = trace(
            vec![EventRecord::send(0, 0, 0, 1), EventRecord::recv(1, 1, 5, 6)],
            vec![(0, 1)],
        );
        assert_eq!(build_partitions(&mut t, true), 1);
        let p = t.partition_of(EventID(0)).unwrap();
        assert_eq!(t.partition_of(EventID(1)), Some(p));
        let partition = t.partitions.get(p);
        assert_eq!(partition.events[&ProcessID(0)], vec![EventID(0)]);
        assert_eq!(partition.events[&ProcessID(1)], vec![EventID(1)]);
        assert!(partition.parents.is_empty() && partition.children.is_empty());
    }

    #[test]
    fn test_phases_split_partitions() {
        let events = vec![
            EventRecord::send(0, 0, 0, 1).set_phase(0),
            EventRecord::recv(1, 1, 2, 3).set_phase(0),
            EventRecord::send(2, 0, 4, 5).set_phase(1),
            EventRecord::recv(3, 1, 6, 7).set_phase(1),
        ];
        let mut t = trace(events.clone(), vec![(0, 1), (2, 3)]);
        assert_eq!(build_partitions(&mut t, true), 2);
        let first = t.partition_of(EventID(0)).unwrap();
        let second = t.partition_of(EventID(2)).unwrap();
        assert_ne!(first, second);
        assert!(t.partitions.get(first).children.contains(&second));
        assert!(t.partitions.get(second).parents.contains(&first));

        let mut t = trace(events, vec![(0, 1), (2, 3)]);
        assert_eq!(build_partitions(&mut t, false), 1);
    }

    #[test]
    fn test_singletons() {
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1).set_phase(0),
                EventRecord::new(1, 0, 1, 2),
                EventRecord::send(2, 1, 0, 1).set_phase(3),
            ],
            vec![],
        );
        assert_eq!(build_partitions(&mut t, true), 2);
        assert_eq!(t.partition_of(EventID(1)), None);
        for (_, partition) in t.partitions.live() {
            assert_eq!(partition.num_events(), 1);
        }
    }

    #[test]
    fn test_no_self_edges() {
        // A message from a later to an earlier event inside one partition
        let mut t = trace(
            vec![
                EventRecord::recv(0, 0, 0, 1),
                EventRecord::send(1, 0, 2, 3),
            ],
            vec![(1, 0)],
        );
        assert_eq!(build_partitions(&mut t, true), 1);
        let p = t.partition_of(EventID(0)).unwrap();
        assert!(!t.partitions.get(p).children.contains(&p));
        assert!(!t.partitions.get(p).parents.contains(&p));
    }
}
