use log::{info, warn};

use crate::layering::{layer_events, Edge};
use crate::state::{EventID, Trace};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StrideReport {
    pub strided: usize,
    pub max_stride: u64,
    pub released: usize,
}

pub fn analyze_strides(trace: &mut Trace) -> StrideReport {
    set_stride_relationships(trace);
    let report = calculate_strides(trace);
    update_strides(trace);
    info!(
        "Computed strides for {} sends, longest chain {}",
        report.strided, report.max_stride
    );
    report
}

/// Follow `step` from `start` (inclusive) past any receives.
fn walk_sends(
    trace: &Trace,
    start: Option<EventID>,
    step: impl Fn(EventID) -> Option<EventID>,
) -> Option<EventID> {
    let mut current = start;
    while let Some(id) = current {
        if trace.event(id).is_send() {
            return Some(id);
        }
        current = step(id);
    }
    None
}

fn next_send(trace: &Trace, start: Option<EventID>) -> Option<EventID> {
    walk_sends(trace, start, |id| trace.comm(id).and_then(|c| c.comm_next))
}

fn prev_send(trace: &Trace, start: Option<EventID>) -> Option<EventID> {
    walk_sends(trace, start, |id| trace.comm(id).and_then(|c| c.comm_prev))
}

/// First pass: link each send to the sends that follow it inside its
/// partition, both on its own process and behind each of its receivers.
/// Receives remember the surrounding sends of their partition.
pub fn set_stride_relationships(trace: &mut Trace) {
    for id in trace.comm_event_ids().collect::<Vec<_>>() {
        if let Some(comm) = trace.comm_mut(id) {
            comm.stride_parents.clear();
            comm.stride_children.clear();
            comm.last_send = None;
            comm.next_send = None;
            comm.stride = None;
        }
    }

    let mut links = Vec::new();
    let mut neighbours = Vec::new();
    for id in trace.comm_event_ids() {
        let partition = trace.partition_of(id);
        let same_partition = |other: &EventID| trace.partition_of(*other) == partition;
        let Some(comm) = trace.comm(id) else {
            continue;
        };
        if comm.is_recv() {
            let last = prev_send(trace, comm.comm_prev).filter(same_partition);
            let next = next_send(trace, comm.comm_next).filter(same_partition);
            neighbours.push((id, last, next));
            continue;
        }
        let mut children: Vec<EventID> = next_send(trace, comm.comm_next).into_iter().collect();
        for message_id in &comm.messages {
            let message = trace.message(*message_id);
            if message.sender == id {
                children.extend(next_send(trace, Some(message.receiver)));
            }
        }
        for child in children {
            if child != id && same_partition(&child) {
                links.push((id, child));
            }
        }
    }

    for (parent, child) in links {
        if let Some(comm) = trace.comm_mut(parent) {
            comm.stride_children.insert(child);
        }
        if let Some(comm) = trace.comm_mut(child) {
            comm.stride_parents.insert(parent);
        }
    }
    for (id, last, next) in neighbours {
        if let Some(comm) = trace.comm_mut(id) {
            comm.last_send = last;
            comm.next_send = next;
        }
    }
}

/// Second pass: a send's stride is the length of the longest stride chain
/// ending at it. Receives keep no stride.
pub fn calculate_strides(trace: &mut Trace) -> StrideReport {
    let nodes: Vec<EventID> = trace
        .comm_event_ids()
        .filter(|id| trace.event(*id).is_send())
        .collect();
    let mut edges = Vec::new();
    for id in &nodes {
        if let Some(comm) = trace.comm(*id) {
            edges.extend(comm.stride_children.iter().map(|c| Edge::soft(*id, *c)));
        }
    }

    let layering = layer_events(trace, &nodes, &edges);
    if !layering.dropped.is_empty() {
        warn!(
            "Released {} stride edges that ran against time",
            layering.dropped.len()
        );
    }
    for (id, stride) in &layering.layers {
        if let Some(comm) = trace.comm_mut(*id) {
            comm.stride = Some(*stride);
        }
    }
    StrideReport {
        strided: layering.layers.len(),
        max_stride: layering.max_layer().unwrap_or(0),
        released: layering.dropped.len(),
    }
}

/// Third pass: a receive's last send becomes whichever matched sender has
/// the largest stride.
pub fn update_strides(trace: &mut Trace) {
    let stride_of = |trace: &Trace, id: EventID| trace.comm(id).and_then(|c| c.stride);

    let mut updates = Vec::new();
    for id in trace.comm_event_ids() {
        let Some(comm) = trace.comm(id).filter(|c| c.is_recv()) else {
            continue;
        };
        let mut best = comm.last_send;
        let mut best_stride = best.and_then(|b| stride_of(trace, b));
        for message_id in &comm.messages {
            let sender = trace.message(*message_id).sender;
            let stride = stride_of(trace, sender);
            let better = match (best, stride, best_stride) {
                (None, _, _) => true,
                (Some(_), Some(s), Some(b)) => s > b,
                (Some(_), Some(_), None) => true,
                (Some(_), None, _) => false,
            };
            if better {
                best = Some(sender);
                best_stride = stride;
            }
        }
        if best != comm.last_send {
            updates.push((id, best));
        }
    }
    for (id, last_send) in updates {
        if let Some(comm) = trace.comm_mut(id) {
            comm.last_send = last_send;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::build_partitions;
    use crate::serialize::{EventRecord, MessageRecord, TraceRecords};

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

    #[test]
    fn test_chain() {
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1),
                EventRecord::recv(1, 1, 2, 3),
                EventRecord::send(2, 1, 4, 5),
                EventRecord::recv(3, 2, 6, 7),
            ],
            vec![(0, 1), (2, 3)],
        );
        let report = analyze_strides(&mut t);
        assert_eq!(report.strided, 2);
        assert_eq!(report.max_stride, 1);
        assert_eq!(report.released, 0);

        let s0 = t.comm(EventID(0)).unwrap();
        assert_eq!(s0.stride, Some(0));
        assert!(s0.stride_children.contains(&EventID(2)));
        let s1 = t.comm(EventID(2)).unwrap();
        assert_eq!(s1.stride, Some(1));
        assert!(s1.stride_parents.contains(&EventID(0)));

        let r1 = t.comm(EventID(1)).unwrap();
        assert_eq!(r1.stride, None);
        assert_eq!(r1.next_send, Some(EventID(2)));
        assert_eq!(r1.last_send, Some(EventID(0)));
        assert_eq!(t.comm(EventID(3)).unwrap().last_send, Some(EventID(2)));
    }

    #[test]
    fn test_partition_boundary() {
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1).set_phase(0),
                EventRecord::recv(1, 1, 2, 3).set_phase(0),
                EventRecord::send(2, 1, 4, 5).set_phase(1),
                EventRecord::recv(3, 2, 6, 7).set_phase(1),
            ],
            vec![(0, 1), (2, 3)],
        );
        analyze_strides(&mut t);
        assert!(t.comm(EventID(0)).unwrap().stride_children.is_empty());
        assert_eq!(t.comm(EventID(2)).unwrap().stride, Some(0));
        assert_eq!(t.comm(EventID(1)).unwrap().next_send, None);
    }

    #[test]
    fn test_last_send_prefers_longest_chain() {
        // Receive on process 2 matched by a fresh send and by the end of a chain
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1),
                EventRecord::recv(1, 1, 2, 3),
                EventRecord::send(2, 1, 4, 5),
                EventRecord::send(3, 2, 0, 1),
                EventRecord::recv(4, 2, 6, 7),
                EventRecord::send(5, 3, 0, 1),
            ],
            vec![(0, 1), (2, 4), (5, 4)],
        );
        analyze_strides(&mut t);
        assert_eq!(t.comm(EventID(2)).unwrap().stride, Some(1));
        assert_eq!(t.comm(EventID(5)).unwrap().stride, Some(0));
        let recv = t.comm(EventID(4)).unwrap();
        // Its own process's earlier send has stride 0, the chain wins
        assert_eq!(recv.last_send, Some(EventID(2)));
    }

    #[test]
    fn test_rerun_is_stable() {
        let mut t = trace(
            vec![
                EventRecord::send(0, 0, 0, 1),
                EventRecord::recv(1, 1, 2, 3),
                EventRecord::send(2, 1, 4, 5),
            ],
            vec![(0, 1)],
        );
        let first = analyze_strides(&mut t);
        let second = analyze_strides(&mut t);
        assert_eq!(first, second);
        assert_eq!(t.comm(EventID(2)).unwrap().stride_parents.len(), 1);
    }
}
