use std::cmp::{max, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::state::{EventID, MessageID, ProcessID, Timestamp, Trace};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: EventID,
    pub to: EventID,
    // Hard edges (process order) are never dropped to break a cycle
    pub hard: bool,
    pub message: Option<MessageID>,
}

impl Edge {
    pub fn process_order(from: EventID, to: EventID) -> Self {
        Edge {
            from,
            to,
            hard: true,
            message: None,
        }
    }

    pub fn message(from: EventID, to: EventID, message: MessageID) -> Self {
        Edge {
            from,
            to,
            hard: false,
            message: Some(message),
        }
    }

    pub fn soft(from: EventID, to: EventID) -> Self {
        Edge {
            from,
            to,
            hard: false,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Layering {
    pub layers: BTreeMap<EventID, u64>,
    pub dropped: Vec<Edge>,
}

impl Layering {
    pub fn max_layer(&self) -> Option<u64> {
        self.layers.values().copied().max()
    }
}

type ReadyKey = Reverse<(Timestamp, ProcessID, EventID)>;

/// Assign every node the length of the longest path reaching it. Nodes are
/// visited in order of enter time, then process. If the edges contain a
/// cycle, the earliest stalled node whose hard predecessors are all done
/// is released and its pending soft in-edges are reported as dropped.
pub fn layer_events(trace: &Trace, nodes: &[EventID], edges: &[Edge]) -> Layering {
    let index: BTreeMap<EventID, usize> = nodes.iter().enumerate().map(|(i, e)| (*e, i)).collect();
    let key = |idx: usize| -> ReadyKey {
        let event = trace.event(nodes[idx]);
        Reverse((event.enter, event.process, nodes[idx]))
    };

    let mut preds: Vec<Vec<(usize, Edge)>> = vec![Vec::new(); nodes.len()];
    let mut succs: Vec<Vec<(usize, bool)>> = vec![Vec::new(); nodes.len()];
    let mut pending = vec![0usize; nodes.len()];
    let mut hard_pending = vec![0usize; nodes.len()];
    for edge in edges {
        let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
            continue;
        };
        preds[to].push((from, *edge));
        succs[from].push((to, edge.hard));
        pending[to] += 1;
        if edge.hard {
            hard_pending[to] += 1;
        }
    }

    let mut ready: BinaryHeap<ReadyKey> = (0..nodes.len())
        .filter(|i| pending[*i] == 0)
        .map(key)
        .collect();
    // Unlayered nodes that only wait on soft edges, earliest first
    let mut releasable: BTreeSet<(Timestamp, ProcessID, EventID)> = (0..nodes.len())
        .filter(|i| hard_pending[*i] == 0)
        .map(|i| key(i).0)
        .collect();
    let mut layer: Vec<Option<u64>> = vec![None; nodes.len()];
    let mut result = Layering::default();
    let mut done = 0;

    while done < nodes.len() {
        let idx = match ready.pop() {
            Some(Reverse((_, _, event))) => index[&event],
            None => {
                // Stalled on a cycle
                let Some((_, _, event)) = releasable.pop_first() else {
                    break;
                };
                let idx = index[&event];
                for (p, edge) in &preds[idx] {
                    if layer[*p].is_none() {
                        result.dropped.push(*edge);
                    }
                }
                idx
            }
        };
        if layer[idx].is_some() {
            continue;
        }

        let mut value = 0;
        for (p, _) in &preds[idx] {
            if let Some(l) = layer[*p] {
                value = max(value, l + 1);
            }
        }
        layer[idx] = Some(value);
        releasable.remove(&key(idx).0);
        result.layers.insert(nodes[idx], value);
        done += 1;

        for (s, hard) in &succs[idx] {
            if layer[*s].is_some() {
                continue;
            }
            if *hard {
                hard_pending[*s] -= 1;
                if hard_pending[*s] == 0 {
                    releasable.insert(key(*s).0);
                }
            }
            pending[*s] -= 1;
            if pending[*s] == 0 {
                ready.push(key(*s));
            }
        }
    }
    result
}
