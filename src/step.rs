use std::cmp::max;
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use petgraph::unionfind::UnionFind;

use crate::condense::partition_graph;
use crate::error::{BuildError, Result};
use crate::layering::{layer_events, Edge};
use crate::state::{EventID, MessageID, PartitionID, Trace};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub groups: usize,
    pub max_step: u64,
    // Messages whose ordering had to be dropped to step a cyclic group
    pub tolerated: usize,
}

/// Partitions sharing one step range because the leap between them is
/// within the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeapGroup {
    pub members: Vec<PartitionID>,
    pub parents: BTreeSet<usize>,
}

pub fn assign_steps(trace: &mut Trace, leap_threshold: u64) -> Result<StepReport> {
    let order = topological_order(trace)?;
    calculate_dag_leap(trace, &order);
    set_mergables(trace, leap_threshold);
    let groups = leap_groups(trace, &order);

    let mut report = StepReport {
        groups: groups.len(),
        ..Default::default()
    };
    let mut group_max = vec![0u64; groups.len()];
    for (idx, group) in groups.iter().enumerate() {
        let base = group
            .parents
            .iter()
            .map(|p| group_max[*p] + 2)
            .max()
            .unwrap_or(1);
        group_max[idx] = step_group(trace, &group.members, base);
    }

    step_plain_events(trace);

    report.tolerated = trace.tolerated_messages.len();
    if report.tolerated > 0 {
        warn!(
            "Tolerated {} messages received before they were sent",
            report.tolerated
        );
    }
    report.max_step = trace
        .processes
        .values()
        .flatten()
        .filter_map(|id| trace.event(*id).step())
        .max()
        .unwrap_or(0);
    trace.max_step = report.max_step;

    verify_steps(trace)?;
    info!(
        "Assigned {} steps across {} leap groups",
        report.max_step + 1,
        report.groups
    );
    Ok(report)
}

pub fn topological_order(trace: &Trace) -> Result<Vec<PartitionID>> {
    let (graph, _) = partition_graph(trace);
    let order = toposort(&graph, None).map_err(|cycle| {
        BuildError::invariant(format!(
            "partition {} lies on a cycle after condensation",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(order.into_iter().map(|n| graph[n]).collect())
}

/// dag_leap is the length of the longest parent chain above a partition.
pub fn calculate_dag_leap(trace: &mut Trace, order: &[PartitionID]) {
    for id in order {
        let leap = trace
            .partitions
            .get(*id)
            .parents
            .iter()
            .map(|p| trace.partitions.get(trace.partitions.resolve(*p)).dag_leap + 1)
            .max()
            .unwrap_or(0);
        trace.partitions.get_mut(*id).dag_leap = leap;
    }
}

/// Mark parent/child edges whose leap difference is below `threshold`.
/// Parent and child always differ by at least one, so thresholds of 0 and 1
/// keep every partition in its own step range.
pub fn set_mergables(trace: &mut Trace, threshold: u64) {
    let mut edges = Vec::new();
    for (id, partition) in trace.partitions.live() {
        for child in &partition.children {
            let child_leap = trace.partitions.get(*child).dag_leap;
            if child_leap.saturating_sub(partition.dag_leap) < threshold {
                edges.push((id, *child));
            }
        }
    }
    for id in trace.partitions.live_ids() {
        let partition = trace.partitions.get_mut(id);
        partition.mergable_parents.clear();
        partition.mergable_children.clear();
    }
    for (parent, child) in edges {
        trace.partitions.get_mut(parent).mergable_children.insert(child);
        trace.partitions.get_mut(child).mergable_parents.insert(parent);
    }
}

/// Connected components over mergable edges, in topological order. Groups
/// that would still reach each other through an outside partition are
/// stepped together.
pub fn leap_groups(trace: &Trace, order: &[PartitionID]) -> Vec<LeapGroup> {
    let position: BTreeMap<PartitionID, usize> =
        order.iter().enumerate().map(|(i, p)| (*p, i)).collect();
    let mut sets = UnionFind::<usize>::new(order.len());
    for (idx, id) in order.iter().enumerate() {
        for child in &trace.partitions.get(*id).mergable_children {
            if let Some(other) = position.get(child) {
                sets.union(idx, *other);
            }
        }
    }

    let mut group_of = BTreeMap::new();
    let mut members: Vec<Vec<PartitionID>> = Vec::new();
    for (idx, id) in order.iter().enumerate() {
        let root = sets.find(idx);
        let group = *group_of.entry(root).or_insert_with(|| {
            members.push(Vec::new());
            members.len() - 1
        });
        members[group].push(*id);
    }
    let group_index = |id: &PartitionID| position.get(id).map(|p| group_of[&sets.find(*p)]);

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..members.len()).map(|g| graph.add_node(g)).collect();
    for (group, list) in members.iter().enumerate() {
        for id in list {
            for child in &trace.partitions.get(*id).children {
                if let Some(other) = group_index(child) {
                    if other != group {
                        graph.update_edge(nodes[group], nodes[other], ());
                    }
                }
            }
        }
    }

    // tarjan_scc yields components in reverse topological order
    let mut renumber = vec![0; members.len()];
    let mut groups = Vec::new();
    for (new, component) in tarjan_scc(&graph).iter().rev().enumerate() {
        if component.len() > 1 {
            debug!("Joining {} leap groups that reach each other", component.len());
        }
        let mut list = Vec::new();
        for node in component {
            renumber[graph[*node]] = new;
            list.extend(members[graph[*node]].iter().copied());
        }
        list.sort_by_key(|p| position[p]);
        groups.push(LeapGroup {
            members: list,
            parents: BTreeSet::new(),
        });
    }
    for edge in graph.raw_edges() {
        let from = renumber[graph[edge.source()]];
        let to = renumber[graph[edge.target()]];
        if from != to {
            groups[to].parents.insert(from);
        }
    }
    groups
}

/// Step every comm event of a group starting at `base`. Returns the
/// largest step given out, or `base` for a group without events.
fn step_group(trace: &mut Trace, members: &[PartitionID], base: u64) -> u64 {
    let partitions = &trace.partitions;
    let nodes: Vec<EventID> = members
        .iter()
        .flat_map(|id| partitions.get(*id).event_ids())
        .collect();
    if nodes.is_empty() {
        debug!("Skipping empty partitions {:?}", members);
        for id in members {
            let partition = trace.partitions.get_mut(*id);
            partition.min_global_step = base;
            partition.max_global_step = base;
        }
        return base;
    }

    let member_set: BTreeSet<PartitionID> = members.iter().copied().collect();
    let in_group = |id: EventID| trace.partition_of(id).is_some_and(|p| member_set.contains(&p));
    let mut edges = Vec::new();
    for id in &nodes {
        let Some(comm) = trace.comm(*id) else {
            continue;
        };
        if let Some(next) = comm.comm_next.filter(|n| in_group(*n)) {
            edges.push(Edge::process_order(*id, next));
        }
        for message_id in &comm.messages {
            let message = trace.message(*message_id);
            if message.sender == *id && in_group(message.receiver) {
                edges.push(Edge::message(*id, message.receiver, *message_id));
            }
        }
    }

    let layering = layer_events(trace, &nodes, &edges);
    for edge in &layering.dropped {
        if let Some(message) = edge.message {
            trace.tolerated_messages.insert(message);
        }
    }

    let mut local_max = BTreeMap::new();
    for (id, layer) in &layering.layers {
        let step = base + 2 * layer;
        trace.event_mut(*id).set_step(step);
        if let Some(p) = trace.partition_of(*id) {
            let entry = local_max.entry(p).or_insert(0);
            *entry = max(*entry, *layer);
        }
    }

    let max_global = base + 2 * layering.max_layer().unwrap_or(0);
    for id in members {
        let partition = trace.partitions.get_mut(*id);
        partition.max_step = local_max.get(id).copied().unwrap_or(0);
        partition.min_global_step = base;
        partition.max_global_step = max_global;
    }
    debug!(
        "Stepped partitions {:?}: steps {}..={}",
        members, base, max_global
    );
    max_global
}

/// Non-comm events sit one step before the next comm event on their
/// process, or one after the last. Sub-events of an aggregate share the
/// aggregate's step.
fn step_plain_events(trace: &mut Trace) {
    let processes: Vec<Vec<EventID>> = trace.processes.values().cloned().collect();
    for list in processes {
        let last_comm = list
            .iter()
            .rev()
            .map(|id| trace.event(*id))
            .find(|e| e.is_comm())
            .and_then(|e| e.step());
        let mut upcoming: Option<u64> = None;
        for id in list.iter().rev() {
            let event = trace.event(*id);
            if event.is_comm() {
                upcoming = event.step();
                continue;
            }
            let step = match (upcoming, last_comm) {
                (Some(next), _) => next.saturating_sub(1),
                (None, Some(last)) => last + 1,
                (None, None) => 0,
            };
            trace.event_mut(*id).set_step(step);
        }
    }

    let absorbed: Vec<(EventID, EventID)> = trace
        .events
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| e.absorbed_into.map(|a| (EventID(idx), a)))
        .collect();
    for (id, aggregate) in absorbed {
        if let Some(step) = trace.event(aggregate).step() {
            trace.event_mut(id).set_step(step);
        }
    }
}

/// Check that steps never run against causality: they never decrease along
/// a process, strictly increase between consecutive comm events, and never
/// decrease across a message unless that message was tolerated as skew.
pub fn verify_steps(trace: &Trace) -> Result<()> {
    let step_of = |id: EventID| {
        trace
            .event(id)
            .step()
            .ok_or_else(|| BuildError::invariant(format!("event {} has no step", id)))
    };

    for list in trace.processes.values() {
        for pair in list.windows(2) {
            if step_of(pair[0])? > step_of(pair[1])? {
                return Err(BuildError::invariant(format!(
                    "step decreases from {} to {} along process {}",
                    pair[0],
                    pair[1],
                    trace.event(pair[0]).process
                )));
            }
        }
    }

    for id in trace.comm_event_ids() {
        if let Some(next) = trace.comm(id).and_then(|c| c.comm_next) {
            if step_of(id)? >= step_of(next)? {
                return Err(BuildError::invariant(format!(
                    "comm events {} and {} share or invert a step",
                    id, next
                )));
            }
        }
    }

    for (idx, message) in trace.messages.iter().enumerate() {
        if trace.tolerated_messages.contains(&MessageID(idx)) {
            continue;
        }
        if step_of(message.sender)? > step_of(message.receiver)? {
            return Err(BuildError::invariant(format!(
                "message from {} to {} goes back in steps",
                message.sender, message.receiver
            )));
        }
    }
    Ok(())
}
