use std::cmp::max;

use log::{debug, info};
use slice_group_by::GroupBy;

use crate::state::{EventID, MetricValue, Trace};

pub const DURATION: &str = "Duration";
pub const LATENESS: &str = "Lateness";

pub fn differential_name(base: &str) -> String {
    format!("D.{}", base)
}

/// Fill in the metrics every trace has, whatever the importer recorded.
pub fn calculate_base_metrics(trace: &mut Trace) {
    calculate_duration(trace);
    calculate_lateness(trace);
}

/// Duration of each event, with the gap since the previous comm event on
/// the process as its aggregate.
fn calculate_duration(trace: &mut Trace) {
    let mut values = Vec::new();
    for id in trace.processes.values().flatten() {
        let event = trace.event(*id);
        let value = event.exit.delta(event.enter);
        let before = match &event.comm {
            Some(comm) => comm.comm_prev,
            None => event.prev,
        };
        let aggregate = before.map_or(0, |b| event.enter.delta(trace.event(b).exit));
        values.push((*id, MetricValue::new(value, aggregate)));
    }
    for (id, value) in values {
        trace.event_mut(id).set_metric(DURATION, value);
    }
    trace.metrics.insert(DURATION.to_owned());
}

/// How far each comm event trails the earliest comm event of its step.
fn calculate_lateness(trace: &mut Trace) {
    let mut stepped: Vec<(u64, EventID)> = trace
        .comm_event_ids()
        .filter_map(|id| trace.event(id).step().map(|s| (s, id)))
        .collect();
    stepped.sort();

    let mut values = Vec::new();
    for group in stepped.linear_group_by_key(|(step, _)| *step) {
        let events: Vec<_> = group.iter().map(|(_, id)| (*id, trace.event(*id))).collect();
        let Some(first_exit) = events.iter().map(|(_, e)| e.exit).min() else {
            continue;
        };
        let Some(first_enter) = events.iter().map(|(_, e)| e.enter).min() else {
            continue;
        };
        for (id, event) in events {
            values.push((
                id,
                MetricValue::new(event.exit.delta(first_exit), event.enter.delta(first_enter)),
            ));
        }
    }
    for (id, value) in values {
        trace.event_mut(id).set_metric(LATENESS, value);
    }
    trace.metrics.insert(LATENESS.to_owned());
}

/// The event whose `base` value an event's own value is measured against.
/// For a receive, that is the matched sender with the largest value.
fn critical_parent(trace: &Trace, id: EventID, base: &str) -> Option<EventID> {
    let event = trace.event(id);
    let Some(comm) = &event.comm else {
        return event.prev;
    };
    if comm.is_recv() && !comm.messages.is_empty() {
        let mut best: Option<(EventID, i64)> = None;
        for message_id in &comm.messages {
            let sender = trace.message(*message_id).sender;
            let value = trace.event(sender).metric(base).map_or(0, |m| m.value);
            if best.is_none_or(|(_, v)| value > v) {
                best = Some((sender, value));
            }
        }
        return best.map(|(sender, _)| sender);
    }
    comm.comm_prev
}

/// Derive `D.<base>`: the part of each event's `base` value not already
/// accounted for by its critical parent. Returns the number of events that
/// received a value.
pub fn calculate_differential_metric(trace: &mut Trace, base: &str) -> usize {
    let name = differential_name(base);
    let mut values = Vec::new();
    for id in trace.processes.values().flatten() {
        let Some(own) = trace.event(*id).metric(base) else {
            continue;
        };
        let parent = critical_parent(trace, *id, base)
            .and_then(|p| trace.event(p).metric(base))
            .unwrap_or_default();
        values.push((
            *id,
            MetricValue::new(
                max(0, own.value.saturating_sub(parent.value)),
                max(0, own.aggregate.saturating_sub(parent.aggregate)),
            ),
        ));
    }

    let count = values.len();
    for (id, value) in values {
        trace.event_mut(id).set_metric(&name, value);
    }
    if count == 0 {
        debug!("No events carry {}, {} is empty", base, name);
    }
    trace.metrics.insert(name.clone());
    info!("Calculated {} for {} events", name, count);
    count
}

/// Events ordered by a metric's value, largest first.
pub fn top_events(trace: &Trace, name: &str, limit: usize) -> Vec<(EventID, MetricValue)> {
    let mut result: Vec<_> = trace
        .processes
        .values()
        .flatten()
        .filter_map(|id| trace.event(*id).metric(name).map(|m| (*id, m)))
        .collect();
    result.sort_by_key(|(id, m)| (std::cmp::Reverse(m.value), *id));
    result.truncate(limit);
    result
}
