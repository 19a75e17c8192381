use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::metric::top_events;
use crate::pipeline::BuildSummary;
use crate::state::{Timestamp, Trace};

const TOP_EVENTS: usize = 5;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MetricTotals {
    pub events: usize,
    pub value: i64,
    pub aggregate: i64,
}

/// Sum every metric over the events of the trace.
pub fn metric_totals(trace: &Trace) -> BTreeMap<String, MetricTotals> {
    let mut totals = BTreeMap::new();
    for name in &trace.metrics {
        totals.insert(name.clone(), MetricTotals::default());
    }
    for id in trace.processes.values().flatten() {
        for (name, metric) in &trace.event(*id).metrics {
            let entry: &mut MetricTotals = totals.entry(name.clone()).or_default();
            entry.events += 1;
            entry.value = entry.value.saturating_add(metric.value);
            entry.aggregate = entry.aggregate.saturating_add(metric.aggregate);
        }
    }
    totals
}

fn print_time(label: &str, nanoseconds: i64) {
    let threshold = 1000000.0;
    let us = nanoseconds as f64 / 1000.0;
    if us.abs() < threshold {
        println!("          {}: {:.3} us", label, us);
    } else {
        println!("          {}: {:.3e} us", label, us);
    }
}

fn print_header(category: &str) {
    println!();
    println!("  -------------------------");
    println!("  {}", category);
    println!("  -------------------------");
}

pub fn print_statistics(trace: &Trace, summary: &BuildSummary) {
    print_header("Trace Statistics");
    println!("      Processes: {}", trace.num_processes());
    println!("      Events: {}", trace.processes.values().map(|v| v.len()).sum::<usize>());
    println!("      Communication events: {}", trace.comm_event_ids().count());
    println!("      Messages: {}", trace.messages.len());
    let span = trace
        .processes
        .values()
        .flatten()
        .map(|id| trace.event(*id).exit)
        .max()
        .unwrap_or_default();
    println!("      Last exit: {} us", span);

    print_header("Partition Statistics");
    println!("      Partitions built: {}", summary.partitions_built);
    println!(
        "      Cycles merged: {} ({} partitions)",
        summary.condense.merged_groups, summary.condense.absorbed
    );
    println!("      Partitions remaining: {}", trace.partitions.live_count());
    let deepest = trace.partitions.live().map(|(_, p)| p.dag_leap).max();
    println!("      Deepest leap: {}", deepest.unwrap_or(0));
    let mut ordering = BTreeMap::<Reverse<usize>, Vec<_>>::new();
    for (id, partition) in trace.partitions.live() {
        ordering
            .entry(Reverse(partition.num_events()))
            .or_default()
            .push(id);
    }
    for (Reverse(size), ids) in ordering.into_iter().take(TOP_EVENTS) {
        for id in ids {
            let partition = trace.partitions.get(id);
            println!(
                "          {}: {} events on {} processes, steps {}..={}",
                id,
                size,
                partition.events.len(),
                partition.min_global_step,
                partition.max_global_step
            );
        }
    }

    print_header("Step Statistics");
    println!("      Steps: {}", trace.max_step + 1);
    println!("      Leap groups: {}", summary.steps.groups);
    println!("      Tolerated messages: {}", summary.steps.tolerated);
    println!("      Strided sends: {}", summary.strides.strided);
    println!("      Longest stride chain: {}", summary.strides.max_stride);

    print_header("Metric Statistics");
    for (name, totals) in metric_totals(trace) {
        println!();
        println!("      {}", name);
        println!("          Events: {}", totals.events);
        print_time("Total", totals.value);
        print_time("Total aggregate", totals.aggregate);
        if name.starts_with("D.") {
            for (id, metric) in top_events(trace, &name, TOP_EVENTS) {
                let event = trace.event(id);
                println!(
                    "          {} on process {} at step {}: {} us",
                    id,
                    event.process,
                    event.step().unwrap_or(0),
                    Timestamp(metric.value.max(0) as u64)
                );
            }
        }
    }
}
