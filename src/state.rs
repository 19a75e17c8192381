use std::cmp::{max, min};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeBounds;

use derive_more::{Add, Display, From, Sub};
use nonmax::NonMaxU64;

use rayon::prelude::*;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::serialize::{EventRecord, TraceRecords};

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Add,
    Sub,
    From,
    Serialize,
    Deserialize,
)]
pub struct Timestamp(pub u64 /* ns */);

impl Timestamp {
    /// Signed distance from `earlier` to `self`. Negative when the two are
    /// out of order, which happens with skewed clocks.
    pub fn delta(self, earlier: Timestamp) -> i64 {
        let delta = i128::from(self.0) - i128::from(earlier.0);
        delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Time is stored in nanoseconds. But it is displayed in microseconds.
        let nanoseconds = self.0;
        let divisor = 1000;
        let microseconds = nanoseconds / divisor;
        let remainder = nanoseconds % divisor;
        write!(f, "{}.{:0>3}", microseconds, remainder)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    From,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct ProcessID(pub u64);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    From,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct FunctionID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    From,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct PhaseID(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
#[display("e{_0}")]
pub struct EventID(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
#[display("m{_0}")]
pub struct MessageID(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
#[display("P{_0}")]
pub struct PartitionID(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommKind {
    Send,
    Recv,
}

impl fmt::Display for CommKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommKind::Send => write!(f, "send"),
            CommKind::Recv => write!(f, "recv"),
        }
    }
}

/// A metric as stored per event: the event's own value and the value of
/// the aggregate interval leading up to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: i64,
    #[serde(default)]
    pub aggregate: i64,
}

impl MetricValue {
    pub fn new(value: i64, aggregate: i64) -> Self {
        MetricValue { value, aggregate }
    }
}

#[derive(Debug, Clone)]
pub struct CommInfo {
    pub kind: CommKind,
    pub messages: Vec<MessageID>,
    // Non-empty only for aggregates (e.g. a waitall over several receives)
    pub subevents: Vec<EventID>,
    pub comm_prev: Option<EventID>,
    pub comm_next: Option<EventID>,
    pub partition: Option<PartitionID>,
    pub stride_parents: BTreeSet<EventID>,
    pub stride_children: BTreeSet<EventID>,
    pub last_send: Option<EventID>,
    pub next_send: Option<EventID>,
    pub stride: Option<u64>,
}

impl CommInfo {
    fn new(kind: CommKind) -> Self {
        CommInfo {
            kind,
            messages: Vec::new(),
            subevents: Vec::new(),
            comm_prev: None,
            comm_next: None,
            partition: None,
            stride_parents: BTreeSet::new(),
            stride_children: BTreeSet::new(),
            last_send: None,
            next_send: None,
            stride: None,
        }
    }

    pub fn is_recv(&self) -> bool {
        self.kind == CommKind::Recv
    }

    pub fn is_aggregate(&self) -> bool {
        !self.subevents.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub raw_id: Option<u64>,
    pub enter: Timestamp,
    pub exit: Timestamp,
    pub process: ProcessID,
    pub function: FunctionID,
    pub phase: PhaseID,
    pub depth: u32,
    step: Option<NonMaxU64>,
    pub prev: Option<EventID>,
    pub next: Option<EventID>,
    pub comm: Option<CommInfo>,
    pub metrics: BTreeMap<String, MetricValue>,
    pub absorbed_into: Option<EventID>,
}

impl Event {
    fn from_record(record: &EventRecord) -> Self {
        Event {
            raw_id: Some(record.id),
            enter: record.enter,
            exit: record.exit,
            process: record.process,
            function: record.function,
            phase: record.phase,
            depth: record.depth,
            step: None,
            prev: None,
            next: None,
            comm: record.comm.map(CommInfo::new),
            metrics: record.metrics.clone(),
            absorbed_into: None,
        }
    }

    pub fn step(&self) -> Option<u64> {
        self.step.map(|s| s.get())
    }

    pub(crate) fn set_step(&mut self, step: u64) {
        self.step = NonMaxU64::new(step);
    }

    pub fn is_comm(&self) -> bool {
        self.comm.is_some()
    }

    pub fn is_recv(&self) -> bool {
        self.comm.as_ref().is_some_and(|c| c.is_recv())
    }

    pub fn is_send(&self) -> bool {
        self.comm.as_ref().is_some_and(|c| !c.is_recv())
    }

    pub fn partition(&self) -> Option<PartitionID> {
        self.comm.as_ref().and_then(|c| c.partition)
    }

    pub fn metric(&self, name: &str) -> Option<MetricValue> {
        self.metrics.get(name).copied()
    }

    pub fn set_metric(&mut self, name: &str, value: MetricValue) {
        self.metrics.insert(name.to_owned(), value);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: EventID,
    pub receiver: EventID,
}

#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub events: BTreeMap<ProcessID, Vec<EventID>>,
    pub max_step: u64,
    pub min_global_step: u64,
    pub max_global_step: u64,
    pub dag_leap: u64,
    pub parents: BTreeSet<PartitionID>,
    pub children: BTreeSet<PartitionID>,
    pub mergable_parents: BTreeSet<PartitionID>,
    pub mergable_children: BTreeSet<PartitionID>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, process: ProcessID, event: EventID) {
        self.events.entry(process).or_default().push(event);
    }

    pub fn num_events(&self) -> usize {
        self.events.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.values().all(|v| v.is_empty())
    }

    pub fn event_ids(&self) -> impl Iterator<Item = EventID> + '_ {
        self.events.values().flatten().copied()
    }

    /// Restore chronological order on every process after events were
    /// appended out of order (e.g. by a merge).
    pub fn sort_events(&mut self, events: &[Event]) {
        for list in self.events.values_mut() {
            list.sort_by_key(|id| (events[id.0].enter, events[id.0].depth, id.0));
            list.dedup();
        }
    }
}

/// Owns every partition ever created. Partitions superseded by a merge stay
/// in the arena and point at their replacement through the redirect table.
/// Replacements are always created after the partitions they absorb, so a
/// redirect only ever points to a larger id and every chain terminates.
#[derive(Debug, Clone, Default)]
pub struct PartitionArena {
    partitions: Vec<Partition>,
    redirect: Vec<Option<PartitionID>>,
}

impl PartitionArena {
    pub fn create(&mut self, partition: Partition) -> PartitionID {
        let id = PartitionID(self.partitions.len());
        self.partitions.push(partition);
        self.redirect.push(None);
        id
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Raw access; does not follow redirects.
    pub fn get(&self, id: PartitionID) -> &Partition {
        &self.partitions[id.0]
    }

    pub fn get_mut(&mut self, id: PartitionID) -> &mut Partition {
        &mut self.partitions[id.0]
    }

    pub fn redirect(&mut self, from: PartitionID, to: PartitionID) -> Result<()> {
        if to <= from {
            return Err(BuildError::invariant(format!(
                "partition {} cannot be redirected to older partition {}",
                from, to
            )));
        }
        self.redirect[from.0] = Some(to);
        Ok(())
    }

    pub fn is_live(&self, id: PartitionID) -> bool {
        self.redirect[id.0].is_none()
    }

    pub fn resolve(&self, id: PartitionID) -> PartitionID {
        let mut current = id;
        while let Some(next) = self.redirect[current.0] {
            current = next;
        }
        current
    }

    pub fn live(&self) -> impl Iterator<Item = (PartitionID, &Partition)> + '_ {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.redirect[*idx].is_none())
            .map(|(idx, p)| (PartitionID(idx), p))
    }

    pub fn live_ids(&self) -> Vec<PartitionID> {
        self.live().map(|(id, _)| id).collect()
    }

    pub fn live_count(&self) -> usize {
        self.redirect.iter().filter(|r| r.is_none()).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub events: Vec<Event>,
    pub messages: Vec<Message>,
    pub partitions: PartitionArena,
    // Process order of every event that was not absorbed into an aggregate
    pub processes: BTreeMap<ProcessID, Vec<EventID>>,
    pub metrics: BTreeSet<String>,
    pub max_step: u64,
    // Messages whose ordering constraint had to be dropped to break a cycle
    pub tolerated_messages: BTreeSet<MessageID>,
}

impl Trace {
    pub fn from_records(records: &TraceRecords) -> Result<Trace> {
        let mut trace = Trace::default();

        let mut ids = BTreeMap::new();
        for record in &records.events {
            if record.exit < record.enter {
                return Err(BuildError::malformed(format!(
                    "event {} on process {} exits at {} before it enters at {}",
                    record.id, record.process, record.exit, record.enter
                )));
            }
            let event_id = EventID(trace.events.len());
            if ids.insert(record.id, event_id).is_some() {
                return Err(BuildError::malformed(format!(
                    "event id {} appears more than once",
                    record.id
                )));
            }
            trace.metrics.extend(record.metrics.keys().cloned());
            trace.events.push(Event::from_record(record));
        }

        let lookup = |raw: u64| {
            ids.get(&raw)
                .copied()
                .ok_or_else(|| BuildError::malformed(format!("unknown event id {}", raw)))
        };

        for record in &records.messages {
            let sender = lookup(record.sender)?;
            let receiver = lookup(record.receiver)?;
            let message_id = MessageID(trace.messages.len());
            trace.attach_message(sender, CommKind::Send, message_id)?;
            trace.attach_message(receiver, CommKind::Recv, message_id)?;
            trace.messages.push(Message { sender, receiver });
        }

        for group in &records.aggregates {
            let members = group
                .iter()
                .map(|raw| lookup(*raw))
                .collect::<Result<Vec<_>>>()?;
            trace.merge_p2p_unlinked(&members)?;
        }

        trace.link_process_order();
        Ok(trace)
    }

    fn attach_message(
        &mut self,
        event_id: EventID,
        expected: CommKind,
        message_id: MessageID,
    ) -> Result<()> {
        let event = &mut self.events[event_id.0];
        match event.comm.as_mut() {
            Some(comm) if comm.kind == expected => {
                comm.messages.push(message_id);
                Ok(())
            }
            _ => Err(BuildError::malformed(format!(
                "message {} expects event {:?} to be a {}",
                message_id, event.raw_id, expected
            ))),
        }
    }

    /// Collapse several sends or receives of one process (e.g. an isend
    /// burst or the receives completed by a waitall) into one aggregate
    /// event. Must be called before partitions are built.
    pub fn merge_p2p(&mut self, subevents: &[EventID]) -> Result<EventID> {
        if !self.partitions.is_empty() {
            return Err(BuildError::invariant(
                "aggregates must be merged before partitions are built",
            ));
        }
        let aggregate = self.merge_p2p_unlinked(subevents)?;
        self.link_process_order();
        Ok(aggregate)
    }

    /// Collapse every run of two or more consecutive comm events of `kind`
    /// on a process into one aggregate: isend bursts for sends, waitall
    /// completions for receives. A run ends at a comm event of the other
    /// kind, at a phase change, or at an existing aggregate. Returns the
    /// number of aggregates created.
    pub fn merge_runs(&mut self, kind: CommKind) -> Result<usize> {
        if !self.partitions.is_empty() {
            return Err(BuildError::invariant(
                "aggregates must be merged before partitions are built",
            ));
        }
        let mut runs = Vec::new();
        for list in self.processes.values() {
            let mut run: Vec<EventID> = Vec::new();
            for id in list {
                let event = &self.events[id.0];
                let Some(comm) = &event.comm else {
                    continue;
                };
                let member = comm.kind == kind && !comm.is_aggregate();
                let continues = member
                    && run
                        .last()
                        .is_none_or(|last| self.events[last.0].phase == event.phase);
                if !continues {
                    if run.len() > 1 {
                        runs.push(std::mem::take(&mut run));
                    }
                    run.clear();
                }
                if member {
                    run.push(*id);
                }
            }
            if run.len() > 1 {
                runs.push(run);
            }
        }

        let count = runs.len();
        for run in runs {
            self.merge_p2p_unlinked(&run)?;
        }
        if count > 0 {
            self.link_process_order();
        }
        Ok(count)
    }

    fn merge_p2p_unlinked(&mut self, subevents: &[EventID]) -> Result<EventID> {
        // Validate and collect everything first so that a rejected group
        // leaves the trace untouched.
        if subevents.is_empty() {
            return Err(BuildError::malformed("aggregate without sub-events"));
        }
        if let Some(bad) = subevents.iter().find(|e| e.0 >= self.events.len()) {
            return Err(BuildError::malformed(format!("unknown sub-event {}", bad)));
        }
        let mut members = subevents.to_vec();
        members.sort_by_key(|id| (self.events[id.0].enter, id.0));
        members.dedup();
        if members.len() != subevents.len() {
            return Err(BuildError::malformed("aggregate lists a sub-event twice"));
        }

        let head = &self.events[members[0].0];
        let (process, function, phase, depth) = (head.process, head.function, head.phase, head.depth);
        let kind = match &head.comm {
            Some(comm) => comm.kind,
            None => {
                return Err(BuildError::malformed(format!(
                    "aggregate member {:?} is not a communication event",
                    head.raw_id
                )));
            }
        };

        let mut messages = Vec::new();
        let (mut enter, mut exit) = (head.enter, head.exit);
        for id in &members {
            let event = &self.events[id.0];
            if event.absorbed_into.is_some() {
                return Err(BuildError::malformed(format!(
                    "event {:?} already belongs to an aggregate",
                    event.raw_id
                )));
            }
            if event.process != process {
                return Err(BuildError::malformed(format!(
                    "aggregate mixes processes {} and {}",
                    process, event.process
                )));
            }
            match &event.comm {
                Some(comm) if comm.kind == kind => messages.extend(comm.messages.iter().copied()),
                _ => {
                    return Err(BuildError::malformed(format!(
                        "aggregate member {:?} is not a {}",
                        event.raw_id, kind
                    )));
                }
            }
            enter = min(enter, event.enter);
            exit = max(exit, event.exit);
        }

        let aggregate_id = EventID(self.events.len());
        let mut comm = CommInfo::new(kind);
        comm.messages = messages;
        comm.subevents = members;
        for message_id in &comm.messages {
            let message = &mut self.messages[message_id.0];
            match kind {
                CommKind::Send => message.sender = aggregate_id,
                CommKind::Recv => message.receiver = aggregate_id,
            }
        }
        for id in &comm.subevents {
            self.events[id.0].absorbed_into = Some(aggregate_id);
        }
        self.events.push(Event {
            raw_id: None,
            enter,
            exit,
            process,
            function,
            phase,
            depth,
            step: None,
            prev: None,
            next: None,
            comm: Some(comm),
            metrics: BTreeMap::new(),
            absorbed_into: None,
        });
        Ok(aggregate_id)
    }

    fn link_process_order(&mut self) {
        let mut processes: BTreeMap<ProcessID, Vec<EventID>> = BTreeMap::new();
        for (idx, event) in self.events.iter().enumerate() {
            if event.absorbed_into.is_none() {
                processes
                    .entry(event.process)
                    .or_default()
                    .push(EventID(idx));
            }
        }

        let events = &self.events;
        processes.par_iter_mut().for_each(|(_, list)| {
            list.sort_by_key(|id| {
                let event = &events[id.0];
                (event.enter, event.depth, id.0)
            })
        });

        for list in processes.values() {
            let mut prev: Option<EventID> = None;
            let mut comm_prev: Option<EventID> = None;
            for id in list {
                let event = &mut self.events[id.0];
                event.prev = prev;
                event.next = None;
                if let Some(comm) = event.comm.as_mut() {
                    comm.comm_prev = comm_prev;
                    comm.comm_next = None;
                }
                if let Some(p) = prev {
                    self.events[p.0].next = Some(*id);
                }
                if self.events[id.0].is_comm() {
                    if let Some(cp) = comm_prev {
                        if let Some(comm) = self.events[cp.0].comm.as_mut() {
                            comm.comm_next = Some(*id);
                        }
                    }
                    comm_prev = Some(*id);
                }
                prev = Some(*id);
            }
        }
        self.processes = processes;
    }

    pub fn event(&self, id: EventID) -> &Event {
        &self.events[id.0]
    }

    pub fn event_mut(&mut self, id: EventID) -> &mut Event {
        &mut self.events[id.0]
    }

    pub fn comm(&self, id: EventID) -> Option<&CommInfo> {
        self.events[id.0].comm.as_ref()
    }

    pub fn comm_mut(&mut self, id: EventID) -> Option<&mut CommInfo> {
        self.events[id.0].comm.as_mut()
    }

    pub fn message(&self, id: MessageID) -> &Message {
        &self.messages[id.0]
    }

    pub fn num_processes(&self) -> usize {
        self.processes.len()
    }

    /// Comm events that take part in the causal graph, in process order.
    pub fn comm_event_ids(&self) -> impl Iterator<Item = EventID> + '_ {
        self.processes
            .values()
            .flatten()
            .copied()
            .filter(|id| self.events[id.0].is_comm())
    }

    pub fn events_for_process(&self, process: ProcessID) -> &[EventID] {
        self.processes
            .get(&process)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn resolve_partition(&self, id: PartitionID) -> PartitionID {
        self.partitions.resolve(id)
    }

    /// The live partition an event belongs to, following any redirects.
    pub fn partition_of(&self, event: EventID) -> Option<PartitionID> {
        self.events[event.0]
            .partition()
            .map(|p| self.partitions.resolve(p))
    }

    pub fn partition_events(&self, id: PartitionID) -> impl Iterator<Item = EventID> + '_ {
        self.partitions.get(self.partitions.resolve(id)).event_ids()
    }

    /// Events whose step falls in `range`, ordered by step, then enter
    /// time, then process.
    pub fn events_in_steps<R: RangeBounds<u64>>(&self, range: R) -> Vec<EventID> {
        let mut result: Vec<_> = self
            .processes
            .values()
            .flatten()
            .copied()
            .filter(|id| self.events[id.0].step().is_some_and(|s| range.contains(&s)))
            .collect();
        result.sort_by_key(|id| {
            let event = &self.events[id.0];
            (event.step(), event.enter, event.process, id.0)
        });
        result
    }
}
