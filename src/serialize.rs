use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::state::{CommKind, FunctionID, MetricValue, PhaseID, ProcessID, Timestamp};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unable to read trace: {0}")]
    Io(#[from] io::Error),

    #[error("unable to decode trace records: {0}")]
    Json(#[from] serde_json::Error),
}

/// One enter/exit interval as handed over by an importer. The `id` is the
/// importer's own identifier and only needs to be unique within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub process: ProcessID,
    pub enter: Timestamp,
    pub exit: Timestamp,
    #[serde(default)]
    pub function: FunctionID,
    #[serde(default)]
    pub phase: PhaseID,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub comm: Option<CommKind>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
}

impl EventRecord {
    pub fn new(id: u64, process: u64, enter: u64, exit: u64) -> Self {
        EventRecord {
            id,
            process: ProcessID(process),
            enter: Timestamp(enter),
            exit: Timestamp(exit),
            function: FunctionID::default(),
            phase: PhaseID::default(),
            depth: 0,
            comm: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn send(id: u64, process: u64, enter: u64, exit: u64) -> Self {
        Self::new(id, process, enter, exit).set_comm(CommKind::Send)
    }

    pub fn recv(id: u64, process: u64, enter: u64, exit: u64) -> Self {
        Self::new(id, process, enter, exit).set_comm(CommKind::Recv)
    }

    pub fn set_comm(mut self, comm: CommKind) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn set_function(mut self, function: u32) -> Self {
        self.function = FunctionID(function);
        self
    }

    pub fn set_phase(mut self, phase: u32) -> Self {
        self.phase = PhaseID(phase);
        self
    }

    pub fn set_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn add_metric(mut self, name: &str, value: i64, aggregate: i64) -> Self {
        self.metrics
            .insert(name.to_owned(), MetricValue::new(value, aggregate));
        self
    }
}

/// A matched point-to-point message, naming importer event ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: u64,
    pub receiver: u64,
}

impl MessageRecord {
    pub fn new(sender: u64, receiver: u64) -> Self {
        MessageRecord { sender, receiver }
    }
}

/// Everything the core needs for one import: events, their matched messages,
/// and groups of events (e.g. the receives of a waitall) that should be
/// collapsed into a single aggregate event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRecords {
    #[serde(default)]
    pub events: Vec<EventRecord>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub aggregates: Vec<Vec<u64>>,
}

impl TraceRecords {
    pub fn len(&self) -> usize {
        self.events.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.messages.is_empty()
    }
}

pub fn from_str(input: &str) -> Result<TraceRecords, LoadError> {
    Ok(serde_json::from_str(input)?)
}

pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<TraceRecords, LoadError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut s = String::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file).read_to_string(&mut s)?;
    } else {
        io::BufReader::new(file).read_to_string(&mut s)?;
    }
    from_str(&s)
}
