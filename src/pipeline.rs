use log::{info, warn};

use crate::condense::{condense, CondenseReport};
use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::metric::{calculate_base_metrics, calculate_differential_metric};
use crate::partition::build_partitions;
use crate::serialize::TraceRecords;
use crate::state::{CommKind, Trace};
use crate::step::{assign_steps, StepReport};
use crate::stride::{analyze_strides, StrideReport};

/// Observer for coarse build progress.
pub trait Progress {
    fn report(&mut self, percent: u8, phase: &str);
}

impl Progress for () {
    fn report(&mut self, _percent: u8, _phase: &str) {}
}

pub struct LogProgress;

impl Progress for LogProgress {
    fn report(&mut self, percent: u8, phase: &str) {
        info!("[{:>3}%] {}", percent, phase);
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub partitions_built: usize,
    pub condense: CondenseReport,
    pub steps: StepReport,
    pub strides: StrideReport,
}

/// Run every stage over one trace. Either the whole trace is built or it
/// is dropped along with the error.
pub fn build_trace(
    records: &TraceRecords,
    config: &Config,
    progress: &mut dyn Progress,
) -> Result<(Trace, BuildSummary)> {
    let mut summary = BuildSummary::default();

    progress.report(0, "Reading events");
    let mut trace = Trace::from_records(records)?;
    if config.isend_coalescing {
        let merged = trace.merge_runs(CommKind::Send)?;
        info!("Coalesced {} send bursts", merged);
    }
    if config.waitall_merge {
        let merged = trace.merge_runs(CommKind::Recv)?;
        info!("Merged {} receive runs into waitalls", merged);
    }

    progress.report(15, "Building partitions");
    summary.partitions_built = build_partitions(&mut trace, config.split_phases);

    progress.report(30, "Merging cycles");
    summary.condense = condense(&mut trace)?;
    if trace.partitions.live_count() == 0 {
        return Err(BuildError::EmptyResult);
    }

    progress.report(50, "Assigning steps");
    summary.steps = assign_steps(&mut trace, config.leap_threshold)?;

    progress.report(70, "Finding strides");
    summary.strides = analyze_strides(&mut trace);

    progress.report(85, "Calculating metrics");
    calculate_base_metrics(&mut trace);
    for base in &config.differential_metrics {
        if trace.metrics.contains(base) {
            calculate_differential_metric(&mut trace, base);
        } else {
            warn!("Skipping differential of unknown metric {}", base);
        }
    }

    progress.report(100, "Done");
    Ok((trace, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{EventRecord, MessageRecord};
    use crate::state::EventID;

    #[derive(Default)]
    struct Recorder(Vec<(u8, String)>);

    impl Progress for Recorder {
        fn report(&mut self, percent: u8, phase: &str) {
            self.0.push((percent, phase.to_owned()));
        }
    }

    fn ping() -> TraceRecords {
        TraceRecords {
            events: vec![EventRecord::send(0, 0, 0, 1), EventRecord::recv(1, 1, 5, 6)],
            messages: vec![MessageRecord::new(0, 1)],
            aggregates: Vec::new(),
        }
    }

    #[test]
    fn test_progress() {
        let mut recorder = Recorder::default();
        build_trace(&ping(), &Config::default(), &mut recorder).unwrap();
        let percents: Vec<u8> = recorder.0.iter().map(|(p, _)| *p).collect();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn test_summary() {
        let (trace, summary) = build_trace(&ping(), &Config::default(), &mut ()).unwrap();
        assert_eq!(summary.partitions_built, 1);
        assert!(summary.condense.is_noop());
        assert_eq!(summary.steps.max_step, 3);
        assert_eq!(summary.strides.strided, 1);
        assert!(trace.metrics.contains("D.Lateness"));
        assert!(trace.event(EventID(1)).metric("Duration").is_some());
    }

    #[test]
    fn test_empty() {
        let records = TraceRecords {
            events: vec![EventRecord::new(0, 0, 0, 1)],
            ..Default::default()
        };
        assert_eq!(
            build_trace(&records, &Config::default(), &mut ()).err(),
            Some(BuildError::EmptyResult)
        );
        assert_eq!(
            build_trace(&TraceRecords::default(), &Config::default(), &mut ()).err(),
            Some(BuildError::EmptyResult)
        );
    }

    #[test]
    fn test_malformed() {
        let mut records = ping();
        records.messages.push(MessageRecord::new(1, 0));
        assert!(matches!(
            build_trace(&records, &Config::default(), &mut ()),
            Err(BuildError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_automatic_aggregation() {
        let records = TraceRecords {
            events: vec![
                EventRecord::send(0, 0, 0, 1),
                EventRecord::send(1, 0, 2, 3),
                EventRecord::recv(2, 1, 5, 6),
                EventRecord::recv(3, 1, 7, 8),
            ],
            messages: vec![MessageRecord::new(0, 2), MessageRecord::new(1, 3)],
            aggregates: Vec::new(),
        };
        let (plain, _) = build_trace(&records, &Config::default(), &mut ()).unwrap();
        assert_eq!(plain.comm_event_ids().count(), 4);

        let config = Config {
            isend_coalescing: true,
            waitall_merge: true,
            ..Default::default()
        };
        let (trace, summary) = build_trace(&records, &config, &mut ()).unwrap();
        let (sends, recvs) = (EventID(4), EventID(5));
        assert_eq!(trace.comm_event_ids().collect::<Vec<_>>(), vec![sends, recvs]);
        assert_eq!(summary.partitions_built, 1);
        assert!(trace.event(sends).step() < trace.event(recvs).step());
        for sub in [EventID(0), EventID(1)] {
            assert_eq!(trace.event(sub).step(), trace.event(sends).step());
        }

        // Either flag alone only merges its own kind
        let config = Config {
            waitall_merge: true,
            ..Default::default()
        };
        let (trace, _) = build_trace(&records, &config, &mut ()).unwrap();
        assert_eq!(trace.comm_event_ids().count(), 3);
        assert!(trace.comm(EventID(4)).unwrap().is_recv());
    }

    #[test]
    fn test_unknown_differential_is_skipped() {
        let config = Config {
            differential_metrics: vec!["PAPI_TOT_CYC".to_owned()],
            ..Default::default()
        };
        let (trace, _) = build_trace(&ping(), &config, &mut ()).unwrap();
        assert!(!trace.metrics.contains("D.PAPI_TOT_CYC"));
    }
}
