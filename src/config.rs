use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::metric::LATENESS;
use crate::serialize::LoadError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Partitions whose leap differs by less than this share a step range.
    /// 0 and 1 step every partition after all of its parents.
    pub leap_threshold: u64,
    /// Only join adjacent comm events of a process when they share a phase.
    pub split_phases: bool,
    /// Merge back-to-back sends of a process into one isend burst.
    pub isend_coalescing: bool,
    /// Merge back-to-back receives of a process into one waitall.
    pub waitall_merge: bool,
    pub differential_metrics: Vec<String>,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            leap_threshold: 0,
            split_phases: true,
            isend_coalescing: false,
            waitall_merge: false,
            differential_metrics: vec![LATENESS.to_owned()],
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, LoadError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: Config = serde_json::from_str(r#"{"leap_threshold": 2}"#).unwrap();
        assert_eq!(config.leap_threshold, 2);
        assert!(config.split_phases);
        assert!(!config.isend_coalescing);
        assert!(!config.waitall_merge);
        assert_eq!(config.differential_metrics, vec!["Lateness".to_owned()]);
    }

    #[test]
    fn test_aggregation_flags() {
        let config: Config =
            serde_json::from_str(r#"{"isend_coalescing": true, "waitall_merge": true}"#).unwrap();
        assert!(config.isend_coalescing);
        assert!(config.waitall_merge);
        assert_eq!(config.leap_threshold, 0);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/stepgraph.json"),
            Err(LoadError::Io(_))
        ));
    }
}
