//! Server configuration: defaults, optional JSON file, CLI overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HearthError, HearthResult};

/// Who performs socket I/O for a ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchModel {
    /// The dispatcher reads/writes; workers only run protocol logic.
    Delegated,
    /// Workers own the whole read-or-write step.
    WorkerOwned,
}

/// Readiness notification discipline for client sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Notification repeats while data remains; one recv per wakeup.
    Level,
    /// Notification fires once per transition; recv loops until EAGAIN.
    Edge,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Worker thread count; 0 means one per CPU.
    pub workers: usize,
    pub doc_root: PathBuf,
    pub dispatch: DispatchModel,
    pub trigger: TriggerMode,
    /// Task queue capacity; submissions beyond it are rejected.
    pub queue_capacity: usize,
    /// Connection slab capacity.
    pub max_connections: usize,
    /// Epoll events harvested per wait.
    pub max_events: usize,
    /// SIGALRM interval; idle connections are evicted after three slots.
    pub timeslot_secs: u64,
    /// Credential store pool size.
    pub store_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            workers: 0,
            doc_root: PathBuf::from("./root"),
            dispatch: DispatchModel::Delegated,
            trigger: TriggerMode::Level,
            queue_capacity: 10_000,
            max_connections: 65_536,
            max_events: 1024,
            timeslot_secs: 5,
            store_connections: 8,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> HearthResult<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| HearthError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Effective worker count once the 0-means-all-cores default resolves.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Absolute idle deadline granted to a connection on each activity.
    pub fn idle_timeout_secs(&self) -> u64 {
        self.timeslot_secs * 3
    }

    pub fn validate(&self) -> HearthResult<()> {
        if self.queue_capacity == 0 {
            return Err(HearthError::Config("queue_capacity must be nonzero".into()));
        }
        if self.max_connections == 0 {
            return Err(HearthError::Config("max_connections must be nonzero".into()));
        }
        if self.max_events == 0 {
            return Err(HearthError::Config("max_events must be nonzero".into()));
        }
        if self.timeslot_secs == 0 {
            return Err(HearthError::Config("timeslot_secs must be nonzero".into()));
        }
        if self.store_connections == 0 {
            return Err(HearthError::Config(
                "store_connections must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.json");
        fs::write(
            &path,
            r#"{ "port": 8080, "dispatch": "worker-owned", "trigger": "edge", "workers": 4 }"#,
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.dispatch, DispatchModel::WorkerOwned);
        assert_eq!(cfg.trigger, TriggerMode::Edge);
        assert_eq!(cfg.effective_workers(), 4);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.timeslot_secs, 5);
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let cfg = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
