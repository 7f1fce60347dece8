use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::limits::*;
use crate::notify::{LogDispatcher, NotifyHub};
use crate::reaper;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Manages per-school schedulers. Each school gets its own scheduler + WAL +
/// background sweeps. School = database name from the pgwire connection.
pub struct SchoolManager {
    schedulers: DashMap<String, Arc<Scheduler>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: SchedulerConfig,
}

impl SchoolManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, config: SchedulerConfig) -> Self {
        Self {
            schedulers: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
        }
    }

    /// Get or lazily create a scheduler for the given school.
    pub fn get_or_create(&self, school: &str) -> std::io::Result<Arc<Scheduler>> {
        if let Some(scheduler) = self.schedulers.get(school) {
            return Ok(scheduler.value().clone());
        }
        if school.len() > MAX_SCHOOL_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "school name too long",
            ));
        }
        if self.schedulers.len() >= MAX_SCHOOLS {
            return Err(std::io::Error::other("too many schools"));
        }

        // Sanitize school name to prevent path traversal
        let safe_name: String = school
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty school name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let scheduler = Arc::new(Scheduler::new(
            wal_path,
            notify,
            Arc::new(LogDispatcher),
            self.config,
        )?);

        // Spawn approval sweeper + compactor for this school
        let sweeper_scheduler = scheduler.clone();
        tokio::spawn(async move {
            reaper::run_approval_sweeper(sweeper_scheduler).await;
        });
        let compactor_scheduler = scheduler.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_scheduler, threshold).await;
        });

        self.schedulers.insert(school.to_string(), scheduler.clone());
        metrics::gauge!(crate::observability::SCHOOLS_ACTIVE).set(self.schedulers.len() as f64);
        Ok(scheduler)
    }
}
