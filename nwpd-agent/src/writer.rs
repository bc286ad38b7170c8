//! Observation storage
//!
//! `FileObservationWriter` appends length-delimited protobuf records to one
//! file per hour (`<prefix>-YYYYMMDD-HH.pb`) in the output directory. `add`
//! only enqueues; a drain task started with `run` does the file I/O and
//! deletes files older than the retention period whenever the hour rolls.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use nwpd_proto::{GetObservationsRequest, Observation};
use prost::Message;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify, OnceCell};
use tracing::{debug, info, warn};

const FILE_SUFFIX: &str = ".pb";
const HOUR_FORMAT: &str = "%Y%m%d-%H";

/// Writer slot created on the first config that names an output directory
pub type SharedWriter = Arc<OnceCell<Arc<dyn ObservationWriter>>>;

#[async_trait]
pub trait ObservationWriter: Send + Sync {
    /// Enqueue an observation; never blocks
    fn add(&self, obs: Arc<Observation>);

    async fn list_observations(&self, options: &ListObservationsOptions)
        -> Result<Vec<Observation>>;

    /// Drain loop; returns after `stop`
    async fn run(&self);

    /// Flush pending observations and end the drain loop
    async fn stop(&self);
}

/// Filters for `list_observations`. Empty filter sets match everything.
#[derive(Debug, Clone, Default)]
pub struct ListObservationsOptions {
    /// Keep at most this many of the newest matches, 0 means no limit
    pub limit: usize,
    pub job_ids: HashSet<String>,
    pub src_hosts: HashSet<String>,
    pub dest_hosts: HashSet<String>,
    pub failures_only: bool,
    /// Inclusive
    pub start: Option<DateTime<Utc>>,
    /// Exclusive
    pub end: Option<DateTime<Utc>>,
}

impl ListObservationsOptions {
    pub fn matches(&self, obs: &Observation) -> bool {
        if self.failures_only && obs.ok {
            return false;
        }
        if !self.job_ids.is_empty() && !self.job_ids.contains(&obs.job_id) {
            return false;
        }
        if !self.src_hosts.is_empty() && !self.src_hosts.contains(&obs.src_host) {
            return false;
        }
        if !self.dest_hosts.is_empty() && !self.dest_hosts.contains(&obs.dest_host) {
            return false;
        }
        let t = obs.time();
        if self.start.is_some_and(|start| t < start) {
            return false;
        }
        if self.end.is_some_and(|end| t >= end) {
            return false;
        }
        true
    }

    /// Sort matches by time and apply the limit
    pub fn finish(&self, mut observations: Vec<Observation>) -> Vec<Observation> {
        observations.sort_by_key(|o| o.time());
        if self.limit > 0 && observations.len() > self.limit {
            observations.drain(..observations.len() - self.limit);
        }
        observations
    }
}

impl From<&GetObservationsRequest> for ListObservationsOptions {
    fn from(request: &GetObservationsRequest) -> Self {
        Self {
            limit: request.limit.max(0) as usize,
            job_ids: request.restrict_to_job_ids.iter().cloned().collect(),
            src_hosts: request.restrict_to_src_hosts.iter().cloned().collect(),
            dest_hosts: request.restrict_to_dest_hosts.iter().cloned().collect(),
            failures_only: request.failures_only,
            start: request.start.as_ref().map(nwpd_proto::time::from_timestamp),
            end: request.end.as_ref().map(nwpd_proto::time::from_timestamp),
        }
    }
}

enum Command {
    Add(Arc<Observation>),
    Stop,
}

pub struct FileObservationWriter {
    dir: PathBuf,
    prefix: String,
    retention: ChronoDuration,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    running: AtomicBool,
    stopped: Notify,
}

impl FileObservationWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        retention_hours: u32,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.into();
        info!(
            "writing observations to {} (prefix {}, retention {}h)",
            dir.display(),
            prefix,
            retention_hours
        );
        Ok(Self {
            dir,
            prefix,
            retention: ChronoDuration::hours(retention_hours as i64),
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            stopped: Notify::new(),
        })
    }

    fn file_name(&self, hour: &str) -> String {
        format!("{}-{}{}", self.prefix, hour, FILE_SUFFIX)
    }

    /// Files of this writer with the hour they start at
    fn data_files(&self) -> Result<Vec<(DateTime<Utc>, PathBuf)>> {
        let mut files = Vec::new();
        let head = format!("{}-", self.prefix);
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(hour) = name
                .strip_prefix(&head)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            if let Some(start) = parse_hour(hour) {
                files.push((start, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    fn delete_expired(&self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let files = match self.data_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("cannot list observation files in {}: {}", self.dir.display(), e);
                return;
            }
        };
        for (start, path) in files {
            if start + ChronoDuration::hours(1) <= cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("deleted expired observation file {}", path.display()),
                    Err(e) => warn!("cannot delete {}: {}", path.display(), e),
                }
            }
        }
    }

    async fn write_batch(
        &self,
        current: &mut Option<(String, tokio::fs::File)>,
        batch: &[Arc<Observation>],
    ) -> Result<()> {
        for obs in batch {
            let hour = obs.time().format(HOUR_FORMAT).to_string();
            let rolled = current.as_ref().map_or(true, |(h, _)| *h != hour);
            if rolled {
                if let Some((_, mut file)) = current.take() {
                    file.flush().await?;
                }
                let path = self.dir.join(self.file_name(&hour));
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                debug!("writing observations to {}", path.display());
                *current = Some((hour, file));
                self.delete_expired(Utc::now());
            }
            if let Some((_, file)) = current.as_mut() {
                file.write_all(&obs.encode_length_delimited_to_vec()).await?;
            }
        }
        if let Some((_, file)) = current.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObservationWriter for FileObservationWriter {
    fn add(&self, obs: Arc<Observation>) {
        if self.tx.send(Command::Add(obs)).is_err() {
            debug!("observation writer stopped, dropping observation");
        }
    }

    async fn list_observations(&self, options: &ListObservationsOptions) -> Result<Vec<Observation>> {
        let mut result = Vec::new();
        for (start, path) in self.data_files()? {
            let end = start + ChronoDuration::hours(1);
            if options.start.is_some_and(|s| end <= s) || options.end.is_some_and(|e| start >= e) {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                // deleted by retention in the meantime
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut buf = data.as_slice();
            while !buf.is_empty() {
                match Observation::decode_length_delimited(&mut buf) {
                    Ok(obs) => {
                        if options.matches(&obs) {
                            result.push(obs);
                        }
                    }
                    Err(e) => {
                        // a record still being appended
                        debug!("stop reading {}: {}", path.display(), e);
                        break;
                    }
                }
            }
        }
        Ok(options.finish(result))
    }

    async fn run(&self) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("observation writer already running");
            return;
        };
        self.running.store(true, Ordering::Release);
        self.delete_expired(Utc::now());

        let mut current = None;
        let mut batch = Vec::new();
        let mut stop = false;
        while !stop {
            let Some(cmd) = rx.recv().await else { break };
            let mut next = Some(cmd);
            while let Some(cmd) = next.take() {
                match cmd {
                    Command::Add(obs) => batch.push(obs),
                    Command::Stop => stop = true,
                }
                if !stop {
                    next = rx.try_recv().ok();
                }
            }
            if let Err(e) = self.write_batch(&mut current, &batch).await {
                warn!("cannot write observations to {}: {}", self.dir.display(), e);
            }
            batch.clear();
        }

        info!("observation writer stopped");
        self.stopped.notify_one();
    }

    async fn stop(&self) {
        if self.tx.send(Command::Stop).is_err() {
            return;
        }
        if self.running.load(Ordering::Acquire) {
            self.stopped.notified().await;
        }
    }
}

fn parse_hour(hour: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(&format!("{}00", hour), "%Y%m%d-%H%M")
        .ok()
        .map(|t| t.and_utc())
        .filter(|t| t.minute() == 0)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AgentError;

    /// Keeps observations in memory, in insertion order
    #[derive(Default)]
    pub struct MemoryWriter {
        pub observations: std::sync::Mutex<Vec<Observation>>,
        pub fail_with: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl ObservationWriter for MemoryWriter {
        fn add(&self, obs: Arc<Observation>) {
            self.observations.lock().unwrap().push((*obs).clone());
        }

        async fn list_observations(
            &self,
            options: &ListObservationsOptions,
        ) -> Result<Vec<Observation>> {
            if let Some(msg) = self.fail_with.lock().unwrap().clone() {
                return Err(AgentError::Storage(msg));
            }
            let matching = self
                .observations
                .lock()
                .unwrap()
                .iter()
                .filter(|o| options.matches(o))
                .cloned()
                .collect();
            Ok(options.finish(matching))
        }

        async fn run(&self) {}

        async fn stop(&self) {}
    }
}
