//! Continuous polling of configured diagnostic targets.
//!
//! Each pass selects every target in list order (`ATSH <target>`), sends its
//! request and stores the trimmed answer. Subscribers are notified once per
//! completed pass. The list is re-read every pass, so edits made while the
//! loop runs are picked up without restarting it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PollerConfig;
use crate::errors::{DriverError, Result};
use crate::protocol::{Commander, PROMPT};
use crate::scope::Scope;

/// Response shown for a target that has not answered yet.
pub const NO_DATA: &str = "NO DATA";

/// Commander shared between the poll loop and whoever owns the link.
pub type SharedCommander = Arc<Mutex<Box<dyn Commander>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub id: Uuid,
    /// ECU header selected before the request is sent.
    pub target: String,
    pub request: String,
    /// Last trimmed answer, `NO DATA` until one arrives.
    pub response: String,
    /// Error from the most recent attempt, cleared on success.
    pub last_error: Option<String>,
}

impl TargetConfig {
    pub fn new(target: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            request: request.into(),
            response: NO_DATA.to_string(),
            last_error: None,
        }
    }
}

/// Ordered, observable target list.
#[derive(Clone)]
pub struct TargetList {
    tx: Arc<watch::Sender<Vec<TargetConfig>>>,
}

impl Default for TargetList {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetList {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TargetConfig>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<TargetConfig> {
        self.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn push(&self, target: TargetConfig) {
        self.tx.send_modify(|targets| targets.push(target));
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.tx.send_if_modified(|targets| {
            let before = targets.len();
            targets.retain(|t| t.id != id);
            targets.len() != before
        })
    }

    pub fn edit(&self, id: Uuid, target: &str, request: &str) -> bool {
        self.tx
            .send_if_modified(|targets| match targets.iter_mut().find(|t| t.id == id) {
                Some(entry) => {
                    entry.target = target.to_string();
                    entry.request = request.to_string();
                    true
                }
                None => false,
            })
    }

    /// Store the outcome of one poll without notifying subscribers.
    fn record(&self, id: Uuid, outcome: std::result::Result<String, String>) {
        self.tx.send_if_modified(|targets| {
            if let Some(entry) = targets.iter_mut().find(|t| t.id == id) {
                match outcome {
                    Ok(response) => {
                        entry.response = response;
                        entry.last_error = None;
                    }
                    Err(error) => entry.last_error = Some(error),
                }
            }
            false
        });
    }

    /// Notify subscribers that a pass completed.
    fn publish(&self) {
        self.tx.send_modify(|_| {});
    }
}

#[derive(Debug, Clone)]
struct PollSettings {
    select_prefix: String,
    response_timeout: Duration,
    resync_delay: Duration,
}

/// Runs the poll loop over a [`TargetList`] on an attached commander.
pub struct Poller {
    targets: TargetList,
    settings: PollSettings,
    commander: Option<SharedCommander>,
    scope: Scope,
    task: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
    starts: u64,
    /// A loop was stopped mid-exchange on the current commander.
    interrupted: bool,
}

impl Poller {
    pub fn new(targets: TargetList, config: &PollerConfig, response_timeout: Duration) -> Self {
        Self {
            targets,
            settings: PollSettings {
                select_prefix: config.select_prefix.clone(),
                response_timeout,
                resync_delay: config.resync_delay(),
            },
            commander: None,
            scope: Scope::new(),
            task: None,
            passes: Arc::new(AtomicU64::new(0)),
            starts: 0,
            interrupted: false,
        }
    }

    /// Use `commander` for subsequent loops. A running loop is stopped first.
    pub fn attach(&mut self, commander: SharedCommander) {
        self.stop();
        self.commander = Some(commander);
        self.interrupted = false;
    }

    /// Stop polling and forget the commander.
    pub fn detach(&mut self) {
        self.stop();
        self.commander = None;
    }

    pub fn is_attached(&self) -> bool {
        self.commander.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Completed passes over the list since creation.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Number of loops started since creation.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Start the loop unless it is already running. Returns whether a loop was started.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        let Some(commander) = self.commander.clone() else {
            debug!("poller start ignored: no adapter attached");
            return false;
        };
        if self.targets.is_empty() {
            return false;
        }

        let scope = self.scope.replace();
        let targets = self.targets.clone();
        let settings = self.settings.clone();
        let passes = self.passes.clone();
        let resync_first = std::mem::take(&mut self.interrupted);
        self.starts += 1;
        info!("poller started ({} targets)", targets.len());

        self.task = Some(tokio::spawn(async move {
            let outcome = scope
                .run(poll_loop(targets, commander, settings, passes, resync_first))
                .await;
            match outcome {
                Ok(()) => info!("poller stopped: target list empty"),
                Err(e) if e.is_cancelled() => debug!("poller cancelled"),
                Err(e) => warn!("poller stopped: {}", e),
            }
        }));
        true
    }

    /// Cancel the running loop. No-op when idle.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            self.scope.cancel();
            if !task.is_finished() {
                self.interrupted = true;
                info!("poller stopped");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn poll_loop(
    targets: TargetList,
    commander: SharedCommander,
    settings: PollSettings,
    passes: Arc<AtomicU64>,
    resync_first: bool,
) -> Result<()> {
    if resync_first {
        debug!("discarding output of the interrupted exchange");
        commander.lock().await.flush(settings.resync_delay).await?;
    }
    loop {
        let pass = targets.snapshot();
        if pass.is_empty() {
            return Ok(());
        }
        for target in &pass {
            let outcome = {
                let mut link = commander.lock().await;
                let outcome = poll_target(link.as_mut(), &settings, target).await;
                if outcome.as_ref().is_err_and(|e| !e.is_cancelled()) {
                    // A late answer would otherwise be read as the reply to the next command.
                    link.flush(settings.resync_delay).await?;
                }
                outcome
            };
            match outcome {
                Ok(response) => targets.record(target.id, Ok(response)),
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(e) => {
                    debug!("poll of {} {} failed: {}", target.target, target.request, e);
                    targets.record(target.id, Err(e.to_string()));
                }
            }
        }
        passes.fetch_add(1, Ordering::Relaxed);
        targets.publish();
        tokio::task::yield_now().await;
    }
}

/// Select the target, then send its request. The select's answer is not
/// used; a short or missing one only matters if output may still follow.
async fn poll_target(
    link: &mut dyn Commander,
    settings: &PollSettings,
    target: &TargetConfig,
) -> Result<String> {
    let select = format!("{} {}", settings.select_prefix, target.target);
    match link
        .send_command_with_response(&select, settings.response_timeout)
        .await
    {
        Ok(_) => {}
        Err(DriverError::MalformedResponse { raw, .. }) => {
            debug!("short answer to {:?}: {:?}", select, raw);
            if !raw.ends_with(PROMPT) {
                link.flush(settings.resync_delay).await?;
            }
        }
        Err(e) => return Err(e),
    }
    let response = link
        .send_command_with_response(&target.request, settings.response_timeout)
        .await?;
    Ok(response.trim().to_string())
}

/// Owner of the target list: mutations start and stop the poller.
///
/// Adding the first target starts the loop, removing the last one stops it;
/// every other edit only changes what the next pass sees.
pub struct TargetManager {
    targets: TargetList,
    poller: Poller,
}

impl TargetManager {
    pub fn new(config: &PollerConfig, response_timeout: Duration) -> Self {
        let targets = TargetList::new();
        let poller = Poller::new(targets.clone(), config, response_timeout);
        Self { targets, poller }
    }

    pub fn targets(&self) -> &TargetList {
        &self.targets
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn add_target(&mut self, target: &str, request: &str) -> Uuid {
        let entry = TargetConfig::new(target.trim(), request.trim());
        let id = entry.id;
        self.targets.push(entry);
        if self.targets.len() == 1 {
            self.poller.start();
        }
        id
    }

    pub fn remove_target(&mut self, id: Uuid) -> bool {
        let removed = self.targets.remove(id);
        if removed && self.targets.is_empty() {
            self.poller.stop();
        }
        removed
    }

    pub fn edit_target(&mut self, id: Uuid, target: &str, request: &str) -> bool {
        self.targets.edit(id, target.trim(), request.trim())
    }

    /// Poll over a freshly connected adapter.
    pub fn attach(&mut self, commander: SharedCommander) {
        self.poller.attach(commander);
        self.poller.start();
    }

    pub fn detach(&mut self) {
        self.poller.detach();
    }
}
