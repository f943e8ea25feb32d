// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background delivery of completed transactions.
//!
//! The agent owns one *generation* of per-process state: the active
//! aggregator, the retry queue, the HTTP client and the delivery thread. A
//! forked child detects the pid change on its first enqueue and replaces the
//! whole generation; nothing inherited from the parent is joined or reused.
//!
//! The delivery thread runs a current-thread tokio runtime:
//!
//! 1. sleep a random jitter in `[0, interval)`
//! 2. if anything is pending, `send_queue`, which ends by truncating the
//!    retry queue to [`RETRY_QUEUE_LIMIT`]
//! 3. sleep `interval` (cut short by [`Agent::request_flush`]) and repeat
//!
//! Response codes adjust the pacing or shut the agent down, see
//! [`Agent::handle_result`].

pub mod retry_queue;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::middleware::MiddlewareChain;
use crate::aggregator::post_processor::PostProcessor;
use crate::aggregator::SharedAggregator;
use crate::config::Config;
use crate::event::Event;
use crate::notifications::{Notifications, Subscriber, SubscriptionId};
use crate::payload::Payload;
use crate::proc::{current_pid, hostname::get_hostname};
use crate::transaction::registry::Registry;
use crate::transaction::Transaction;
use crate::transmitter::Transmitter;
use crate::util::{lock, panic_message};

use retry_queue::RetryQueue;

/// Path segment appended to the endpoint for transaction batches.
pub const ACTION: &str = "";

/// Payloads kept for retry. Older payloads are dropped first.
pub const RETRY_QUEUE_LIMIT: usize = 3;

pub const BACKOFF_FACTOR: f64 = 1.5;

/// Bounds for the sleep interval as it is scaled by 420 and 413 responses.
pub const MIN_SLEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_SLEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const REVISION_ENV: &str = "APP_REVISION";

const REQUEST_EVENT_PREFIX: &str = "process_action";
const JOB_EVENT_PREFIX: &str = "perform_job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Inactive,
    Active,
    Shutdown,
}

struct Worker {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// State that belongs to one process. Replaced wholesale after a fork.
struct Generation {
    aggregator: SharedAggregator,
    retry_queue: Mutex<RetryQueue>,
    transmitter: Option<Transmitter>,
    transmission_successful: AtomicBool,
    flush_requested: Notify,
    // Held for a whole send so a payload is never transmitted twice.
    sending: AsyncMutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl Generation {
    fn new(config: &Config, hostname: &str) -> Self {
        let transmitter = match Transmitter::new(config, ACTION, hostname) {
            Ok(transmitter) => Some(transmitter),
            Err(e) => {
                error!("AGENT | Unable to create transmitter: {}", e);
                None
            }
        };
        Generation {
            aggregator: SharedAggregator::new(),
            retry_queue: Mutex::new(RetryQueue::new()),
            transmitter,
            transmission_successful: AtomicBool::new(true),
            flush_requested: Notify::new(),
            sending: AsyncMutex::new(()),
            worker: Mutex::new(None),
        }
    }

    fn has_pending(&self) -> bool {
        self.aggregator.has_pending() || !lock(&self.retry_queue).is_empty()
    }

    fn truncate_retry_queue(&self) {
        let dropped = lock(&self.retry_queue).truncate(RETRY_QUEUE_LIMIT);
        if dropped > 0 {
            error!(
                "AGENT | Retry queue too large, dropped {} oldest payloads",
                dropped
            );
        }
    }
}

pub struct Agent {
    config: Arc<Config>,
    notifications: Arc<Notifications>,
    registry: Arc<Registry>,
    post_processor: PostProcessor,
    hostname: String,
    master_pid: u32,
    pid: AtomicU32,
    state: Mutex<AgentState>,
    sleep_interval: Mutex<Option<Duration>>,
    subscription: Mutex<Option<SubscriptionId>>,
    generation: Mutex<Arc<Generation>>,
}

impl Agent {
    /// Creates an inactive agent. Call [`Agent::start`] to begin delivery.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        notifications: Arc<Notifications>,
        registry: Arc<Registry>,
        chain: MiddlewareChain,
    ) -> Arc<Self> {
        let hostname = get_hostname();
        let revision = std::env::var(REVISION_ENV).ok();
        let post_processor = PostProcessor::new(Arc::clone(&config), chain, revision);
        let sleep_interval = config.flush_strategy.interval(&config.env);
        let generation = Arc::new(Generation::new(&config, &hostname));
        let pid = current_pid();

        Arc::new(Agent {
            config,
            notifications,
            registry,
            post_processor,
            hostname,
            master_pid: pid,
            pid: AtomicU32::new(pid),
            state: Mutex::new(AgentState::Inactive),
            sleep_interval: Mutex::new(sleep_interval),
            subscription: Mutex::new(None),
            generation: Mutex::new(generation),
        })
    }

    /// Subscribes to the notifications bus and starts the delivery thread.
    /// Does nothing unless the configuration is active.
    pub fn start(self: &Arc<Self>) {
        if !self.config.active {
            info!("AGENT | Not starting, not active for {}", self.config.env);
            return;
        }
        self.subscribe();
        self.start_thread();
        *lock(&self.state) = AgentState::Active;
        info!("AGENT | Started agent for {}", self.config.env);
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == AgentState::Active
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub fn master_pid(&self) -> u32 {
        self.master_pid
    }

    /// Pid of the process the current generation belongs to.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Overrides the pid recorded for the current generation. The next
    /// enqueue from a process with a different pid rebuilds the generation.
    #[doc(hidden)]
    pub fn set_recorded_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    /// Current pause between delivery cycles, `None` with the manual strategy.
    #[must_use]
    pub fn sleep_interval(&self) -> Option<Duration> {
        *lock(&self.sleep_interval)
    }

    #[must_use]
    pub fn post_processor(&self) -> &PostProcessor {
        &self.post_processor
    }

    /// Transactions waiting in the active aggregator.
    #[must_use]
    pub fn pending_transactions(&self) -> usize {
        self.current_generation().aggregator.len()
    }

    #[must_use]
    pub fn retry_queue_len(&self) -> usize {
        lock(&self.current_generation().retry_queue).len()
    }

    /// Whether the last delivery attempt left the retry queue empty.
    #[must_use]
    pub fn transmission_successful(&self) -> bool {
        self.current_generation()
            .transmission_successful
            .load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_thread_running(&self) -> bool {
        lock(&self.current_generation().worker)
            .as_ref()
            .is_some_and(|worker| !worker.cancel.is_cancelled() && !worker.thread.is_finished())
    }

    fn current_generation(&self) -> Arc<Generation> {
        Arc::clone(&lock(&self.generation))
    }

    /// Appends a completed transaction to the active aggregator. Never
    /// blocks on I/O. Transactions are dropped unless the agent is active.
    pub fn enqueue(self: &Arc<Self>, transaction: Transaction) {
        self.fork_if_pid_changed();
        if !self.is_active() {
            debug!(
                "AGENT | Agent not active, dropping transaction: {}",
                transaction.request_id()
            );
            return;
        }
        if let Some(action) = transaction.action() {
            if self.config.ignore_actions.iter().any(|ignored| ignored == action) {
                debug!(
                    "AGENT | Ignoring transaction: {} ({})",
                    transaction.request_id(),
                    action
                );
                return;
            }
        }
        self.current_generation()
            .aggregator
            .add(transaction, &self.config);
    }

    /// Rebuilds the per-process state in a forked child.
    pub fn forked(self: &Arc<Self>) {
        info!("AGENT | Forked worker process");
        self.reset_generation();
        self.restart();
    }

    /// Replaces the per-process state with an empty generation owned by the
    /// calling process, without starting a delivery thread. Payloads and
    /// transactions inherited from a parent are left to the parent.
    pub fn reset_generation(&self) {
        let mut slot = lock(&self.generation);
        self.install_generation(&mut slot, current_pid());
    }

    /// Runs the fork handling once per new process, however many threads
    /// notice the pid change at the same time.
    fn fork_if_pid_changed(self: &Arc<Self>) {
        let pid = current_pid();
        if self.pid() == pid {
            return;
        }
        let mut slot = lock(&self.generation);
        if self.pid() == pid {
            return;
        }
        self.install_generation(&mut slot, pid);
        drop(slot);

        info!("AGENT | Forked worker process");
        self.restart();
    }

    fn install_generation(&self, slot: &mut Arc<Generation>, pid: u32) {
        let fresh = Arc::new(Generation::new(&self.config, &self.hostname));
        let inherited = std::mem::replace(slot, fresh);
        // The parent's delivery thread does not exist here; its handles are
        // never touched again.
        std::mem::forget(inherited);
        self.pid.store(pid, Ordering::Release);
    }

    fn restart(self: &Arc<Self>) {
        self.resubscribe();
        self.start_thread();
        *lock(&self.state) = AgentState::Active;
    }

    /// Forgets the delivery thread inherited from a parent process without
    /// signalling it.
    pub fn abandon_thread(&self) {
        if let Some(worker) = lock(&self.current_generation().worker).take() {
            debug!("AGENT | Abandoning inherited agent thread");
            std::mem::forget(worker);
        }
    }

    /// Deactivates the agent. With `flush`, and only when the previous
    /// delivery fully succeeded, makes one last blocking delivery attempt.
    pub fn shutdown(&self, flush: bool, reason: &str) {
        info!("AGENT | Shutting down agent ({})", reason);
        *lock(&self.state) = AgentState::Shutdown;
        self.unsubscribe();
        self.stop_thread();

        let generation = self.current_generation();
        if flush && generation.transmission_successful.load(Ordering::Relaxed) {
            self.flush_generation(&generation);
        }
    }

    /// Cancels the delivery loop. A send in flight is abandoned; its payload
    /// stays queued.
    pub fn stop_thread(&self) {
        if let Some(worker) = lock(&self.current_generation().worker).take() {
            debug!("AGENT | Stopping agent thread");
            worker.cancel.cancel();
        }
    }

    /// Wakes the delivery loop for an immediate send. Without a delivery
    /// thread the queue is sent on the calling thread.
    pub fn request_flush(&self) {
        let generation = self.current_generation();
        let running = lock(&generation.worker).is_some();
        if running {
            debug!("AGENT | Flush requested");
            generation.flush_requested.notify_one();
        } else {
            self.flush_generation(&generation);
        }
    }

    /// Sends the queue and waits for the attempt to finish.
    pub fn flush(&self) {
        self.flush_generation(&self.current_generation());
    }

    /// Drains the aggregator into a payload, queues it ahead of older
    /// payloads and attempts delivery of the whole retry queue.
    pub async fn send_queue(&self) {
        let generation = self.current_generation();
        self.send_generation(&generation).await;
    }

    async fn send_generation(&self, generation: &Generation) {
        let _sending = generation.sending.lock().await;
        debug!("AGENT | Sending queue");
        if !generation.has_pending() {
            return;
        }

        let records = generation
            .aggregator
            .drain_and_post_process(&self.post_processor);
        if !records.is_empty() {
            match Payload::build(&records) {
                Ok(payload) => {
                    lock(&generation.retry_queue).push_front(payload);
                }
                Err(e) => error!(
                    "AGENT | Failed to build payload, dropping {} transactions: {}",
                    records.len(),
                    e
                ),
            }
        }

        self.send_retry_queue(generation).await;
        generation.truncate_retry_queue();
    }

    async fn send_retry_queue(&self, generation: &Generation) {
        let Some(transmitter) = &generation.transmitter else {
            error!("AGENT | No transmitter available, keeping payloads queued");
            generation
                .transmission_successful
                .store(false, Ordering::Relaxed);
            return;
        };

        let entries = lock(&generation.retry_queue).snapshot();
        for entry in entries {
            let delivered = match transmitter.transmit(&entry.payload).await {
                Ok(code) => self.handle_result(code),
                Err(e) => {
                    error!("AGENT | {} while sending queued payload", e);
                    false
                }
            };
            if delivered {
                lock(&generation.retry_queue).remove(entry.id);
            }
        }

        let empty = lock(&generation.retry_queue).is_empty();
        generation
            .transmission_successful
            .store(empty, Ordering::Relaxed);
    }

    /// Interprets a response status. Returns whether the payload can leave
    /// the retry queue.
    pub fn handle_result(&self, code: u16) -> bool {
        debug!("AGENT | Queue sent, response code: {}", code);
        match code {
            200 => true,
            420 => {
                info!("AGENT | Increasing sleep time since the server told us to");
                self.scale_sleep_interval(BACKOFF_FACTOR);
                true
            }
            413 => {
                info!("AGENT | Decreasing sleep time since our last push was too large");
                self.scale_sleep_interval(1.0 / BACKOFF_FACTOR);
                true
            }
            429 => {
                error!("AGENT | Too many requests sent");
                self.shutdown(false, "429");
                true
            }
            406 => {
                error!("AGENT | This agent version can no longer communicate with the API, please upgrade");
                self.shutdown(false, "406");
                true
            }
            402 => {
                error!("AGENT | Payment required");
                self.shutdown(false, "402");
                true
            }
            401 => {
                error!("AGENT | API token cannot be authorized");
                self.shutdown(false, "401");
                true
            }
            400 => {
                error!("AGENT | Malformed payload rejected");
                true
            }
            other => {
                error!("AGENT | Unknown response code: '{}'", other);
                false
            }
        }
    }

    fn scale_sleep_interval(&self, factor: f64) {
        let mut interval = lock(&self.sleep_interval);
        if let Some(current) = *interval {
            let scaled = (current.as_secs_f64() * factor).clamp(
                MIN_SLEEP_INTERVAL.as_secs_f64(),
                MAX_SLEEP_INTERVAL.as_secs_f64(),
            );
            *interval = Some(Duration::from_secs_f64(scaled));
        }
    }

    fn subscribe(&self) {
        debug!("AGENT | Subscribing to notifications");
        let registry = Arc::clone(&self.registry);
        let subscriber: Subscriber = Arc::new(move |event: &Event| {
            let Some(current) = registry.current() else {
                return;
            };
            let mut transaction = lock(&current);
            if event.name.starts_with(REQUEST_EVENT_PREFIX) {
                transaction.set_primary_request_event(event);
            } else if event.name.starts_with(JOB_EVENT_PREFIX) {
                transaction.set_primary_job_event(event);
            }
            transaction.add_event(event.clone());
        });
        *lock(&self.subscription) = Some(self.notifications.subscribe(subscriber));
    }

    fn unsubscribe(&self) {
        if let Some(id) = lock(&self.subscription).take() {
            debug!("AGENT | Unsubscribing from notifications");
            self.notifications.unsubscribe(id);
        }
    }

    fn resubscribe(&self) {
        self.unsubscribe();
        self.subscribe();
    }

    fn start_thread(self: &Arc<Self>) {
        let Some(interval) = self.sleep_interval() else {
            debug!("AGENT | Manual flush strategy, no agent thread started");
            return;
        };
        debug!("AGENT | Starting agent thread");

        let generation = self.current_generation();
        let cancel = CancellationToken::new();
        let agent = Arc::downgrade(self);
        let loop_generation = Arc::clone(&generation);
        let loop_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name("apm-agent".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("AGENT | Unable to create runtime for agent thread: {}", e);
                        return;
                    }
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(run_loop(agent, loop_generation, loop_cancel, interval));
                }));
                if let Err(panic) = result {
                    error!("AGENT | Agent thread panicked: {}", panic_message(&*panic));
                }
            });

        match spawned {
            Ok(thread) => *lock(&generation.worker) = Some(Worker { cancel, thread }),
            Err(e) => error!("AGENT | Unable to spawn agent thread: {}", e),
        }
    }

    /// Runs one send of `generation` on a scoped thread with its own
    /// runtime, so it is safe to call from inside another runtime.
    fn flush_generation(&self, generation: &Generation) {
        thread::scope(|scope| {
            let spawned = thread::Builder::new()
                .name("apm-agent-flush".to_string())
                .spawn_scoped(scope, || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime.block_on(self.send_generation(generation)),
                        Err(e) => error!("AGENT | Unable to create runtime for flush: {}", e),
                    }
                });
            match spawned {
                Ok(handle) => {
                    if handle.join().is_err() {
                        error!("AGENT | Flush thread panicked");
                    }
                }
                Err(e) => error!("AGENT | Unable to spawn flush thread: {}", e),
            }
        });
    }
}

async fn run_loop(
    agent: Weak<Agent>,
    generation: Arc<Generation>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let jitter = interval.mul_f64(fastrand::f64());
    if !pause(&generation, &cancel, jitter).await {
        return;
    }

    loop {
        let Some(agent) = agent.upgrade() else {
            debug!("AGENT | Agent dropped, leaving agent thread");
            return;
        };

        if generation.has_pending() {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("AGENT | Agent thread cancelled during send");
                    return;
                }
                () = agent.send_generation(&generation) => {}
            }
        }

        let interval = agent.sleep_interval().unwrap_or(interval);
        drop(agent);
        debug!("AGENT | Sleeping {:?}", interval);
        if !pause(&generation, &cancel, interval).await {
            return;
        }
    }
}

/// Sleeps for `duration` or until a flush is requested. Returns `false` once
/// the loop is cancelled.
async fn pause(generation: &Generation, cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
        () = generation.flush_requested.notified() => true,
    }
}
