// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service object host integrations talk to.
//!
//! A [`Monitor`] is started once per process and shared as `Arc<Monitor>`.
//! Web middleware and job runners create a transaction per unit of work,
//! publish events while it runs and complete it at the end:
//!
//! ```rust,no_run
//! # use apm_agent::config::Config;
//! # use apm_agent::monitor::Monitor;
//! # use apm_agent::transaction::{TransactionContext, TransactionDefaults};
//! # use serde_json::Map;
//! let monitor = Monitor::start(Config::default());
//! let transaction = monitor.create_transaction(
//!     "request-1",
//!     TransactionContext::default(),
//!     TransactionDefaults::default(),
//! );
//! monitor.instrument("process_action.web", Map::new(), || {
//!     // handle the request
//! });
//! transaction.complete();
//! ```
//!
//! None of the methods return errors or panic on internal failures; problems
//! are logged and the host carries on.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde_json::{Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::Agent;
use crate::aggregator::middleware::{Capabilities, MiddlewareChain};
use crate::config::Config;
use crate::event::Event;
use crate::ipc::client::IpcClient;
use crate::ipc::server::IpcServer;
use crate::ipc::socket::server_socket_path;
use crate::ipc::IpcError;
use crate::notifications::Notifications;
use crate::proc::current_pid;
use crate::transaction::frontend::FrontendError;
use crate::transaction::registry::{
    clear_current_if, current_id, set_current_id, Registry, SharedTransaction,
};
use crate::transaction::{
    BacktraceCleaner, CapturedError, Kind, PassthroughCleaner, Transaction, TransactionContext,
    TransactionDefaults,
};
use crate::util::{lock, panic_message};
use crate::{logger, AGENT_VERSION};

pub struct Monitor {
    config: Arc<Config>,
    notifications: Arc<Notifications>,
    registry: Arc<Registry>,
    agent: Arc<Agent>,
    backtrace_cleaner: RwLock<Arc<dyn BacktraceCleaner>>,
    ipc_server: Mutex<Option<IpcServer>>,
    ipc_client: Mutex<Option<Arc<IpcClient>>>,
    this: Weak<Monitor>,
}

impl Monitor {
    /// Builds the monitor and, when `config.active`, starts the agent.
    #[must_use]
    pub fn start(config: Config) -> Arc<Self> {
        logger::init(config.log_level);
        let config = Arc::new(config);
        let notifications = Arc::new(Notifications::new());
        let registry = Arc::new(Registry::new());
        let chain = MiddlewareChain::default_chain(
            Capabilities::from_config(&config),
            &config.root_path,
        );
        let agent = Agent::new(
            Arc::clone(&config),
            Arc::clone(&notifications),
            Arc::clone(&registry),
            chain,
        );

        if config.active {
            info!(
                "MONITOR | Starting apm-agent {} for {}",
                AGENT_VERSION, config.env
            );
            agent.start();
        } else {
            info!("MONITOR | Not starting, not active for {}", config.env);
        }

        Arc::new_cyclic(|this| Monitor {
            config,
            notifications,
            registry,
            agent,
            backtrace_cleaner: RwLock::new(Arc::new(PassthroughCleaner)),
            ipc_server: Mutex::new(None),
            ipc_client: Mutex::new(None),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    #[must_use]
    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.config.active && self.agent.is_active()
    }

    /// Replaces the hook used to clean exception backtraces.
    pub fn set_backtrace_cleaner(&self, cleaner: Arc<dyn BacktraceCleaner>) {
        *self
            .backtrace_cleaner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = cleaner;
    }

    fn backtrace_cleaner(&self) -> Arc<dyn BacktraceCleaner> {
        Arc::clone(
            &self
                .backtrace_cleaner
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn is_ignored_exception(&self, error: &CapturedError) -> bool {
        self.config
            .ignore_exceptions
            .iter()
            .any(|ignored| *ignored == error.class_name)
    }

    /// Registers a new transaction and makes it current on the calling thread.
    pub fn create_transaction(
        &self,
        request_id: impl Into<String>,
        context: TransactionContext,
        defaults: TransactionDefaults,
    ) -> TransactionHandle {
        let request_id = request_id.into();
        debug!("MONITOR | Creating transaction: {}", request_id);
        let inner = self
            .registry
            .register(Transaction::new(request_id.clone(), context, defaults));
        TransactionHandle {
            request_id,
            inner,
            monitor: self.this.clone(),
        }
    }

    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        let request_id = current_id()?;
        let inner = self.registry.get(&request_id)?;
        Some(TransactionHandle {
            request_id,
            inner,
            monitor: self.this.clone(),
        })
    }

    pub fn complete_current(&self) {
        match current_id() {
            Some(request_id) => self.complete_transaction(&request_id),
            None => error!("MONITOR | Trying to complete current, but no transaction present"),
        }
    }

    /// Removes the transaction from the registry and hands it on for
    /// delivery if it has a primary event or an exception.
    pub fn complete_transaction(&self, request_id: &str) {
        clear_current_if(request_id);
        let Some(shared) = self.registry.remove(request_id) else {
            error!("MONITOR | Trying to complete unknown transaction: {}", request_id);
            return;
        };
        let transaction = std::mem::take(&mut *lock(&shared));
        if !transaction.is_completable() {
            debug!(
                "MONITOR | Not processing transaction: {} ({} events recorded)",
                request_id,
                transaction.events().len()
            );
            return;
        }
        self.route(transaction);
    }

    /// Sends `transaction` to the master through IPC in a forwarding child,
    /// or to the local agent otherwise.
    fn route(&self, mut transaction: Transaction) {
        let client = lock(&self.ipc_client).clone();
        match client {
            Some(client) => {
                transaction.sanitize_to_primitive_form(&self.config);
                debug!(
                    "IPC | Sending transaction {} to {}",
                    transaction.request_id(),
                    client.path().display()
                );
                if let Err(e) = client.enqueue(&transaction) {
                    error!(
                        "IPC | Failed to forward transaction {}: {}",
                        transaction.request_id(),
                        e
                    );
                }
            }
            None => {
                debug!("MONITOR | Enqueueing transaction: {}", transaction.request_id());
                self.enqueue(transaction);
            }
        }
    }

    /// Hands a completed transaction to the agent. No-op when inactive.
    pub fn enqueue(&self, transaction: Transaction) {
        if !self.is_active() {
            return;
        }
        self.agent.enqueue(transaction);
    }

    /// Records `error` on the current transaction unless its class is ignored.
    pub fn add_exception(&self, error: &CapturedError) {
        if !self.is_active() || self.is_ignored_exception(error) {
            return;
        }
        if let Some(current) = self.registry.current() {
            lock(&current).add_exception(error, self.backtrace_cleaner().as_ref());
        }
    }

    /// Reports `error` in a transaction of its own and asks for an immediate
    /// delivery. The calling thread's current transaction is left in place.
    pub fn send_exception(&self, error: &CapturedError, tags: Option<Map<String, Value>>) {
        if !self.is_active() || self.is_ignored_exception(error) {
            return;
        }
        let previous = current_id();
        let handle = self.create_transaction(
            Uuid::new_v4().to_string(),
            TransactionContext::default(),
            TransactionDefaults {
                kind: Some(Kind::Exception),
                ..TransactionDefaults::default()
            },
        );
        handle.add_exception(error);
        if let Some(tags) = tags {
            handle.set_tags(tags);
        }
        handle.complete();
        set_current_id(previous);
        self.agent.request_flush();
    }

    /// Merges `tags` into the current transaction. Returns whether there was
    /// one.
    pub fn tag_request(&self, tags: Map<String, Value>) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.registry.current() {
            Some(current) => {
                lock(&current).set_tags(tags);
                true
            }
            None => false,
        }
    }

    /// Runs `f` inside a fresh transaction, published as event `name`. An
    /// error returned by `f` is recorded on the transaction; a panic is
    /// recorded and then resumed. `f`'s result is returned unchanged.
    pub fn monitor_transaction<T, E>(
        &self,
        name: &str,
        payload: Map<String, Value>,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::error::Error,
    {
        if !self.is_active() {
            return f();
        }

        let handle = self.create_transaction(
            Uuid::new_v4().to_string(),
            TransactionContext::default(),
            TransactionDefaults::default(),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.notifications.instrument(name, payload, f)
        }));
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    self.add_exception(&CapturedError::from_error(e));
                }
                handle.complete();
                result
            }
            Err(panic) => {
                self.add_exception(&CapturedError::new("panic", panic_message(&*panic)));
                handle.complete();
                panic::resume_unwind(panic)
            }
        }
    }

    /// Runs `f` with event capture paused on the current transaction.
    pub fn without_instrumentation<T>(&self, f: impl FnOnce() -> T) -> T {
        let _paused = PauseGuard::new(self.registry.current());
        f()
    }

    /// Times `f` and publishes it as event `name` on the notifications bus.
    pub fn instrument<T>(
        &self,
        name: &str,
        payload: Map<String, Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        self.notifications.instrument(name, payload, f)
    }

    /// Converts a browser error report into a failed `frontend` transaction
    /// and enqueues it.
    pub fn enqueue_frontend_error(&self, report: FrontendError) {
        if !self.is_active() {
            return;
        }
        self.route(report.into_transaction());
    }

    /// Sends everything pending now, blocking until the attempt finishes.
    pub fn flush(&self) {
        self.agent.flush();
    }

    /// Final flush and shutdown, for process exit.
    pub fn stop(&self) {
        self.agent.shutdown(true, "stop");
        self.stop_ipc();
    }

    /// Starts the forwarding server in the master process. Call before the
    /// host forks its workers.
    pub fn start_ipc_server(&self) -> Result<PathBuf, IpcError> {
        let path = server_socket_path(&self.config.root_path, current_pid());
        let mut slot = lock(&self.ipc_server);
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        info!("IPC | Starting IPC server, listening on {}", path.display());
        *slot = Some(IpcServer::start(path.clone(), Arc::clone(&self.agent))?);
        Ok(path)
    }

    /// Switches a freshly forked child to forwarding: drops the inherited
    /// server handle, connects a client to the master's socket, abandons
    /// the inherited agent thread and starts over with empty buffers.
    pub fn ipc_forked(&self) {
        let inherited = lock(&self.ipc_server).take();
        let path = match inherited {
            Some(server) => {
                let path = server.path().to_path_buf();
                server.abandon();
                path
            }
            None => server_socket_path(&self.config.root_path, self.agent.master_pid()),
        };
        debug!("IPC | Starting IPC client for {}", path.display());
        *lock(&self.ipc_client) = Some(Arc::new(IpcClient::new(path)));
        self.agent.abandon_thread();
        self.agent.reset_generation();
    }

    /// Whether completed transactions are forwarded to a master process.
    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        lock(&self.ipc_client).is_some()
    }

    /// Stops the forwarding server and drops the client, if any.
    pub fn stop_ipc(&self) {
        if let Some(server) = lock(&self.ipc_server).take() {
            server.stop();
        }
        if lock(&self.ipc_client).take().is_some() {
            debug!("IPC | Stopping IPC client");
        }
    }
}

/// Pauses a transaction for the lifetime of the guard.
struct PauseGuard(Option<SharedTransaction>);

impl PauseGuard {
    fn new(transaction: Option<SharedTransaction>) -> Self {
        if let Some(transaction) = &transaction {
            lock(transaction).pause();
        }
        PauseGuard(transaction)
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(transaction) = &self.0 {
            lock(transaction).resume();
        }
    }
}

/// Handle to a live transaction, returned by [`Monitor::create_transaction`].
#[derive(Clone)]
pub struct TransactionHandle {
    request_id: String,
    inner: SharedTransaction,
    monitor: Weak<Monitor>,
}

impl TransactionHandle {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn add_event(&self, event: Event) {
        lock(&self.inner).add_event(event);
    }

    pub fn set_primary_request_event(&self, event: &Event) {
        lock(&self.inner).set_primary_request_event(event);
    }

    pub fn set_primary_job_event(&self, event: &Event) {
        lock(&self.inner).set_primary_job_event(event);
    }

    pub fn set_tags(&self, tags: Map<String, Value>) {
        lock(&self.inner).set_tags(tags);
    }

    /// Records `error`, cleaning its backtrace with the monitor's cleaner.
    pub fn add_exception(&self, error: &CapturedError) {
        let cleaner: Arc<dyn BacktraceCleaner> = match self.monitor.upgrade() {
            Some(monitor) => monitor.backtrace_cleaner(),
            None => Arc::new(PassthroughCleaner),
        };
        lock(&self.inner).add_exception(error, cleaner.as_ref());
    }

    pub fn pause(&self) {
        lock(&self.inner).pause();
    }

    pub fn resume(&self) {
        lock(&self.inner).resume();
    }

    /// Runs `f` with read access to the transaction.
    pub fn with<T>(&self, f: impl FnOnce(&Transaction) -> T) -> T {
        f(&*lock(&self.inner))
    }

    pub fn complete(self) {
        match self.monitor.upgrade() {
            Some(monitor) => monitor.complete_transaction(&self.request_id),
            None => error!(
                "MONITOR | Monitor gone, dropping transaction: {}",
                self.request_id
            ),
        }
    }
}
