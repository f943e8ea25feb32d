// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::Agent;
use crate::ipc::socket::{remove_stale_socket, validate_socket_path, SocketCleanupGuard};
use crate::ipc::{codec, IpcError, ACCEPTED, REJECTED};
use crate::proc::current_pid;
use crate::transaction::Transaction;

/// Accepts transactions from forked workers and hands them to the master's
/// agent. Runs on its own thread with a current-thread runtime.
pub struct IpcServer {
    path: PathBuf,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    owner_pid: u32,
    _cleanup: SocketCleanupGuard,
}

impl IpcServer {
    /// Binds `path`, replacing a stale socket file, and starts serving.
    pub fn start(path: PathBuf, agent: Arc<Agent>) -> Result<Self, IpcError> {
        validate_socket_path(&path)?;
        remove_stale_socket(&path)?;

        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let cleanup = SocketCleanupGuard::new(path.clone());

        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("apm-agent-ipc".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("IPC | Unable to create runtime for server: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    match UnixListener::from_std(listener) {
                        Ok(listener) => serve(listener, agent, server_cancel).await,
                        Err(e) => error!("IPC | Unable to register listener: {}", e),
                    }
                });
            })?;

        info!("IPC | Server listening on {}", path.display());
        Ok(IpcServer {
            path,
            cancel,
            thread: Some(thread),
            owner_pid: current_pid(),
            _cleanup: cleanup,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting, waits for the server thread and removes the socket.
    pub fn stop(mut self) {
        debug!("IPC | Stopping server on {}", self.path.display());
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("IPC | Server thread panicked");
            }
        }
    }

    /// Drops a handle inherited from a parent process. The parent keeps
    /// serving and owns the socket file.
    pub fn abandon(self) {
        debug!("IPC | Abandoning inherited server handle");
        std::mem::forget(self);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.owner_pid == current_pid() {
            self.cancel.cancel();
        }
    }
}

async fn serve(listener: UnixListener, agent: Arc<Agent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("IPC | Server shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, Arc::clone(&agent), cancel.clone()));
                }
                Err(e) => error!("IPC | Failed to accept connection: {}", e),
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, agent: Arc<Agent>, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, codec());
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let ack = match frame {
            None => return,
            Some(Err(e)) => {
                error!("IPC | Failed to read frame: {}", e);
                return;
            }
            Some(Ok(frame)) => match serde_json::from_slice::<Transaction>(&frame) {
                Ok(transaction) => {
                    debug!("IPC | Received transaction {}", transaction.request_id());
                    agent.enqueue(transaction);
                    ACCEPTED
                }
                Err(e) => {
                    error!("IPC | Rejected malformed transaction: {}", e);
                    REJECTED
                }
            },
        };
        if let Err(e) = framed.send(Bytes::from(vec![ack])).await {
            error!("IPC | Failed to acknowledge transaction: {}", e);
            return;
        }
    }
}
