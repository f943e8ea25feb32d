// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket path selection, validation and cleanup.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::ipc::IpcError;
use crate::proc::current_pid;

/// Socket paths longer than this are rejected; the platform limit is 108
/// bytes on Linux and 104 on macOS.
pub const MAX_SOCKET_PATH_LEN: usize = 100;

pub const SOCKET_PREFIX: &str = "apm-agent";

const FALLBACK_DIR: &str = "/tmp";

/// `{root}/tmp/apm-agent-{pid}.sock` when `{root}/tmp` is a directory,
/// `/tmp/apm-agent-{pid}.sock` otherwise.
#[must_use]
pub fn server_socket_path(root: &Path, master_pid: u32) -> PathBuf {
    let file_name = format!("{SOCKET_PREFIX}-{master_pid}.sock");
    let app_tmp = root.join("tmp");
    if app_tmp.is_dir() {
        app_tmp.join(file_name)
    } else {
        Path::new(FALLBACK_DIR).join(file_name)
    }
}

/// Checks that `path` can be bound as a Unix socket.
pub fn validate_socket_path(path: &Path) -> Result<(), IpcError> {
    let raw = path.as_os_str().as_encoded_bytes();
    if raw.is_empty() {
        return Err(IpcError::InvalidPath(
            "socket path cannot be empty".to_string(),
        ));
    }
    if raw.contains(&0) {
        return Err(IpcError::InvalidPath(
            "socket path cannot contain null bytes".to_string(),
        ));
    }
    if raw.len() > MAX_SOCKET_PATH_LEN {
        return Err(IpcError::InvalidPath(format!(
            "{} is {} bytes long (maximum {MAX_SOCKET_PATH_LEN})",
            path.display(),
            raw.len()
        )));
    }
    if !path.is_absolute() {
        return Err(IpcError::InvalidPath(format!(
            "{} is not absolute",
            path.display()
        )));
    }
    Ok(())
}

/// Removes a socket left behind by a previous master. Symlinks are refused.
pub fn remove_stale_socket(path: &Path) -> Result<(), IpcError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if metadata.file_type().is_symlink() {
        return Err(IpcError::InvalidPath(format!(
            "{} is a symlink, refusing to remove it",
            path.display()
        )));
    }
    if metadata.is_dir() {
        return Err(IpcError::InvalidPath(format!(
            "{} is a directory",
            path.display()
        )));
    }
    debug!("IPC | Removing stale socket {}", path.display());
    std::fs::remove_file(path)?;
    Ok(())
}

/// Removes the socket file on drop, but only in the process that bound it.
/// A forked child dropping its inherited copy leaves the file alone.
#[derive(Debug)]
pub struct SocketCleanupGuard {
    path: PathBuf,
    owner_pid: u32,
}

impl SocketCleanupGuard {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        SocketCleanupGuard {
            path,
            owner_pid: current_pid(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketCleanupGuard {
    fn drop(&mut self) {
        if self.owner_pid != current_pid() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "IPC | Failed to remove socket file {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}
