// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::ipc::{IpcError, ACCEPTED, MAX_FRAME_LENGTH};
use crate::transaction::Transaction;
use crate::util::lock;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking client used by forked workers. Connects on first use and
/// reconnects once when a kept connection turns out to be broken.
#[derive(Debug)]
pub struct IpcClient {
    path: PathBuf,
    timeout: Duration,
    stream: Mutex<Option<UnixStream>>,
}

impl IpcClient {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        IpcClient {
            path,
            timeout: DEFAULT_TIMEOUT,
            stream: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends `transaction` to the server and waits for the acknowledgement.
    pub fn enqueue(&self, transaction: &Transaction) -> Result<(), IpcError> {
        let frame = serde_json::to_vec(transaction)?;
        if frame.len() > MAX_FRAME_LENGTH {
            return Err(IpcError::FrameTooLarge(frame.len()));
        }

        let mut slot = lock(&self.stream);
        let reused = slot.is_some();
        let ack = match self.exchange(&mut slot, &frame) {
            Err(IpcError::Io(e)) if reused => {
                debug!("IPC | Reconnecting after broken connection: {}", e);
                self.exchange(&mut slot, &frame)?
            }
            result => result?,
        };

        if ack == ACCEPTED {
            Ok(())
        } else {
            Err(IpcError::Rejected)
        }
    }

    fn connect(&self) -> Result<UnixStream, IpcError> {
        let stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    /// Writes one frame and reads the acknowledgement. The connection is put
    /// back into `slot` only when the exchange completed.
    fn exchange(&self, slot: &mut Option<UnixStream>, frame: &[u8]) -> Result<u8, IpcError> {
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect()?,
        };

        let length =
            u32::try_from(frame.len()).map_err(|_| IpcError::FrameTooLarge(frame.len()))?;
        stream.write_all(&length.to_be_bytes())?;
        stream.write_all(frame)?;
        stream.flush()?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let ack_length = u32::from_be_bytes(header);
        if ack_length != 1 {
            return Err(IpcError::UnexpectedAck(ack_length));
        }
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack)?;

        *slot = Some(stream);
        Ok(ack[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionContext, TransactionDefaults};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    fn transaction() -> Transaction {
        Transaction::new(
            "ipc-1",
            TransactionContext::default(),
            TransactionDefaults::default(),
        )
    }

    /// Reads one frame and answers it with `ack`.
    fn answer_once(listener: &UnixListener, ack: u8) -> Vec<u8> {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).expect("header");
        let length = usize::try_from(u32::from_be_bytes(header)).expect("length");
        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).expect("frame");
        stream.write_all(&1u32.to_be_bytes()).expect("ack header");
        stream.write_all(&[ack]).expect("ack");
        frame
    }

    #[test]
    fn test_enqueue_without_server_fails() {
        let dir = TempDir::new().expect("tempdir");
        let client = IpcClient::new(dir.path().join("missing.sock"));
        assert!(matches!(
            client.enqueue(&transaction()),
            Err(IpcError::Io(_))
        ));
    }

    #[test]
    fn test_enqueue_sends_length_prefixed_json() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("server.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let server = std::thread::spawn(move || answer_once(&listener, ACCEPTED));

        let client = IpcClient::new(path);
        client.enqueue(&transaction()).expect("accepted");

        let frame = server.join().expect("server thread");
        let decoded: Transaction = serde_json::from_slice(&frame).expect("json");
        assert_eq!(decoded.request_id(), "ipc-1");
    }

    #[test]
    fn test_rejected_ack_is_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("server.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let server = std::thread::spawn(move || {
            answer_once(&listener, crate::ipc::REJECTED);
        });

        let client = IpcClient::new(path);
        assert!(matches!(
            client.enqueue(&transaction()),
            Err(IpcError::Rejected)
        ));
        server.join().expect("server thread");
    }
}
