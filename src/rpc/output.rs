//! Output Writer
//!
//! Single-consumer queue in front of the byte stream. Any task may
//! enqueue; one writer task encodes, frames and flushes in enqueue order.
//! A write or encode failure stops the writer for good and is reported
//! through [`OutputWriter::wait_for_shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::OutputError;
use crate::infra::transport::write_frame;
use crate::protocol::{Dialect, OutgoingMessage};

/// Gate applied to every message just before it is written
pub trait OutputFilter: Send + Sync {
    fn allows(&self, message: &OutgoingMessage) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl OutputFilter for AllowAll {
    fn allows(&self, _message: &OutgoingMessage) -> bool {
        true
    }
}

/// Holds back server-initiated traffic until the handshake is done.
/// Responses and log/telemetry notifications always pass.
#[derive(Debug, Default)]
pub struct InitializedFilter {
    initialized: AtomicBool,
}

impl InitializedFilter {
    const ALWAYS_ALLOWED: [&'static str; 3] =
        ["window/logMessage", "window/showMessage", "telemetry/event"];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl OutputFilter for InitializedFilter {
    fn allows(&self, message: &OutgoingMessage) -> bool {
        self.is_initialized()
            || message.is_response()
            || message
                .method()
                .is_some_and(|m| Self::ALWAYS_ALLOWED.contains(&m))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Running,
    Stopped,
    Faulted(OutputError),
}

struct Queued {
    seq: i64,
    message: OutgoingMessage,
}

struct QueueState {
    sender: Option<mpsc::UnboundedSender<Queued>>,
    next_seq: i64,
}

pub struct OutputWriter {
    dialect: Dialect,
    filter: Arc<dyn OutputFilter>,
    queue: Mutex<QueueState>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Queued>>>,
    state: watch::Sender<WriterState>,
}

impl OutputWriter {
    pub fn new(dialect: Dialect, filter: Arc<dyn OutputFilter>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(WriterState::Idle);
        Self {
            dialect,
            filter,
            queue: Mutex::new(QueueState {
                sender: Some(sender),
                next_seq: 1,
            }),
            receiver: Mutex::new(Some(receiver)),
            state,
        }
    }

    /// Queue a message built from its sequence number. Numbering and
    /// queueing happen under one lock, so sequence order is wire order.
    pub fn enqueue_with(
        &self,
        build: impl FnOnce(i64) -> OutgoingMessage,
    ) -> Result<i64, OutputError> {
        let mut queue = lock(&self.queue);
        let Some(sender) = queue.sender.as_ref() else {
            return Err(self.fault().unwrap_or(OutputError::Closed));
        };

        let seq = queue.next_seq;
        let message = build(seq);
        if sender.send(Queued { seq, message }).is_err() {
            return Err(self.fault().unwrap_or(OutputError::Closed));
        }
        queue.next_seq += 1;
        Ok(seq)
    }

    /// Queue a message; never blocks
    pub fn send(&self, message: OutgoingMessage) -> Result<(), OutputError> {
        self.enqueue_with(|_| message).map(|_| ())
    }

    /// Spawn the writer task over `writer`
    pub fn start<W>(self: &Arc<Self>, writer: W) -> Result<JoinHandle<()>, OutputError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(receiver) = lock(&self.receiver).take() else {
            return Err(OutputError::Closed);
        };
        self.state.send_replace(WriterState::Running);

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run(receiver, writer).await }))
    }

    /// Stop accepting messages. Already queued ones are still written.
    pub fn close(&self) {
        lock(&self.queue).sender = None;
        // Never started: nothing will drain the queue
        if lock(&self.receiver).take().is_some() {
            self.state.send_replace(WriterState::Stopped);
        }
    }

    /// Resolves once the writer has stopped, with its fault if any
    pub async fn wait_for_shutdown(&self) -> Result<(), OutputError> {
        let mut state = self.state.subscribe();
        let outcome = match state
            .wait_for(|s| matches!(s, WriterState::Stopped | WriterState::Faulted(_)))
            .await
        {
            Ok(state) => match &*state {
                WriterState::Faulted(err) => Err(err.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(OutputError::Closed),
        };
        outcome
    }

    pub fn state(&self) -> WriterState {
        self.state.borrow().clone()
    }

    pub fn fault(&self) -> Option<OutputError> {
        match &*self.state.borrow() {
            WriterState::Faulted(err) => Some(err.clone()),
            _ => None,
        }
    }

    async fn run<W>(&self, mut receiver: mpsc::UnboundedReceiver<Queued>, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        let mut fault = None;

        while let Some(Queued { seq, message }) = receiver.recv().await {
            if !self.filter.allows(&message) {
                tracing::debug!(method = ?message.method(), "Dropping message held back by output filter");
                continue;
            }

            let payload = match self.dialect.encode(seq, &message) {
                Ok(payload) => payload,
                Err(e) => {
                    fault = Some(OutputError::Serialize(e.to_string()));
                    break;
                }
            };

            if let Err(e) = write_frame(&mut writer, &payload).await {
                fault = Some(OutputError::Write(e.to_string()));
                break;
            }
        }

        match fault {
            Some(err) => {
                tracing::error!("Output writer stopped: {err}");
                lock(&self.queue).sender = None;
                self.state.send_replace(WriterState::Faulted(err));
            }
            None => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Output stream shutdown failed: {e}");
                }
                self.state.send_replace(WriterState::Stopped);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    use super::*;
    use crate::infra::transport::FrameReader;
    use crate::protocol::RequestId;

    fn notification(method: &str) -> OutgoingMessage {
        OutgoingMessage::Notification {
            method: method.to_string(),
            params: json!({}),
        }
    }

    async fn read_all(reader: tokio::io::DuplexStream) -> Vec<Value> {
        let mut frames = FrameReader::new(reader);
        let mut values = Vec::new();
        while let Some(payload) = frames.read_frame().await.unwrap() {
            values.push(serde_json::from_slice(&payload).unwrap());
        }
        values
    }

    #[tokio::test]
    async fn test_writes_in_enqueue_order() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let output = Arc::new(OutputWriter::new(Dialect::JsonRpc, Arc::new(AllowAll)));
        let task = output.start(server).unwrap();

        let mut producers = Vec::new();
        for i in 0..32 {
            let output = Arc::clone(&output);
            producers.push(tokio::spawn(async move {
                // completion order is scrambled on purpose
                tokio::time::sleep(std::time::Duration::from_millis((31 - i) % 7)).await;
                output
                    .enqueue_with(|seq| {
                        OutgoingMessage::success(RequestId::Number(seq), "m", json!(i))
                    })
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for producer in producers {
            seqs.push(producer.await.unwrap());
        }
        output.close();
        output.wait_for_shutdown().await.unwrap();
        task.await.unwrap();

        let written = read_all(client).await;
        assert_eq!(written.len(), 32);
        let ids: Vec<i64> = written.iter().map(|v| v["id"].as_i64().unwrap()).collect();
        let mut expected = seqs.clone();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_dap_seq_is_monotonic() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let output = Arc::new(OutputWriter::new(Dialect::Dap, Arc::new(AllowAll)));
        output.start(server).unwrap();

        output.send(notification("output")).unwrap();
        output.send(notification("stopped")).unwrap();
        output
            .send(OutgoingMessage::success(RequestId::Number(9), "threads", json!({})))
            .unwrap();
        output.close();
        output.wait_for_shutdown().await.unwrap();

        let written = read_all(client).await;
        let seqs: Vec<i64> = written.iter().map(|v| v["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(written[2]["request_seq"], 9);
    }

    #[tokio::test]
    async fn test_initialized_filter() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let filter = Arc::new(InitializedFilter::new());
        let output = Arc::new(OutputWriter::new(Dialect::JsonRpc, filter.clone()));
        output.start(server).unwrap();

        output.send(notification("textDocument/publishDiagnostics")).unwrap();
        output.send(notification("window/logMessage")).unwrap();
        output
            .send(OutgoingMessage::success(RequestId::Number(1), "initialize", json!({})))
            .unwrap();
        output.send(notification("$/progress")).unwrap();

        // Let the writer drain the pre-initialization messages first
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        filter.mark_initialized();
        output.send(notification("$/progress")).unwrap();
        output.close();
        output.wait_for_shutdown().await.unwrap();

        let written = read_all(client).await;
        let kinds: Vec<String> = written
            .iter()
            .map(|v| {
                v.get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("response")
                    .to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["window/logMessage", "response", "$/progress"]);
    }

    #[tokio::test]
    async fn test_write_failure_faults_writer() {
        let mock = Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let output = Arc::new(OutputWriter::new(Dialect::JsonRpc, Arc::new(AllowAll)));
        output.start(mock).unwrap();

        output.send(notification("first")).unwrap();
        let result = output.wait_for_shutdown().await;
        assert!(matches!(result, Err(OutputError::Write(_))));
        assert!(matches!(output.state(), WriterState::Faulted(_)));

        let err = output.send(notification("second")).unwrap_err();
        assert!(matches!(err, OutputError::Write(_)));
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let output = OutputWriter::new(Dialect::JsonRpc, Arc::new(AllowAll));
        output.close();
        output.wait_for_shutdown().await.unwrap();
        assert_eq!(
            output.send(notification("late")).unwrap_err(),
            OutputError::Closed
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let (_, other) = tokio::io::duplex(64);
        let output = Arc::new(OutputWriter::new(Dialect::JsonRpc, Arc::new(AllowAll)));
        output.start(server).unwrap();
        assert!(output.start(other).is_err());
        output.close();
        output.wait_for_shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
