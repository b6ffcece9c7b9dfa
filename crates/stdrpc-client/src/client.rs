//! JSON-RPC client bound to one child process.
//!
//! Every request goes through a single writer task, so lines never interleave
//! and a caller cancelled mid-write cannot leave half a line on the pipe. In
//! concurrent mode a single reader task owns the child's stdout and routes
//! each response to its caller by id. In sequential mode one call runs at a
//! time and reads its own response.

use crate::pending::{PendingCalls, PendingGuard};
use crate::process::{LineReader, LineWriter, ProcessHandle};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stdrpc_core::{codec, CallMode, ClientConfig, Error, Request, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Requests queued for the writer before senders have to wait.
const OUTGOING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Starting = 0,
    Ready = 1,
    Closed = 2,
}

struct SessionState(AtomicU8);

impl SessionState {
    fn new() -> Self {
        Self(AtomicU8::new(ClientState::Starting as u8))
    }

    fn get(&self) -> ClientState {
        match self.0.load(Ordering::SeqCst) {
            0 => ClientState::Starting,
            1 => ClientState::Ready,
            _ => ClientState::Closed,
        }
    }

    fn set_ready(&self) {
        let _ = self.0.compare_exchange(
            ClientState::Starting as u8,
            ClientState::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Returns true if this call moved the session to `Closed`.
    fn close(&self) -> bool {
        self.0.swap(ClientState::Closed as u8, Ordering::SeqCst) != ClientState::Closed as u8
    }
}

/// State shared with the reader and writer tasks.
struct Session {
    program: String,
    state: SessionState,
    pending: PendingCalls,
    /// Flips to `true` once, when the session closes.
    closed: watch::Sender<bool>,
}

impl Session {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            state: SessionState::new(),
            pending: PendingCalls::new(),
            closed: watch::Sender::new(false),
        }
    }

    fn close(&self, cause: &str) {
        if self.state.close() {
            tracing::info!(program = %self.program, cause, "rpc session closed");
            self.closed.send_replace(true);
        }
        let failed = self.pending.close();
        if failed > 0 {
            tracing::warn!(program = %self.program, failed, "failed outstanding calls");
        }
    }
}

struct Outgoing {
    line: Vec<u8>,
    ack: oneshot::Sender<Result<()>>,
}

/// Read side for sequential mode.
struct SequentialReader {
    reader: LineReader,
    /// Call whose response has not been read yet.
    in_flight: Option<u64>,
    /// Calls given up on; their responses are skipped if they ever arrive.
    abandoned: HashSet<u64>,
}

impl SequentialReader {
    fn new(reader: LineReader) -> Self {
        Self {
            reader,
            in_flight: None,
            abandoned: HashSet::new(),
        }
    }

    fn abandon_in_flight(&mut self) {
        if let Some(id) = self.in_flight.take() {
            tracing::debug!(id, "previous call abandoned before its response arrived");
            self.abandoned.insert(id);
        }
    }

    async fn read_response(&mut self, id: u64) -> Result<Value> {
        loop {
            let line = self.reader.read_line().await?;
            if is_blank(&line) {
                continue;
            }

            match codec::decode(&line) {
                Ok(response) if response.id == id => {
                    self.in_flight = None;
                    return response.into_result();
                }
                Ok(response) if self.abandoned.remove(&response.id) => {
                    tracing::debug!(id = response.id, "discarding late response");
                }
                Ok(response) => {
                    return Err(Error::malformed(
                        Some(response.id),
                        format!("expected response to request {}, got id {}", id, response.id),
                    ));
                }
                Err(Error::MalformedResponse { id: Some(other), .. })
                    if self.abandoned.remove(&other) =>
                {
                    tracing::debug!(id = other, "discarding late malformed response");
                }
                Err(err) => {
                    if matches!(err, Error::MalformedResponse { id: Some(other), .. } if other == id) {
                        self.in_flight = None;
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Client for a child process that speaks newline-delimited JSON-RPC 2.0 on
/// stdin/stdout.
///
/// The client owns the child. [`RpcClient::shutdown`] stops it gracefully;
/// dropping the client kills it.
pub struct RpcClient {
    session: Arc<Session>,
    mode: CallMode,
    call_timeout: Option<Duration>,
    next_id: AtomicU64,
    pid: Option<u32>,
    outgoing: Mutex<Option<mpsc::Sender<Outgoing>>>,
    sequential: tokio::sync::Mutex<Option<SequentialReader>>,
    process: Arc<tokio::sync::Mutex<ProcessHandle>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Launch the configured child and start serving calls against it.
    pub async fn spawn(config: ClientConfig) -> Result<Self> {
        let session = Arc::new(Session::new(config.program.clone()));

        let mut process = ProcessHandle::start(&config)?;
        let pid = process.id();
        let writer = process.take_writer().ok_or(Error::ProcessTerminated)?;
        let reader = process.take_reader().ok_or(Error::ProcessTerminated)?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let writer_task = tokio::spawn(write_loop(writer, outgoing_rx, session.clone()));

        let (sequential, reader_task) = match config.mode {
            CallMode::Concurrent => (None, Some(tokio::spawn(read_loop(reader, session.clone())))),
            CallMode::Sequential => (Some(SequentialReader::new(reader)), None),
        };

        let process = Arc::new(tokio::sync::Mutex::new(process));
        let reaper_task = tokio::spawn(reap_on_close(process.clone(), session.clone()));

        session.state.set_ready();
        tracing::info!(
            program = %config.program,
            pid = ?pid,
            mode = ?config.mode,
            "rpc client ready"
        );

        Ok(Self {
            session,
            mode: config.mode,
            call_timeout: config.call_timeout(),
            next_id: AtomicU64::new(1),
            pid,
            outgoing: Mutex::new(Some(outgoing_tx)),
            sequential: tokio::sync::Mutex::new(sequential),
            process,
            writer_task: Mutex::new(Some(writer_task)),
            reader_task: Mutex::new(reader_task),
            reaper_task: Mutex::new(Some(reaper_task)),
        })
    }

    /// Call `method` with positional `params` and wait for its result.
    ///
    /// Fails with [`Error::Remote`] when the child answers with an error
    /// object, [`Error::ProcessTerminated`] once the child is gone,
    /// [`Error::MalformedResponse`] for unreadable replies and
    /// [`Error::Timeout`] when a call timeout is configured and expires.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.state() == ClientState::Closed {
            return Err(Error::ProcessTerminated);
        }

        match self.mode {
            CallMode::Concurrent => self.call_concurrent(method, params).await,
            CallMode::Sequential => self.call_sequential(method, params).await,
        }
    }

    /// Like [`RpcClient::call`], deserializing the result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn state(&self) -> ClientState {
        self.session.state.get()
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// Number of calls waiting for a response (concurrent mode).
    pub fn pending_calls(&self) -> usize {
        self.session.pending.len()
    }

    /// OS process id of the child as spawned.
    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Check whether the child has exited without waiting for it.
    ///
    /// Waits only while a teardown after a detected crash is in progress.
    pub async fn try_exit_status(&self) -> Result<Option<ExitStatus>> {
        self.process.lock().await.try_exit_status()
    }

    /// Close the session and stop the child.
    ///
    /// Outstanding calls fail with [`Error::ProcessTerminated`]. The child's
    /// stdin is closed first; it is killed if it has not exited within the
    /// configured grace period. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<ExitStatus> {
        self.session.close("client shutdown");

        // Closing the channel lets the writer finish and drop the child's stdin.
        drop(lock(&self.outgoing).take());
        let writer_task = lock(&self.writer_task).take();

        let mut process = self.process.lock().await;
        if let Some(task) = writer_task {
            if tokio::time::timeout(process.grace(), task).await.is_err() {
                tracing::warn!(program = %self.session.program, "writer still blocked at shutdown");
            }
        }
        let status = process.shutdown().await;
        drop(process);

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        // Waits for a sequential call still reading; the child is gone, so it
        // sees end of stream promptly.
        *self.sequential.lock().await = None;

        status
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call_concurrent(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id();
        let line = codec::encode_request(&Request::new(method, params, id))?;

        let rx = self.session.pending.register(id)?;
        let _guard = PendingGuard::new(&self.session.pending, id);

        let exchange = async {
            self.send_line(line).await?;
            // The sender only goes away without a reply when the session closes.
            rx.await.unwrap_or(Err(Error::ProcessTerminated))
        };
        self.with_timeout(method, exchange).await
    }

    async fn call_sequential(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut slot = self.sequential.lock().await;
        let reader = slot.as_mut().ok_or(Error::ProcessTerminated)?;
        if self.state() == ClientState::Closed {
            return Err(Error::ProcessTerminated);
        }

        reader.abandon_in_flight();
        let id = self.next_id();
        let line = codec::encode_request(&Request::new(method, params, id))?;
        reader.in_flight = Some(id);

        let exchange = async {
            self.send_line(line).await?;
            reader.read_response(id).await
        };

        match self.with_timeout(method, exchange).await {
            Err(err) if err.is_terminal() || matches!(err, Error::Io(_)) => {
                self.session.close(&err.to_string());
                Err(Error::ProcessTerminated)
            }
            other => other,
        }
    }

    /// Queue a line for the writer and wait until it is on the pipe.
    async fn send_line(&self, line: Vec<u8>) -> Result<()> {
        let sender = lock(&self.outgoing).clone().ok_or(Error::ProcessTerminated)?;
        let (ack, ack_rx) = oneshot::channel();
        sender
            .send(Outgoing { line, ack })
            .await
            .map_err(|_| Error::ProcessTerminated)?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::debug!("request not written: {}", err);
                Err(Error::ProcessTerminated)
            }
            Err(_) => Err(Error::ProcessTerminated),
        }
    }

    async fn with_timeout<F>(&self, method: &str, exchange: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        let Some(timeout) = self.call_timeout else {
            return exchange.await;
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::debug!(method, timeout_ms, "call timed out");
                Err(Error::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for task in [&self.writer_task, &self.reader_task, &self.reaper_task] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }
    }
}

async fn write_loop(
    mut writer: LineWriter,
    mut outgoing: mpsc::Receiver<Outgoing>,
    session: Arc<Session>,
) {
    let mut closed = session.closed.subscribe();
    loop {
        let next = tokio::select! {
            next = outgoing.recv() => next,
            _ = closed.wait_for(|closed| *closed) => None,
        };
        let Some(Outgoing { line, ack }) = next else {
            break;
        };

        match writer.write_line(&line).await {
            Ok(()) => {
                let _ = ack.send(Ok(()));
            }
            Err(err) => {
                tracing::warn!(program = %session.program, "write to child failed: {}", err);
                session.close("write to child failed");
                let _ = ack.send(Err(err));
                break;
            }
        }
    }
    // Dropping the writer closes the child's stdin.
}

async fn read_loop(mut reader: LineReader, session: Arc<Session>) {
    let cause = loop {
        let line = match reader.read_line().await {
            Ok(line) => line,
            Err(Error::EndOfStream) => break "child closed stdout".to_string(),
            Err(err) => break format!("read from child failed: {}", err),
        };
        if is_blank(&line) {
            continue;
        }

        match codec::decode(&line) {
            Ok(response) => {
                let id = response.id;
                if !session.pending.complete(id, response.into_result()) {
                    tracing::debug!(id, "discarding response with no pending call");
                }
            }
            Err(Error::MalformedResponse { id: Some(id), reason }) => {
                tracing::warn!(id, %reason, "malformed response");
                if !session.pending.complete(id, Err(Error::malformed(Some(id), reason))) {
                    tracing::debug!(id, "discarding malformed response with no pending call");
                }
            }
            Err(err) => {
                // Nothing ties this line to a request, so none of the
                // outstanding calls can trust their reply.
                let reason = err.to_string();
                let failed = session
                    .pending
                    .fail_all(|| Error::malformed(None, reason.clone()));
                tracing::warn!(
                    failed,
                    %reason,
                    line = %String::from_utf8_lossy(&line),
                    "unattributable line from child"
                );
            }
        }
    };

    session.close(&cause);
}

/// Tear the child down once the session closes, whatever closed it.
///
/// Runs for crashes detected by the reader or by a sequential call as well as
/// for [`RpcClient::shutdown`]; the handle's shutdown is idempotent.
async fn reap_on_close(process: Arc<tokio::sync::Mutex<ProcessHandle>>, session: Arc<Session>) {
    let mut closed = session.closed.subscribe();
    if closed.wait_for(|closed| *closed).await.is_err() {
        return;
    }
    drop(closed);

    let mut process = process.lock().await;
    match process.shutdown().await {
        Ok(status) => tracing::debug!(program = %session.program, ?status, "child reaped"),
        Err(e) => tracing::warn!(program = %session.program, "failed to reap child: {}", e),
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
