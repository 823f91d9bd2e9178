//! The channel itself: lifecycle state machine, ordered/unordered dispatch,
//! the sender and acceptor loops, and the submit/raise API.
//!
//! Scheduling model:
//! - one acceptor task per channel, blocking on framed reads;
//! - one ordered worker, the sole writer of the output stream, which also
//!   executes inbound stream-bound operations in strict FIFO order;
//! - an unordered pool (`tokio::spawn` per operation) for everything else.
//!
//! Callers never block: submissions enqueue a job and return a [`Reply`]
//! future immediately.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::cache::{CacheKey, ResultCache};
use crate::error::ChannelError;
use crate::listener::{ChannelListener, ChannelListeners, EventListener, EventListeners};
use crate::options::{AckMode, Caching, StreamName, SubmitOptions};
use crate::pending::{Completion, PendingEntry, PendingTable};
use crate::protocol::{Frame, FrameCodec, OpKind, Operation};
use crate::registry::{Protocol, RemoteCall, RemoteTask};
use crate::serializer::{JsonSerializer, Serializer};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const STATE_NEW: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Work for the ordered worker. Outbound writes and inbound stream-bound
/// executions share the one queue, which is what makes their relative order
/// total.
enum Job {
    Send {
        sequence: u64,
        operation: Operation,
        sent_ack: Option<Completion>,
    },
    Execute {
        sequence: u64,
        operation: Operation,
    },
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Shared {
    state: AtomicU8,
    next_sequence: AtomicU64,
    pending: PendingTable,
    cache: ResultCache,
    protocol: Protocol,
    serializer: Arc<dyn Serializer>,
    event_listeners: EventListeners,
    channel_listeners: ChannelListeners,
    ordered_tx: mpsc::UnboundedSender<Job>,
    // Consumed by open().
    ordered_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    /// Assign a sequence number, register the pending entry when the caller
    /// wants a processed acknowledgement, and enqueue the send.
    fn send_operation(
        &self,
        operation: Operation,
        ack: AckMode,
        cache: Option<(CacheKey, Duration)>,
    ) -> oneshot::Receiver<Result<Value, ChannelError>> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match ack {
            AckMode::Processed => {
                // Insert before enqueueing the send so a response arriving
                // arbitrarily fast always finds its entry.
                self.pending.insert(sequence, PendingEntry::new(tx, cache));
                let enqueued = self
                    .ordered_tx
                    .send(Job::Send {
                        sequence,
                        operation,
                        sent_ack: None,
                    })
                    .is_ok();
                if !enqueued || !self.is_open() {
                    // Lost the race with close(); the entry may have been
                    // inserted after the table was drained.
                    if let Some(entry) = self.pending.remove(sequence) {
                        entry.complete(Err(ChannelError::Closed));
                    }
                }
            }
            AckMode::Sent => {
                // On failure the job (and with it the completion) is
                // dropped, which resolves the reply as closed.
                let _ = self.ordered_tx.send(Job::Send {
                    sequence,
                    operation,
                    sent_ack: Some(tx),
                });
            }
        }
        rx
    }

    fn raise_event(
        &self,
        stream: &StreamName,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<Reply<()>, ChannelError> {
        self.ensure_open()?;
        if stream.is_empty() {
            return Err(ChannelError::InvalidStreamName);
        }
        let ack = options.ack_or(AckMode::Sent);
        let operation = Operation::Event {
            stream: stream.clone(),
            payload,
            response_required: ack == AckMode::Processed,
        };
        Ok(Reply::waiting(self.send_operation(operation, ack, None)))
    }

    /// Resolve the pending entry a response frame is correlated with; a
    /// response nobody is waiting on is discarded.
    fn complete_response(&self, sequence: u64, result: Result<Value, String>) {
        let Some(entry) = self.pending.remove(sequence) else {
            tracing::trace!(sequence, "Response with no pending entry, discarding");
            return;
        };
        match result {
            Ok(value) => {
                if let Some((key, ttl)) = entry.cache.clone() {
                    self.cache.store(key, value.clone(), ttl);
                }
                entry.complete(Ok(value));
            }
            Err(message) => entry.complete(Err(ChannelError::remote(message))),
        }
    }

    /// Idempotent, one-way transition to closed.
    fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        tracing::debug!("Closing channel");

        // Stop reading. The acceptor may be the caller; then the abort
        // lands at its next yield point, after this function returns.
        if let Some(handle) = lock(&self.acceptor).take() {
            handle.abort();
        }

        // Already queued sends drain first, then the worker shuts the
        // output stream down and exits on its own; detach the handle.
        let _ = self.ordered_tx.send(Job::Shutdown);
        drop(lock(&self.worker).take());

        // Close stream halves that were never handed to a task.
        drop(lock(&self.reader).take());
        drop(lock(&self.writer).take());

        self.event_listeners.clear();
        self.pending.fail_all(|| ChannelError::Closed);
        self.channel_listeners.notify_closed();
    }
}

/// An asynchronous, bidirectional remote-call/event channel over a pair of
/// byte streams.
///
/// Built closed; [`open`](Channel::open) starts the acceptor and worker
/// tasks. Closing is one-way and idempotent; channels are not reopenable.
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// A channel over the given stream halves with the default JSON
    /// serializer.
    pub fn new(
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        protocol: Protocol,
    ) -> Self {
        Self::with_serializer(input, output, protocol, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        protocol: Protocol,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        let (ordered_tx, ordered_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_NEW),
                next_sequence: AtomicU64::new(0),
                pending: PendingTable::new(),
                cache: ResultCache::new(),
                protocol,
                serializer,
                event_listeners: EventListeners::default(),
                channel_listeners: ChannelListeners::default(),
                ordered_tx,
                ordered_rx: Mutex::new(Some(ordered_rx)),
                reader: Mutex::new(Some(Box::new(input))),
                writer: Mutex::new(Some(Box::new(output))),
                acceptor: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start the acceptor and ordered worker and notify lifecycle
    /// listeners. No-op if already open; a closed channel stays closed.
    pub fn open(&self) {
        match self.shared.state.compare_exchange(
            STATE_NEW,
            STATE_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_OPEN) => return,
            Err(_) => {
                tracing::warn!("open() on a closed channel; channels are not reopenable");
                return;
            }
        }

        let reader = lock(&self.shared.reader).take();
        let writer = lock(&self.shared.writer).take();
        let jobs = lock(&self.shared.ordered_rx).take();
        let (Some(reader), Some(writer), Some(jobs)) = (reader, writer, jobs) else {
            tracing::error!("Channel stream halves unavailable, closing");
            self.shared.close();
            return;
        };

        *lock(&self.shared.worker) =
            Some(tokio::spawn(ordered_worker(self.shared.clone(), jobs, writer)));
        *lock(&self.shared.acceptor) =
            Some(tokio::spawn(acceptor_loop(self.shared.clone(), reader)));

        self.shared.channel_listeners.notify_opened();
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Submit a call for remote execution.
    ///
    /// Fails synchronously, before a sequence number is allocated, when
    /// the channel is not open, the call is not registered with the
    /// protocol, or its arguments cannot be encoded.
    pub fn submit<C: RemoteCall>(
        &self,
        call: &C,
        options: SubmitOptions,
    ) -> Result<Reply<C::Output>, ChannelError> {
        self.shared.ensure_open()?;
        if !self.shared.protocol.has_call(C::NAME) {
            return Err(ChannelError::unregistered(C::NAME));
        }
        let args = serde_json::to_value(call)
            .map_err(|e| ChannelError::serialize(format!("'{}': {e}", C::NAME)))?;
        let ack = options.ack_or(AckMode::Processed);

        let key = CacheKey::new(C::NAME, &args);
        let cache = match options.caching() {
            Caching::Enabled { ttl } if ack == AckMode::Processed => {
                if let Some(value) = self.shared.cache.lookup(&key) {
                    tracing::trace!(call = C::NAME, "Result cache hit");
                    return Ok(Reply::ready(Ok(value)));
                }
                Some((key, ttl))
            }
            Caching::Enabled { .. } => {
                tracing::debug!(
                    call = C::NAME,
                    "Caching is meaningless with sent-acknowledgement, ignoring"
                );
                None
            }
            Caching::Disabled => {
                self.shared.cache.invalidate(&key);
                None
            }
        };

        let operation = Operation::Call {
            name: C::NAME.to_string(),
            args,
            response_required: ack == AckMode::Processed,
        };
        Ok(Reply::waiting(
            self.shared.send_operation(operation, ack, cache),
        ))
    }

    /// Submit a fire-and-forget task. Acknowledges on send by default.
    pub fn submit_task<T: RemoteTask>(
        &self,
        task: &T,
        options: SubmitOptions,
    ) -> Result<Reply<()>, ChannelError> {
        self.shared.ensure_open()?;
        if !self.shared.protocol.has_task(T::NAME) {
            return Err(ChannelError::unregistered(T::NAME));
        }
        let args = serde_json::to_value(task)
            .map_err(|e| ChannelError::serialize(format!("'{}': {e}", T::NAME)))?;
        let ack = options.ack_or(AckMode::Sent);
        let operation = Operation::Task {
            name: T::NAME.to_string(),
            args,
            response_required: ack == AckMode::Processed,
        };
        Ok(Reply::waiting(
            self.shared.send_operation(operation, ack, None),
        ))
    }

    /// Raise an event for the listeners registered on `stream` at the other
    /// end. Acknowledges on send by default.
    pub fn raise(
        &self,
        stream: &StreamName,
        event: Value,
        options: SubmitOptions,
    ) -> Result<Reply<()>, ChannelError> {
        self.shared.raise_event(stream, event, options)
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.shared.channel_listeners.add(listener);
    }

    pub fn add_listener(&self, stream: &StreamName, listener: Arc<dyn EventListener>) {
        self.shared.event_listeners.add(stream, listener);
    }

    pub fn remove_listener(&self, stream: &StreamName, listener: &Arc<dyn EventListener>) {
        self.shared.event_listeners.remove(stream, listener);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.shared.state.load(Ordering::SeqCst) {
            STATE_OPEN => "open",
            STATE_CLOSED => "closed",
            _ => "new",
        };
        f.debug_struct("Channel").field("state", &state).finish()
    }
}

/// Capability handed to executing calls and tasks: the explicit way for
/// remote-submitted work to reach back through the channel that delivered
/// it, typically to publish progress events.
pub struct ChannelContext {
    shared: Weak<Shared>,
}

impl ChannelContext {
    fn for_shared(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// A context bound to no channel; raising through it fails closed.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    /// Raise an event back through the delivering channel.
    pub fn raise(
        &self,
        stream: &StreamName,
        event: Value,
        options: SubmitOptions,
    ) -> Result<Reply<()>, ChannelError> {
        match self.shared.upgrade() {
            Some(shared) => shared.raise_event(stream, event, options),
            None => Err(ChannelError::Closed),
        }
    }
}

/// Future resolving to the outcome of a submission.
///
/// Sent-acknowledged submissions resolve once their frame is written and
/// flushed; processed-acknowledged ones resolve when the matching response
/// arrives. The channel enforces no timeout; race this against a timer if
/// you need one.
pub struct Reply<T> {
    state: ReplyState,
    _result: PhantomData<fn() -> T>,
}

enum ReplyState {
    Waiting(oneshot::Receiver<Result<Value, ChannelError>>),
    Ready(Option<Result<Value, ChannelError>>),
}

impl<T> Reply<T> {
    fn waiting(receiver: oneshot::Receiver<Result<Value, ChannelError>>) -> Self {
        Self {
            state: ReplyState::Waiting(receiver),
            _result: PhantomData,
        }
    }

    fn ready(result: Result<Value, ChannelError>) -> Self {
        Self {
            state: ReplyState::Ready(Some(result)),
            _result: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for Reply<T> {
    type Output = Result<T, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let raw = match &mut this.state {
            ReplyState::Waiting(receiver) => {
                let raw = match Pin::new(receiver).poll(cx) {
                    Poll::Ready(Ok(result)) => result,
                    // The completion was dropped without resolving; that
                    // only happens when the channel tears down.
                    Poll::Ready(Err(_)) => Err(ChannelError::Closed),
                    Poll::Pending => return Poll::Pending,
                };
                this.state = ReplyState::Ready(None);
                raw
            }
            ReplyState::Ready(slot) => match slot.take() {
                Some(result) => result,
                None => return Poll::Pending,
            },
        };
        Poll::Ready(raw.and_then(|value| {
            serde_json::from_value(value)
                .map_err(|e| ChannelError::deserialize(format!("reply value: {e}")))
        }))
    }
}

/// The ordered worker: sole writer of the output stream, and the FIFO
/// executor for inbound stream-bound operations.
async fn ordered_worker(
    shared: Arc<Shared>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    writer: BoxedWriter,
) {
    let mut framed = FramedWrite::new(writer, FrameCodec::new());
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Shutdown => break,
            Job::Send {
                sequence,
                operation,
                sent_ack,
            } => write_operation(&shared, &mut framed, sequence, operation, sent_ack).await,
            Job::Execute {
                sequence,
                operation,
            } => {
                if let Some(response) = execute_operation(&shared, sequence, &operation) {
                    write_operation(&shared, &mut framed, sequence, response, None).await;
                }
            }
        }
    }

    // Best-effort shutdown of the output stream; errors here are not
    // interesting.
    if let Err(e) = framed.close().await {
        tracing::trace!(error = %e, "Output stream close failed");
    }
    tracing::trace!("Ordered worker exiting");
}

/// Serialize into a scratch buffer first; the live stream is only touched
/// once the payload is known good, so a failing payload can never corrupt
/// the frame boundary.
async fn write_operation(
    shared: &Arc<Shared>,
    framed: &mut FramedWrite<BoxedWriter, FrameCodec>,
    sequence: u64,
    operation: Operation,
    sent_ack: Option<Completion>,
) {
    let (kind, payload) = match operation.encode(shared.serializer.as_ref()) {
        Ok(payload) => (operation.kind(), payload),
        Err(error) => {
            tracing::debug!(
                sequence,
                kind = %operation.kind(),
                error = %error,
                "Operation failed to serialize"
            );
            if let Some(ack) = sent_ack {
                // A sent-mode waiter on this machine; nothing goes over the
                // wire.
                let _ = ack.send(Err(error));
                return;
            }
            if let Some(entry) = shared.pending.remove(sequence) {
                // A processed-mode caller is waiting on this machine; fail
                // it locally instead of sending anything.
                entry.complete(Err(error));
                return;
            }
            // This was a response owed to a remote caller: replace it with
            // an error description so their future is not abandoned.
            let replacement =
                Operation::response_err(format!("remote serialization failed: {error}"));
            match replacement.encode(shared.serializer.as_ref()) {
                Ok(payload) => (OpKind::Response, payload),
                Err(second) => {
                    tracing::error!(
                        sequence,
                        error = %second,
                        "Replacement response failed to serialize, dropping"
                    );
                    return;
                }
            }
        }
    };

    match framed.send(Frame::new(kind, sequence, payload)).await {
        Ok(()) => {
            if let Some(ack) = sent_ack {
                let _ = ack.send(Ok(Value::Null));
            }
        }
        Err(error) => {
            tracing::warn!(sequence, error = %error, "Failed to write frame");
            if let Some(ack) = sent_ack {
                let _ = ack.send(Err(ChannelError::Io(error)));
            }
        }
    }
}

/// One loop per channel reading frames off the input stream. Read failure
/// or end-of-stream is fatal and closes the channel.
async fn acceptor_loop(shared: Arc<Shared>, reader: BoxedReader) {
    let mut framed = FramedRead::new(reader, FrameCodec::new());
    loop {
        match framed.next().await {
            Some(Ok(frame)) => accept_frame(&shared, frame),
            Some(Err(error)) => {
                tracing::warn!(error = %error, "Channel input failed");
                break;
            }
            None => {
                tracing::debug!("Channel input closed");
                break;
            }
        }
    }
    shared.close();
}

/// Decode an inbound frame and hand it to the right dispatch queue:
/// stream-bound operations to the ordered worker, everything else to its
/// own task.
fn accept_frame(shared: &Arc<Shared>, frame: Frame) {
    let Frame {
        kind,
        sequence,
        payload,
    } = frame;

    let operation = match Operation::decode(kind, payload, shared.serializer.as_ref()) {
        Ok(operation) => operation,
        Err(error) => {
            // The frame itself was well-formed, so the stream is still
            // good; report the failure to whoever may be waiting.
            tracing::debug!(sequence, %kind, error = %error, "Failed to decode operation");
            let response =
                Operation::response_err(format!("remote failed to decode {kind} frame: {error}"));
            let _ = shared.ordered_tx.send(Job::Send {
                sequence,
                operation: response,
                sent_ack: None,
            });
            return;
        }
    };

    if operation.stream_name().is_some() {
        let _ = shared.ordered_tx.send(Job::Execute {
            sequence,
            operation,
        });
    } else {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            if let Some(response) = execute_operation(&shared, sequence, &operation) {
                let _ = shared.ordered_tx.send(Job::Send {
                    sequence,
                    operation: response,
                    sent_ack: None,
                });
            }
        });
    }
}

/// Perform the local effect of an inbound operation; the returned response,
/// if any, is sent back with the originating sequence number.
fn execute_operation(
    shared: &Arc<Shared>,
    sequence: u64,
    operation: &Operation,
) -> Option<Operation> {
    match operation {
        Operation::Call {
            name,
            args,
            response_required,
        } => {
            let result = run_call(shared, name, args);
            response_required.then(|| Operation::Response { result })
        }
        Operation::Task {
            name,
            args,
            response_required,
        } => {
            let result = run_task(shared, name, args);
            response_required.then(|| Operation::Response { result })
        }
        Operation::Event {
            stream,
            payload,
            response_required,
        } => {
            shared.event_listeners.deliver(stream, payload);
            response_required.then(|| Operation::response_ok(Value::Null))
        }
        Operation::Response { result } => {
            shared.complete_response(sequence, result.clone());
            None
        }
    }
}

fn run_call(shared: &Arc<Shared>, name: &str, args: &Value) -> Result<Value, String> {
    let Some(handler) = shared.protocol.call_handler(name) else {
        return Err(format!("no call registered for '{name}'"));
    };
    let ctx = ChannelContext::for_shared(shared);
    // A panicking handler must yield an error response, not a caller that
    // waits forever.
    catch_unwind(AssertUnwindSafe(|| handler(args.clone(), &ctx)))
        .unwrap_or_else(|panic| Err(format!("'{name}' panicked: {}", panic_message(&*panic))))
}

fn run_task(shared: &Arc<Shared>, name: &str, args: &Value) -> Result<Value, String> {
    let Some(handler) = shared.protocol.task_handler(name) else {
        return Err(format!("no task registered for '{name}'"));
    };
    let ctx = ChannelContext::for_shared(shared);
    catch_unwind(AssertUnwindSafe(|| {
        handler(args.clone(), &ctx).map(|()| Value::Null)
    }))
    .unwrap_or_else(|panic| Err(format!("'{name}' panicked: {}", panic_message(&*panic))))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
