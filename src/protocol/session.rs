//! Request/reply session over a [`LineChannel`].
//!
//! The protocol carries no correlation ids: replies come back in request
//! order and echo the leading tokens of their command. One reader task owns
//! the read half and routes every line either to the oldest pending request
//! or, once `listen 1` is active, to the event bus. One writer task owns the
//! write half and enqueues each pending request at the moment its line goes
//! out, so queue order always equals wire order.
//!
//! The exchange is half-duplex: after writing a command the writer holds the
//! next one back until the first is settled (answered, failed, or past its
//! request timeout).
//!
//! ```text
//! request() ──► mpsc ──► writer task ──► socket
//!                          │ push
//!                          ▼
//!                    pending queue ◄── pop ── reader task ◄── socket
//!                                                │
//!                                                └─► bus (pushed events)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::channel::{ChannelCloser, LineChannel, LineReader, LineWriter};
use super::codec::{decode_line, Command};
use super::events::parse_server_event;
use crate::bus::{BusEvent, SharedBus};
use crate::error::{CliError, CliResult};

/// Default CLI port of the server.
pub const DEFAULT_CLI_PORT: u16 = 9090;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Outgoing lines buffered ahead of the writer task.
const OUTGOING_QUEUE_DEPTH: usize = 64;
/// How long the writer may spend sending `exit` before the channel is closed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Timeouts applied by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A decoded reply line together with the echo length of its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    tokens: Vec<String>,
    echo_len: usize,
}

impl Reply {
    pub fn new(tokens: Vec<String>, echo_len: usize) -> Self {
        Self { tokens, echo_len }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Tokens after the echoed command prefix.
    pub fn tail(&self) -> &[String] {
        self.tokens.get(self.echo_len..).unwrap_or(&[])
    }

    /// First token after the echo (the answer to a `?` query).
    pub fn value(&self) -> Option<&str> {
        self.tail().first().map(String::as_str)
    }
}

/// Anything that can issue a command and wait for its reply.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(&self, command: Command) -> CliResult<Reply>;
}

/// An outstanding command awaiting its reply line.
///
/// Dropping it (after completion, or when the queue is drained) drops
/// `_settled`, which releases the writer.
struct PendingRequest {
    command: Command,
    reply: oneshot::Sender<CliResult<Reply>>,
    _settled: oneshot::Sender<()>,
}

impl PendingRequest {
    fn complete(self, result: CliResult<Reply>) {
        if self.reply.send(result).is_err() {
            trace!(command = %self.command, "reply arrived after the caller gave up");
        }
    }
}

enum Outgoing {
    Request {
        line: String,
        pending: PendingRequest,
        settled: oneshot::Receiver<()>,
    },
    Exit,
}

/// FIFO of requests in wire order, shared by the writer and reader tasks.
#[derive(Clone, Default)]
struct PendingQueue {
    inner: Arc<Mutex<VecDeque<PendingRequest>>>,
}

enum Route {
    Reply(PendingRequest),
    Mismatch(PendingRequest),
    Event,
    Stray,
}

impl PendingQueue {
    fn entries(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, pending: PendingRequest) {
        self.entries().push_back(pending);
    }

    /// Decide where a decoded line goes.
    ///
    /// Requests whose caller already timed out are skipped when the line
    /// does not echo them, so a reply that never came does not shift every
    /// later reply onto the wrong request.
    fn route(&self, tokens: &[String], listening: bool) -> Route {
        let mut entries = self.entries();
        while let Some(front) = entries.front() {
            if front.command.is_echoed_by(tokens) {
                return entries.pop_front().map_or(Route::Stray, Route::Reply);
            }
            if !front.reply.is_closed() {
                break;
            }
            trace!(command = %front.command, "dropping abandoned request");
            entries.pop_front();
        }

        if listening {
            Route::Event
        } else {
            entries.pop_front().map_or(Route::Stray, Route::Mismatch)
        }
    }

    /// Fail every outstanding request with `SessionClosed`.
    fn fail_all(&self) {
        let drained: Vec<PendingRequest> = self.entries().drain(..).collect();
        for pending in drained {
            pending.complete(Err(CliError::SessionClosed));
        }
    }
}

/// State shared by the session handle and its two tasks.
struct Shared {
    address: String,
    pending: PendingQueue,
    listening: AtomicBool,
    closing: AtomicBool,
    closer: ChannelCloser,
    bus: SharedBus,
}

/// One open command/reply channel to the server.
pub struct ProtocolSession {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Outgoing>,
    options: SessionOptions,
}

impl ProtocolSession {
    /// Connect over TCP and start the reader and writer tasks.
    pub async fn open(address: &str, options: SessionOptions, bus: SharedBus) -> CliResult<Self> {
        let channel = LineChannel::open(address, options.connect_timeout).await?;
        Ok(Self::start(address, channel, options, bus))
    }

    /// Start a session over an already-open channel.
    pub fn start<R, W>(
        address: &str,
        channel: LineChannel<R, W>,
        options: SessionOptions,
        bus: SharedBus,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closer = channel.closer();
        let (reader, writer) = channel.into_split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            address: address.to_string(),
            pending: PendingQueue::default(),
            listening: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closer,
            bus,
        });

        tokio::spawn(write_loop(
            writer,
            outgoing_rx,
            shared.clone(),
            options.request_timeout,
        ));
        tokio::spawn(read_loop(reader, shared.clone()));

        debug!(address, "protocol session started");
        Self {
            shared,
            outgoing,
            options,
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Whether pushed events are being routed to the bus.
    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst) || self.shared.closer.is_closed()
    }

    /// Resolves once the underlying channel is closed, locally or by the peer.
    pub async fn closed(&self) {
        self.shared.closer.closed().await
    }

    /// Send `listen 1`; from then on unmatched lines are published as events.
    pub async fn enable_events(&self) -> CliResult<()> {
        self.request(Command::new(["listen", "1"])).await?;
        Ok(())
    }

    /// Send `exit` best-effort and close the channel.
    ///
    /// Idempotent. Outstanding requests fail with `SessionClosed` right away.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(address = %self.shared.address, "closing protocol session");
        self.shared.pending.fail_all();

        if self.outgoing.try_send(Outgoing::Exit).is_err() {
            self.shared.closer.close();
        }
    }
}

#[async_trait]
impl Requester for ProtocolSession {
    async fn request(&self, command: Command) -> CliResult<Reply> {
        if self.is_closed() {
            return Err(CliError::SessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        let (settled_tx, settled) = oneshot::channel();
        let label = command.to_string();
        debug!(address = %self.shared.address, command = %label, "request");

        self.outgoing
            .send(Outgoing::Request {
                line: command.to_line(),
                pending: PendingRequest {
                    command,
                    reply: tx,
                    _settled: settled_tx,
                },
                settled,
            })
            .await
            .map_err(|_| CliError::SessionClosed)?;

        match timeout(self.options.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CliError::SessionClosed),
            Err(_) => {
                warn!(
                    address = %self.shared.address,
                    command = %label,
                    "no reply after {:?}",
                    self.options.request_timeout
                );
                Err(CliError::Timeout {
                    command: label,
                    after: self.options.request_timeout,
                })
            }
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.closer.close();
    }
}

async fn write_loop<W>(
    mut writer: LineWriter<W>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
    request_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            next = outgoing.recv() => next,
            _ = shared.closer.closed() => None,
        };

        match next {
            Some(Outgoing::Request {
                line,
                pending,
                settled,
            }) => {
                if shared.closing.load(Ordering::SeqCst) {
                    pending.complete(Err(CliError::SessionClosed));
                    continue;
                }
                if pending.reply.is_closed() {
                    trace!(command = %pending.command, "caller gave up before the command was sent");
                    continue;
                }
                shared.pending.push(pending);
                if let Err(e) = writer.write_line(&line).await {
                    debug!(address = %shared.address, "writer stopping: {}", e);
                    break;
                }

                tokio::select! {
                    _ = settled => {}
                    _ = tokio::time::sleep(request_timeout) => {
                        trace!(address = %shared.address, "no reply in time, sending next command");
                    }
                    _ = shared.closer.closed() => break,
                }
            }
            Some(Outgoing::Exit) => {
                if timeout(EXIT_GRACE, writer.write_line("exit")).await.is_err() {
                    debug!(address = %shared.address, "exit not sent within grace period");
                }
                break;
            }
            None => break,
        }
    }

    shared.closer.close();
    shared.pending.fail_all();
    writer.shutdown().await;
}

async fn read_loop<R>(mut reader: LineReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match reader.read_line().await {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(address = %shared.address, line = %line, "received");

        let tokens = decode_line(&line);
        let listening = shared.listening.load(Ordering::SeqCst);

        match shared.pending.route(&tokens, listening) {
            Route::Reply(pending) => {
                match pending.command.tokens() {
                    [cmd, flag] if cmd == "listen" => {
                        shared.listening.store(flag == "1", Ordering::SeqCst);
                    }
                    _ => {}
                }
                let echo_len = pending.command.echo_len();
                pending.complete(Ok(Reply::new(tokens, echo_len)));
            }
            Route::Mismatch(pending) => {
                warn!(
                    address = %shared.address,
                    command = %pending.command,
                    line = %line,
                    "reply does not echo its command"
                );
                let reason = format!("unexpected reply '{}'", line);
                let command = pending.command.to_string();
                pending.complete(Err(CliError::malformed(command, reason)));
            }
            Route::Event => {
                let event = parse_server_event(&tokens, &line);
                debug!(address = %shared.address, ?event, "server event");
                shared.bus.publish(BusEvent::ServerEvent { event });
            }
            Route::Stray => {
                if !shared.closing.load(Ordering::SeqCst) {
                    debug!(address = %shared.address, line = %line, "ignoring unsolicited line");
                }
            }
        }
    }

    shared.closer.close();
    shared.pending.fail_all();
    debug!(address = %shared.address, "protocol session reader stopped");
}
