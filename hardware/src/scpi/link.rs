//! Background task owning the TCP session to the instrument.

use std::future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::{Command, LinkError, LinkResult, DEFAULT_PORT, DEFAULT_RESPONSE_TIMEOUT};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 256;

/// Connection parameters for an [`ScpiLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Response window for queries sent with [`ScpiLink::send`].
    pub response_timeout: Duration,
    /// Limit on a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Backoff for attempt `n` is `min(base * 2^n, max)`.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl LinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(10_000),
        }
    }

    /// Connect to `host` on the default SCPI port.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PORT)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Delay before automatic reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Snapshot of the link's connection bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub connected: bool,
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

/// Lifecycle notifications for logging and UI. Delivery is best effort.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected {
        addr: String,
    },
    /// `reason` is `None` for an explicit disconnect.
    Disconnected {
        reason: Option<String>,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Error {
        message: String,
    },
    CommandSent {
        command: String,
    },
    ResponseReceived {
        command: String,
        response: String,
    },
}

enum LinkRequest {
    Connect {
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetAutoReconnect {
        enabled: bool,
    },
    Send {
        command: Command,
        timeout: Duration,
        reply: oneshot::Sender<LinkResult<Option<String>>>,
    },
}

/// Handle to the SCPI session.
///
/// All methods take `&self`; requests are queued FIFO to the task that owns the socket,
/// which processes one command at a time. Dropping the handle stops the task and closes
/// the socket.
pub struct ScpiLink {
    config: LinkConfig,
    requests: mpsc::UnboundedSender<LinkRequest>,
    events: broadcast::Sender<LinkEvent>,
    state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl ScpiLink {
    /// Create a disconnected link. Must be called from within a Tokio runtime.
    pub fn new(config: LinkConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let initial = LinkState {
            connected: false,
            auto_reconnect: config.auto_reconnect,
            reconnect_attempts: 0,
            max_reconnect_attempts: config.max_reconnect_attempts,
        };
        let (state_tx, state_rx) = watch::channel(initial);

        let actor = LinkActor {
            auto_reconnect: config.auto_reconnect,
            config: config.clone(),
            requests: requests_rx,
            events: events.clone(),
            state: state_tx,
            connection: None,
            pending: None,
            draining_until: None,
            reconnect_at: None,
            reconnect_attempts: 0,
            exhausted: false,
        };
        let task = tokio::spawn(actor.run());

        Self {
            config,
            requests: requests_tx,
            events,
            state: state_rx,
            task,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Open the TCP connection. Succeeds immediately if already connected.
    ///
    /// A successful connect re-enables automatic reconnects if the configuration asks
    /// for them and resets the attempt counter.
    pub async fn connect(&self) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(LinkRequest::Connect { reply })?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Close the connection without triggering a reconnect. Idempotent.
    pub async fn disconnect(&self) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(LinkRequest::Disconnect { reply })?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Enable or disable automatic reconnection.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        let _ = self.requests.send(LinkRequest::SetAutoReconnect { enabled });
    }

    /// Send a command with the configured response timeout.
    ///
    /// Returns `Some(line)` for queries and `None` for fire-and-forget commands.
    pub async fn send(&self, command: impl Into<Command>) -> LinkResult<Option<String>> {
        self.send_with_timeout(command, self.config.response_timeout)
            .await
    }

    /// Send a command, waiting at most `timeout` for the reply to a query.
    pub async fn send_with_timeout(
        &self,
        command: impl Into<Command>,
        timeout: Duration,
    ) -> LinkResult<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.submit(LinkRequest::Send {
            command: command.into(),
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Send a query and return its response line.
    pub async fn query(&self, text: &str) -> LinkResult<String> {
        let command = Command::new(text);
        if !command.expects_response() {
            return Err(LinkError::NotAQuery {
                command: command.text().to_string(),
            });
        }
        match self.send(command).await? {
            Some(response) => Ok(response),
            None => Err(LinkError::NotAQuery {
                command: text.to_string(),
            }),
        }
    }

    /// Send a fire-and-forget command.
    pub async fn write(&self, text: &str) -> LinkResult<()> {
        self.send(text).await.map(|_| ())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn submit(&self, request: LinkRequest) -> LinkResult<()> {
        self.requests.send(request).map_err(|_| LinkError::Closed)
    }
}

impl Drop for ScpiLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

struct Pending {
    command: String,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<LinkResult<Option<String>>>,
}

enum Wake {
    Line(io::Result<Option<String>>),
    ResponseTimeout,
    DrainElapsed,
    ReconnectDue,
    Request(Option<LinkRequest>),
}

struct LinkActor {
    config: LinkConfig,
    requests: mpsc::UnboundedReceiver<LinkRequest>,
    events: broadcast::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    connection: Option<Connection>,
    /// At most one command awaits a response at any time.
    pending: Option<Pending>,
    /// After a timeout the queue is held until the late reply arrives or this passes.
    draining_until: Option<Instant>,
    reconnect_at: Option<Instant>,
    auto_reconnect: bool,
    reconnect_attempts: u32,
    exhausted: bool,
}

impl LinkActor {
    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let draining_until = self.draining_until;
            let reconnect_at = self.reconnect_at;
            let idle = self.pending.is_none() && self.draining_until.is_none();

            // The reader stays armed even when nothing is pending so that late replies
            // are drained here instead of being matched to the next command.
            let wake = tokio::select! {
                line = next_line(self.connection.as_mut()) => Wake::Line(line),
                _ = sleep_until_opt(deadline) => Wake::ResponseTimeout,
                _ = sleep_until_opt(draining_until) => Wake::DrainElapsed,
                _ = sleep_until_opt(reconnect_at) => Wake::ReconnectDue,
                request = self.requests.recv(), if idle => Wake::Request(request),
            };

            match wake {
                Wake::Line(Ok(Some(line))) => self.handle_line(line),
                Wake::Line(Ok(None)) => self.connection_lost("closed by instrument".to_string()),
                Wake::Line(Err(err)) => self.connection_lost(err.to_string()),
                Wake::ResponseTimeout => self.handle_timeout(),
                Wake::DrainElapsed => {
                    debug!("No late reply arrived, resuming");
                    self.draining_until = None;
                }
                Wake::ReconnectDue => self.attempt_reconnect().await,
                Wake::Request(Some(request)) => self.handle_request(request).await,
                Wake::Request(None) => break,
            }
        }

        debug!("SCPI link task exiting");
    }

    fn handle_line(&mut self, line: String) {
        let response = line.trim_end_matches('\r').to_string();
        match self.pending.take() {
            Some(pending) => {
                debug!("<- {} = {}", pending.command, response);
                self.emit(LinkEvent::ResponseReceived {
                    command: pending.command.clone(),
                    response: response.clone(),
                });
                let _ = pending.reply.send(Ok(Some(response)));
            }
            None => {
                if self.draining_until.take().is_some() {
                    debug!("Discarding late response: {response:?}");
                } else {
                    debug!("Discarding unsolicited response: {response:?}");
                }
            }
        }
    }

    fn handle_timeout(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "No response to `{}` within {:?}",
                pending.command, pending.timeout
            );
            // Hold the next command back so a late reply cannot be taken as its answer
            self.draining_until = Some(Instant::now() + pending.timeout);
            let _ = pending.reply.send(Err(LinkError::Timeout {
                command: pending.command,
                timeout: pending.timeout,
            }));
        }
    }

    async fn handle_request(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            LinkRequest::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            LinkRequest::SetAutoReconnect { enabled } => {
                self.auto_reconnect = enabled;
                if enabled && self.exhausted {
                    self.exhausted = false;
                    self.reconnect_attempts = 0;
                    self.schedule_reconnect();
                } else if !enabled {
                    self.reconnect_at = None;
                }
                self.publish_state();
            }
            LinkRequest::Send {
                command,
                timeout,
                reply,
            } => self.send(command, timeout, reply).await,
        }
    }

    async fn connect(&mut self) -> LinkResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        match self.open().await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.exhausted = false;
                self.auto_reconnect = self.config.auto_reconnect;
                info!("Connected to instrument at {}", self.config.addr());
                self.emit(LinkEvent::Connected {
                    addr: self.config.addr(),
                });
                self.publish_state();
                Ok(())
            }
            Err(err) => {
                self.emit(LinkEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.draining_until = None;
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.writer.shutdown().await {
                debug!("Socket shutdown failed: {err}");
            }
            info!("Disconnected from instrument at {}", self.config.addr());
            self.emit(LinkEvent::Disconnected { reason: None });
        }
        self.publish_state();
    }

    async fn send(
        &mut self,
        command: Command,
        timeout: Duration,
        reply: oneshot::Sender<LinkResult<Option<String>>>,
    ) {
        let Some(connection) = self.connection.as_mut() else {
            let err = if self.exhausted {
                LinkError::ReconnectExhausted {
                    addr: self.config.addr(),
                    attempts: self.config.max_reconnect_attempts,
                }
            } else {
                LinkError::NotConnected
            };
            let _ = reply.send(Err(err));
            return;
        };

        let line = format!("{}\n", command.text());
        if let Err(err) = connection.writer.write_all(line.as_bytes()).await {
            let reason = err.to_string();
            let _ = reply.send(Err(LinkError::ConnectionLost {
                command: command.text().to_string(),
                reason: reason.clone(),
            }));
            self.connection_lost(reason);
            return;
        }

        debug!("-> {}", command);
        self.emit(LinkEvent::CommandSent {
            command: command.text().to_string(),
        });

        if command.expects_response() {
            self.pending = Some(Pending {
                command: command.text().to_string(),
                timeout,
                deadline: Instant::now() + timeout,
                reply,
            });
        } else {
            let _ = reply.send(Ok(None));
        }
    }

    fn connection_lost(&mut self, reason: String) {
        self.connection = None;
        self.draining_until = None;
        warn!("Instrument connection lost: {reason}");

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(LinkError::ConnectionLost {
                command: pending.command,
                reason: reason.clone(),
            }));
        }

        self.emit(LinkEvent::Disconnected {
            reason: Some(reason),
        });

        if self.auto_reconnect {
            self.schedule_reconnect();
        }
        self.publish_state();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            let err = LinkError::ReconnectExhausted {
                addr: self.config.addr(),
                attempts: self.reconnect_attempts,
            };
            warn!("{err}");
            self.emit(LinkEvent::Error {
                message: err.to_string(),
            });
            self.exhausted = true;
            self.auto_reconnect = false;
            self.reconnect_at = None;
            return;
        }

        self.reconnect_attempts += 1;
        let delay = reconnect_delay(
            self.reconnect_attempts,
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            self.config.addr(),
            delay,
            self.reconnect_attempts,
            self.config.max_reconnect_attempts
        );
        self.emit(LinkEvent::Reconnecting {
            attempt: self.reconnect_attempts,
            delay,
        });
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        match self.open().await {
            Ok(connection) => {
                info!(
                    "Reconnected to {} after {} attempt(s)",
                    self.config.addr(),
                    self.reconnect_attempts
                );
                self.connection = Some(connection);
                self.reconnect_attempts = 0;
                self.emit(LinkEvent::Connected {
                    addr: self.config.addr(),
                });
            }
            Err(err) => {
                warn!("Reconnect attempt {} failed: {err}", self.reconnect_attempts);
                self.emit(LinkEvent::Error {
                    message: err.to_string(),
                });
                self.schedule_reconnect();
            }
        }
        self.publish_state();
    }

    async fn open(&self) -> LinkResult<Connection> {
        let addr = self.config.addr();
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(LinkError::Connection {
                    addr,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(LinkError::Connection {
                    addr,
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                })
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {err}");
        }

        let (reader, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        self.state.send_replace(LinkState {
            connected: self.connection.is_some(),
            auto_reconnect: self.auto_reconnect,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        });
    }
}

/// Next response line, or never if there is no connection.
async fn next_line(connection: Option<&mut Connection>) -> io::Result<Option<String>> {
    match connection {
        // `next_line` is cancel safe, so losing the select race drops no data
        Some(connection) => connection.lines.next_line().await,
        None => future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}
