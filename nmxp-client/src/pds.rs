use std::collections::VecDeque;

use futures_core::Stream;
use nmxp_rs_protocol::request::message_text;
use nmxp_rs_protocol::{
    ChannelDirectory, DataRecord, DataType, DecodeError, MessageType, ProtocolError, Request,
    ShutdownReason, decode_compressed, decode_decompressed,
};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::config::{ClientConfig, PdsRequest};
use crate::connection::Connection;
use crate::continuity::{Continuity, ContinuityTracker};
use crate::error::{ClientError, Result};
use crate::retry::{StopSignal, connect_with_retry};
use crate::sink::RecordPipeline;
use crate::state::PdsState;

/// Async client for a NaqsServer Private Data Stream.
///
/// Connecting performs the whole handshake: CONNECT, channel list, subset
/// and AddTimeSeriesChannels. The client is then `Subscribed` and
/// [`next_record`](Self::next_record) yields decoded records.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nmxp_rs_client::Result<()> {
/// use nmxp_rs_client::{PdsClient, PdsRequest};
/// use nmxp_rs_protocol::ShutdownReason;
///
/// let request = PdsRequest::new("IU.ANMO.BH?,*.HHZ");
/// let mut client = PdsClient::connect("naqs.example.org:28000", request).await?;
///
/// while let Some(record) = client.next_record().await? {
///     println!("{} {} samples at {}", record.name(), record.samples.len(), record.time);
/// }
/// client.terminate(ShutdownReason::Normal, "done").await?;
/// # Ok(())
/// # }
/// ```
pub struct PdsClient {
    connection: Connection,
    state: PdsState,
    directory: ChannelDirectory,
    subscribed: ChannelDirectory,
    request: PdsRequest,
    continuity: ContinuityTracker,
    ready: VecDeque<DataRecord>,
    last_pending: Instant,
    dropped: u64,
    span: Span,
}

impl PdsClient {
    /// Connect and subscribe with the default [`ClientConfig`].
    pub async fn connect(addr: &str, request: PdsRequest) -> Result<Self> {
        Self::connect_with_config(addr, request, ClientConfig::default(), StopSignal::never()).await
    }

    /// Connect and subscribe. The TCP connect is retried with the configured
    /// backoff until it succeeds or `stop` fires.
    pub async fn connect_with_config(
        addr: &str,
        request: PdsRequest,
        config: ClientConfig,
        mut stop: StopSignal,
    ) -> Result<Self> {
        request.validate()?;

        let span = info_span!("pds", addr);
        let connection = connect_with_retry(addr, &config, &mut stop)
            .instrument(span.clone())
            .await?;
        Self::handshake(connection, request, span, None).await
    }

    /// Subscribe over an open connection, carrying continuity state over
    /// from a previous connection when given.
    pub(crate) async fn handshake(
        connection: Connection,
        request: PdsRequest,
        span: Span,
        continuity: Option<ContinuityTracker>,
    ) -> Result<Self> {
        let continuity = continuity
            .unwrap_or_else(|| ContinuityTracker::new(&ChannelDirectory::default(), request.reorder_capacity()));

        let mut client = Self {
            connection,
            state: PdsState::Connected,
            directory: ChannelDirectory::default(),
            subscribed: ChannelDirectory::default(),
            request,
            continuity,
            ready: VecDeque::new(),
            last_pending: Instant::now(),
            dropped: 0,
            span,
        };
        client.subscribe().await?;
        Ok(client)
    }

    // -- Accessors --

    pub fn state(&self) -> PdsState {
        self.state
    }

    /// Full channel list sent by the server.
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    /// Channels selected by the request patterns, in subscription order.
    pub fn subscribed(&self) -> &ChannelDirectory {
        &self.subscribed
    }

    pub fn request(&self) -> &PdsRequest {
        &self.request
    }

    pub fn continuity(&self) -> &ContinuityTracker {
        &self.continuity
    }

    /// Packets dropped because they could not be decoded.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    // -- Streaming (Subscribed|Streaming → Streaming) --

    /// Read the next decoded record.
    ///
    /// Returns `Ok(None)` once the server closes the connection or ends the
    /// subscription. Undecodable packets are logged and skipped; an ERROR
    /// message from the server is returned as [`ClientError::ServerError`].
    pub async fn next_record(&mut self) -> Result<Option<DataRecord>> {
        if let Some(record) = self.ready.pop_front() {
            return Ok(Some(record));
        }
        if self.state == PdsState::Closed {
            return Ok(None);
        }
        self.require_state_in(&[PdsState::Subscribed, PdsState::Streaming])?;
        self.state = PdsState::Streaming;

        loop {
            if let Some(record) = self.ready.pop_front() {
                return Ok(Some(record));
            }
            self.send_pending_if_due().await?;

            // With a keep-alive configured, wait for data only until the
            // next REQUESTPENDING is due.
            let received = match self.request.request_pending_interval {
                Some(interval) => {
                    let wait = interval.saturating_sub(self.last_pending.elapsed());
                    match self.connection.wait_readable(wait).await {
                        Ok(false) => continue,
                        Ok(true) => self.connection.recv_message().await,
                        Err(e) => Err(e),
                    }
                }
                None => self.connection.recv_message().await,
            };

            let (header, body) = match received {
                Ok(msg) => msg,
                Err(ClientError::Disconnected) => {
                    info!(parent: &self.span, "server closed connection");
                    return Ok(self.close_stream());
                }
                Err(e) => {
                    if e.is_connection_fatal() {
                        self.state = PdsState::Closed;
                    }
                    return Err(e);
                }
            };

            match header.kind() {
                Some(MessageType::Compressed) => {
                    let decoded = decode_compressed(&body, &self.subscribed);
                    self.accept(decoded);
                }
                Some(MessageType::Decompressed) => {
                    let decoded = decode_decompressed(&body, &self.subscribed);
                    self.accept(decoded);
                }
                Some(MessageType::Error) => {
                    let text = message_text(&body);
                    error!(parent: &self.span, %text, "server error");
                    return Err(ClientError::ServerError(text));
                }
                Some(MessageType::TerminateSubscription) => {
                    info!(parent: &self.span, text = %message_text(body.get(4..).unwrap_or_default()), "server ended subscription");
                    return Ok(self.close_stream());
                }
                Some(other) => debug!(parent: &self.span, ?other, "ignoring message"),
                None => debug!(parent: &self.span, msg_type = header.msg_type, "ignoring unknown message type"),
            }
        }
    }

    /// Consume this client and return a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<DataRecord>> {
        crate::stream::record_stream(self)
    }

    /// Feed every record to `pipeline` until the stream ends or `stop` fires.
    ///
    /// Returns the number of records processed.
    pub async fn run(&mut self, pipeline: &mut RecordPipeline, mut stop: StopSignal) -> Result<u64> {
        let mut count = 0;
        loop {
            let next = tokio::select! {
                r = self.next_record() => r?,
                _ = stop.stopped() => {
                    self.terminate(ShutdownReason::Normal, "stopped").await?;
                    return Ok(count);
                }
            };
            let Some(record) = next else {
                return Ok(count);
            };
            pipeline.process(&record);
            count += 1;
        }
    }

    /// Send TerminateSubscription and close the socket.
    ///
    /// Can be called in any state. Records still held by the raw reorder
    /// buffers are discarded.
    pub async fn terminate(&mut self, reason: ShutdownReason, message: &str) -> Result<()> {
        if self.state == PdsState::Closed {
            return Ok(());
        }
        self.state = PdsState::Terminating;
        let held = self.continuity.flush_raw().len();
        if held > 0 {
            debug!(parent: &self.span, held, "discarding buffered raw packets");
        }

        let request = Request::TerminateSubscription {
            reason,
            message: message.to_owned(),
        };
        let sent = self.connection.send_request(&request).await;
        self.connection.shutdown().await.ok();
        self.state = PdsState::Closed;
        info!(parent: &self.span, ?reason, "subscription terminated");
        sent
    }

    /// Give up the continuity state so a new connection can carry it on.
    ///
    /// Raw packets still waiting in the reorder buffers are kept.
    pub(crate) fn into_continuity(self) -> ContinuityTracker {
        self.continuity
    }

    // -- Private helpers --

    async fn subscribe(&mut self) -> Result<()> {
        self.connection.send_request(&Request::Connect).await?;

        let body = self.expect(MessageType::ChannelList).await?;
        self.directory = ChannelDirectory::parse(&body)?;
        self.state = PdsState::DirectoryReceived;
        info!(parent: &self.span, channels = self.directory.len(), "channel list received");

        self.subscribed = self
            .directory
            .filter_by_type(DataType::Timeseries)
            .subset(&self.request.patterns, &self.request.default_network)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if self.subscribed.is_empty() {
            return Err(ClientError::Config(format!(
                "no channel matches {:?}",
                self.request.patterns
            )));
        }
        self.continuity.rebuild(&self.subscribed);

        let request = Request::AddTimeSeriesChannels {
            keys: self.subscribed.keys(),
            short_term_completion: self.request.completion.to_i32(),
            out_format: self.request.out_format,
            buffered: self.request.buffered,
        };
        self.connection.send_request(&request).await?;
        self.state = PdsState::Subscribed;
        self.last_pending = Instant::now();
        info!(parent: &self.span, channels = self.subscribed.len(), completion = ?self.request.completion, "subscribed");
        Ok(())
    }

    async fn expect(&mut self, expected: MessageType) -> Result<Vec<u8>> {
        let (header, body) = self.connection.recv_message().await?;
        match header.kind() {
            Some(kind) if kind == expected => Ok(body),
            Some(MessageType::Error) => Err(ClientError::ServerError(message_text(&body))),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected,
                actual: header.msg_type,
            }
            .into()),
        }
    }

    async fn send_pending_if_due(&mut self) -> Result<()> {
        if let Some(interval) = self.request.request_pending_interval
            && self.last_pending.elapsed() >= interval
        {
            trace!(parent: &self.span, "REQUESTPENDING");
            self.connection.send_request(&Request::RequestPending).await?;
            self.last_pending = Instant::now();
        }
        Ok(())
    }

    fn accept(&mut self, decoded: std::result::Result<DataRecord, DecodeError>) {
        let record = match decoded {
            Ok(record) => record,
            Err(DecodeError::FillerPacket) => {
                trace!(parent: &self.span, "filler packet");
                return;
            }
            Err(e) => {
                self.dropped += 1;
                warn!(parent: &self.span, error = %e, "packet dropped");
                return;
            }
        };

        for record in self.continuity.reorder(record) {
            self.check_continuity(&record);
            self.ready.push_back(record);
        }
    }

    fn check_continuity(&mut self, record: &DataRecord) {
        let x0_mismatch = self.continuity.x0_mismatch(record);
        match self.continuity.observe(record) {
            Continuity::Gap(seconds) => {
                warn!(parent: &self.span, channel = %record.name(), seconds, time = record.time, "gap")
            }
            Continuity::Overlap(seconds) => {
                warn!(parent: &self.span, channel = %record.name(), seconds, time = record.time, "overlap")
            }
            Continuity::Contiguous if x0_mismatch => {
                warn!(parent: &self.span, channel = %record.name(), x0 = ?record.x0, "x0 does not continue previous packet")
            }
            _ => {}
        }
    }

    /// Mark the stream closed and queue whatever the reorder buffers held.
    fn close_stream(&mut self) -> Option<DataRecord> {
        self.state = PdsState::Closed;
        for record in self.continuity.flush_raw() {
            self.check_continuity(&record);
            self.ready.push_back(record);
        }
        self.ready.pop_front()
    }

    fn require_state_in(&self, allowed: &[PdsState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let expected: &'static str = match allowed {
                [PdsState::Subscribed, PdsState::Streaming] => "Subscribed|Streaming",
                _ => "valid state",
            };
            Err(ClientError::InvalidState {
                expected,
                actual: self.state.as_str(),
            })
        }
    }
}
