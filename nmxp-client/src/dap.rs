use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nmxp_rs_protocol::channel::parse_precis_list;
use nmxp_rs_protocol::request::message_text;
use nmxp_rs_protocol::{
    ChannelDirectory, DataRecord, DataType, DecodeError, MessageType, PrecisEntry, ProtocolError,
    Request, ShutdownReason, decode_compressed, decode_decompressed,
};
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::config::{ClientConfig, Credentials, DapMode, DapRequest, TimeWindow};
use crate::connection::Connection;
use crate::continuity::{Continuity, ContinuityTracker};
use crate::error::{ClientError, Result};
use crate::retry::{StopSignal, connect_with_retry};
use crate::sink::RecordPipeline;
use crate::state::DapState;

/// Async client for a DataServer (Data Access Protocol).
///
/// Connecting reads the server's connection-time token, logs in and waits
/// for READY. Each [`request_data`](Self::request_data) then returns to
/// `Ready` once [`next_record`](Self::next_record) has drained the answer.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nmxp_rs_client::Result<()> {
/// use nmxp_rs_client::{Credentials, DapClient, TimeWindow};
///
/// let mut client = DapClient::connect("dataserver.example.org:28002", Credentials::default()).await?;
/// let channels = client.select("ANMO.BHZ", "IU").await?;
/// let window = TimeWindow::new(1_700_000_000, 1_700_000_600);
/// for key in channels.keys() {
///     client.request_data(key, window).await?;
///     while let Some(record) = client.next_record().await? {
///         println!("{} {} samples", record.name(), record.samples.len());
///     }
/// }
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct DapClient {
    connection: Connection,
    state: DapState,
    connection_time: i32,
    directory: ChannelDirectory,
    selected: ChannelDirectory,
    window: Option<TimeWindow>,
    continuity: ContinuityTracker,
    dropped: u64,
    span: Span,
}

impl DapClient {
    /// Connect and log in with the default [`ClientConfig`].
    pub async fn connect(addr: &str, credentials: Credentials) -> Result<Self> {
        Self::connect_with_config(addr, credentials, ClientConfig::default(), StopSignal::never()).await
    }

    /// Connect and log in. The TCP connect is retried with the configured
    /// backoff until it succeeds or `stop` fires.
    pub async fn connect_with_config(
        addr: &str,
        credentials: Credentials,
        config: ClientConfig,
        mut stop: StopSignal,
    ) -> Result<Self> {
        credentials.validate()?;

        let span = info_span!("dap", addr);
        let mut connection = connect_with_retry(addr, &config, &mut stop)
            .instrument(span.clone())
            .await?;

        let connection_time = connection.recv_i32().await?;
        debug!(parent: &span, connection_time, "connection time received");

        let mut client = Self {
            connection,
            state: DapState::Connected,
            connection_time,
            directory: ChannelDirectory::default(),
            selected: ChannelDirectory::default(),
            window: None,
            continuity: ContinuityTracker::new(&ChannelDirectory::default(), None),
            dropped: 0,
            span,
        };
        client.login(&credentials).await?;
        Ok(client)
    }

    /// Connect with the request's credentials, [`run`](Self::run) it and
    /// close.
    pub async fn retrieve(
        addr: &str,
        request: &DapRequest,
        config: ClientConfig,
        pipeline: &mut RecordPipeline,
        stop: StopSignal,
    ) -> Result<u64> {
        request.validate()?;
        let mut client = Self::connect_with_config(addr, request.credentials.clone(), config, stop.clone()).await?;
        client.run(request, pipeline, stop).await
    }

    // -- Accessors --

    pub fn state(&self) -> DapState {
        self.state
    }

    /// Token the server sent on connect, in epoch seconds.
    pub fn connection_time(&self) -> i32 {
        self.connection_time
    }

    /// Last channel list received.
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    /// Channels whose records are decoded.
    pub fn selected(&self) -> &ChannelDirectory {
        &self.selected
    }

    pub fn continuity(&self) -> &ContinuityTracker {
        &self.continuity
    }

    /// Packets dropped because they could not be decoded.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    // -- Catalogue (Ready → Ready) --

    /// Fetch the server's channel list.
    ///
    /// Every time-series channel of the list becomes selected; narrow the
    /// selection with [`select`](Self::select).
    pub async fn channel_list(&mut self) -> Result<&ChannelDirectory> {
        self.require_state_in(&[DapState::Ready])?;
        self.connection.send_request(&Request::ChannelListRequest).await?;
        let body = self.expect(MessageType::ChannelList).await?;
        self.directory = ChannelDirectory::parse(&body)?;
        self.set_selected(self.directory.filter_by_type(DataType::Timeseries));
        info!(parent: &self.span, channels = self.directory.len(), "channel list received");
        Ok(&self.directory)
    }

    /// Select the time-series channels matching `patterns`, fetching the
    /// channel list first if it has not been received yet.
    pub async fn select(&mut self, patterns: &str, default_network: &str) -> Result<ChannelDirectory> {
        if self.directory.is_empty() {
            self.channel_list().await?;
        }
        let selected = self
            .directory
            .filter_by_type(DataType::Timeseries)
            .subset(patterns, default_network)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if selected.is_empty() {
            return Err(ClientError::Config(format!("no channel matches {patterns:?}")));
        }
        self.set_selected(selected.clone());
        debug!(parent: &self.span, channels = selected.len(), "channels selected");
        Ok(selected)
    }

    /// Fetch the time range the server holds for every channel of
    /// `data_type`.
    pub async fn precis_list(&mut self, data_type: DataType) -> Result<Vec<PrecisEntry>> {
        self.require_state_in(&[DapState::Ready])?;
        let request = Request::PrecisListRequest {
            instrument_id: -1,
            data_type: i32::from(data_type.to_u8()),
            channel: -1,
        };
        self.connection.send_request(&request).await?;
        let body = self.expect(MessageType::PrecisList).await?;
        Ok(parse_precis_list(&body)?)
    }

    // -- Retrieval (Ready → Requesting → Receiving → Ready) --

    /// Ask for one channel's data in `window`.
    ///
    /// Read the answer with [`next_record`](Self::next_record) until it
    /// returns `Ok(None)`.
    pub async fn request_data(&mut self, key: u32, window: TimeWindow) -> Result<()> {
        self.require_state_in(&[DapState::Ready])?;

        debug!(parent: &self.span, key, start = window.start, end = window.end, "DATAREQUEST");
        let request = Request::DataRequest {
            key,
            start: window.start,
            end: window.end,
        };
        self.connection.send_request(&request).await?;
        self.window = Some(window);
        self.state = DapState::Requesting;
        Ok(())
    }

    /// Read the next record of the current request, trimmed to its window.
    ///
    /// Returns `Ok(None)` once the server signals READY. Records entirely
    /// outside the window and undecodable packets are skipped.
    pub async fn next_record(&mut self) -> Result<Option<DataRecord>> {
        if self.state == DapState::Ready {
            return Ok(None);
        }
        self.require_state_in(&[DapState::Requesting, DapState::Receiving])?;

        loop {
            let (header, body) = match self.connection.recv_message().await {
                Ok(msg) => msg,
                Err(e) => {
                    if e.is_connection_fatal() {
                        self.state = DapState::Closed;
                    }
                    return Err(e);
                }
            };

            let decoded = match header.kind() {
                Some(MessageType::Compressed) => decode_compressed(&body, &self.selected),
                Some(MessageType::Decompressed) => decode_decompressed(&body, &self.selected),
                Some(MessageType::Ready) => {
                    self.state = DapState::Ready;
                    self.window = None;
                    return Ok(None);
                }
                Some(MessageType::Error) => {
                    let text = message_text(&body);
                    error!(parent: &self.span, %text, "server error");
                    return Err(ClientError::ServerError(text));
                }
                Some(other) => {
                    debug!(parent: &self.span, ?other, "ignoring message");
                    continue;
                }
                None => {
                    debug!(parent: &self.span, msg_type = header.msg_type, "ignoring unknown message type");
                    continue;
                }
            };
            self.state = DapState::Receiving;

            if let Some(record) = self.accept(decoded) {
                return Ok(Some(record));
            }
        }
    }

    /// Retrieve everything `request` describes and feed it to `pipeline`.
    ///
    /// In [`DapMode::Delay`] the window keeps sliding forward, each one
    /// requested once the wall clock is `delay` past its end, until `stop`
    /// fires. Finishes with TerminateSubscription. Returns the number of
    /// records processed.
    pub async fn run(
        &mut self,
        request: &DapRequest,
        pipeline: &mut RecordPipeline,
        mut stop: StopSignal,
    ) -> Result<u64> {
        request.validate()?;
        match self.run_windows(request, pipeline, &mut stop).await {
            Ok(count) => {
                self.terminate(ShutdownReason::Normal, "done").await?;
                Ok(count)
            }
            Err(e) => {
                if let Err(t) = self.terminate(ShutdownReason::Error, &e.to_string()).await {
                    debug!(parent: &self.span, error = %t, "terminate after failure failed");
                }
                Err(e)
            }
        }
    }

    /// Send TerminateSubscription and close the socket. Can be called in any
    /// state.
    pub async fn terminate(&mut self, reason: ShutdownReason, message: &str) -> Result<()> {
        if self.state == DapState::Closed {
            return Ok(());
        }
        self.state = DapState::Terminating;
        let request = Request::TerminateSubscription {
            reason,
            message: message.to_owned(),
        };
        let sent = self.connection.send_request(&request).await;
        self.connection.shutdown().await.ok();
        self.state = DapState::Closed;
        info!(parent: &self.span, ?reason, "session terminated");
        sent
    }

    pub async fn close(&mut self) -> Result<()> {
        self.terminate(ShutdownReason::Normal, "").await
    }

    // -- Private helpers --

    async fn run_windows(
        &mut self,
        request: &DapRequest,
        pipeline: &mut RecordPipeline,
        stop: &mut StopSignal,
    ) -> Result<u64> {
        let channels = self.select(&request.patterns, &request.default_network).await?;

        let mut count = 0;
        let mut window = request.window;
        'windows: loop {
            if let DapMode::Delay { delay } = request.mode
                && let Err(ClientError::Stopped) = stop.sleep(until_past(window.end, delay)).await
            {
                break;
            }
            info!(parent: &self.span, start = window.start, end = window.end, channels = channels.len(), "requesting window");

            for key in channels.keys() {
                if stop.is_stopped() {
                    break 'windows;
                }
                self.request_data(key, window).await?;
                while let Some(record) = self.next_record().await? {
                    pipeline.process(&record);
                    count += 1;
                }
            }

            match request.mode {
                DapMode::OnePass => break,
                DapMode::Delay { .. } => window = window.next(),
            }
        }
        Ok(count)
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let request =
            Request::connect_request(&credentials.username, &credentials.password, self.connection_time)?;
        self.connection.send_request(&request).await?;

        loop {
            let (header, body) = self.connection.recv_message().await?;
            match header.kind() {
                Some(MessageType::Ready) => break,
                Some(MessageType::Error) => {
                    let text = message_text(&body);
                    error!(parent: &self.span, %text, "login rejected");
                    return Err(ClientError::ServerError(text));
                }
                _ => debug!(parent: &self.span, msg_type = header.msg_type, "skipping message before READY"),
            }
        }

        self.state = DapState::Ready;
        info!(parent: &self.span, user = %credentials.username, "logged in");
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

    fn set_selected(&mut self, selected: ChannelDirectory) {
        self.continuity.rebuild(&selected);
        self.selected = selected;
    }

    fn accept(&mut self, decoded: std::result::Result<DataRecord, DecodeError>) -> Option<DataRecord> {
        let mut record = match decoded {
            Ok(record) => record,
            Err(DecodeError::FillerPacket) => {
                trace!(parent: &self.span, "filler packet");
                return None;
            }
            Err(e) => {
                self.dropped += 1;
                warn!(parent: &self.span, error = %e, "packet dropped");
                return None;
            }
        };

        if let Some(window) = self.window
            && !record.trim(f64::from(window.start), f64::from(window.end))
        {
            trace!(parent: &self.span, channel = %record.name(), time = record.time, "outside window");
            return None;
        }

        let x0_mismatch = self.continuity.x0_mismatch(&record);
        match self.continuity.observe(&record) {
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
        Some(record)
    }

    fn require_state_in(&self, allowed: &[DapState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let expected: &'static str = match allowed {
                [DapState::Ready] => "Ready",
                [DapState::Requesting, DapState::Receiving] => "Requesting|Receiving",
                _ => "valid state",
            };
            Err(ClientError::InvalidState {
                expected,
                actual: self.state.as_str(),
            })
        }
    }
}

/// Time left until the wall clock passes `end + delay`.
fn until_past(end: i32, delay: Duration) -> Duration {
    let target = Duration::from_secs(u64::try_from(end).unwrap_or_default()) + delay;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    target.saturating_sub(now)
}
