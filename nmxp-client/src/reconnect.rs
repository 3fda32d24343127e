use futures_core::Stream;
use nmxp_rs_protocol::{DataRecord, ShutdownReason};
use tracing::{Span, debug, info, info_span, warn};

use crate::config::{ClientConfig, PdsRequest};
use crate::connection::Connection;
use crate::continuity::ContinuityTracker;
use crate::error::{ClientError, Result};
use crate::pds::PdsClient;
use crate::retry::{StopSignal, with_backoff};
use crate::sink::RecordPipeline;

/// A wrapper around [`PdsClient`] that reconnects when the connection is
/// lost.
///
/// On EOF or a connection-fatal error (see
/// [`ClientError::is_connection_fatal`]) it opens a new connection with the
/// configured backoff, repeats the handshake and subscribes again with the
/// same request. Per-channel continuity state survives the reconnect, so the
/// first record after it is checked against the last record before it.
///
/// Server ERROR messages, configuration errors and decode errors are never
/// retried. Firing the stop signal ends the stream cleanly with `Ok(None)`.
pub struct ReconnectingPdsClient {
    addr: String,
    request: PdsRequest,
    config: ClientConfig,
    stop: StopSignal,
    client: Option<PdsClient>,
    reconnects: u32,
    span: Span,
}

impl ReconnectingPdsClient {
    pub async fn connect(addr: &str, request: PdsRequest) -> Result<Self> {
        Self::connect_with_config(addr, request, ClientConfig::default(), StopSignal::never()).await
    }

    pub async fn connect_with_config(
        addr: &str,
        request: PdsRequest,
        config: ClientConfig,
        stop: StopSignal,
    ) -> Result<Self> {
        let client =
            PdsClient::connect_with_config(addr, request.clone(), config.clone(), stop.clone()).await?;
        Ok(Self {
            addr: addr.to_owned(),
            request,
            config,
            stop,
            client: Some(client),
            reconnects: 0,
            span: info_span!("pds_reconnect", addr),
        })
    }

    /// The current connection, if one is open.
    pub fn client(&self) -> Option<&PdsClient> {
        self.client.as_ref()
    }

    pub fn continuity(&self) -> Option<&ContinuityTracker> {
        self.client.as_ref().map(PdsClient::continuity)
    }

    /// Successful reconnects so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Read the next record, reconnecting as needed.
    ///
    /// Returns `Ok(None)` once the stop signal fires, or `Err` on errors that
    /// a new connection would not fix, including
    /// [`ClientError::ReconnectFailed`] when the attempt limit is reached.
    pub async fn next_record(&mut self) -> Result<Option<DataRecord>> {
        loop {
            if self.stop.is_stopped() {
                self.close().await;
                return Ok(None);
            }

            let mut stop = self.stop.clone();
            let result = match self.client.as_mut() {
                Some(client) => tokio::select! {
                    r = client.next_record() => r,
                    _ = stop.stopped() => {
                        self.close().await;
                        return Ok(None);
                    }
                },
                None => Err(ClientError::Disconnected),
            };

            match result {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => debug!(parent: &self.span, "stream ended, reconnecting"),
                Err(e) if e.is_connection_fatal() => {
                    warn!(parent: &self.span, error = %e, "connection lost, reconnecting")
                }
                Err(e) => return Err(e),
            }

            match self.reconnect().await {
                Ok(()) => continue,
                Err(ClientError::Stopped) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume this client and return a [`Stream`] of records with
    /// auto-reconnect.
    pub fn into_stream(self) -> impl Stream<Item = Result<DataRecord>> {
        async_stream::try_stream! {
            let mut this = self;
            loop {
                match this.next_record().await {
                    Ok(Some(record)) => yield record,
                    Ok(None) => break,
                    Err(ClientError::ReconnectFailed { .. }) => break,
                    Err(e) => Err(e)?,
                }
            }
        }
    }

    /// Feed every record to `pipeline` until stopped. Returns the number of
    /// records processed.
    pub async fn run(&mut self, pipeline: &mut RecordPipeline) -> Result<u64> {
        let mut count = 0;
        while let Some(record) = self.next_record().await? {
            pipeline.process(&record);
            count += 1;
        }
        Ok(count)
    }

    /// Terminate the current subscription, if any.
    pub async fn terminate(&mut self, reason: ShutdownReason, message: &str) -> Result<()> {
        match self.client.as_mut() {
            Some(client) => client.terminate(reason, message).await,
            None => Ok(()),
        }
    }

    // -- Private helpers --

    async fn close(&mut self) {
        if let Err(e) = self.terminate(ShutdownReason::Normal, "stopped").await {
            debug!(parent: &self.span, error = %e, "terminate on stop failed");
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let tracker = self.client.take().map(PdsClient::into_continuity);

        let mut stop = self.stop.clone();
        let (addr, config, request, span) = (&self.addr, &self.config, &self.request, &self.span);
        let client = with_backoff(&config.backoff, &mut stop, |attempt| {
            info!(parent: span, attempt, "reconnecting");
            let tracker = tracker.clone();
            async move {
                let connection = Connection::connect(addr, config.connect_timeout, config.read_timeout).await?;
                PdsClient::handshake(connection, request.clone(), info_span!("pds", addr = %addr), tracker).await
            }
        })
        .await?;

        self.reconnects += 1;
        info!(parent: &self.span, reconnects = self.reconnects, "reconnected");
        self.client = Some(client);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backoff;
    use crate::mock::{NaqsConfig, NaqsServer, PACKET_TICKS, compressed_message, error_message};
    use crate::retry::StopHandle;
    use nmxp_rs_protocol::{ChannelDirectory, ChannelKey, Request};
    use std::pin::pin;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    const KEY: u32 = 0x0003_0100;
    const T0: u64 = 1_700_000_000 * 10_000;

    fn directory() -> ChannelDirectory {
        ChannelDirectory::new(vec![ChannelKey::new(KEY, "PFO.HHZ")])
    }

    fn fast_config(max_attempts: u32) -> ClientConfig {
        ClientConfig {
            read_timeout: Duration::from_secs(5),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                max_attempts,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn packet(seq: u32, x0: i32) -> Vec<u8> {
        compressed_message(3, 0, seq, T0 + u64::from(seq) * PACKET_TICKS, x0, 1)
    }

    async fn two_connection_server() -> NaqsServer {
        let mut config = NaqsConfig::new(directory(), vec![]);
        config.connection_messages = vec![vec![packet(0, 0)], vec![packet(1, 16)]];
        config.close_after_stream = true;
        config.max_connections = 2;
        NaqsServer::start(config).await
    }

    #[tokio::test]
    async fn reconnect_on_disconnect() {
        let server = two_connection_server().await;
        let mut client = ReconnectingPdsClient::connect_with_config(
            &server.addr(),
            PdsRequest::new("PFO.HHZ"),
            fast_config(2),
            StopSignal::never(),
        )
        .await
        .unwrap();

        let first = client.next_record().await.unwrap().unwrap();
        assert_eq!(first.sequence_number, Some(0));

        // connection closes → reconnect → record from the second connection
        let second = client.next_record().await.unwrap().unwrap();
        assert_eq!(second.sequence_number, Some(1));
        assert_eq!(client.reconnects(), 1);

        // continuity survived the reconnect
        let state = client.continuity().unwrap().state(KEY).unwrap();
        assert_eq!((state.gaps, state.overlaps, state.x0_mismatches), (0, 0, 0));

        // both connections subscribed with the same request
        let again = server.captured().wait_for(1, |r| r.len() >= 2).await;
        assert_eq!(again, server.captured().connection(0)[..2]);

        // server is gone now: attempts run out
        let err = client.next_record().await.unwrap_err();
        assert!(matches!(err, ClientError::ReconnectFailed { attempts: 2 }));
    }

    #[tokio::test]
    async fn stream_ends_when_reconnect_fails() {
        let server = two_connection_server().await;
        let client = ReconnectingPdsClient::connect_with_config(
            &server.addr(),
            PdsRequest::new("PFO.HHZ"),
            fast_config(1),
            StopSignal::never(),
        )
        .await
        .unwrap();

        let stream = pin!(client.into_stream());
        let records: Vec<_> = stream.collect().await;
        let seqs: Vec<_> = records
            .iter()
            .map(|r| r.as_ref().unwrap().sequence_number.unwrap())
            .collect();
        assert_eq!(seqs, [0, 1]);
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let mut config = NaqsConfig::new(directory(), vec![error_message("not authorized")]);
        config.max_connections = 2;
        let server = NaqsServer::start(config).await;
        let mut client = ReconnectingPdsClient::connect_with_config(
            &server.addr(),
            PdsRequest::new("PFO.HHZ"),
            fast_config(0),
            StopSignal::never(),
        )
        .await
        .unwrap();

        assert!(matches!(client.next_record().await, Err(ClientError::ServerError(_))));
        assert_eq!(client.reconnects(), 0);
        assert_eq!(server.captured().connections(), 1);
    }

    #[tokio::test]
    async fn stop_ends_cleanly() {
        // server keeps the subscription open and sends nothing
        let server = NaqsServer::start(NaqsConfig::new(directory(), vec![])).await;
        let handle = StopHandle::new();
        let mut client = ReconnectingPdsClient::connect_with_config(
            &server.addr(),
            PdsRequest::new("PFO.HHZ"),
            fast_config(0),
            handle.signal(),
        )
        .await
        .unwrap();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });

        assert!(client.next_record().await.unwrap().is_none());
        stopper.await.unwrap();

        let requests = server.captured().wait_for(0, |r| r.len() >= 3).await;
        assert!(matches!(
            requests.last(),
            Some(Request::TerminateSubscription { reason: ShutdownReason::Normal, .. })
        ));
    }
}
