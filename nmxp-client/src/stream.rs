use futures_core::Stream;
use nmxp_rs_protocol::DataRecord;

use crate::error::ClientError;
use crate::pds::PdsClient;

/// Convert a subscribed [`PdsClient`] into a [`Stream`] of records.
///
/// The stream yields `Ok(DataRecord)` per decoded record and ends with `None`
/// when the server closes the connection or ends the subscription.
pub fn record_stream(mut client: PdsClient) -> impl Stream<Item = Result<DataRecord, ClientError>> {
    async_stream::try_stream! {
        while let Some(record) = client.next_record().await? {
            yield record;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, PdsRequest};
    use crate::mock::{NaqsConfig, NaqsServer, PACKET_TICKS, compressed_message, error_message};
    use crate::retry::StopSignal;
    use nmxp_rs_protocol::{ChannelDirectory, ChannelKey};
    use std::pin::pin;
    use tokio_stream::StreamExt;

    const T0: u64 = 1_700_000_000 * 10_000;

    fn directory() -> ChannelDirectory {
        ChannelDirectory::new(vec![ChannelKey::new(0x0007_0101, "KONO.BHE")])
    }

    async fn subscribe(messages: Vec<Vec<u8>>, close: bool) -> PdsClient {
        let mut config = NaqsConfig::new(directory(), messages);
        config.close_after_stream = close;
        let server = NaqsServer::start(config).await;
        PdsClient::connect_with_config(
            &server.addr(),
            PdsRequest::new("KONO.BHE"),
            ClientConfig::default(),
            StopSignal::never(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stream_yields_records() {
        let client = subscribe(
            vec![
                compressed_message(7, 1, 40, T0, 5, 1),
                compressed_message(7, 1, 41, T0 + PACKET_TICKS, 21, 1),
            ],
            true,
        )
        .await;

        let mut stream = pin!(record_stream(client));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence_number, Some(40));
        assert_eq!(first.network.as_deref(), Some("XX"));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.sequence_number, Some(41));

        // EOF → stream ends
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_on_eof() {
        let client = subscribe(vec![], true).await;
        let stream = pin!(record_stream(client));
        let collected: Vec<_> = stream.collect().await;
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn stream_surfaces_server_error() {
        let client = subscribe(
            vec![compressed_message(7, 1, 1, T0, 0, 0), error_message("shutting down")],
            false,
        )
        .await;

        let stream = pin!(client.into_stream());
        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected[0].is_ok());
        assert!(matches!(collected[1], Err(ClientError::ServerError(_))));
    }
}
