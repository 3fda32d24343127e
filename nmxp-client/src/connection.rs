use std::time::Duration;

use nmxp_rs_protocol::message::{HEADER_LEN, decode_header, encode_header};
use nmxp_rs_protocol::{MessageHeader, MessageType, ProtocolError, Request};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};

/// Largest body the client will allocate for. Channel lists of a few
/// thousand entries stay far below this.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

/// Framed NMXP transport over one TCP stream.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    read_timeout: Duration,
}

impl Connection {
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        debug!(addr, "TCP connecting");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))?
            .map_err(|source| ClientError::Connect {
                addr: addr.to_owned(),
                source,
            })?;

        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, read_timeout))
    }

    pub(crate) fn from_stream(stream: TcpStream, read_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_timeout,
        }
    }

    /// Write all of `data`, or fail with `ShortTransfer` if the peer stops
    /// accepting bytes part way.
    pub async fn send_ctrl(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let n = self.writer.write(&data[sent..]).await?;
            if n == 0 {
                return Err(ClientError::ShortTransfer {
                    expected: data.len(),
                    actual: sent,
                });
            }
            sent += n;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Fill `buf` completely.
    ///
    /// EOF before the first byte is `Disconnected`; EOF after it is
    /// `ShortTransfer`. The whole transfer is bounded by the read timeout.
    pub async fn recv_ctrl(&mut self, buf: &mut [u8]) -> Result<()> {
        let expected = buf.len();
        let reader = &mut self.reader;
        let fill = async move {
            let mut filled = 0;
            while filled < expected {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    return Err(if filled == 0 {
                        ClientError::Disconnected
                    } else {
                        ClientError::ShortTransfer {
                            expected,
                            actual: filled,
                        }
                    });
                }
                filled += n;
            }
            Ok::<(), ClientError>(())
        };

        tokio::time::timeout(self.read_timeout, fill)
            .await
            .map_err(|_| {
                warn!(timeout = ?self.read_timeout, "read timeout");
                ClientError::Timeout(self.read_timeout)
            })?
    }

    pub async fn send_header(&mut self, header: MessageHeader) -> Result<()> {
        self.send_ctrl(&encode_header(header)).await
    }

    pub async fn recv_header(&mut self) -> Result<MessageHeader> {
        let mut buf = [0u8; HEADER_LEN];
        self.recv_ctrl(&mut buf).await?;
        Ok(decode_header(&buf)?)
    }

    /// Send a header and, when non-empty, the body, as one write.
    pub async fn send_message(&mut self, msg_type: MessageType, body: &[u8]) -> Result<()> {
        trace!(?msg_type, len = body.len(), "sending");
        let header = MessageHeader::new(msg_type, body.len() as u32);
        let mut data = Vec::with_capacity(HEADER_LEN + body.len());
        data.extend_from_slice(&encode_header(header));
        data.extend_from_slice(body);
        self.send_ctrl(&data).await
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        self.send_message(request.msg_type(), &request.to_body()).await
    }

    /// Read one message. A zero length means no body bytes follow.
    pub async fn recv_message(&mut self) -> Result<(MessageHeader, Vec<u8>)> {
        let header = self.recv_header().await?;
        if header.length > MAX_BODY_LEN {
            return Err(ProtocolError::MessageTooLarge {
                length: header.length,
                max: MAX_BODY_LEN,
            }
            .into());
        }

        let mut body = vec![0u8; header.length as usize];
        if !body.is_empty() {
            self.recv_ctrl(&mut body).await?;
        }
        trace!(msg_type = header.msg_type, len = body.len(), "received");
        Ok((header, body))
    }

    /// Wait up to `wait` for the next byte to arrive without consuming it.
    ///
    /// Returns `false` if nothing arrived in time. EOF counts as readable so
    /// the following receive reports it. Cancel-safe: bytes already buffered
    /// stay in the reader.
    pub async fn wait_readable(&mut self, wait: Duration) -> Result<bool> {
        match tokio::time::timeout(wait, self.reader.fill_buf()).await {
            Ok(filled) => {
                filled?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Read a big-endian i32 that is not wrapped in a message (the DAP
    /// connection-time token).
    pub async fn recv_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.recv_ctrl(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
