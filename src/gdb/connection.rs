//! Transport side of an RSP session: acknowledgements, retransmission and
//! no-ack mode on top of [`PacketDecoder`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::packet::{encode_packet, Frame, PacketDecoder};
use super::response::Response;

const READ_CHUNK: usize = 4096;

/// Inbound traffic that needs handling by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Interrupt,
    Packet(Vec<u8>),
}

pub struct GdbConnection<S> {
    stream: S,
    decoder: PacketDecoder,
    ack_mode: bool,
    /// Last packet sent, kept for retransmission while acks are on
    last_sent: Option<Vec<u8>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> GdbConnection<S> {
    pub fn new(stream: S, max_packet_size: usize) -> Self {
        Self {
            stream,
            decoder: PacketDecoder::new(max_packet_size),
            ack_mode: true,
            last_sent: None,
        }
    }

    pub fn ack_mode(&self) -> bool {
        self.ack_mode
    }

    /// Read whatever the client sent next. Empty means the client closed the connection.
    ///
    /// Cancel safe: nothing is consumed unless the read completes.
    pub async fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; READ_CHUNK];
        let read = self.stream.read(&mut buffer).await?;
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Decode received bytes, acknowledging packets and answering NACKs
    pub async fn process(&mut self, data: &[u8]) -> io::Result<Vec<Incoming>> {
        let mut incoming = Vec::new();
        for frame in self.decoder.feed(data) {
            match frame {
                Frame::Packet(payload) => {
                    if self.ack_mode {
                        self.write_raw(b"+").await?;
                    }
                    incoming.push(Incoming::Packet(payload));
                }
                Frame::Invalid(e) => {
                    warn!("Discarding malformed packet: {}", e);
                    if self.ack_mode {
                        self.write_raw(b"-").await?;
                    }
                }
                Frame::Interrupt => incoming.push(Incoming::Interrupt),
                Frame::Nack => {
                    if let Some(packet) = self.last_sent.clone() {
                        debug!("Client NACKed, retransmitting last packet");
                        self.write_raw(&packet).await?;
                    }
                }
                Frame::Ack => {}
            }
        }
        Ok(incoming)
    }

    pub async fn write_response(&mut self, response: &Response) -> io::Result<()> {
        let payload = response.to_payload();
        trace!("--> ${}", payload);
        let packet = encode_packet(payload.as_bytes());
        self.write_raw(&packet).await?;
        self.last_sent = self.ack_mode.then_some(packet);
        Ok(())
    }

    /// Stop sending and expecting acknowledgements
    pub fn disable_acks(&mut self) {
        debug!("Acknowledgement mode disabled");
        self.ack_mode = false;
        self.last_sent = None;
    }

    async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_valid_packet_is_acked() {
        let stream = Builder::new().read(b"$m0,4#fd").write(b"+").build();
        let mut connection = GdbConnection::new(stream, 4096);
        let data = connection.read_chunk().await.unwrap();
        let incoming = connection.process(&data).await.unwrap();
        assert_eq!(incoming, vec![Incoming::Packet(b"m0,4".to_vec())]);
    }

    #[tokio::test]
    async fn test_bad_checksum_is_nacked_and_dropped() {
        let stream = Builder::new().read(b"$m0,4#00").write(b"-").build();
        let mut connection = GdbConnection::new(stream, 4096);
        let data = connection.read_chunk().await.unwrap();
        assert!(connection.process(&data).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_triggers_retransmission() {
        let stream = Builder::new()
            .write(b"$OK#9a")
            .read(b"-")
            .write(b"$OK#9a")
            .build();
        let mut connection = GdbConnection::new(stream, 4096);
        connection.write_response(&Response::Ok).await.unwrap();
        let data = connection.read_chunk().await.unwrap();
        assert!(connection.process(&data).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_ack_mode() {
        let stream = Builder::new()
            .write(b"$OK#9a")
            .read(b"$g#67")
            .build();
        let mut connection = GdbConnection::new(stream, 4096);
        connection.write_response(&Response::Ok).await.unwrap();
        connection.disable_acks();
        assert!(!connection.ack_mode());

        let data = connection.read_chunk().await.unwrap();
        let incoming = connection.process(&data).await.unwrap();
        assert_eq!(incoming, vec![Incoming::Packet(b"g".to_vec())]);
    }

    #[tokio::test]
    async fn test_interrupt_byte() {
        let stream = Builder::new().read(b"\x03").build();
        let mut connection = GdbConnection::new(stream, 4096);
        let data = connection.read_chunk().await.unwrap();
        assert_eq!(connection.process(&data).await.unwrap(), vec![Incoming::Interrupt]);
    }
}
