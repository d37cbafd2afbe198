//! Byte transports beneath the RPC engine.
//!
//! A [`Transport`] moves whole PDU fragments. [`StreamTransport`] adapts any
//! async byte stream by framing on the fragment length field of the common
//! header; reassembly of multi-fragment calls happens above, in the request
//! engine.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{Result, RpcError};
use crate::packet::{get_frag_length, PduHeader, FRAG_MAX_SIZE};

/// Upper bound on a single fragment before the peer is considered hostile.
pub const DEFAULT_MAX_PDU_SIZE: usize = 4 * 1024 * 1024;

/// A connection-oriented fragment carrier.
///
/// Implementations must be safe to share: sends may run concurrently with a
/// receive, and the receive side must tolerate being cancelled between
/// fragments without losing buffered bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one encoded fragment. `last_frag` marks the final fragment of a
    /// PDU for carriers that batch or need to flag message boundaries.
    async fn send_request(&self, blob: Bytes, last_frag: bool) -> Result<()>;

    /// Receives the next whole fragment from the peer.
    async fn send_read(&self) -> Result<Bytes>;

    /// Marks the transport dead. Subsequent operations fail with
    /// [`RpcError::ConnectionClosed`]; the underlying stream closes on drop.
    fn shutdown(&self);

    /// Human-readable peer name for diagnostics.
    fn peer_name(&self) -> String;
}

struct FrameReader<S> {
    io: ReadHalf<S>,
    buf: BytesMut,
}

/// Frames an async byte stream into PDUs using the header fragment length.
pub struct StreamTransport<S> {
    reader: Mutex<FrameReader<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
    peer: String,
    max_pdu_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamTransport<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (io, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FrameReader {
                io,
                buf: BytesMut::with_capacity(FRAG_MAX_SIZE as usize),
            }),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            peer: peer.into(),
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }

    pub fn with_max_pdu_size(mut self, max_pdu_size: usize) -> Self {
        self.max_pdu_size = max_pdu_size;
        self
    }

    /// Reads until the buffer holds one complete fragment.
    ///
    /// Partial frames stay in the buffer between calls, so a caller that is
    /// cancelled mid-read resumes where it left off.
    async fn read_frame(&self) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let FrameReader { io, buf } = &mut *guard;
        loop {
            if buf.len() >= PduHeader::SIZE {
                let frag_length = get_frag_length(buf) as usize;
                if frag_length < PduHeader::SIZE {
                    return Err(RpcError::InvalidPdu(format!(
                        "fragment length {frag_length} below header size"
                    )));
                }
                if frag_length > self.max_pdu_size {
                    return Err(RpcError::PduTooLarge {
                        size: frag_length,
                        max: self.max_pdu_size,
                    });
                }
                if buf.len() >= frag_length {
                    return Ok(buf.split_to(frag_length).freeze());
                }
            }
            let n = io.read_buf(buf).await?;
            if n == 0 {
                return Err(RpcError::ConnectionClosed);
            }
        }
    }

    async fn write_frame(&self, blob: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&blob).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> Transport for StreamTransport<S> {
    async fn send_request(&self, blob: Bytes, _last_frag: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        trace!(peer = %self.peer, len = blob.len(), "transport write");
        self.write_frame(blob).await
    }

    async fn send_read(&self) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let frame = self.read_frame().await?;
        trace!(peer = %self.peer, len = frame.len(), "transport read");
        Ok(frame)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn peer_name(&self) -> String {
        self.peer.clone()
    }
}

/// Connects a TCP transport (the `ncacn_ip_tcp` carrier).
pub async fn connect_tcp(host: &str, port: u16) -> Result<StreamTransport<TcpStream>> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(StreamTransport::new(stream, format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FaultPdu, ResponsePdu};

    #[tokio::test]
    async fn test_read_across_partial_writes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(client, "test");

        let pdu = ResponsePdu::new(1, 0, Bytes::from(vec![0x42; 50])).encode();
        let (head, tail) = pdu.split_at(20);
        server.write_all(head).await.unwrap();

        let read = tokio::spawn(async move { transport.send_read().await.unwrap() });
        tokio::task::yield_now().await;
        server.write_all(tail).await.unwrap();

        let frame = read.await.unwrap();
        assert_eq!(frame, pdu);
    }

    #[tokio::test]
    async fn test_two_pdus_in_one_write() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = StreamTransport::new(client, "test");

        let first = ResponsePdu::new(1, 0, Bytes::from_static(b"one")).encode();
        let second = FaultPdu::new(2, crate::error::FAULT_OTHER).encode();
        let mut combined = BytesMut::new();
        combined.extend_from_slice(&first);
        combined.extend_from_slice(&second);
        server.write_all(&combined).await.unwrap();

        assert_eq!(transport.send_read().await.unwrap(), first);
        assert_eq!(transport.send_read().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_oversize_fragment_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::<tokio::io::DuplexStream>::new(client, "test")
            .with_max_pdu_size(64);

        let pdu = ResponsePdu::new(1, 0, Bytes::from(vec![0; 100])).encode();
        server.write_all(&pdu).await.unwrap();

        match transport.send_read().await {
            Err(RpcError::PduTooLarge { size, max: 64 }) => assert_eq!(size, pdu.len()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runt_fragment_length_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(client, "test");

        // little-endian drep, frag_length = 4
        let raw = [5u8, 0, 2, 3, 0x10, 0, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0];
        server.write_all(&raw).await.unwrap();

        match transport.send_read().await {
            Err(RpcError::InvalidPdu(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(client, "test");

        let pdu = ResponsePdu::new(1, 0, Bytes::from(vec![0; 40])).encode();
        server.write_all(&pdu[..30]).await.unwrap();
        drop(server);

        match transport.send_read().await {
            Err(RpcError::ConnectionClosed) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_fast() {
        let (client, _server) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(client, "box17");
        assert_eq!(transport.peer_name(), "box17");

        transport.shutdown();
        match transport.send_read().await {
            Err(RpcError::ConnectionClosed) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match transport
            .send_request(Bytes::from_static(b"data"), true)
            .await
        {
            Err(RpcError::ConnectionClosed) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
