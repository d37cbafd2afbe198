//! Shared helpers for the integration suite: an in-memory peer that speaks
//! the server side of the protocol over a duplex stream, plus a
//! deterministic toy security provider.
//!
//! The duplex buffer is large enough to hold whole fragment trains, so tests
//! run both sides sequentially: queue the peer's reply, drive the client,
//! then inspect what went out on the wire.
#![allow(dead_code)]

use std::ops::Range;
use std::sync::Once;

use bytes::{Bytes, BytesMut};
use tokio::io::DuplexStream;

use ncacn::packet::{
    set_auth_length, set_frag_length, BindAckPdu, PacketFlags, RequestPdu, ResponsePdu,
    NDR_TRANSFER_SYNTAX, REQUEST_LENGTH,
};
use ncacn::security::wrap_pdu;
use ncacn::{
    AuthLevel, AuthType, AuthVerifier, ConnFlags, Pipe, Result, RpcError, SecurityProvider,
    SecurityState, StreamTransport, SyntaxId, Transport, Uuid,
};

/// The endpoint mapper interface, used as a stand-in for any bound interface.
pub const TEST_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid {
        data1: 0xe1af_8308,
        data2: 0x5d1f,
        data3: 0x11c9,
        data4: [0x91, 0xa4, 0x08, 0x00, 0x2b, 0x14, 0xa0, 0xfa],
    },
    3,
    0,
);

/// The remote management interface, for renegotiation tests.
pub const MGMT_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid {
        data1: 0xafa8_bd80,
        data2: 0x7d8a,
        data3: 0x11c9,
        data4: [0xbe, 0xf4, 0x08, 0x00, 0x2b, 0x10, 0x29, 0x89],
    },
    1,
    0,
);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// The far end of an in-memory connection. Drives the server side of the
/// protocol directly through a second [`StreamTransport`].
pub struct Peer {
    pub transport: StreamTransport<DuplexStream>,
}

pub fn pipe_pair() -> (Pipe, Peer) {
    pipe_pair_with_flags(ConnFlags::default())
}

pub fn pipe_pair_with_flags(flags: ConnFlags) -> (Pipe, Peer) {
    init_logging();
    let (client, server) = tokio::io::duplex(1 << 20);
    let pipe = Pipe::with_flags(Box::new(StreamTransport::new(client, "client")), flags);
    let peer = Peer {
        transport: StreamTransport::new(server, "peer"),
    };
    (pipe, peer)
}

impl Peer {
    pub async fn recv(&self) -> Bytes {
        self.transport.send_read().await.unwrap()
    }

    pub async fn send(&self, blob: Bytes) {
        self.transport.send_request(blob, true).await.unwrap();
    }

    /// Reads request fragments until LAST_FRAG and returns them decoded.
    pub async fn recv_request(&self) -> Vec<RequestPdu> {
        let mut parts = Vec::new();
        loop {
            let raw = self.recv().await;
            let (pdu, _) = RequestPdu::decode(&raw).unwrap();
            let last = pdu.header.packet_flags.is_last();
            parts.push(pdu);
            if last {
                return parts;
            }
        }
    }

    /// Queues an accepting BIND_ACK for the bind about to be sent.
    pub async fn ack_bind(&self, call_id: u32, max_xmit_frag: u16, max_recv_frag: u16) {
        let ack = BindAckPdu::new(call_id, max_xmit_frag, max_recv_frag, NDR_TRANSFER_SYNTAX);
        self.send(ack.encode()).await;
    }

    /// Single-fragment unprotected response.
    pub async fn respond(&self, call_id: u32, stub: Bytes) {
        self.send(ResponsePdu::new(call_id, 0, stub).encode()).await;
    }

    /// Response split over an explicit fragment train.
    pub async fn respond_fragments(&self, call_id: u32, chunks: &[&[u8]]) {
        for (i, chunk) in chunks.iter().enumerate() {
            let mut resp = ResponsePdu::new(call_id, 0, Bytes::copy_from_slice(chunk));
            let mut flags = PacketFlags::new(0);
            if i == 0 {
                flags.set(PacketFlags::FIRST_FRAG);
            }
            if i == chunks.len() - 1 {
                flags.set(PacketFlags::LAST_FRAG);
            }
            resp.header.packet_flags = flags;
            self.send(resp.encode()).await;
        }
    }

    /// Signed or sealed single-fragment response.
    pub async fn respond_protected(&self, state: &SecurityState, call_id: u32, stub: Bytes) {
        let resp = ResponsePdu::new(call_id, 0, stub);
        let blob = wrap_pdu(state, resp.encode_raw(), REQUEST_LENGTH).unwrap();
        self.send(blob).await;
    }

    /// Response carrying an arbitrary connect-level credential blob.
    pub async fn respond_with_verifier(&self, call_id: u32, stub: Bytes, creds: &[u8]) {
        let resp = ResponsePdu::new(call_id, 0, stub);
        let mut buf = resp.encode_raw();
        let trailer = AuthVerifier {
            auth_type: AuthType::Ntlm,
            auth_level: AuthLevel::Connect,
            auth_pad_length: 0,
            auth_context_id: 0,
            auth_value: Bytes::copy_from_slice(creds),
        };
        trailer.encode(&mut buf, true);
        let total = buf.len() as u16;
        set_frag_length(&mut buf, total);
        set_auth_length(&mut buf, creds.len() as u16);
        self.send(buf.freeze()).await;
    }
}

fn checksum(whole: &[u8]) -> [u8; 8] {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in whole {
        acc = acc.wrapping_mul(31).wrapping_add(b as u64);
    }
    acc.to_le_bytes()
}

/// XOR cipher with a fold checksum: enough structure to prove the engine
/// pads, backpatches and verifies in the right order.
pub struct XorProvider {
    pub key: u8,
}

impl SecurityProvider for XorProvider {
    fn sig_size(&self) -> usize {
        8
    }

    fn sign_packet(&self, whole: &[u8], _data: Range<usize>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&checksum(whole)))
    }

    fn check_packet(&self, whole: &[u8], _data: Range<usize>, signature: &[u8]) -> Result<()> {
        if signature == checksum(whole) {
            Ok(())
        } else {
            Err(RpcError::AccessDenied)
        }
    }

    fn seal_packet(&self, whole: &mut [u8], data: Range<usize>) -> Result<Bytes> {
        for b in &mut whole[data] {
            *b ^= self.key;
        }
        Ok(Bytes::copy_from_slice(&checksum(whole)))
    }

    fn unseal_packet(&self, whole: &mut [u8], data: Range<usize>, signature: &[u8]) -> Result<()> {
        if signature != checksum(whole) {
            return Err(RpcError::AccessDenied);
        }
        for b in &mut whole[data] {
            *b ^= self.key;
        }
        Ok(())
    }

    fn session_key(&self) -> Result<Bytes> {
        Ok(Bytes::from_static(b"0123456789abcdef"))
    }
}

/// Fresh security state at the protection level the flags imply.
pub fn security_state(flags: ConnFlags, key: u8) -> SecurityState {
    SecurityState::new(
        AuthType::Ntlm,
        flags.auth_level(),
        Box::new(XorProvider { key }),
    )
}

/// Installs matching security state on the pipe and returns the peer's copy.
pub fn install_security(pipe: &Pipe, key: u8) -> SecurityState {
    let flags = pipe.connection().flags();
    pipe.connection().set_security(security_state(flags, key));
    security_state(flags, key)
}

/// Builds a protected response and hands back the mutable wire bytes, for
/// tests that tamper with them before sending.
pub fn protected_response(state: &SecurityState, call_id: u32, stub: Bytes) -> BytesMut {
    let resp = ResponsePdu::new(call_id, 0, stub);
    let blob = wrap_pdu(state, resp.encode_raw(), REQUEST_LENGTH).unwrap();
    BytesMut::from(&blob[..])
}
