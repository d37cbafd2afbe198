//! Per-packet authentication: the auth trailer codec, the pluggable security
//! provider interface, and the sign/seal paths that protect REQUEST PDUs and
//! verify RESPONSE PDUs.
//!
//! The trailer sits at the end of a fragment: 8 fixed bytes followed by the
//! provider credentials. The header `auth_length` counts only the credential
//! bytes, never the 8 byte trailer header.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::packet::{
    get_auth_length, get_frag_length, put_u32_drep, set_auth_length, set_frag_length, PacketType,
    Pdu, RequestPdu, DREP_LITTLE_ENDIAN, DREP_OFFSET, GUID_SIZE, REQUEST_LENGTH,
};

/// Authentication service identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    None = 0,
    DcePrivate = 1,
    DcePublic = 2,
    GssNegotiate = 9,
    Ntlm = 10,
    GssKerberos = 16,
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthType::None),
            1 => Some(AuthType::DcePrivate),
            2 => Some(AuthType::DcePublic),
            9 => Some(AuthType::GssNegotiate),
            10 => Some(AuthType::Ntlm),
            16 => Some(AuthType::GssKerberos),
            68 => Some(AuthType::Netlogon),
            _ => None,
        }
    }
}

/// Protection levels, in increasing order of coverage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthLevel {
    None = 1,
    Connect = 2,
    Call = 3,
    Packet = 4,
    Integrity = 5,
    Privacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthLevel::None),
            2 => Some(AuthLevel::Connect),
            3 => Some(AuthLevel::Call),
            4 => Some(AuthLevel::Packet),
            5 => Some(AuthLevel::Integrity),
            6 => Some(AuthLevel::Privacy),
            _ => None,
        }
    }
}

/// The auth trailer carried at the tail of protected fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    pub auth_pad_length: u8,
    pub auth_context_id: u32,
    pub auth_value: Bytes,
}

impl AuthVerifier {
    /// Fixed bytes before the credentials.
    pub const HEADER_SIZE: usize = 8;

    pub fn new(auth_type: AuthType, auth_level: AuthLevel, auth_context_id: u32) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            auth_context_id,
            auth_value: Bytes::new(),
        }
    }

    /// Copy of this trailer carrying `token` as the credentials.
    pub fn with_token(&self, token: Bytes) -> Self {
        Self {
            auth_value: token,
            ..self.clone()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        buf.put_u8(self.auth_type as u8);
        buf.put_u8(self.auth_level as u8);
        buf.put_u8(self.auth_pad_length);
        buf.put_u8(0); // reserved
        put_u32_drep(buf, little_endian, self.auth_context_id);
        buf.put_slice(&self.auth_value);
    }

    /// Decodes a trailer from the tail of a fragment. `tail` must hold the
    /// 8 byte trailer header plus `auth_length` credential bytes.
    pub fn decode(tail: &[u8], auth_length: usize, little_endian: bool) -> Result<Self> {
        if tail.len() < Self::HEADER_SIZE + auth_length {
            return Err(RpcError::InvalidPdu("truncated auth trailer".into()));
        }
        let auth_type = AuthType::from_u8(tail[0])
            .ok_or_else(|| RpcError::InvalidPdu(format!("unknown auth type {}", tail[0])))?;
        let auth_level = AuthLevel::from_u8(tail[1])
            .ok_or_else(|| RpcError::InvalidPdu(format!("unknown auth level {}", tail[1])))?;
        let auth_pad_length = tail[2];
        let ctx = [tail[4], tail[5], tail[6], tail[7]];
        let auth_context_id = if little_endian {
            u32::from_le_bytes(ctx)
        } else {
            u32::from_be_bytes(ctx)
        };
        let auth_value =
            Bytes::copy_from_slice(&tail[Self::HEADER_SIZE..Self::HEADER_SIZE + auth_length]);
        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            auth_context_id,
            auth_value,
        })
    }
}

/// Zero padding needed to bring a stub up to a 16 byte multiple, so block
/// ciphers never see a partial block.
pub fn auth_padding(stub_length: usize) -> usize {
    (16 - (stub_length & 15)) & 15
}

const CONNECT_VERIFIER: [u8; 16] = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// The fixed credential blob used at connect level.
pub fn connect_verifier() -> Bytes {
    Bytes::from_static(&CONNECT_VERIFIER)
}

/// Connect-level check: a present verifier must be exactly the fixed blob.
pub fn check_connect_verifier(data: &[u8]) -> Result<()> {
    if data.len() != CONNECT_VERIFIER.len() {
        return Err(RpcError::AccessDenied);
    }
    if u32::from_le_bytes([data[0], data[1], data[2], data[3]]) != 1 {
        return Err(RpcError::AccessDenied);
    }
    Ok(())
}

/// Cryptographic backend for packet protection.
///
/// `whole` is the full PDU up to but excluding the credentials; `data` is the
/// stub-plus-padding range within it. Seal and unseal transform `data` in
/// place. A decryption or checksum failure should surface as
/// [`RpcError::AccessDenied`].
pub trait SecurityProvider: Send + Sync {
    /// Credential bytes produced by sign and seal.
    fn sig_size(&self) -> usize;

    fn sign_packet(&self, whole: &[u8], data: Range<usize>) -> Result<Bytes>;

    fn check_packet(&self, whole: &[u8], data: Range<usize>, signature: &[u8]) -> Result<()>;

    fn seal_packet(&self, whole: &mut [u8], data: Range<usize>) -> Result<Bytes>;

    fn unseal_packet(&self, whole: &mut [u8], data: Range<usize>, signature: &[u8]) -> Result<()>;

    /// Transport session key for callers that key application crypto off it.
    fn session_key(&self) -> Result<Bytes>;
}

/// Negotiated security context for a connection
pub struct SecurityState {
    pub auth_info: AuthVerifier,
    pub provider: Box<dyn SecurityProvider>,
}

impl SecurityState {
    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        provider: Box<dyn SecurityProvider>,
    ) -> Self {
        Self {
            auth_info: AuthVerifier::new(auth_type, auth_level, 0),
            provider,
        }
    }

    /// Replaces the credential token carried on the next bind-class PDU.
    pub fn set_token(&mut self, token: Bytes) {
        self.auth_info.auth_value = token;
    }
}

/// Pads, signs or seals an encoded PDU and appends the credentials.
///
/// `buf` is the output of an `encode_raw` and `stub_start` the offset where
/// its stub data begins. The fragment and auth lengths are repatched to cover
/// the padding and trailer before the provider runs, so signatures commit to
/// the final header.
pub fn wrap_pdu(state: &SecurityState, mut buf: BytesMut, stub_start: usize) -> Result<Bytes> {
    let level = state.auth_info.auth_level;
    if level == AuthLevel::None {
        return Ok(buf.freeze());
    }
    let little_endian = buf[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0;
    let pad = auth_padding(buf.len() - stub_start);
    buf.put_bytes(0, pad);

    let creds_len = match level {
        AuthLevel::Connect => CONNECT_VERIFIER.len(),
        AuthLevel::Integrity | AuthLevel::Privacy => state.provider.sig_size(),
        _ => return Err(RpcError::NegotiationFailed("unsupported auth level")),
    };

    let mut trailer = state.auth_info.with_token(Bytes::new());
    trailer.auth_pad_length = pad as u8;
    trailer.encode(&mut buf, little_endian);

    let stub_end = buf.len() - AuthVerifier::HEADER_SIZE;
    let frag_total = (buf.len() + creds_len) as u16;
    set_frag_length(&mut buf, frag_total);
    set_auth_length(&mut buf, creds_len as u16);

    let creds = match level {
        AuthLevel::Privacy => {
            let whole = buf.len();
            state.provider.seal_packet(&mut buf[..whole], stub_start..stub_end)?
        }
        AuthLevel::Integrity => state.provider.sign_packet(&buf, stub_start..stub_end)?,
        AuthLevel::Connect => connect_verifier(),
        _ => return Err(RpcError::NegotiationFailed("unsupported auth level")),
    };
    if creds.len() != creds_len {
        return Err(RpcError::InvalidPdu(format!(
            "security provider produced {} credential bytes, expected {}",
            creds.len(),
            creds_len
        )));
    }
    buf.put_slice(&creds);
    Ok(buf.freeze())
}

/// Protects one request fragment according to the connection security state.
pub(crate) fn wrap_request(state: Option<&SecurityState>, pdu: &RequestPdu) -> Result<Bytes> {
    let Some(state) = state else {
        return Ok(pdu.encode());
    };
    if state.auth_info.auth_level == AuthLevel::None {
        return Ok(pdu.encode());
    }
    let stub_start = REQUEST_LENGTH + if pdu.object.is_some() { GUID_SIZE } else { 0 };
    wrap_pdu(state, pdu.encode_raw(), stub_start)
}

/// Verifies and decodes one received fragment.
///
/// Only RESPONSE PDUs are protected; anything else decodes as-is. At connect
/// level a missing trailer is permitted, under integrity or privacy it is an
/// access denial. Decryption happens before the PDU body is parsed.
pub(crate) fn unwrap_reply(state: Option<&SecurityState>, raw: Bytes) -> Result<Pdu> {
    let Some(state) = state else {
        return Pdu::decode(&raw);
    };
    let level = state.auth_info.auth_level;
    let is_response = raw.len() > 2 && PacketType::from_u8(raw[2]) == Some(PacketType::Response);
    if !is_response || level == AuthLevel::None {
        return Pdu::decode(&raw);
    }

    let auth_length = get_auth_length(&raw) as usize;
    if auth_length == 0 {
        return match level {
            // the server may elect not to sign a connect-level reply
            AuthLevel::Connect => Pdu::decode(&raw),
            _ => Err(RpcError::AccessDenied),
        };
    }

    let frag_length = get_frag_length(&raw) as usize;
    let trailer_total = AuthVerifier::HEADER_SIZE + auth_length;
    if frag_length > raw.len() || REQUEST_LENGTH + trailer_total > frag_length {
        return Err(RpcError::AuthTrailerTooLong {
            auth_length,
            frag_length,
        });
    }
    let little_endian = raw[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0;
    let verifier = AuthVerifier::decode(
        &raw[frag_length - trailer_total..frag_length],
        auth_length,
        little_endian,
    )?;
    // whole runs up to the credentials, data is the stub plus auth padding
    let whole_end = frag_length - auth_length;
    let stub_end = frag_length - trailer_total;

    match level {
        AuthLevel::Privacy => {
            let mut buf = BytesMut::from(&raw[..]);
            state.provider.unseal_packet(
                &mut buf[..whole_end],
                REQUEST_LENGTH..stub_end,
                &verifier.auth_value,
            )?;
            Pdu::decode(&buf.freeze())
        }
        AuthLevel::Integrity => {
            state.provider.check_packet(
                &raw[..whole_end],
                REQUEST_LENGTH..stub_end,
                &verifier.auth_value,
            )?;
            Pdu::decode(&raw)
        }
        AuthLevel::Connect => {
            check_connect_verifier(&verifier.auth_value)?;
            Pdu::decode(&raw)
        }
        _ => Err(RpcError::NegotiationFailed("unsupported auth level")),
    }
}
