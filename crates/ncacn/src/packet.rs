//! Connection-oriented DCE/RPC PDU encoding and decoding.
//!
//! Every PDU starts with a 16 byte common header. Multi-byte fields after the
//! data representation label follow the endianness it declares, so decoding
//! always reads the label before the fragment length, auth length and call id.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::security::AuthVerifier;

/// RPC protocol version carried in every header.
pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// Default fragment size offered to servers before negotiation.
pub const FRAG_MAX_SIZE: u16 = 5840;

/// Size of the common header plus the request-specific fields.
pub const REQUEST_LENGTH: usize = 24;

/// Worst-case space reserved for an auth trailer when chunking stub data.
pub const MAX_SIGN_SIZE: usize = 64;

/// Wire size of an object UUID.
pub const GUID_SIZE: usize = 16;

/// Byte offsets of header fields used for in-place patching.
pub const DREP_OFFSET: usize = 4;
pub const FRAG_LEN_OFFSET: usize = 8;
pub const AUTH_LEN_OFFSET: usize = 10;
pub const CALL_ID_OFFSET: usize = 12;

/// Integer representation bit of the first data representation byte.
pub const DREP_LITTLE_ENDIAN: u8 = 0x10;

/// BIND_NAK reject reason: no proposed transfer syntax was acceptable.
pub const BIND_NAK_REASON_ASYNTAX: u16 = 1;

/// Presentation context negotiation results.
pub const CTX_ACCEPTANCE: u16 = 0;
pub const CTX_USER_REJECTION: u16 = 1;
pub const CTX_PROVIDER_REJECTION: u16 = 2;

/// DCE/RPC packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    Auth3 = 16,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Request),
            2 => Some(PacketType::Response),
            3 => Some(PacketType::Fault),
            11 => Some(PacketType::Bind),
            12 => Some(PacketType::BindAck),
            13 => Some(PacketType::BindNak),
            14 => Some(PacketType::AlterContext),
            15 => Some(PacketType::AlterContextResp),
            16 => Some(PacketType::Auth3),
            _ => None,
        }
    }
}

/// Per-fragment flags from the common header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const FIRST_FRAG: u8 = 0x01;
    pub const LAST_FRAG: u8 = 0x02;
    pub const PENDING_CANCEL: u8 = 0x04;
    pub const CONC_MPX: u8 = 0x10;
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    pub const MAYBE: u8 = 0x40;
    pub const OBJECT_UUID: u8 = 0x80;

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// Single-fragment PDU: both FIRST_FRAG and LAST_FRAG.
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    pub fn is_first(&self) -> bool {
        self.contains(Self::FIRST_FRAG)
    }

    pub fn is_last(&self) -> bool {
        self.contains(Self::LAST_FRAG)
    }
}

/// NDR data representation label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation(pub [u8; 4]);

impl DataRepresentation {
    pub fn little_endian() -> Self {
        Self([DREP_LITTLE_ENDIAN, 0, 0, 0])
    }

    pub fn big_endian() -> Self {
        Self([0, 0, 0, 0])
    }

    pub fn is_little_endian(&self) -> bool {
        self.0[0] & DREP_LITTLE_ENDIAN != 0
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::little_endian()
    }
}

/// A UUID in Windows GUID field layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Uuid {
    pub const fn nil() -> Self {
        Self {
            data1: 0,
            data2: 0,
            data3: 0,
            data4: [0; 8],
        }
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::nil()
    }

    /// Parses the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
    pub fn parse(s: &str) -> Option<Self> {
        // the group slices below are byte-indexed
        if !s.is_ascii() {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 {
            return None;
        }
        if parts[0].len() != 8
            || parts[1].len() != 4
            || parts[2].len() != 4
            || parts[3].len() != 4
            || parts[4].len() != 12
        {
            return None;
        }
        let data1 = u32::from_str_radix(parts[0], 16).ok()?;
        let data2 = u16::from_str_radix(parts[1], 16).ok()?;
        let data3 = u16::from_str_radix(parts[2], 16).ok()?;
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().take(2).enumerate() {
            *byte = u8::from_str_radix(&parts[3][i * 2..i * 2 + 2], 16).ok()?;
        }
        for (i, byte) in data4.iter_mut().skip(2).enumerate() {
            *byte = u8::from_str_radix(&parts[4][i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        if little_endian {
            buf.put_u32_le(self.data1);
            buf.put_u16_le(self.data2);
            buf.put_u16_le(self.data3);
        } else {
            buf.put_u32(self.data1);
            buf.put_u16(self.data2);
            buf.put_u16(self.data3);
        }
        buf.put_slice(&self.data4);
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        if cursor.remaining() < GUID_SIZE {
            return Err(RpcError::InvalidPdu("truncated UUID".into()));
        }
        let data1 = if little_endian {
            cursor.get_u32_le()
        } else {
            cursor.get_u32()
        };
        let (data2, data3) = if little_endian {
            (cursor.get_u16_le(), cursor.get_u16_le())
        } else {
            (cursor.get_u16(), cursor.get_u16())
        };
        let mut data4 = [0u8; 8];
        cursor.copy_to_slice(&mut data4);
        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

/// An interface or transfer syntax identifier: UUID plus packed version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: major as u32 | ((minor as u32) << 16),
        }
    }

    pub const fn nil() -> Self {
        Self {
            uuid: Uuid::nil(),
            version: 0,
        }
    }

    pub fn major(&self) -> u16 {
        (self.version & 0xffff) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        self.uuid.encode(buf, little_endian);
        if little_endian {
            buf.put_u32_le(self.version);
        } else {
            buf.put_u32(self.version);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Self> {
        let uuid = Uuid::decode(cursor, little_endian)?;
        if cursor.remaining() < 4 {
            return Err(RpcError::InvalidPdu("truncated syntax version".into()));
        }
        let version = if little_endian {
            cursor.get_u32_le()
        } else {
            cursor.get_u32()
        };
        Ok(Self { uuid, version })
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.uuid, self.major(), self.minor())
    }
}

/// The standard NDR transfer syntax, version 2.0.
pub const NDR_TRANSFER_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid {
        data1: 0x8a88_5d04,
        data2: 0x1ceb,
        data3: 0x11c9,
        data4: [0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
    },
    2,
    0,
);

/// Common 16 byte PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub rpc_vers: u8,
    pub rpc_vers_minor: u8,
    pub ptype: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: DataRepresentation,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(ptype: PacketType, call_id: u32) -> Self {
        Self {
            rpc_vers: RPC_VERSION_MAJOR,
            rpc_vers_minor: RPC_VERSION_MINOR,
            ptype,
            packet_flags: PacketFlags::complete(),
            data_rep: DataRepresentation::default(),
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.data_rep.is_little_endian()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.rpc_vers);
        buf.put_u8(self.rpc_vers_minor);
        buf.put_u8(self.ptype as u8);
        buf.put_u8(self.packet_flags.0);
        buf.put_slice(&self.data_rep.0);
        if self.is_little_endian() {
            buf.put_u16_le(self.frag_length);
            buf.put_u16_le(self.auth_length);
            buf.put_u32_le(self.call_id);
        } else {
            buf.put_u16(self.frag_length);
            buf.put_u16(self.auth_length);
            buf.put_u32(self.call_id);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        if cursor.remaining() < Self::SIZE {
            return Err(RpcError::InvalidPdu("truncated PDU header".into()));
        }
        let rpc_vers = cursor.get_u8();
        let rpc_vers_minor = cursor.get_u8();
        if rpc_vers != RPC_VERSION_MAJOR || rpc_vers_minor != RPC_VERSION_MINOR {
            return Err(RpcError::RpcVersionMismatch {
                major: rpc_vers,
                minor: rpc_vers_minor,
            });
        }
        let ptype_raw = cursor.get_u8();
        let ptype =
            PacketType::from_u8(ptype_raw).ok_or(RpcError::InvalidPacketType(ptype_raw))?;
        let packet_flags = PacketFlags::new(cursor.get_u8());
        let mut drep = [0u8; 4];
        cursor.copy_to_slice(&mut drep);
        let data_rep = DataRepresentation(drep);
        let little_endian = data_rep.is_little_endian();
        let (frag_length, auth_length, call_id) = if little_endian {
            (
                cursor.get_u16_le(),
                cursor.get_u16_le(),
                cursor.get_u32_le(),
            )
        } else {
            (cursor.get_u16(), cursor.get_u16(), cursor.get_u32())
        };
        Ok(Self {
            rpc_vers,
            rpc_vers_minor,
            ptype,
            packet_flags,
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

/// Reads the fragment length from a raw PDU, honouring its drep label.
///
/// Callers must hand in at least a full common header.
pub fn get_frag_length(data: &[u8]) -> u16 {
    let raw = [data[FRAG_LEN_OFFSET], data[FRAG_LEN_OFFSET + 1]];
    if data[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0 {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    }
}

/// Patches the fragment length of a raw PDU in place.
pub fn set_frag_length(data: &mut [u8], frag_length: u16) {
    let raw = if data[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0 {
        frag_length.to_le_bytes()
    } else {
        frag_length.to_be_bytes()
    };
    data[FRAG_LEN_OFFSET] = raw[0];
    data[FRAG_LEN_OFFSET + 1] = raw[1];
}

/// Reads the auth length from a raw PDU, honouring its drep label.
pub fn get_auth_length(data: &[u8]) -> u16 {
    let raw = [data[AUTH_LEN_OFFSET], data[AUTH_LEN_OFFSET + 1]];
    if data[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0 {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    }
}

/// Patches the auth length of a raw PDU in place.
pub fn set_auth_length(data: &mut [u8], auth_length: u16) {
    let raw = if data[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0 {
        auth_length.to_le_bytes()
    } else {
        auth_length.to_be_bytes()
    };
    data[AUTH_LEN_OFFSET] = raw[0];
    data[AUTH_LEN_OFFSET + 1] = raw[1];
}

/// Reads the call id out of a raw PDU without decoding the body.
///
/// Returns `None` when the buffer is shorter than a common header, so
/// dispatch can tell runts from decodable packets.
pub fn peek_call_id(data: &[u8]) -> Option<u32> {
    if data.len() < PduHeader::SIZE {
        return None;
    }
    let raw = [
        data[CALL_ID_OFFSET],
        data[CALL_ID_OFFSET + 1],
        data[CALL_ID_OFFSET + 2],
        data[CALL_ID_OFFSET + 3],
    ];
    if data[DREP_OFFSET] & DREP_LITTLE_ENDIAN != 0 {
        Some(u32::from_le_bytes(raw))
    } else {
        Some(u32::from_be_bytes(raw))
    }
}

/// Splits a PDU tail into stub data and an optional auth trailer.
///
/// The stub region runs from `body_start` to the start of the trailer, minus
/// the auth padding declared by the trailer itself.
fn split_auth_trailer(
    data: &Bytes,
    header: &PduHeader,
    body_start: usize,
) -> Result<(Bytes, Option<AuthVerifier>)> {
    let frag_length = header.frag_length as usize;
    if data.len() < frag_length {
        return Err(RpcError::InvalidPdu("truncated fragment".into()));
    }
    let auth_length = header.auth_length as usize;
    if auth_length == 0 {
        return Ok((data.slice(body_start..frag_length), None));
    }
    let trailer_total = AuthVerifier::HEADER_SIZE + auth_length;
    if body_start + trailer_total > frag_length {
        return Err(RpcError::AuthTrailerTooLong {
            auth_length,
            frag_length,
        });
    }
    let stub_end = frag_length - trailer_total;
    let verifier = AuthVerifier::decode(
        &data[stub_end..frag_length],
        auth_length,
        header.is_little_endian(),
    )?;
    let pad = verifier.auth_pad_length as usize;
    if pad > stub_end - body_start {
        return Err(RpcError::InvalidPdu(
            "auth padding exceeds stub data".into(),
        ));
    }
    Ok((data.slice(body_start..stub_end - pad), Some(verifier)))
}

pub(crate) fn put_u16_drep(buf: &mut BytesMut, little_endian: bool, value: u16) {
    if little_endian {
        buf.put_u16_le(value);
    } else {
        buf.put_u16(value);
    }
}

pub(crate) fn put_u32_drep(buf: &mut BytesMut, little_endian: bool, value: u32) {
    if little_endian {
        buf.put_u32_le(value);
    } else {
        buf.put_u32(value);
    }
}

fn get_u16_drep(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> u16 {
    if little_endian {
        cursor.get_u16_le()
    } else {
        cursor.get_u16()
    }
}

fn get_u32_drep(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> u32 {
    if little_endian {
        cursor.get_u32_le()
    } else {
        cursor.get_u32()
    }
}

/// Backpatches the real header over the placeholder bytes once the body is
/// in place and the fragment length is known. The shared tail of every encode.
fn finish_pdu(header: &PduHeader, auth_length: u16, mut buf: BytesMut) -> BytesMut {
    let mut patched = header.clone();
    patched.frag_length = buf.len() as u16;
    patched.auth_length = auth_length;
    let mut header_buf = BytesMut::with_capacity(PduHeader::SIZE);
    patched.encode(&mut header_buf);
    buf[..PduHeader::SIZE].copy_from_slice(&header_buf);
    buf
}

/// One element of a bind or alter context presentation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }
}

/// Outcome of one presentation context negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxResult {
    pub result: u16,
    pub reason: u16,
    pub syntax: SyntaxId,
}

impl CtxResult {
    pub fn accepted(&self) -> bool {
        self.result == CTX_ACCEPTANCE
    }
}

fn encode_context_list(buf: &mut BytesMut, little_endian: bool, contexts: &[ContextElement]) {
    buf.put_u8(contexts.len() as u8);
    buf.put_u8(0); // reserved
    put_u16_drep(buf, little_endian, 0); // reserved
    for ctx in contexts {
        put_u16_drep(buf, little_endian, ctx.context_id);
        buf.put_u8(ctx.transfer_syntaxes.len() as u8);
        buf.put_u8(0); // reserved
        ctx.abstract_syntax.encode(buf, little_endian);
        for ts in &ctx.transfer_syntaxes {
            ts.encode(buf, little_endian);
        }
    }
}

fn decode_context_list(
    cursor: &mut Cursor<&[u8]>,
    little_endian: bool,
) -> Result<Vec<ContextElement>> {
    if cursor.remaining() < 4 {
        return Err(RpcError::InvalidPdu("truncated context list".into()));
    }
    let num_contexts = cursor.get_u8();
    cursor.advance(3); // reserved
    let mut contexts = Vec::with_capacity(num_contexts as usize);
    for _ in 0..num_contexts {
        if cursor.remaining() < 4 {
            return Err(RpcError::InvalidPdu("truncated context element".into()));
        }
        let context_id = get_u16_drep(cursor, little_endian);
        let num_transfer = cursor.get_u8();
        cursor.advance(1); // reserved
        let abstract_syntax = SyntaxId::decode(cursor, little_endian)?;
        let mut transfer_syntaxes = Vec::with_capacity(num_transfer as usize);
        for _ in 0..num_transfer {
            transfer_syntaxes.push(SyntaxId::decode(cursor, little_endian)?);
        }
        contexts.push(ContextElement {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        });
    }
    Ok(contexts)
}

fn encode_result_list(buf: &mut BytesMut, little_endian: bool, results: &[CtxResult]) {
    buf.put_u8(results.len() as u8);
    buf.put_u8(0); // reserved
    put_u16_drep(buf, little_endian, 0); // reserved
    for res in results {
        put_u16_drep(buf, little_endian, res.result);
        put_u16_drep(buf, little_endian, res.reason);
        res.syntax.encode(buf, little_endian);
    }
}

fn decode_result_list(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> Result<Vec<CtxResult>> {
    if cursor.remaining() < 4 {
        return Err(RpcError::InvalidPdu("truncated result list".into()));
    }
    let num_results = cursor.get_u8();
    cursor.advance(3); // reserved
    let mut results = Vec::with_capacity(num_results as usize);
    for _ in 0..num_results {
        if cursor.remaining() < 4 {
            return Err(RpcError::InvalidPdu("truncated context result".into()));
        }
        let result = get_u16_drep(cursor, little_endian);
        let reason = get_u16_drep(cursor, little_endian);
        let syntax = SyntaxId::decode(cursor, little_endian)?;
        results.push(CtxResult {
            result,
            reason,
            syntax,
        });
    }
    Ok(results)
}

/// Parses the auth trailer of a bind-class PDU from the fragment tail.
fn decode_tail_auth(data: &Bytes, header: &PduHeader) -> Result<Option<AuthVerifier>> {
    let auth_length = header.auth_length as usize;
    if auth_length == 0 {
        return Ok(None);
    }
    let frag_length = header.frag_length as usize;
    let trailer_total = AuthVerifier::HEADER_SIZE + auth_length;
    if data.len() < frag_length || frag_length < PduHeader::SIZE + trailer_total {
        return Err(RpcError::AuthTrailerTooLong {
            auth_length,
            frag_length,
        });
    }
    let verifier = AuthVerifier::decode(
        &data[frag_length - trailer_total..frag_length],
        auth_length,
        header.is_little_endian(),
    )?;
    Ok(Some(verifier))
}

/// REQUEST PDU
#[derive(Debug, Clone)]
pub struct RequestPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object: Option<Uuid>,
    pub stub_data: Bytes,
}

impl RequestPdu {
    pub fn new(
        call_id: u32,
        context_id: u16,
        opnum: u16,
        object: Option<Uuid>,
        stub_data: Bytes,
    ) -> Self {
        let mut header = PduHeader::new(PacketType::Request, call_id);
        if object.is_some() {
            header.packet_flags.set(PacketFlags::OBJECT_UUID);
        }
        Self {
            header,
            alloc_hint: stub_data.len() as u32,
            context_id,
            opnum,
            object,
            stub_data,
        }
    }

    /// Encodes without freezing so a security layer can append padding and an
    /// auth trailer, then repatch the length fields.
    pub fn encode_raw(&self) -> BytesMut {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(REQUEST_LENGTH + GUID_SIZE + self.stub_data.len());
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u32_drep(&mut buf, little_endian, self.alloc_hint);
        put_u16_drep(&mut buf, little_endian, self.context_id);
        put_u16_drep(&mut buf, little_endian, self.opnum);
        if let Some(object) = &self.object {
            object.encode(&mut buf, little_endian);
        }
        buf.put_slice(&self.stub_data);
        finish_pdu(&self.header, 0, buf)
    }

    pub fn encode(&self) -> Bytes {
        self.encode_raw().freeze()
    }

    pub fn decode(data: &Bytes) -> Result<(Self, Option<AuthVerifier>)> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < REQUEST_LENGTH - PduHeader::SIZE {
            return Err(RpcError::InvalidPdu("truncated request".into()));
        }
        let alloc_hint = get_u32_drep(&mut cursor, little_endian);
        let context_id = get_u16_drep(&mut cursor, little_endian);
        let opnum = get_u16_drep(&mut cursor, little_endian);
        let object = if header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
            Some(Uuid::decode(&mut cursor, little_endian)?)
        } else {
            None
        };
        let body_start = cursor.position() as usize;
        let (stub_data, auth) = split_auth_trailer(data, &header, body_start)?;
        Ok((
            Self {
                header,
                alloc_hint,
                context_id,
                opnum,
                object,
                stub_data,
            },
            auth,
        ))
    }
}

/// RESPONSE PDU
#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Bytes,
}

impl ResponsePdu {
    pub fn new(call_id: u32, context_id: u16, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Response, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id,
            cancel_count: 0,
            stub_data,
        }
    }

    pub fn encode_raw(&self) -> BytesMut {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(REQUEST_LENGTH + self.stub_data.len());
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u32_drep(&mut buf, little_endian, self.alloc_hint);
        put_u16_drep(&mut buf, little_endian, self.context_id);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0); // reserved
        buf.put_slice(&self.stub_data);
        finish_pdu(&self.header, 0, buf)
    }

    pub fn encode(&self) -> Bytes {
        self.encode_raw().freeze()
    }

    pub fn decode(data: &Bytes) -> Result<(Self, Option<AuthVerifier>)> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < REQUEST_LENGTH - PduHeader::SIZE {
            return Err(RpcError::InvalidPdu("truncated response".into()));
        }
        let alloc_hint = get_u32_drep(&mut cursor, little_endian);
        let context_id = get_u16_drep(&mut cursor, little_endian);
        let cancel_count = cursor.get_u8();
        cursor.advance(1); // reserved
        let body_start = cursor.position() as usize;
        let (stub_data, auth) = split_auth_trailer(data, &header, body_start)?;
        Ok((
            Self {
                header,
                alloc_hint,
                context_id,
                cancel_count,
                stub_data,
            },
            auth,
        ))
    }
}

/// FAULT PDU
#[derive(Debug, Clone)]
pub struct FaultPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
}

impl FaultPdu {
    pub fn new(call_id: u32, status: u32) -> Self {
        Self {
            header: PduHeader::new(PacketType::Fault, call_id),
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
            status,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(32);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u32_drep(&mut buf, little_endian, self.alloc_hint);
        put_u16_drep(&mut buf, little_endian, self.context_id);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0); // reserved
        put_u32_drep(&mut buf, little_endian, self.status);
        buf.put_slice(&[0u8; 4]); // reserved
        finish_pdu(&self.header, 0, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < 12 {
            return Err(RpcError::InvalidPdu("truncated fault".into()));
        }
        let alloc_hint = get_u32_drep(&mut cursor, little_endian);
        let context_id = get_u16_drep(&mut cursor, little_endian);
        let cancel_count = cursor.get_u8();
        cursor.advance(1); // reserved
        let status = get_u32_drep(&mut cursor, little_endian);
        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            status,
        })
    }
}

/// BIND PDU
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    pub auth: Option<AuthVerifier>,
}

impl BindPdu {
    pub fn new(call_id: u32, context_id: u16, syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            header: PduHeader::new(PacketType::Bind, call_id),
            max_xmit_frag: FRAG_MAX_SIZE,
            max_recv_frag: FRAG_MAX_SIZE,
            assoc_group_id: 0,
            context_list: vec![ContextElement::new(context_id, syntax, transfer_syntax)],
            auth: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u16_drep(&mut buf, little_endian, self.max_xmit_frag);
        put_u16_drep(&mut buf, little_endian, self.max_recv_frag);
        put_u32_drep(&mut buf, little_endian, self.assoc_group_id);
        encode_context_list(&mut buf, little_endian, &self.context_list);
        let auth_length = encode_tail_auth(&mut buf, little_endian, self.auth.as_ref());
        finish_pdu(&self.header, auth_length, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < 8 {
            return Err(RpcError::InvalidPdu("truncated bind".into()));
        }
        let max_xmit_frag = get_u16_drep(&mut cursor, little_endian);
        let max_recv_frag = get_u16_drep(&mut cursor, little_endian);
        let assoc_group_id = get_u32_drep(&mut cursor, little_endian);
        let context_list = decode_context_list(&mut cursor, little_endian)?;
        let auth = decode_tail_auth(data, &header)?;
        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
            auth,
        })
    }
}

/// BIND_ACK PDU
#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_address: String,
    pub results: Vec<CtxResult>,
    pub auth: Option<AuthVerifier>,
}

impl BindAckPdu {
    pub fn new(call_id: u32, max_xmit_frag: u16, max_recv_frag: u16, syntax: SyntaxId) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindAck, call_id),
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id: 0,
            secondary_address: String::new(),
            results: vec![CtxResult {
                result: CTX_ACCEPTANCE,
                reason: 0,
                syntax,
            }],
            auth: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u16_drep(&mut buf, little_endian, self.max_xmit_frag);
        put_u16_drep(&mut buf, little_endian, self.max_recv_frag);
        put_u32_drep(&mut buf, little_endian, self.assoc_group_id);
        // port_any_t: length includes the terminating NUL
        let addr = self.secondary_address.as_bytes();
        put_u16_drep(&mut buf, little_endian, (addr.len() + 1) as u16);
        buf.put_slice(addr);
        buf.put_u8(0);
        while buf.len() % 4 != 0 {
            buf.put_u8(0); // align
        }
        encode_result_list(&mut buf, little_endian, &self.results);
        let auth_length = encode_tail_auth(&mut buf, little_endian, self.auth.as_ref());
        finish_pdu(&self.header, auth_length, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < 10 {
            return Err(RpcError::InvalidPdu("truncated bind ack".into()));
        }
        let max_xmit_frag = get_u16_drep(&mut cursor, little_endian);
        let max_recv_frag = get_u16_drep(&mut cursor, little_endian);
        let assoc_group_id = get_u32_drep(&mut cursor, little_endian);
        let addr_len = get_u16_drep(&mut cursor, little_endian) as usize;
        if cursor.remaining() < addr_len {
            return Err(RpcError::InvalidPdu("truncated secondary address".into()));
        }
        let mut addr = vec![0u8; addr_len];
        cursor.copy_to_slice(&mut addr);
        while addr.last() == Some(&0) {
            addr.pop();
        }
        let secondary_address = String::from_utf8(addr)
            .map_err(|_| RpcError::InvalidPdu("secondary address not UTF-8".into()))?;
        while cursor.position() % 4 != 0 {
            if cursor.remaining() == 0 {
                return Err(RpcError::InvalidPdu("truncated bind ack".into()));
            }
            cursor.advance(1); // align
        }
        let results = decode_result_list(&mut cursor, little_endian)?;
        let auth = decode_tail_auth(data, &header)?;
        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_address,
            results,
            auth,
        })
    }
}

/// BIND_NAK PDU
#[derive(Debug, Clone)]
pub struct BindNakPdu {
    pub header: PduHeader,
    pub reject_reason: u16,
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    pub fn new(call_id: u32, reject_reason: u16) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindNak, call_id),
            reject_reason,
            versions: vec![(RPC_VERSION_MAJOR, RPC_VERSION_MINOR)],
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(32);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u16_drep(&mut buf, little_endian, self.reject_reason);
        buf.put_u8(self.versions.len() as u8);
        for (major, minor) in &self.versions {
            buf.put_u8(*major);
            buf.put_u8(*minor);
        }
        finish_pdu(&self.header, 0, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < 2 {
            return Err(RpcError::InvalidPdu("truncated bind nak".into()));
        }
        let reject_reason = get_u16_drep(&mut cursor, little_endian);
        let mut versions = Vec::new();
        if cursor.remaining() > 0 {
            let num_versions = cursor.get_u8();
            for _ in 0..num_versions {
                if cursor.remaining() < 2 {
                    break;
                }
                versions.push((cursor.get_u8(), cursor.get_u8()));
            }
        }
        Ok(Self {
            header,
            reject_reason,
            versions,
        })
    }
}

/// ALTER_CONTEXT PDU, same body layout as BIND
#[derive(Debug, Clone)]
pub struct AlterContextPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    pub auth: Option<AuthVerifier>,
}

impl AlterContextPdu {
    pub fn new(call_id: u32, context_id: u16, syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            header: PduHeader::new(PacketType::AlterContext, call_id),
            max_xmit_frag: FRAG_MAX_SIZE,
            max_recv_frag: FRAG_MAX_SIZE,
            assoc_group_id: 0,
            context_list: vec![ContextElement::new(context_id, syntax, transfer_syntax)],
            auth: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u16_drep(&mut buf, little_endian, self.max_xmit_frag);
        put_u16_drep(&mut buf, little_endian, self.max_recv_frag);
        put_u32_drep(&mut buf, little_endian, self.assoc_group_id);
        encode_context_list(&mut buf, little_endian, &self.context_list);
        let auth_length = encode_tail_auth(&mut buf, little_endian, self.auth.as_ref());
        finish_pdu(&self.header, auth_length, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        let little_endian = header.is_little_endian();
        if cursor.remaining() < 8 {
            return Err(RpcError::InvalidPdu("truncated alter context".into()));
        }
        let max_xmit_frag = get_u16_drep(&mut cursor, little_endian);
        let max_recv_frag = get_u16_drep(&mut cursor, little_endian);
        let assoc_group_id = get_u32_drep(&mut cursor, little_endian);
        let context_list = decode_context_list(&mut cursor, little_endian)?;
        let auth = decode_tail_auth(data, &header)?;
        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
            auth,
        })
    }
}

/// ALTER_CONTEXT_RESP PDU, same body layout as BIND_ACK
#[derive(Debug, Clone)]
pub struct AlterContextRespPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_address: String,
    pub results: Vec<CtxResult>,
    pub auth: Option<AuthVerifier>,
}

impl AlterContextRespPdu {
    pub fn new(call_id: u32, syntax: SyntaxId) -> Self {
        Self {
            header: PduHeader::new(PacketType::AlterContextResp, call_id),
            max_xmit_frag: FRAG_MAX_SIZE,
            max_recv_frag: FRAG_MAX_SIZE,
            assoc_group_id: 0,
            secondary_address: String::new(),
            results: vec![CtxResult {
                result: CTX_ACCEPTANCE,
                reason: 0,
                syntax,
            }],
            auth: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u16_drep(&mut buf, little_endian, self.max_xmit_frag);
        put_u16_drep(&mut buf, little_endian, self.max_recv_frag);
        put_u32_drep(&mut buf, little_endian, self.assoc_group_id);
        let addr = self.secondary_address.as_bytes();
        put_u16_drep(&mut buf, little_endian, (addr.len() + 1) as u16);
        buf.put_slice(addr);
        buf.put_u8(0);
        while buf.len() % 4 != 0 {
            buf.put_u8(0); // align
        }
        encode_result_list(&mut buf, little_endian, &self.results);
        let auth_length = encode_tail_auth(&mut buf, little_endian, self.auth.as_ref());
        finish_pdu(&self.header, auth_length, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let ack = BindAckPdu::decode(data)?;
        Ok(Self {
            header: ack.header,
            max_xmit_frag: ack.max_xmit_frag,
            max_recv_frag: ack.max_recv_frag,
            assoc_group_id: ack.assoc_group_id,
            secondary_address: ack.secondary_address,
            results: ack.results,
            auth: ack.auth,
        })
    }
}

/// AUTH3 PDU: the final leg of a three-leg auth handshake
#[derive(Debug, Clone)]
pub struct Auth3Pdu {
    pub header: PduHeader,
    pub auth: AuthVerifier,
}

impl Auth3Pdu {
    pub fn new(call_id: u32, auth: AuthVerifier) -> Self {
        Self {
            header: PduHeader::new(PacketType::Auth3, call_id),
            auth,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&[0u8; PduHeader::SIZE]);
        put_u32_drep(&mut buf, little_endian, 0); // pad
        let auth_length = encode_tail_auth(&mut buf, little_endian, Some(&self.auth));
        finish_pdu(&self.header, auth_length, buf).freeze()
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(data.as_ref());
        let header = PduHeader::decode(&mut cursor)?;
        if cursor.remaining() < 4 {
            return Err(RpcError::InvalidPdu("truncated auth3".into()));
        }
        cursor.advance(4); // pad
        let auth = decode_tail_auth(data, &header)?
            .ok_or_else(|| RpcError::InvalidPdu("auth3 without auth trailer".into()))?;
        Ok(Self { header, auth })
    }
}

/// Appends an auth trailer if present, returning the credential length for
/// the header auth_length field.
fn encode_tail_auth(
    buf: &mut BytesMut,
    little_endian: bool,
    auth: Option<&AuthVerifier>,
) -> u16 {
    match auth {
        Some(verifier) => {
            verifier.encode(buf, little_endian);
            verifier.auth_value.len() as u16
        }
        None => 0,
    }
}

/// Any decoded PDU
#[derive(Debug, Clone)]
pub enum Pdu {
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    AlterContext(AlterContextPdu),
    AlterContextResp(AlterContextRespPdu),
    Auth3(Auth3Pdu),
}

impl Pdu {
    pub fn decode(data: &Bytes) -> Result<Self> {
        if data.len() < PduHeader::SIZE {
            return Err(RpcError::InvalidPdu("truncated PDU header".into()));
        }
        let ptype = PacketType::from_u8(data[2]).ok_or(RpcError::InvalidPacketType(data[2]))?;
        match ptype {
            PacketType::Request => RequestPdu::decode(data).map(|(pdu, _)| Pdu::Request(pdu)),
            PacketType::Response => ResponsePdu::decode(data).map(|(pdu, _)| Pdu::Response(pdu)),
            PacketType::Fault => FaultPdu::decode(data).map(Pdu::Fault),
            PacketType::Bind => BindPdu::decode(data).map(Pdu::Bind),
            PacketType::BindAck => BindAckPdu::decode(data).map(Pdu::BindAck),
            PacketType::BindNak => BindNakPdu::decode(data).map(Pdu::BindNak),
            PacketType::AlterContext => AlterContextPdu::decode(data).map(Pdu::AlterContext),
            PacketType::AlterContextResp => {
                AlterContextRespPdu::decode(data).map(Pdu::AlterContextResp)
            }
            PacketType::Auth3 => Auth3Pdu::decode(data).map(Pdu::Auth3),
        }
    }

    pub fn header(&self) -> &PduHeader {
        match self {
            Pdu::Request(p) => &p.header,
            Pdu::Response(p) => &p.header,
            Pdu::Fault(p) => &p.header,
            Pdu::Bind(p) => &p.header,
            Pdu::BindAck(p) => &p.header,
            Pdu::BindNak(p) => &p.header,
            Pdu::AlterContext(p) => &p.header,
            Pdu::AlterContextResp(p) => &p.header,
            Pdu::Auth3(p) => &p.header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = PduHeader::new(PacketType::Request, 42);
        header.frag_length = 1234;
        header.auth_length = 16;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), PduHeader::SIZE);
        let mut cursor = Cursor::new(&buf[..]);
        let decoded = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_big_endian_roundtrip() {
        let mut header = PduHeader::new(PacketType::Response, 7);
        header.data_rep = DataRepresentation::big_endian();
        header.frag_length = 0x1234;
        header.call_id = 0xdeadbeef;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut cursor = Cursor::new(&buf[..]);
        let decoded = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded.frag_length, 0x1234);
        assert_eq!(decoded.call_id, 0xdeadbeef);
        assert!(!decoded.is_little_endian());
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut header = PduHeader::new(PacketType::Request, 1);
        header.rpc_vers = 4;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut cursor = Cursor::new(&buf[..]);
        match PduHeader::decode(&mut cursor) {
            Err(RpcError::RpcVersionMismatch { major: 4, minor: 0 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_raw_length_patching() {
        let mut header = PduHeader::new(PacketType::Request, 3);
        header.frag_length = 100;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut raw = buf.to_vec();
        set_frag_length(&mut raw, 5840);
        set_auth_length(&mut raw, 24);
        assert_eq!(get_frag_length(&raw), 5840);
        assert_eq!(get_auth_length(&raw), 24);
        assert_eq!(peek_call_id(&raw), Some(3));
    }

    #[test]
    fn test_raw_length_patching_big_endian() {
        let mut header = PduHeader::new(PacketType::Request, 9);
        header.data_rep = DataRepresentation::big_endian();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut raw = buf.to_vec();
        set_frag_length(&mut raw, 0x0102);
        assert_eq!(raw[FRAG_LEN_OFFSET], 0x01);
        assert_eq!(raw[FRAG_LEN_OFFSET + 1], 0x02);
        assert_eq!(get_frag_length(&raw), 0x0102);
        assert_eq!(peek_call_id(&raw), Some(9));
    }

    #[test]
    fn test_peek_call_id_runt() {
        assert_eq!(peek_call_id(&[0u8; 8]), None);
    }

    #[test]
    fn test_uuid_parse_display() {
        let s = "8a885d04-1ceb-11c9-9fe8-08002b104860";
        let uuid = Uuid::parse(s).unwrap();
        assert_eq!(uuid, NDR_TRANSFER_SYNTAX.uuid);
        assert_eq!(uuid.to_string(), s);
        assert!(Uuid::parse("not-a-uuid").is_none());
        assert!(Uuid::parse("8a885d04-1ceb-11c9-9fe8").is_none());
        // multi-byte char straddling a hex-pair boundary must not panic
        assert!(Uuid::parse("e1af8308-5d1f-11c9-9\u{e9}4-08002b14a0fa").is_none());
    }

    #[test]
    fn test_uuid_wire_roundtrip() {
        let uuid = Uuid::parse("12345678-9abc-def0-1234-56789abcdef0").unwrap();
        for little_endian in [true, false] {
            let mut buf = BytesMut::new();
            uuid.encode(&mut buf, little_endian);
            assert_eq!(buf.len(), GUID_SIZE);
            let mut cursor = Cursor::new(&buf[..]);
            assert_eq!(Uuid::decode(&mut cursor, little_endian).unwrap(), uuid);
        }
    }

    #[test]
    fn test_syntax_version_packing() {
        let syntax = SyntaxId::new(Uuid::nil(), 5, 1);
        assert_eq!(syntax.version, 0x0001_0005);
        assert_eq!(syntax.major(), 5);
        assert_eq!(syntax.minor(), 1);
        assert_eq!(NDR_TRANSFER_SYNTAX.major(), 2);
        assert_eq!(NDR_TRANSFER_SYNTAX.minor(), 0);
    }

    #[test]
    fn test_request_roundtrip() {
        let stub = Bytes::from(vec![0xaa; 100]);
        let req = RequestPdu::new(5, 1, 2, None, stub.clone());
        let encoded = req.encode();
        assert_eq!(encoded.len(), REQUEST_LENGTH + 100);
        assert_eq!(get_frag_length(&encoded) as usize, encoded.len());
        let (decoded, auth) = RequestPdu::decode(&encoded).unwrap();
        assert!(auth.is_none());
        assert_eq!(decoded.opnum, 2);
        assert_eq!(decoded.context_id, 1);
        assert_eq!(decoded.alloc_hint, 100);
        assert_eq!(decoded.stub_data, stub);
        assert!(decoded.object.is_none());
    }

    #[test]
    fn test_request_with_object_roundtrip() {
        let object = Uuid::parse("11223344-5566-7788-99aa-bbccddeeff00").unwrap();
        let req = RequestPdu::new(6, 0, 9, Some(object), Bytes::from_static(b"hi"));
        let encoded = req.encode();
        assert_eq!(encoded.len(), REQUEST_LENGTH + GUID_SIZE + 2);
        let (decoded, _) = RequestPdu::decode(&encoded).unwrap();
        assert!(decoded.header.packet_flags.contains(PacketFlags::OBJECT_UUID));
        assert_eq!(decoded.object, Some(object));
        assert_eq!(decoded.stub_data, Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = ResponsePdu::new(7, 1, Bytes::from(vec![1, 2, 3, 4]));
        let encoded = resp.encode();
        let (decoded, auth) = ResponsePdu::decode(&encoded).unwrap();
        assert!(auth.is_none());
        assert_eq!(decoded.header.call_id, 7);
        assert_eq!(decoded.stub_data, Bytes::from(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_fault_roundtrip() {
        let fault = FaultPdu::new(9, crate::error::FAULT_OP_RNG_ERROR);
        let encoded = fault.encode();
        // common header + 12 body bytes + 4 reserved
        assert_eq!(encoded.len(), 32);
        let decoded = FaultPdu::decode(&encoded).unwrap();
        assert_eq!(decoded.status, crate::error::FAULT_OP_RNG_ERROR);
        assert_eq!(decoded.header.call_id, 9);
    }

    #[test]
    fn test_bind_roundtrip() {
        let syntax = SyntaxId::new(
            Uuid::parse("12345778-1234-abcd-ef00-0123456789ac").unwrap(),
            1,
            0,
        );
        let bind = BindPdu::new(1, 0, syntax, NDR_TRANSFER_SYNTAX);
        let encoded = bind.encode();
        let decoded = BindPdu::decode(&encoded).unwrap();
        assert_eq!(decoded.max_xmit_frag, FRAG_MAX_SIZE);
        assert_eq!(decoded.max_recv_frag, FRAG_MAX_SIZE);
        assert_eq!(decoded.context_list.len(), 1);
        assert_eq!(decoded.context_list[0].abstract_syntax, syntax);
        assert_eq!(decoded.context_list[0].transfer_syntaxes, vec![NDR_TRANSFER_SYNTAX]);
        assert!(decoded.auth.is_none());
    }

    #[test]
    fn test_bind_ack_roundtrip_with_address() {
        let mut ack = BindAckPdu::new(1, 4280, 4280, NDR_TRANSFER_SYNTAX);
        ack.secondary_address = "135".to_string();
        let encoded = ack.encode();
        let decoded = BindAckPdu::decode(&encoded).unwrap();
        assert_eq!(decoded.max_xmit_frag, 4280);
        assert_eq!(decoded.secondary_address, "135");
        assert_eq!(decoded.results.len(), 1);
        assert!(decoded.results[0].accepted());
        assert_eq!(decoded.results[0].syntax, NDR_TRANSFER_SYNTAX);
    }

    #[test]
    fn test_bind_nak_roundtrip() {
        let nak = BindNakPdu::new(1, BIND_NAK_REASON_ASYNTAX);
        let encoded = nak.encode();
        let decoded = BindNakPdu::decode(&encoded).unwrap();
        assert_eq!(decoded.reject_reason, BIND_NAK_REASON_ASYNTAX);
        assert_eq!(decoded.versions, vec![(5, 0)]);
    }

    #[test]
    fn test_alter_context_resp_reason() {
        let mut resp = AlterContextRespPdu::new(3, NDR_TRANSFER_SYNTAX);
        resp.results[0].result = CTX_PROVIDER_REJECTION;
        resp.results[0].reason = BIND_NAK_REASON_ASYNTAX;
        let encoded = resp.encode();
        let decoded = AlterContextRespPdu::decode(&encoded).unwrap();
        assert_eq!(decoded.results[0].result, CTX_PROVIDER_REJECTION);
        assert_eq!(decoded.results[0].reason, BIND_NAK_REASON_ASYNTAX);
    }

    #[test]
    fn test_pdu_dispatch() {
        let fault = FaultPdu::new(11, crate::error::FAULT_UNK_IF).encode();
        match Pdu::decode(&fault).unwrap() {
            Pdu::Fault(f) => assert_eq!(f.status, crate::error::FAULT_UNK_IF),
            other => panic!("wrong dispatch: {other:?}"),
        }
        let bad = Bytes::from_static(&[5, 0, 99, 0, 0x10, 0, 0, 0, 16, 0, 0, 0, 1, 0, 0, 0]);
        match Pdu::decode(&bad) {
            Err(RpcError::InvalidPacketType(99)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_flags_helpers() {
        let mut flags = PacketFlags::complete();
        assert!(flags.is_first());
        assert!(flags.is_last());
        flags.clear(PacketFlags::FIRST_FRAG);
        assert!(!flags.is_first());
        flags.set(PacketFlags::OBJECT_UUID);
        assert!(flags.contains(PacketFlags::OBJECT_UUID));
    }
}
