//! NDR marshalling contexts and the typed call path.
//!
//! Scalars are naturally aligned: every put or get pads to the size of the
//! value first. Pull contexts can verify that padding is zero and can track
//! whether reference pointers should be allocated, both driven by connection
//! flags.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::connection::{ConnFlags, Pipe};
use crate::error::{Result, RpcError};
use crate::packet::Uuid;
use crate::request::RpcRequest;

/// Which half of a call a marshal pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdrDirection {
    In,
    Out,
}

/// Marshalling context
pub struct NdrPush {
    buf: BytesMut,
    little_endian: bool,
}

impl NdrPush {
    pub fn new(little_endian: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            little_endian,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn align(&mut self, alignment: usize) {
        while self.buf.len() % alignment != 0 {
            self.buf.put_u8(0);
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.align(2);
        if self.little_endian {
            self.buf.put_u16_le(value);
        } else {
            self.buf.put_u16(value);
        }
    }

    pub fn put_u32(&mut self, value: u32) {
        self.align(4);
        if self.little_endian {
            self.buf.put_u32_le(value);
        } else {
            self.buf.put_u32(value);
        }
    }

    pub fn put_u64(&mut self, value: u64) {
        self.align(8);
        if self.little_endian {
            self.buf.put_u64_le(value);
        } else {
            self.buf.put_u64(value);
        }
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_u32(value as u32);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Unmarshalling context
pub struct NdrPull {
    data: Bytes,
    offset: usize,
    little_endian: bool,
    pad_check: bool,
    ref_alloc: bool,
}

impl NdrPull {
    pub fn new(data: Bytes, little_endian: bool) -> Self {
        Self {
            data,
            offset: 0,
            little_endian,
            pad_check: false,
            ref_alloc: false,
        }
    }

    pub fn with_flags(data: Bytes, little_endian: bool, flags: ConnFlags) -> Self {
        Self {
            data,
            offset: 0,
            little_endian,
            pad_check: flags.contains(ConnFlags::PAD_CHECK),
            ref_alloc: flags.contains(ConnFlags::REF_ALLOC),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether unique pointer targets should be allocated when absent.
    pub fn ref_alloc(&self) -> bool {
        self.ref_alloc
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.remaining() < len {
            return Err(RpcError::InvalidPdu(format!(
                "truncated stub data: need {len} bytes at offset {}",
                self.offset
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn align(&mut self, alignment: usize) -> Result<()> {
        while self.offset % alignment != 0 {
            let at = self.offset;
            let byte = self.take(1)?[0];
            if self.pad_check && byte != 0 {
                return Err(RpcError::InvalidPdu(format!(
                    "nonzero alignment padding at offset {at}"
                )));
            }
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let raw = self.take(2)?;
        let raw = [raw[0], raw[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let raw = self.take(4)?;
        let raw = [raw[0], raw[1], raw[2], raw[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(if self.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        let at = self.offset;
        self.take(len)?;
        Ok(self.data.slice(at..at + len))
    }
}

/// A type that marshals itself in both directions of a call.
///
/// Generated stubs push IN members on the way out and pull OUT members from
/// the reply; handwritten implementations follow the same split.
pub trait NdrMarshal {
    fn ndr_push(&self, ndr: &mut NdrPush, direction: NdrDirection) -> Result<()>;
    fn ndr_pull(&mut self, ndr: &mut NdrPull, direction: NdrDirection) -> Result<()>;
}

/// Pulls `blob` into a fresh value, pushes it again and compares bytes.
///
/// Catches asymmetric marshallers early, before they corrupt data on a real
/// wire. Works entirely on copies; the caller's value is never touched.
fn validate_roundtrip<T: NdrMarshal + Default>(
    context: &'static str,
    blob: &Bytes,
    direction: NdrDirection,
    little_endian: bool,
) -> Result<()> {
    let mut shadow = T::default();
    let mut pull = NdrPull::new(blob.clone(), little_endian);
    shadow.ndr_pull(&mut pull, direction)?;
    let mut push = NdrPush::new(little_endian);
    shadow.ndr_push(&mut push, direction)?;
    let replayed = push.into_bytes();
    if replayed != *blob {
        return Err(RpcError::ValidationFailed {
            context,
            original: blob.clone(),
            replayed,
        });
    }
    Ok(())
}

/// A typed call in flight: the engine request plus the marshalling flags
/// captured at send time. Consumed by [`NdrCall::recv`].
pub struct NdrCall {
    req: RpcRequest,
    flags: ConnFlags,
    opnum: u16,
}

impl NdrCall {
    pub fn call_id(&self) -> u32 {
        self.req.call_id()
    }

    /// Waits for the reply and unmarshals the OUT members of `args` in the
    /// reply's own byte order.
    ///
    /// Undrained reply bytes are a warning by default and an error under
    /// [`ConnFlags::STRICT_REPLY`].
    pub async fn recv<T: NdrMarshal + Default>(self, args: &mut T) -> Result<()> {
        let reply = self.req.recv().await?;

        let reply_le = !reply.big_endian;
        let mut pull = NdrPull::with_flags(reply.stub_data.clone(), reply_le, self.flags);
        args.ndr_pull(&mut pull, NdrDirection::Out)?;
        if self.flags.contains(ConnFlags::VALIDATE_OUT) {
            let mut shadow = NdrPush::new(reply_le);
            args.ndr_push(&mut shadow, NdrDirection::Out)?;
            validate_roundtrip::<T>(
                "reply stub",
                &shadow.into_bytes(),
                NdrDirection::Out,
                reply_le,
            )?;
        }

        let undrained = pull.remaining();
        if undrained > 0 {
            if self.flags.contains(ConnFlags::STRICT_REPLY) {
                return Err(RpcError::TrailingBytes(undrained));
            }
            warn!(
                bytes = undrained,
                opnum = self.opnum,
                "ignoring undrained reply bytes"
            );
        }
        Ok(())
    }
}

impl Pipe {
    /// Starts a typed call: marshals the IN members of `args` and sends the
    /// request, returning the in-flight call.
    pub async fn ndr_request_send<T: NdrMarshal + Default>(
        &self,
        object: Option<Uuid>,
        opnum: u16,
        args: &T,
    ) -> Result<NdrCall> {
        let flags = self.conn.flags();
        let push_le = !flags.contains(ConnFlags::BIGENDIAN);

        let mut push = NdrPush::new(push_le);
        args.ndr_push(&mut push, NdrDirection::In)?;
        let blob = push.into_bytes();
        if flags.contains(ConnFlags::VALIDATE_IN) {
            validate_roundtrip::<T>("request stub", &blob, NdrDirection::In, push_le)?;
        }

        let req = self.request_send(object, opnum, blob).await?;
        Ok(NdrCall { req, flags, opnum })
    }

    /// One complete typed call: marshal, send, wait, unmarshal.
    pub async fn ndr_request<T: NdrMarshal + Default>(
        &self,
        object: Option<Uuid>,
        opnum: u16,
        args: &mut T,
    ) -> Result<()> {
        let call = self.ndr_request_send(object, opnum, args).await?;
        call.recv(args).await
    }
}
