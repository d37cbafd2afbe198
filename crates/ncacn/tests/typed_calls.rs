//! The typed call path: marshalling flags, validation and reply draining.

mod support;

use bytes::Bytes;
use ncacn::packet::{DataRepresentation, ResponsePdu};
use ncacn::{ConnFlags, NdrDirection, NdrMarshal, NdrPull, NdrPush, Result, RpcError};

use support::{pipe_pair, pipe_pair_with_flags};

/// A call with one IN scalar and one OUT scalar.
#[derive(Default)]
struct EchoCall {
    input: u32,
    output: u32,
}

impl NdrMarshal for EchoCall {
    fn ndr_push(&self, ndr: &mut NdrPush, direction: NdrDirection) -> Result<()> {
        match direction {
            NdrDirection::In => ndr.put_u32(self.input),
            NdrDirection::Out => ndr.put_u32(self.output),
        }
        Ok(())
    }

    fn ndr_pull(&mut self, ndr: &mut NdrPull, direction: NdrDirection) -> Result<()> {
        match direction {
            NdrDirection::In => self.input = ndr.get_u32()?,
            NdrDirection::Out => self.output = ndr.get_u32()?,
        }
        Ok(())
    }
}

/// Pushes its IN member but forgets it on the pull, so a replay never
/// reproduces the original bytes.
#[derive(Default)]
struct LossyCall {
    value: u32,
}

impl NdrMarshal for LossyCall {
    fn ndr_push(&self, ndr: &mut NdrPush, direction: NdrDirection) -> Result<()> {
        if direction == NdrDirection::In {
            ndr.put_u32(self.value);
        }
        Ok(())
    }

    fn ndr_pull(&mut self, ndr: &mut NdrPull, direction: NdrDirection) -> Result<()> {
        if direction == NdrDirection::In {
            ndr.get_u32()?;
        }
        Ok(())
    }
}

/// OUT members whose layout needs alignment padding between them.
#[derive(Default)]
struct MixedCall {
    flag: u8,
    count: u32,
}

impl NdrMarshal for MixedCall {
    fn ndr_push(&self, ndr: &mut NdrPush, direction: NdrDirection) -> Result<()> {
        if direction == NdrDirection::Out {
            ndr.put_u8(self.flag);
            ndr.put_u32(self.count);
        }
        Ok(())
    }

    fn ndr_pull(&mut self, ndr: &mut NdrPull, direction: NdrDirection) -> Result<()> {
        if direction == NdrDirection::Out {
            self.flag = ndr.get_u8()?;
            self.count = ndr.get_u32()?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_typed_call_roundtrip() {
    let (pipe, peer) = pipe_pair();
    // the first request consumes call id 2
    let mut out_stub = NdrPush::new(true);
    out_stub.put_u32(84);
    peer.respond(2, out_stub.into_bytes()).await;

    let mut args = EchoCall {
        input: 42,
        output: 0,
    };
    pipe.ndr_request(None, 0, &mut args).await.unwrap();
    assert_eq!(args.output, 84);

    let parts = peer.recv_request().await;
    let mut pull = NdrPull::new(parts[0].stub_data.clone(), true);
    assert_eq!(pull.get_u32().unwrap(), 42);
}

#[tokio::test]
async fn test_overlapping_typed_calls() {
    let (pipe, peer) = pipe_pair();
    // replies queued in reverse order of the sends
    let mut out_b = NdrPush::new(true);
    out_b.put_u32(200);
    peer.respond(3, out_b.into_bytes()).await;
    let mut out_a = NdrPush::new(true);
    out_a.put_u32(100);
    peer.respond(2, out_a.into_bytes()).await;

    let mut args_a = EchoCall { input: 1, output: 0 };
    let mut args_b = EchoCall { input: 2, output: 0 };
    let call_a = pipe.ndr_request_send(None, 0, &args_a).await.unwrap();
    let call_b = pipe.ndr_request_send(None, 0, &args_b).await.unwrap();
    assert_eq!(call_a.call_id(), 2);
    assert_eq!(call_b.call_id(), 3);

    // the first waiter pumps both replies; the second finds its own ready
    call_a.recv(&mut args_a).await.unwrap();
    call_b.recv(&mut args_b).await.unwrap();
    assert_eq!(args_a.output, 100);
    assert_eq!(args_b.output, 200);
}

#[tokio::test]
async fn test_trailing_reply_bytes_ignored_by_default() {
    let (pipe, peer) = pipe_pair();
    let mut out_stub = NdrPush::new(true);
    out_stub.put_u32(84);
    out_stub.put_bytes(&[0xde, 0xad]);
    peer.respond(2, out_stub.into_bytes()).await;

    let mut args = EchoCall::default();
    pipe.ndr_request(None, 0, &mut args).await.unwrap();
    assert_eq!(args.output, 84);
}

#[tokio::test]
async fn test_trailing_reply_bytes_error_when_strict() {
    let (pipe, peer) = pipe_pair_with_flags(ConnFlags::new(ConnFlags::STRICT_REPLY));
    let mut out_stub = NdrPush::new(true);
    out_stub.put_u32(84);
    out_stub.put_bytes(&[0xde, 0xad]);
    peer.respond(2, out_stub.into_bytes()).await;

    let mut args = EchoCall::default();
    match pipe.ndr_request(None, 0, &mut args).await {
        Err(RpcError::TrailingBytes(2)) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_big_endian_reply_unmarshalled() {
    let (pipe, peer) = pipe_pair();
    let mut out_stub = NdrPush::new(false);
    out_stub.put_u32(0x0102_0304);
    let mut resp = ResponsePdu::new(2, 0, out_stub.into_bytes());
    resp.header.data_rep = DataRepresentation::big_endian();
    peer.send(resp.encode()).await;

    let mut args = EchoCall::default();
    pipe.ndr_request(None, 0, &mut args).await.unwrap();
    assert_eq!(args.output, 0x0102_0304);
}

#[tokio::test]
async fn test_validate_in_catches_asymmetric_marshaller() {
    let (pipe, _peer) = pipe_pair_with_flags(ConnFlags::new(ConnFlags::VALIDATE_IN));

    let mut args = LossyCall { value: 7 };
    match pipe.ndr_request(None, 0, &mut args).await {
        Err(RpcError::ValidationFailed { context, .. }) => {
            assert_eq!(context, "request stub")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_validate_out_accepts_symmetric_marshaller() {
    let (pipe, peer) = pipe_pair_with_flags(ConnFlags::new(ConnFlags::VALIDATE_OUT));
    let mut out_stub = NdrPush::new(true);
    out_stub.put_u32(84);
    peer.respond(2, out_stub.into_bytes()).await;

    let mut args = EchoCall { input: 1, output: 0 };
    pipe.ndr_request(None, 0, &mut args).await.unwrap();
    assert_eq!(args.output, 84);
}

#[tokio::test]
async fn test_pad_check_rejects_dirty_padding() {
    // dirty alignment padding between the u8 and the u32
    let stub: &[u8] = &[1, 0xff, 0xff, 0xff, 4, 0, 0, 0];

    let (pipe, peer) = pipe_pair();
    peer.respond(2, Bytes::from_static(stub)).await;
    let mut args = MixedCall::default();
    pipe.ndr_request(None, 0, &mut args).await.unwrap();
    assert_eq!((args.flag, args.count), (1, 4));

    let (pipe, peer) = pipe_pair_with_flags(ConnFlags::new(ConnFlags::PAD_CHECK));
    peer.respond(2, Bytes::from_static(stub)).await;
    let mut args = MixedCall::default();
    match pipe.ndr_request(None, 0, &mut args).await {
        Err(RpcError::InvalidPdu(msg)) => {
            assert!(msg.contains("padding"))
        }
        other => panic!("unexpected: {other:?}"),
    }
}
