//! The request engine: chunked sends, response reassembly, and demultiplexing
//! of interleaved replies onto their waiting calls.
//!
//! There is no dedicated reader task. Whichever call is currently awaiting
//! its reply pumps the transport and routes every fragment it sees, its own
//! or not; completions travel over per-call oneshot channels so each waiter
//! observes exactly its own outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::connection::{ConnFlags, Connection, Pipe, Reply};
use crate::error::{Result, RpcError, FAULT_OTHER};
use crate::packet::{
    peek_call_id, DataRepresentation, PacketFlags, Pdu, RequestPdu, ResponsePdu, Uuid, GUID_SIZE,
    MAX_SIGN_SIZE, REQUEST_LENGTH,
};
use crate::security::{unwrap_reply, wrap_request};

/// An in-flight call. Dropping it abandons the call; a late response is then
/// discarded as unmatched.
pub struct RpcRequest {
    conn: Arc<Connection>,
    last_fault: Arc<AtomicU32>,
    call_id: u32,
    rx: Option<oneshot::Receiver<Result<Reply>>>,
}

impl RpcRequest {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Waits for this call to complete, driving reception while it waits.
    ///
    /// The select is biased towards the completion channel: a call whose
    /// reply has already been routed returns without touching the transport.
    /// Cancelling this future is safe; partial fragments stay buffered in
    /// the transport and the call is unregistered on drop.
    pub async fn recv(mut self) -> Result<Reply> {
        let Some(mut rx) = self.rx.take() else {
            return Err(RpcError::Cancelled);
        };
        let result = loop {
            tokio::select! {
                biased;
                done = &mut rx => {
                    break match done {
                        Ok(result) => result,
                        // sender dropped without a verdict: the call was
                        // removed from the pending table out from under us
                        Err(_) => Err(RpcError::Cancelled),
                    };
                }
                frame = self.conn.recv_fragment() => {
                    match frame {
                        Ok(raw) => dispatch_fragment(&self.conn, raw),
                        // a dead transport completes every pending call,
                        // including ours; the next loop turn collects it
                        Err(err) => self.conn.fail_all(&err),
                    }
                }
            }
        };
        match &result {
            // sticky: only a successful call clears the diagnostic
            Ok(_) => self.last_fault.store(0, Ordering::Relaxed),
            Err(RpcError::Fault(code)) => self.last_fault.store(*code, Ordering::Relaxed),
            Err(_) => {}
        }
        result
    }
}

impl Drop for RpcRequest {
    fn drop(&mut self) {
        // no-op once the call completed; otherwise forget it
        self.conn.unregister_call(self.call_id);
    }
}

/// Routes one received fragment to the pending call it belongs to.
///
/// The call id is peeked from the raw header before any decoding, so a
/// malformed or verification-failed fragment poisons exactly the call it was
/// addressed to instead of tearing down the connection.
pub(crate) fn dispatch_fragment(conn: &Connection, raw: Bytes) {
    let Some(call_id) = peek_call_id(&raw) else {
        debug!(len = raw.len(), "dropping runt fragment");
        return;
    };
    let decoded = conn.with_security(|sec| unwrap_reply(sec, raw));
    match decoded {
        Err(err) => complete_call(conn, call_id, Err(err)),
        Ok(Pdu::Fault(fault)) => {
            debug!(
                call_id,
                status = format_args!("0x{:08x}", fault.status),
                "fault received"
            );
            complete_call(conn, call_id, Err(RpcError::Fault(fault.status)));
        }
        Ok(Pdu::Response(resp)) => append_response(conn, call_id, resp),
        Ok(other) => {
            debug!(
                call_id,
                ptype = ?other.header().ptype,
                "unexpected packet type in reply, faulting call"
            );
            complete_call(conn, call_id, Err(RpcError::Fault(FAULT_OTHER)));
        }
    }
}

fn complete_call(conn: &Connection, call_id: u32, result: Result<Reply>) {
    let removed = conn.pending_lock().remove(&call_id);
    match removed {
        Some(call) => {
            let _ = call.tx.send(result);
        }
        None => debug!(call_id, "no pending call matches fragment, dropping"),
    }
}

fn append_response(conn: &Connection, call_id: u32, resp: ResponsePdu) {
    let mut pending = conn.pending_lock();
    let Some(mut call) = pending.remove(&call_id) else {
        drop(pending);
        debug!(call_id, "response for unknown call id, dropping");
        return;
    };
    call.payload.extend_from_slice(&resp.stub_data);
    // the final fragment's representation governs unmarshalling
    call.big_endian = !resp.header.is_little_endian();
    if resp.header.packet_flags.is_last() {
        drop(pending);
        let reply = Reply {
            stub_data: call.payload.freeze(),
            big_endian: call.big_endian,
        };
        let _ = call.tx.send(Ok(reply));
    } else {
        pending.insert(call_id, call);
    }
}

impl Pipe {
    /// Starts a call: fragments the stub to the server's receive limit and
    /// sends every fragment, returning the in-flight request.
    ///
    /// The call is registered before the first fragment is written, so a
    /// reply can never race its own waiter. A send failure unregisters the
    /// call and surfaces immediately.
    pub async fn request_send(
        &self,
        object: Option<Uuid>,
        opnum: u16,
        stub_data: Bytes,
    ) -> Result<RpcRequest> {
        let conn = self.conn.clone();
        let call_id = conn.next_call_id();

        // headroom for the request header, a worst-case auth trailer, and
        // the object GUID which rides on every fragment of the call
        let overhead =
            REQUEST_LENGTH + MAX_SIGN_SIZE + if object.is_some() { GUID_SIZE } else { 0 };
        let chunk_size = (conn.srv_max_recv_frag() as usize).saturating_sub(overhead);
        if chunk_size == 0 {
            return Err(RpcError::InvalidPdu(
                "negotiated fragment limit leaves no room for stub data".into(),
            ));
        }

        let rx = conn.register_call(call_id);

        let total = stub_data.len();
        let mut remaining = stub_data;
        let mut first = true;
        while !remaining.is_empty() || first {
            let part = remaining.split_to(remaining.len().min(chunk_size));
            let last = remaining.is_empty();

            let mut pdu = RequestPdu::new(call_id, self.context_id, opnum, object, part);
            pdu.alloc_hint = total as u32;
            let mut flags = PacketFlags::new(0);
            if first {
                flags.set(PacketFlags::FIRST_FRAG);
            }
            if last {
                flags.set(PacketFlags::LAST_FRAG);
            }
            if object.is_some() {
                flags.set(PacketFlags::OBJECT_UUID);
            }
            pdu.header.packet_flags = flags;
            if conn.flags().contains(ConnFlags::BIGENDIAN) {
                pdu.header.data_rep = DataRepresentation::big_endian();
            }

            let blob = match conn.with_security(|sec| wrap_request(sec, &pdu)) {
                Ok(blob) => blob,
                Err(err) => {
                    conn.unregister_call(call_id);
                    return Err(err);
                }
            };
            trace!(
                call_id,
                opnum,
                len = blob.len(),
                first,
                last,
                "sending request fragment"
            );
            if let Err(err) = conn.send_fragment(blob, last).await {
                conn.unregister_call(call_id);
                return Err(err);
            }
            first = false;
        }

        Ok(RpcRequest {
            conn,
            last_fault: self.last_fault.clone(),
            call_id,
            rx: Some(rx),
        })
    }

    /// One complete call: send, then wait for the reply.
    pub async fn request(
        &self,
        object: Option<Uuid>,
        opnum: u16,
        stub_data: Bytes,
    ) -> Result<Reply> {
        let req = self.request_send(object, opnum, stub_data).await?;
        req.recv().await
    }
}
