//! Endpoint negotiation: bind, alter context, and the third leg of
//! three-leg authentication handshakes.
//!
//! These exchanges are synchronous on the connection. Bind and alter context
//! reuse the connection's current call id without consuming it; auth3
//! consumes a fresh one.

use tracing::debug;

use crate::connection::{ConnFlags, Pipe};
use crate::error::{Result, RpcError};
use crate::packet::{
    AlterContextPdu, Auth3Pdu, BindPdu, DataRepresentation, Pdu, SyntaxId,
    BIND_NAK_REASON_ASYNTAX,
};

/// Maps a reject reason to an error. The syntax reason gets its own variant
/// so callers can retry with a different transfer syntax.
fn map_reject_reason(reason: u16) -> RpcError {
    if reason == BIND_NAK_REASON_ASYNTAX {
        RpcError::UnsupportedTransferSyntax
    } else {
        RpcError::Rejected(reason)
    }
}

impl Pipe {
    /// Binds this pipe to an interface over a transfer syntax.
    ///
    /// On acceptance the server's fragment limits replace the connection
    /// defaults, and returned credentials update the handshake token. The
    /// pipe's negotiated syntaxes are recorded before the exchange, matching
    /// what went out on the wire even if the server rejects it.
    pub async fn bind(&mut self, syntax: SyntaxId, transfer_syntax: SyntaxId) -> Result<()> {
        self.syntax = syntax;
        self.transfer_syntax = transfer_syntax;

        let mut pdu = BindPdu::new(
            self.conn.current_call_id(),
            self.context_id,
            syntax,
            transfer_syntax,
        );
        if self.conn.flags().contains(ConnFlags::BIGENDIAN) {
            pdu.header.data_rep = DataRepresentation::big_endian();
        }
        pdu.auth = self.conn.auth_trailer();

        let raw = self.conn.round_trip(pdu.encode()).await?;
        match Pdu::decode(&raw)? {
            Pdu::BindNak(nak) => {
                debug!(reason = nak.reject_reason, "bind rejected");
                Err(map_reject_reason(nak.reject_reason))
            }
            Pdu::BindAck(ack) => {
                let Some(result) = ack.results.first() else {
                    return Err(RpcError::NegotiationFailed("bind ack carried no results"));
                };
                if !result.accepted() {
                    debug!(
                        result = result.result,
                        reason = result.reason,
                        "presentation context rejected"
                    );
                    self.set_last_fault(result.reason as u32);
                    return Err(RpcError::NegotiationFailed("presentation context rejected"));
                }
                self.conn.set_frag_limits(ack.max_xmit_frag, ack.max_recv_frag);
                if let Some(trailer) = ack.auth {
                    if !trailer.auth_value.is_empty() {
                        self.conn.update_auth_token(trailer.auth_value);
                    }
                }
                debug!(
                    peer = %self.conn.peer_name(),
                    syntax = %syntax,
                    max_xmit = ack.max_xmit_frag,
                    max_recv = ack.max_recv_frag,
                    "bind accepted"
                );
                Ok(())
            }
            _ => Err(RpcError::NegotiationFailed("unexpected reply to bind")),
        }
    }

    /// Renegotiates the presentation context on an established connection.
    ///
    /// Fragment limits are fixed at bind time and not touched here; only the
    /// context and any returned credentials change.
    pub async fn alter_context(
        &mut self,
        syntax: SyntaxId,
        transfer_syntax: SyntaxId,
    ) -> Result<()> {
        self.syntax = syntax;
        self.transfer_syntax = transfer_syntax;

        let mut pdu = AlterContextPdu::new(
            self.conn.current_call_id(),
            self.context_id,
            syntax,
            transfer_syntax,
        );
        let (max_xmit_frag, max_recv_frag) = self.conn.frag_limits();
        pdu.max_xmit_frag = max_xmit_frag;
        pdu.max_recv_frag = max_recv_frag;
        if self.conn.flags().contains(ConnFlags::BIGENDIAN) {
            pdu.header.data_rep = DataRepresentation::big_endian();
        }
        pdu.auth = self.conn.auth_trailer();

        let raw = self.conn.round_trip(pdu.encode()).await?;
        match Pdu::decode(&raw)? {
            Pdu::AlterContextResp(resp) => {
                let Some(result) = resp.results.first() else {
                    return Err(RpcError::NegotiationFailed(
                        "alter context response carried no results",
                    ));
                };
                if !result.accepted() {
                    debug!(
                        result = result.result,
                        reason = result.reason,
                        "alter context rejected"
                    );
                    return Err(map_reject_reason(result.reason));
                }
                if let Some(trailer) = resp.auth {
                    if !trailer.auth_value.is_empty() {
                        self.conn.update_auth_token(trailer.auth_value);
                    }
                }
                debug!(syntax = %syntax, "alter context accepted");
                Ok(())
            }
            _ => Err(RpcError::NegotiationFailed(
                "unexpected reply to alter context",
            )),
        }
    }

    /// Sends the AUTH3 leg carrying the final handshake token. One-way:
    /// servers do not acknowledge it.
    pub async fn auth3(&mut self) -> Result<()> {
        let Some(trailer) = self.conn.auth_trailer() else {
            return Err(RpcError::NegotiationFailed("no security context for auth3"));
        };
        if trailer.auth_value.is_empty() {
            return Err(RpcError::NegotiationFailed(
                "auth3 requires handshake credentials",
            ));
        }
        let mut pdu = Auth3Pdu::new(self.conn.next_call_id(), trailer);
        if self.conn.flags().contains(ConnFlags::BIGENDIAN) {
            pdu.header.data_rep = DataRepresentation::big_endian();
        }
        self.conn.send_fragment(pdu.encode(), true).await
    }
}
