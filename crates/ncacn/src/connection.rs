//! Shared per-connection state: call id allocation, negotiated fragment
//! limits, the security context and the table of in-flight calls. The
//! caller-facing [`Pipe`] handle lives here too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{dup_error, Result, RpcError};
use crate::packet::{SyntaxId, FRAG_MAX_SIZE};
use crate::security::{AuthLevel, AuthVerifier, SecurityState};
use crate::transport::Transport;

/// Connection behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnFlags(pub u32);

impl ConnFlags {
    /// Marshal with big-endian integer representation.
    pub const BIGENDIAN: u32 = 1 << 0;
    /// Verify that alignment padding bytes are zero when unmarshalling.
    pub const PAD_CHECK: u32 = 1 << 1;
    /// Allocate storage for reference pointers when unmarshalling.
    pub const REF_ALLOC: u32 = 1 << 2;
    /// Re-parse outgoing stubs and compare against the original bytes.
    pub const VALIDATE_IN: u32 = 1 << 3;
    /// Re-marshal incoming replies and compare against the original bytes.
    pub const VALIDATE_OUT: u32 = 1 << 4;
    /// Treat undrained reply bytes as an error instead of a warning.
    pub const STRICT_REPLY: u32 = 1 << 5;
    /// Authenticate the connection without per-packet protection.
    pub const CONNECT: u32 = 1 << 6;
    /// Sign every request and verify every response.
    pub const SIGN: u32 = 1 << 7;
    /// Seal every request and unseal every response.
    pub const SEAL: u32 = 1 << 8;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Protection level implied by the flags. Seal wins over sign, sign over
    /// connect.
    pub fn auth_level(&self) -> AuthLevel {
        if self.contains(Self::SEAL) {
            AuthLevel::Privacy
        } else if self.contains(Self::SIGN) {
            AuthLevel::Integrity
        } else if self.contains(Self::CONNECT) {
            AuthLevel::Connect
        } else {
            AuthLevel::None
        }
    }
}

/// A fully reassembled call result
#[derive(Debug, Clone)]
pub struct Reply {
    pub stub_data: Bytes,
    /// Endianness of the final response fragment, for unmarshalling.
    pub big_endian: bool,
}

/// Reassembly state for one in-flight call
pub(crate) struct PendingCall {
    pub(crate) payload: BytesMut,
    pub(crate) big_endian: bool,
    pub(crate) tx: oneshot::Sender<Result<Reply>>,
}

/// Well-known fallback session key for unauthenticated connections.
const DEFAULT_SESSION_KEY: &[u8] = b"SystemLibraryDTC";

/// One transport connection shared by every pipe and request on it.
///
/// All state is either atomic or behind short-lived sync locks; nothing here
/// is held across an await point.
pub struct Connection {
    transport: Box<dyn Transport>,
    flags: ConnFlags,
    call_id: AtomicU32,
    srv_max_xmit_frag: AtomicU16,
    srv_max_recv_frag: AtomicU16,
    security: RwLock<Option<SecurityState>>,
    pending: Mutex<HashMap<u32, PendingCall>>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, flags: ConnFlags) -> Self {
        Self {
            transport,
            flags,
            call_id: AtomicU32::new(1),
            srv_max_xmit_frag: AtomicU16::new(FRAG_MAX_SIZE),
            srv_max_recv_frag: AtomicU16::new(FRAG_MAX_SIZE),
            security: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn peer_name(&self) -> String {
        self.transport.peer_name()
    }

    /// Negotiated (xmit, recv) fragment limits.
    pub fn frag_limits(&self) -> (u16, u16) {
        (
            self.srv_max_xmit_frag.load(Ordering::Relaxed),
            self.srv_max_recv_frag.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn srv_max_recv_frag(&self) -> u16 {
        self.srv_max_recv_frag.load(Ordering::Relaxed)
    }

    pub(crate) fn set_frag_limits(&self, max_xmit_frag: u16, max_recv_frag: u16) {
        self.srv_max_xmit_frag.store(max_xmit_frag, Ordering::Relaxed);
        self.srv_max_recv_frag.store(max_recv_frag, Ordering::Relaxed);
    }

    /// Call id a bind-class PDU goes out with. Bind and alter context reuse
    /// the current id without consuming it.
    pub(crate) fn current_call_id(&self) -> u32 {
        self.call_id.load(Ordering::Relaxed)
    }

    /// Allocates a fresh call id. Zero is skipped on wrap so an id of zero
    /// can never match a pending call.
    pub(crate) fn next_call_id(&self) -> u32 {
        let mut id = self.call_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 {
            id = self.call_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        id
    }

    fn sec_read(&self) -> RwLockReadGuard<'_, Option<SecurityState>> {
        self.security.read().unwrap_or_else(|e| e.into_inner())
    }

    fn sec_write(&self) -> RwLockWriteGuard<'_, Option<SecurityState>> {
        self.security.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn pending_lock(&self) -> MutexGuard<'_, HashMap<u32, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installs the security context used for per-packet protection and for
    /// auth trailers on bind-class PDUs.
    pub fn set_security(&self, state: SecurityState) {
        *self.sec_write() = Some(state);
    }

    pub fn has_security(&self) -> bool {
        self.sec_read().is_some()
    }

    /// Auth trailer template carrying the current handshake token.
    pub(crate) fn auth_trailer(&self) -> Option<AuthVerifier> {
        self.sec_read().as_ref().map(|s| s.auth_info.clone())
    }

    /// Replaces the handshake token after the server returned credentials.
    pub(crate) fn update_auth_token(&self, token: Bytes) {
        if let Some(state) = self.sec_write().as_mut() {
            state.set_token(token);
        }
    }

    /// Runs `f` against the security state under the read lock.
    pub(crate) fn with_security<R>(&self, f: impl FnOnce(Option<&SecurityState>) -> R) -> R {
        f(self.sec_read().as_ref())
    }

    /// Session key for application-level crypto. Unauthenticated connections
    /// get the DCE well-known fallback key.
    pub fn session_key(&self) -> Result<Bytes> {
        match self.sec_read().as_ref() {
            Some(state) => state.provider.session_key(),
            None => Ok(Bytes::from_static(DEFAULT_SESSION_KEY)),
        }
    }

    pub(crate) async fn send_fragment(&self, blob: Bytes, last_frag: bool) -> Result<()> {
        self.transport.send_request(blob, last_frag).await
    }

    pub(crate) async fn recv_fragment(&self) -> Result<Bytes> {
        self.transport.send_read().await
    }

    /// One synchronous exchange, used by the bind-class operations which
    /// never overlap with in-flight requests.
    pub(crate) async fn round_trip(&self, blob: Bytes) -> Result<Bytes> {
        self.transport.send_request(blob, true).await?;
        self.transport.send_read().await
    }

    /// Registers a call awaiting its response fragments.
    pub(crate) fn register_call(&self, call_id: u32) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(
            call_id,
            PendingCall {
                payload: BytesMut::new(),
                big_endian: false,
                tx,
            },
        );
        rx
    }

    /// Drops a call from the table, e.g. when its send failed or its waiter
    /// went away. Returns whether it was still pending.
    pub(crate) fn unregister_call(&self, call_id: u32) -> bool {
        self.pending_lock().remove(&call_id).is_some()
    }

    /// Completes every pending call with a copy of `err` and clears the
    /// table. Used when the transport dies: nothing can complete after that.
    pub(crate) fn fail_all(&self, err: &RpcError) {
        let drained: Vec<(u32, PendingCall)> = self.pending_lock().drain().collect();
        if !drained.is_empty() {
            debug!(
                error = %err,
                waiters = drained.len(),
                "transport failure fans out to all pending calls"
            );
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(dup_error(err)));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}

/// A caller's handle on one presentation context over a connection.
///
/// Request operations take `&self` and may run concurrently from many tasks.
/// Negotiation takes `&mut self`, so a bind can never overlap in-flight
/// requests on the same pipe.
pub struct Pipe {
    pub(crate) conn: Arc<Connection>,
    pub(crate) syntax: SyntaxId,
    pub(crate) transfer_syntax: SyntaxId,
    pub(crate) context_id: u16,
    pub(crate) last_fault: Arc<AtomicU32>,
}

impl Pipe {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_flags(transport, ConnFlags::default())
    }

    pub fn with_flags(transport: Box<dyn Transport>, flags: ConnFlags) -> Self {
        Self {
            conn: Arc::new(Connection::new(transport, flags)),
            syntax: SyntaxId::nil(),
            transfer_syntax: SyntaxId::nil(),
            context_id: 0,
            last_fault: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Abstract syntax this pipe last negotiated.
    pub fn syntax(&self) -> SyntaxId {
        self.syntax
    }

    pub fn transfer_syntax(&self) -> SyntaxId {
        self.transfer_syntax
    }

    pub fn context_id(&self) -> u16 {
        self.context_id
    }

    /// Fault status of the most recent failed call, zero after a success.
    pub fn last_fault_code(&self) -> u32 {
        self.last_fault.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_fault(&self, code: u32) {
        self.last_fault.store(code, Ordering::Relaxed);
    }

    pub fn session_key(&self) -> Result<Bytes> {
        self.conn.session_key()
    }

    pub fn peer_name(&self) -> String {
        self.conn.peer_name()
    }
}
