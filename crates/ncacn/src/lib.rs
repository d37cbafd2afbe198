//! Connection-oriented DCE/RPC (MSRPC) client runtime.
//!
//! Implements the `ncacn` wire protocol from the fragment layer up: PDU
//! encoding and decoding, bind and alter-context negotiation, per-packet
//! sign and seal, chunked requests with demultiplexing of interleaved
//! replies, and a small NDR layer for typed calls.
//!
//! Calls multiplex freely: many tasks can issue requests on one [`Pipe`] and
//! each waiter receives exactly its own reply, with faults and transport
//! failures routed to the calls they affect.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use ncacn::{connect_tcp, Pipe, SyntaxId, Uuid, NDR_TRANSFER_SYNTAX};
//!
//! const EPM: SyntaxId = SyntaxId::new(
//!     Uuid {
//!         data1: 0xe1af8308,
//!         data2: 0x5d1f,
//!         data3: 0x11c9,
//!         data4: [0x91, 0xa4, 0x08, 0x00, 0x2b, 0x14, 0xa0, 0xfa],
//!     },
//!     3,
//!     0,
//! );
//!
//! # async fn run() -> ncacn::Result<()> {
//! let transport = connect_tcp("server.example", 135).await?;
//! let mut pipe = Pipe::new(Box::new(transport));
//! pipe.bind(EPM, NDR_TRANSFER_SYNTAX).await?;
//!
//! // epm_Map is opnum 3 on the endpoint mapper
//! let reply = pipe.request(None, 3, Bytes::from_static(&[0u8; 4])).await?;
//! println!("{} reply bytes", reply.stub_data.len());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod ndr;
pub mod negotiate;
pub mod packet;
pub mod registry;
pub mod request;
pub mod security;
pub mod transport;

pub use connection::{ConnFlags, Connection, Pipe, Reply};
pub use error::{fault_string, Result, RpcError};
pub use ndr::{NdrCall, NdrDirection, NdrMarshal, NdrPull, NdrPush};
pub use packet::{
    DataRepresentation, PacketFlags, PacketType, Pdu, PduHeader, SyntaxId, Uuid, FRAG_MAX_SIZE,
    NDR_TRANSFER_SYNTAX,
};
pub use registry::{CallDef, InterfaceRegistry, InterfaceTable};
pub use request::RpcRequest;
pub use security::{AuthLevel, AuthType, AuthVerifier, SecurityProvider, SecurityState};
pub use transport::{connect_tcp, StreamTransport, Transport, DEFAULT_MAX_PDU_SIZE};
