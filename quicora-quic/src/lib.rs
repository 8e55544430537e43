//! # quicora-quic: operation-serialized QUIC connection core
//!
//! The per-connection core of a QUIC endpoint (draft-23): handshake
//! orchestration, packet decode/encode, acknowledgement tracking,
//! connection ID management, key updates, idle/keep-alive/shutdown
//! timers, and the close state machine, all serialized through a
//! per-connection operation queue drained by a single worker.
//!
//! ## Architecture
//!
//! ```text
//! quicora-quic/
//! ├── error       - wire error codes and internal statuses
//! ├── types       - varints, connection IDs, time, limits
//! ├── version     - the single supported protocol version
//! ├── packet      - headers, packet numbers, HP, spaces, ack tracking
//! ├── frames      - frame types, parsing, encoding
//! ├── crypto      - TLS-engine and cipher contracts, key state
//! ├── transport   - transport parameters, resumption blobs
//! ├── recovery    - RTT estimation and loss-detection seams
//! ├── stream      - stream-set seam (resolution + limits)
//! ├── binding     - CID lookup table seam
//! ├── worker      - scheduler / timer-wheel seam
//! └── connection  - the connection state machine itself
//! ```
//!
//! ## Execution model
//!
//! The crate performs no I/O and reads no clocks. Datagrams enter via
//! [`Connection::queue_datagrams`], API calls via the `api_*` methods
//! (both thread-safe, both enqueue operations), and the owning worker
//! calls [`Connection::drain`] and [`Connection::on_timer_wheel_fired`]
//! with the current time. Outbound datagrams accumulate until
//! [`Connection::take_transmits`].

#![forbid(unsafe_code)]

pub mod binding;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod stream;
pub mod transport;
pub mod types;
pub mod version;
pub mod worker;

pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, Lifecycle, Statistics,
};
pub use error::{Status, TransportError};
pub use types::{ConnectionId, Instant, RecvDatagram, Side};
pub use version::{QuicVersion, VERSION_DRAFT_23};
