//! External capabilities the engine calls into.
//!
//! Three seams: publisher resolution, byte fetch (favicons), and the remote
//! ledger client. Each is a trait so the core never depends on transport
//! internals; the ledger client additionally ships a scriptable double for
//! tests and embedders without a live backend.

pub mod client;
pub mod fetch;
pub mod resolver;

pub use client::{
    AlphaState, ClientFactory, ClientOptions, ClientState, LedgerClient, LogEntry,
    MockLedgerClient, PaymentInfo, SyncResponse,
};
pub use fetch::{image_data_uri, BytesFetcher, FetchedBody, HttpFetcher};
pub use resolver::{DomainResolver, PublisherResolver};
