//! Persisted store, object store and fetch plumbing for the daily collector.

pub mod blob;
pub mod http;
pub mod memory;
pub mod paginate;
pub mod postgres;
pub mod store;

pub use blob::{latest_json, put_json, snapshot_key, BlobError, BlobStore, FsBlobStore, StoredBlob};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::MemoryEventStore;
pub use paginate::{
    CredentialPool, DayReport, DayTermination, EmptyCredentialPool, FetchCursor, FetchPolicy,
    FetchSession, PageBody, PageClient, PageError, PageRequest, RawPage,
    ResilientPaginatedFetcher, WindowFetch,
};
pub use postgres::PgEventStore;
pub use store::{EventStore, StoreError};

pub const CRATE_NAME: &str = "dhc-storage";
