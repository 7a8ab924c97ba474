//! Backend services for the MesaGrid core.
//!
//! - `credentials` - OS keychain integration for connection passwords
//! - `storage` - Local SQLite storage for connection metadata
//! - `registry` - Connection profiles and their runtime pools
//! - `pool` - Per-profile connection pools over deadpool
//! - `guard` - Lexical classification of destructive statements
//! - `query` - Ad-hoc query execution with cancellation
//! - `schema` - Catalog introspection with a per-profile cache
//! - `pager` - Keyset and offset table paging
//! - `mutation` - Single-row insert, update and delete

pub mod credentials;
pub mod guard;
pub mod mutation;
pub mod pager;
pub mod pool;
pub mod query;
pub mod registry;
pub mod schema;
pub mod storage;

pub use credentials::{CredentialVault, CredentialsProvider};
pub use mutation::MutationEngine;
pub use pager::CursorPager;
pub use pool::{PoolManager, PooledConnection, ProfilePool};
pub use query::QueryExecutor;
pub use registry::ConnectionRegistry;
pub use schema::SchemaIntrospector;
pub use storage::LocalStorage;
