//! Connectivity and query-execution core for the MesaGrid database client.
//!
//! This crate provides everything below the presentation layer:
//!
//! - **error**: Error taxonomy and the structured error response
//! - **config**: Pool sizing, row bounds and cache policy
//! - **logging**: Structured logging setup
//! - **models**: Profiles, typed values, query results, pages and mutations
//! - **engine**: PostgreSQL and MySQL drivers behind one connection trait
//! - **services**: Vault, registry, pools, executor, introspector, pager, mutations
//! - **state**: Process-wide service wiring
//! - **commands**: The command surface consumed by the UI

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod test_support;
mod verification_tests;

pub use config::CoreConfig;
pub use error::{ConnectionError, CoreError, ErrorResponse, MutationError, QueryError, VaultError};
pub use models::{
    ColumnDetail, ColumnMetadata, ConnectionProfile, Cursor, EngineType, MutationRequest, Page,
    PageOptions, PoolStatus, ProfileDraft, QueryRequest, QueryResult, Row, Secret, TableDescriptor,
    TableRef, Value,
};
pub use services::{
    ConnectionRegistry, CredentialVault, CursorPager, LocalStorage, MutationEngine, PoolManager,
    QueryExecutor, SchemaIntrospector,
};
pub use state::CoreState;
