//! Data models for the MesaGrid core.
//!
//! - `connection` - ConnectionProfile, ProfileDraft, Secret, PoolStatus
//! - `value` - Value, Row
//! - `query` - QueryRequest, QueryResult, QueryHandle, classifications
//! - `schema` - TableDescriptor, ColumnMetadata, ColumnDetail
//! - `page` - Page, PageOptions, Cursor
//! - `mutation` - MutationRequest, KeyPart

pub mod connection;
pub mod mutation;
pub mod page;
pub mod query;
pub mod schema;
pub mod value;

pub use connection::{
    ConnectionProfile, EngineType, PoolStatus, ProfileDraft, ProfilePatch, Secret,
    TestConnectionResult,
};
pub use mutation::{KeyPart, MutationChange, MutationRequest, MutationResult};
pub use page::{
    CountMode, Cursor, CursorPosition, Page, PageOptions, PagingStrategy, SortDirection,
};
pub use query::{
    ActiveQuery, Classification, DestructiveKind, QueryHandle, QueryRequest, QueryResult,
    StatementKind,
};
pub use schema::{ColumnDetail, ColumnMetadata, TableDescriptor, TableKind, TableRef};
pub use value::{Row, Value};
