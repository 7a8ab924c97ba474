//! Command surface consumed by the presentation layer.
//!
//! Every command takes plain serde types, parses string ids, and returns
//! either a serializable value or an [`ErrorResponse`]. No driver handle or
//! raw driver error crosses this boundary.

pub mod connection;
pub mod query;
pub mod table;

pub use connection::*;
pub use query::*;
pub use table::*;

use crate::error::{CoreError, ErrorResponse};
use uuid::Uuid;

/// Parse an id received as a string.
pub(crate) fn parse_id(value: &str, what: &str) -> Result<Uuid, ErrorResponse> {
    Uuid::parse_str(value.trim())
        .map_err(|e| CoreError::validation(format!("Invalid {what} ID: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_rejects_garbage() {
        let err = parse_id("not-a-uuid", "connection").unwrap_err();
        assert_eq!(err.kind, "Validation");
        assert!(err.message.contains("Invalid connection ID"));

        let id = Uuid::new_v4();
        assert_eq!(parse_id(&format!(" {id} "), "query").unwrap(), id);
    }
}
