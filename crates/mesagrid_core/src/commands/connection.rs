//! Connection profile and pool commands.

use super::parse_id;
use crate::error::ErrorResponse;
use crate::models::{ConnectionProfile, PoolStatus, ProfileDraft, ProfilePatch, Secret, TestConnectionResult};
use crate::state::CoreState;

use serde::Deserialize;
use std::collections::HashMap;

/// Profile fields plus the password to store in the vault.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionRequest {
    /// Connectivity fields
    #[serde(flatten)]
    pub profile: ProfileDraft,
    /// Password, written to the vault only
    pub password: String,
}

/// Partial profile edit with an optional new password.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectionRequest {
    /// Profile id
    pub id: String,
    /// Fields to change
    #[serde(flatten)]
    pub patch: ProfilePatch,
    /// Replacement password
    #[serde(default)]
    pub password: Option<String>,
}

/// Save a new profile. Returns its id.
pub fn create_connection(state: &CoreState, request: CreateConnectionRequest) -> Result<String, ErrorResponse> {
    let profile = state.registry().create(request.profile, &Secret::new(request.password))?;
    Ok(profile.id.to_string())
}

/// Edit a saved profile.
pub fn update_connection(
    state: &CoreState,
    request: UpdateConnectionRequest,
) -> Result<ConnectionProfile, ErrorResponse> {
    let id = parse_id(&request.id, "connection")?;
    let password = request.password.map(Secret::new);
    Ok(state.registry().update(id, request.patch, password.as_ref())?)
}

/// Get one saved profile.
pub fn get_connection(state: &CoreState, id: &str) -> Result<ConnectionProfile, ErrorResponse> {
    let id = parse_id(id, "connection")?;
    Ok(state.registry().get(id)?)
}

/// All saved profiles. Never includes passwords.
pub fn list_connections(state: &CoreState) -> Vec<ConnectionProfile> {
    state.registry().list()
}

/// Delete a profile, its password and its pool.
pub fn delete_connection(state: &CoreState, id: &str) -> Result<(), ErrorResponse> {
    let id = parse_id(id, "connection")?;
    state.registry().delete(id)?;
    state.schema().invalidate(id);
    Ok(())
}

/// Try connectivity settings without saving them. Never fails.
pub async fn test_connection(state: &CoreState, profile: ProfileDraft, password: String) -> TestConnectionResult {
    state.registry().pools().test_connection(&profile, &Secret::new(password)).await
}

/// Open the profile's pool.
pub async fn connect(state: &CoreState, id: &str) -> Result<PoolStatus, ErrorResponse> {
    let id = parse_id(id, "connection")?;
    Ok(state.registry().connect(id).await?)
}

/// Close the profile's pool.
pub fn disconnect(state: &CoreState, id: &str) -> Result<(), ErrorResponse> {
    let id = parse_id(id, "connection")?;
    state.registry().disconnect(id)?;
    Ok(())
}

/// Status of one pool, or `None` when the profile is not connected.
pub fn pool_status(state: &CoreState, id: &str) -> Result<Option<PoolStatus>, ErrorResponse> {
    let id = parse_id(id, "connection")?;
    Ok(state.registry().pools().status(id))
}

/// Status of every open pool, keyed by profile id.
pub fn pool_statuses(state: &CoreState) -> HashMap<String, PoolStatus> {
    state
        .registry()
        .pools()
        .statuses()
        .into_iter()
        .map(|(id, status)| (id.to_string(), status))
        .collect()
}
