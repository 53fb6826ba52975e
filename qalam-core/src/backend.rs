//! Backend collaborator contracts.
//!
//! The cache treats every backend call as an async request that may fail; it
//! does not care whether the transport is HTTP, RPC or a direct query.

use async_trait::async_trait;
use std::time::Duration;

use crate::{AvatarRecord, InventoryItem, QalamResult, SubjectId};

/// The backend locations an avatar may live in.
#[async_trait]
pub trait AvatarBackend: Send + Sync {
    /// Direct avatar record for the subject, if any.
    async fn avatar_record(&self, subject: &SubjectId) -> QalamResult<Option<AvatarRecord>>;

    /// Full inventory through the inventory service endpoint.
    async fn inventory_via_service(&self, subject: &SubjectId) -> QalamResult<Vec<InventoryItem>>;

    /// The equipped avatar item through a direct inventory query.
    async fn equipped_avatar_direct(
        &self,
        subject: &SubjectId,
    ) -> QalamResult<Option<InventoryItem>>;

    /// Issue a fresh signed URL for a storage path.
    async fn create_signed_url(
        &self,
        path: &str,
        expires_in: Duration,
    ) -> QalamResult<Option<String>>;
}
