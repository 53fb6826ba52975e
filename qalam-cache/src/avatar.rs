//! Avatar sources.
//!
//! A subject's avatar is either a custom upload in the avatar table or an
//! equipped shop item in the inventory. The inventory is read through the
//! service endpoint first and through a direct query as a last resort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use qalam_core::{
    AvatarBackend, AvatarProfile, AvatarSource, ChangeEvent, EntityKind, QalamResult, SubjectId,
};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::resolver::{SourceFallbackResolver, SourceProbe, ValueRepair};

/// Change-notification tables that affect avatars.
pub const AVATAR_TABLE: &str = "avatars";
pub const INVENTORY_TABLE: &str = "user_inventory";

/// Shortest stored URL treated as intact.
const MIN_URL_LEN: usize = 50;

/// Lifetime of re-issued signed URLs.
const SIGNED_URL_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

static STORAGE_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"/(profile/avatar/[^?]+)").ok());

/// Custom upload in the avatar table.
pub struct AvatarRecordProbe {
    backend: Arc<dyn AvatarBackend>,
}

impl AvatarRecordProbe {
    pub fn new(backend: Arc<dyn AvatarBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SourceProbe<AvatarProfile> for AvatarRecordProbe {
    fn name(&self) -> &str {
        AvatarSource::AvatarRecord.as_str()
    }

    async fn probe(&self, subject: &SubjectId, _kind: EntityKind) -> QalamResult<Option<AvatarProfile>> {
        let record = self.backend.avatar_record(subject).await?;
        Ok(record
            .filter(|r| !r.avatar.is_empty())
            .map(|r| AvatarProfile::from_record(&r, r.avatar.clone())))
    }
}

/// Equipped avatar from the full inventory listing.
pub struct InventoryServiceProbe {
    backend: Arc<dyn AvatarBackend>,
}

impl InventoryServiceProbe {
    pub fn new(backend: Arc<dyn AvatarBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SourceProbe<AvatarProfile> for InventoryServiceProbe {
    fn name(&self) -> &str {
        AvatarSource::InventoryService.as_str()
    }

    async fn probe(&self, subject: &SubjectId, _kind: EntityKind) -> QalamResult<Option<AvatarProfile>> {
        let items = self.backend.inventory_via_service(subject).await?;
        Ok(items
            .iter()
            .find(|item| item.is_equipped_avatar())
            .and_then(|item| item.shop_item.as_ref())
            .map(|shop| AvatarProfile::from_shop_item(shop, AvatarSource::InventoryService)))
    }
}

/// Equipped avatar through a direct inventory query.
pub struct InventoryDirectProbe {
    backend: Arc<dyn AvatarBackend>,
}

impl InventoryDirectProbe {
    pub fn new(backend: Arc<dyn AvatarBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SourceProbe<AvatarProfile> for InventoryDirectProbe {
    fn name(&self) -> &str {
        AvatarSource::InventoryDirect.as_str()
    }

    async fn probe(&self, subject: &SubjectId, _kind: EntityKind) -> QalamResult<Option<AvatarProfile>> {
        let item = self.backend.equipped_avatar_direct(subject).await?;
        Ok(item
            .as_ref()
            .and_then(|item| item.shop_item.as_ref())
            .map(|shop| AvatarProfile::from_shop_item(shop, AvatarSource::InventoryDirect)))
    }
}

/// Re-issues signed URLs for avatar records whose stored URL is truncated
/// or a bare storage path.
pub struct SignedUrlRepair {
    backend: Arc<dyn AvatarBackend>,
}

impl SignedUrlRepair {
    pub fn new(backend: Arc<dyn AvatarBackend>) -> Self {
        Self { backend }
    }

    /// A stored URL is usable if it is absolute and not implausibly short.
    pub fn is_plausible_url(url: &str) -> bool {
        url.starts_with("http") && url.len() >= MIN_URL_LEN
    }

    /// Storage path (`profile/avatar/...`) embedded in a stored URL.
    pub fn storage_path(url: &str) -> Option<&str> {
        STORAGE_PATH
            .as_ref()?
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

#[async_trait]
impl ValueRepair<AvatarProfile> for SignedUrlRepair {
    fn needs_repair(&self, source: &str, value: &AvatarProfile) -> bool {
        source == AvatarSource::AvatarRecord.as_str() && !Self::is_plausible_url(&value.image)
    }

    async fn repair(&self, subject: &SubjectId, value: &AvatarProfile) -> QalamResult<Option<AvatarProfile>> {
        let Some(path) = Self::storage_path(&value.image) else {
            debug!(subject = %subject, "No storage path in stored avatar URL");
            return Ok(None);
        };
        let signed = self.backend.create_signed_url(path, SIGNED_URL_TTL).await?;
        Ok(signed.map(|url| AvatarProfile {
            is_video: AvatarProfile::detect_video(&url),
            image: url,
            ..value.clone()
        }))
    }
}

/// Avatar resolver: avatar record, then inventory service, then direct
/// inventory query, with signed-URL repair for avatar records.
pub fn avatar_resolver(backend: Arc<dyn AvatarBackend>) -> SourceFallbackResolver<AvatarProfile> {
    SourceFallbackResolver::new()
        .with_probe(AvatarRecordProbe::new(Arc::clone(&backend)))
        .with_probe(InventoryServiceProbe::new(Arc::clone(&backend)))
        .with_probe(InventoryDirectProbe::new(Arc::clone(&backend)))
        .with_repair(SignedUrlRepair::new(backend))
}

/// Inventory changes that can affect the equipped avatar: the new or the
/// old row is an avatar item.
pub fn inventory_avatar_changed(event: &ChangeEvent) -> bool {
    let avatar = Value::String("avatar".to_string());
    event.touches("item_type", &avatar)
}
