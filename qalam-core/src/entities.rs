//! Normalized entity shapes handed to the cache.

use serde::{Deserialize, Serialize};

/// Level assigned to a subject that has not earned anything yet.
pub const DEFAULT_LEVEL: u32 = 1;

/// Outcome of resolving an entity across its backend sources.
///
/// `Absent` is a valid terminal state (a subject with no avatar), cached like
/// any other value. It is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolved<V> {
    Found { value: V, source: String },
    Absent,
}

impl<V> Resolved<V> {
    pub fn found(value: V, source: impl Into<String>) -> Self {
        Resolved::Found {
            value,
            source: source.into(),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Resolved::Absent)
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Resolved::Found { value, .. } => Some(value),
            Resolved::Absent => None,
        }
    }

    /// Name of the source that produced the value.
    pub fn source(&self) -> Option<&str> {
        match self {
            Resolved::Found { source, .. } => Some(source),
            Resolved::Absent => None,
        }
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            Resolved::Found { value, .. } => Some(value),
            Resolved::Absent => None,
        }
    }
}

/// Where an avatar was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarSource {
    /// Direct avatar record (custom upload).
    AvatarRecord,
    /// Equipped inventory item via the inventory service endpoint.
    InventoryService,
    /// Equipped inventory item via a direct query.
    InventoryDirect,
}

impl AvatarSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarSource::AvatarRecord => "avatar-record",
            AvatarSource::InventoryService => "inventory-service",
            AvatarSource::InventoryDirect => "inventory-direct",
        }
    }
}

/// The one avatar shape every source is normalized into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarProfile {
    pub id: String,
    pub name: String,
    /// Image or video URL.
    pub image: String,
    pub thumbnail: Option<String>,
    pub source: AvatarSource,
    pub is_video: bool,
}

impl AvatarProfile {
    /// Custom uploads live under `/profile/avatar/` and are always videos.
    pub fn detect_video(url: &str) -> bool {
        url.contains("/profile/avatar/") || url.ends_with(".mp4")
    }

    pub fn from_record(record: &AvatarRecord, image: String) -> Self {
        Self {
            id: record.id.clone(),
            name: "Custom Avatar".to_string(),
            is_video: Self::detect_video(&image),
            image,
            thumbnail: None,
            source: AvatarSource::AvatarRecord,
        }
    }

    pub fn from_shop_item(item: &ShopItem, source: AvatarSource) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            image: item.image.clone(),
            thumbnail: item.thumbnail.clone(),
            source,
            is_video: Self::detect_video(&item.image),
        }
    }
}

/// Row of the direct avatar table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarRecord {
    pub id: String,
    /// Stored URL, possibly truncated or a bare storage path.
    pub avatar: String,
}

/// Catalogue entry of the shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopItem {
    pub id: String,
    pub name: String,
    pub image: String,
    pub thumbnail: Option<String>,
}

/// Row of a subject's inventory, joined with its shop item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub item_type: String,
    pub is_equipped: bool,
    pub shop_item: Option<ShopItem>,
}

impl InventoryItem {
    pub fn is_equipped_avatar(&self) -> bool {
        self.item_type == "avatar" && self.is_equipped
    }
}

/// Computed level of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub level: u32,
    pub description: String,
    pub xp: u64,
}

impl LevelInfo {
    /// The level every new subject starts on.
    pub fn unearned() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            description: "Pemula".to_string(),
            xp: 0,
        }
    }

    /// Nothing earned yet; such values are re-checked sooner.
    pub fn is_unearned(&self) -> bool {
        self.level <= DEFAULT_LEVEL && self.xp == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_video() {
        assert!(AvatarProfile::detect_video(
            "https://cdn.example.com/storage/v1/object/sign/profile/avatar/u1.webm?token=x"
        ));
        assert!(AvatarProfile::detect_video("https://cdn.example.com/a.mp4"));
        assert!(!AvatarProfile::detect_video("https://cdn.example.com/a.png"));
    }

    #[test]
    fn test_from_shop_item_normalizes() {
        let item = ShopItem {
            id: "s1".to_string(),
            name: "Knight".to_string(),
            image: "https://cdn.example.com/knight.mp4".to_string(),
            thumbnail: Some("https://cdn.example.com/knight.png".to_string()),
        };
        let profile = AvatarProfile::from_shop_item(&item, AvatarSource::InventoryDirect);
        assert_eq!(profile.id, "s1");
        assert!(profile.is_video);
        assert_eq!(profile.source, AvatarSource::InventoryDirect);
    }

    #[test]
    fn test_resolved_accessors() {
        let found = Resolved::found(7, "avatar-record");
        assert_eq!(found.value(), Some(&7));
        assert_eq!(found.source(), Some("avatar-record"));
        assert!(!found.is_absent());

        let absent: Resolved<i32> = Resolved::Absent;
        assert!(absent.is_absent());
        assert_eq!(absent.into_option(), None);
    }

    #[test]
    fn test_level_unearned() {
        assert!(LevelInfo::unearned().is_unearned());
        let zero = LevelInfo {
            level: 0,
            description: "Persiapan".to_string(),
            xp: 0,
        };
        assert!(zero.is_unearned());
        let earned = LevelInfo {
            level: 3,
            description: "Menengah".to_string(),
            xp: 1200,
        };
        assert!(!earned.is_unearned());
    }

    #[test]
    fn test_inventory_equipped_avatar() {
        let item = InventoryItem {
            id: "i1".to_string(),
            item_type: "avatar".to_string(),
            is_equipped: true,
            shop_item: None,
        };
        assert!(item.is_equipped_avatar());
    }
}
