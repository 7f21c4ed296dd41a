//! Asset descriptors identifying remote files and images

use serde::{Deserialize, Serialize};

/// What kind of object an asset is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Arbitrary file, fetched by content hash only
    File,
    /// Image with server-side size-tiered variants
    Image,
}

/// Size variant requested for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    /// Low-resolution preview generated by the server
    Thumbnail,
    Small,
    Medium,
    Large,
    /// Unscaled upload
    Original,
}

impl SizeTier {
    /// String form used in cache keys and requests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Original => "original",
        }
    }
}

/// Identifies one remote object
///
/// Immutable once a transfer begins. Used both to query the local cache and to
/// build outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Content hash assigned by the server
    pub hash: String,

    /// Remote URL, when the server provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// File or image
    pub kind: AssetKind,

    /// Size tier for image variants (`None` for plain files)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<SizeTier>,
}

impl AssetDescriptor {
    /// Describe a plain file
    pub fn file(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            url: None,
            kind: AssetKind::File,
            tier: None,
        }
    }

    /// Describe an image at the given size tier
    pub fn image(hash: impl Into<String>, url: Option<String>, tier: SizeTier) -> Self {
        Self {
            hash: hash.into(),
            url,
            kind: AssetKind::Image,
            tier: Some(tier),
        }
    }

    /// Returns true if this asset has size-tiered variants
    pub fn is_image(&self) -> bool {
        self.kind == AssetKind::Image
    }

    /// Descriptor of the thumbnail variant of this asset
    pub fn preview(&self) -> Self {
        Self {
            tier: Some(SizeTier::Thumbnail),
            ..self.clone()
        }
    }

    /// Stable key for content-addressed local storage
    ///
    /// Prefers the content hash, falling back to the URL for assets the server
    /// has not hashed yet. The tier is appended so every variant of an image
    /// gets its own slot.
    pub fn cache_key(&self) -> String {
        let base = if self.hash.is_empty() {
            self.url.as_deref().unwrap_or_default()
        } else {
            self.hash.as_str()
        };
        match self.tier {
            Some(tier) => format!("{base}@{}", tier.as_str()),
            None => base.to_string(),
        }
    }
}
