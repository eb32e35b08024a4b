//! Stored images and their resized renditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Fixed rendition presets generated for every uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum VariantSize {
    Small,
    Medium,
    Large,
    Original,
}

impl VariantSize {
    /// Generation order.
    pub const ALL: [VariantSize; 4] = [
        VariantSize::Small,
        VariantSize::Medium,
        VariantSize::Large,
        VariantSize::Original,
    ];

    /// Target width in pixels; `None` keeps the source width.
    pub fn width(&self) -> Option<u32> {
        match self {
            VariantSize::Small => Some(480),
            VariantSize::Medium => Some(1024),
            VariantSize::Large => Some(1920),
            VariantSize::Original => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantSize::Small => "small",
            VariantSize::Medium => "medium",
            VariantSize::Large => "large",
            VariantSize::Original => "original",
        }
    }
}

impl fmt::Display for VariantSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded rendition of an image.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ImageVariant {
    pub size: VariantSize,

    /// Public URL of the stored rendition.
    pub url: String,

    pub width: u32,
    pub height: u32,

    /// Object key in the store; internal only.
    #[serde(skip)]
    pub storage_key: String,
}

/// An image whose variants were generated and stored.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub id: Uuid,
    pub original_name: String,
    pub variants: Vec<ImageVariant>,
    pub created_at: DateTime<Utc>,
}

/// Row shape of the `images` table.
#[derive(Clone, FromRow, Debug)]
pub struct ImageRow {
    pub id: Uuid,
    pub original_name: String,
    pub created_at: DateTime<Utc>,
}
