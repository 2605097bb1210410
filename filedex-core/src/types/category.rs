use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Coarse content category assigned to every indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Document,
    Image,
    Video,
    Audio,
    Archive,
    Folder,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Document,
        Category::Image,
        Category::Video,
        Category::Audio,
        Category::Archive,
        Category::Folder,
        Category::Other,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Archive => "archive",
            Self::Folder => "folder",
            Self::Other => "other",
        }
    }

    /// Human-facing label, capitalised the way the dashboard shows it.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Document => "Document",
            Self::Image => "Image",
            Self::Video => "Video",
            Self::Audio => "Audio",
            Self::Archive => "Archive",
            Self::Folder => "Folder",
            Self::Other => "Other",
        }
    }

    /// Directory name used under the organized-files root.
    pub const fn folder_name(self) -> &'static str {
        match self {
            Self::Document => "Documents",
            Self::Image => "Images",
            Self::Video => "Videos",
            Self::Audio => "Audio",
            Self::Archive => "Archives",
            Self::Folder => "Folders",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCategoryError {
    invalid_value: String,
}

impl ParseCategoryError {
    pub fn new(value: &str) -> Self {
        Self {
            invalid_value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseCategoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid category: {}", self.invalid_value)
    }
}

impl std::error::Error for ParseCategoryError {}

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseCategoryError::new(value))
    }
}
