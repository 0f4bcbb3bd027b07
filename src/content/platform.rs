use serde::{Deserialize, Serialize};

/// Platform field of an image descriptor
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Returns a platform with just architecture and os,
    ///
    pub fn new(architecture: impl Into<String>, os: impl Into<String>) -> Self {
        Platform {
            architecture: architecture.into(),
            os: os.into(),
            os_version: None,
            os_features: None,
            variant: None,
        }
    }

    /// Sets the variant, chainable
    ///
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Returns true when an index entry with this platform satisfies the wanted platform,
    ///
    /// Architecture and os must match exactly. The variant is compared only
    /// when both sides specify one, a caller without a variant matches any
    /// entry variant.
    ///
    pub fn matches(&self, wanted: &Platform) -> bool {
        if self.architecture != wanted.architecture || self.os != wanted.os {
            return false;
        }
        match (self.variant.as_ref(), wanted.variant.as_ref()) {
            (Some(have), Some(want)) => have == want,
            _ => true,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = self.variant.as_ref() {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}
