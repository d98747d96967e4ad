//! Discovered endpoint patterns.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse category of a captured payload.
///
/// Categories are a routing hint only; nothing in the pipeline interprets the
/// payload beyond assigning one of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Medications,
    Allergies,
    Problems,
    Vitals,
    Labs,
    Immunizations,
    Encounters,
    Orders,
    Demographics,
    /// Free-text clinical notes.
    Notes,
    /// Attached or scanned documents.
    Documents,
    Unknown,
}

impl DataCategory {
    pub const ALL: [DataCategory; 12] = [
        DataCategory::Medications,
        DataCategory::Allergies,
        DataCategory::Problems,
        DataCategory::Vitals,
        DataCategory::Labs,
        DataCategory::Immunizations,
        DataCategory::Encounters,
        DataCategory::Orders,
        DataCategory::Demographics,
        DataCategory::Notes,
        DataCategory::Documents,
        DataCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataCategory::Medications => "medications",
            DataCategory::Allergies => "allergies",
            DataCategory::Problems => "problems",
            DataCategory::Vitals => "vitals",
            DataCategory::Labs => "labs",
            DataCategory::Immunizations => "immunizations",
            DataCategory::Encounters => "encounters",
            DataCategory::Orders => "orders",
            DataCategory::Demographics => "demographics",
            DataCategory::Notes => "notes",
            DataCategory::Documents => "documents",
            DataCategory::Unknown => "unknown",
        }
    }

    /// Parse a category name, accepting a few common singular forms.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let found = DataCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == name || c.as_str().strip_suffix('s') == Some(name.as_str()));
        found.or(match name.as_str() {
            "medication" | "meds" => Some(DataCategory::Medications),
            "allergy" => Some(DataCategory::Allergies),
            "lab" | "results" => Some(DataCategory::Labs),
            _ => None,
        })
    }

    /// Narrative categories are handed to a summarizer rather than stored raw.
    pub fn is_narrative(self) -> bool {
        matches!(self, DataCategory::Notes | DataCategory::Documents)
    }
}

impl std::fmt::Display for DataCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized endpoint and its discovery metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointPattern {
    pub normalized_key: String,
    /// The first concrete URL that produced this pattern.
    pub original_sample: String,
    pub method: String,
    pub data_category: DataCategory,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub query_params: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_schema: Option<serde_json::Value>,
}

impl EndpointPattern {
    pub fn new(
        normalized_key: impl Into<String>,
        original_sample: impl Into<String>,
        method: impl Into<String>,
        data_category: DataCategory,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            normalized_key: normalized_key.into(),
            original_sample: original_sample.into(),
            method: method.into(),
            data_category,
            first_seen: seen_at,
            last_seen: seen_at,
            use_count: 1,
            query_params: BTreeSet::new(),
            inferred_schema: None,
        }
    }

    /// Record another sighting. `last_seen` only ever moves forward.
    pub fn touch(&mut self, seen_at: DateTime<Utc>) {
        self.use_count += 1;
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn touch_keeps_latest_timestamp() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        let mut pattern =
            EndpointPattern::new("h/chart/{id}", "h/chart/1", "GET", DataCategory::Unknown, t1);
        pattern.touch(t0);
        assert_eq!(pattern.use_count, 2);
        assert_eq!(pattern.last_seen, t1);
        assert_eq!(pattern.first_seen, t1);
    }

    #[test]
    fn parses_category_names() {
        assert_eq!(DataCategory::parse("Allergy"), Some(DataCategory::Allergies));
        assert_eq!(DataCategory::parse("note"), Some(DataCategory::Notes));
        assert_eq!(DataCategory::parse("labs"), Some(DataCategory::Labs));
        assert_eq!(DataCategory::parse("weather"), None);
        assert!(DataCategory::Documents.is_narrative());
        assert!(!DataCategory::Vitals.is_narrative());
    }
}
