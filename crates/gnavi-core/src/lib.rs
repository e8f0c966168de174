//! Core domain model for Grant Navi: grant records, title normalization,
//! URL validation and the organization fallback directory.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "gnavi-core";

/// Geographic scope of the issuing authority. A municipal listing is stored
/// as `Prefecture` plus a non-empty `area_city`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    National,
    Prefecture,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::National => "national",
            Level::Prefecture => "prefecture",
        }
    }

    /// Lenient parse; unknown values fall back to `National`, matching how
    /// upstream CSVs defaulted the column.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim() {
            "prefecture" => Level::Prefecture,
            _ => Level::National,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical pre-persistence record shape. Scrapers emit it, the CSV reader
/// produces it, and the reconciler consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GrantDraft {
    #[serde(rename = "type")]
    pub grant_type: String,
    pub title: String,
    pub description: String,
    pub organization: String,
    pub level: Level,
    pub area_prefecture: String,
    pub area_city: String,
    pub industry: String,
    pub target_type: String,
    pub max_amount: String,
    pub subsidy_rate: String,
    pub url: String,
    pub source_url: String,
}

/// Persisted grant row as stored in the `grants` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub id: i64,
    pub grant_type: String,
    pub title: String,
    pub description: String,
    pub organization: String,
    pub level: Level,
    pub area_prefecture: String,
    pub area_city: String,
    pub industry: String,
    pub target_type: String,
    pub max_amount: String,
    pub subsidy_rate: String,
    pub url: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GrantRecord {
    /// Municipal listings are prefecture rows carrying a city qualifier.
    pub fn is_municipal(&self) -> bool {
        self.level == Level::Prefecture && !self.area_city.trim().is_empty()
    }
}

/// Comparison key for all deduplication and cross-batch matching.
///
/// Produced by stripping any number of wrapping ASCII double quotes (stray
/// CSV escaping), trimming, and collapsing internal whitespace runs to a
/// single space. Idempotent. An empty key marks a likely invalid or
/// placeholder record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedTitle(String);

impl NormalizedTitle {
    pub fn new(raw: &str) -> Self {
        let stripped = raw.trim().trim_matches('"').trim();
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        Self(collapsed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NormalizedTitle {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl Borrow<str> for NormalizedTitle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Shared URL predicate. Applied identically at classification,
/// reconciliation and cleanup time.
///
/// Placeholder values (`example.com`), `javascript:` pseudo-URLs, relative
/// paths and unparsable strings are all treated as "no URL".
pub fn is_valid_url(url: Option<&str>) -> bool {
    let Some(url) = url else {
        return false;
    };
    let trimmed = url.trim();
    if trimmed.is_empty()
        || trimmed == "https://example.com"
        || trimmed == "http://example.com"
        || trimmed.contains("javascript:")
    {
        return false;
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return false;
    }
    match Url::parse(trimmed) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => !host.is_empty() && host != "example.com",
            None => false,
        },
        Err(_) => false,
    }
}

/// Exact organization-name to homepage mapping, consulted only when a record
/// carries no usable URL of its own. A miss resolves to the empty string:
/// the record is persisted without a link rather than rejected, and no
/// plausible-but-wrong detail URL is ever fabricated.
#[derive(Debug, Clone, Default)]
pub struct OrgDirectory {
    entries: HashMap<String, String>,
}

impl OrgDirectory {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, organization: &str) -> Option<&str> {
        self.entries.get(organization).map(String::as_str)
    }

    /// Resolve a record's URL: own valid URL wins, then the organization
    /// fallback, then empty string.
    pub fn resolve_url(&self, url: &str, organization: &str) -> String {
        if is_valid_url(Some(url)) {
            return url.trim().to_string();
        }
        self.lookup(organization.trim()).unwrap_or("").to_string()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ministry and prefecture homepages used as fallback links for
/// bulk-scraped listings that never resolved to a detail page.
pub fn default_org_directory() -> OrgDirectory {
    let entries = [
        ("厚生労働省", "https://www.mhlw.go.jp/"),
        ("経済産業省", "https://www.meti.go.jp/"),
        ("観光庁", "https://www.mlit.go.jp/kankocho/"),
        ("中小企業庁", "https://www.chusho.meti.go.jp/"),
        ("環境省", "https://www.env.go.jp/"),
        ("総務省", "https://www.soumu.go.jp/"),
        ("農林水産省", "https://www.maff.go.jp/"),
        ("文部科学省", "https://www.mext.go.jp/"),
        ("内閣府", "https://www.cao.go.jp/"),
        ("山形県", "https://www.pref.yamagata.jp/"),
    ]
    .into_iter()
    .map(|(org, url)| (org.to_string(), url.to_string()))
    .collect();
    OrgDirectory::new(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_quotes_and_trims() {
        assert_eq!(NormalizedTitle::new("\"Grant X\"").as_str(), "Grant X");
        assert_eq!(NormalizedTitle::new("  Grant X  ").as_str(), "Grant X");
        assert_eq!(NormalizedTitle::new("Grant X").as_str(), "Grant X");
        assert_eq!(NormalizedTitle::new("\"\"補助金A\"\"").as_str(), "補助金A");
    }

    #[test]
    fn normalization_collapses_internal_whitespace() {
        assert_eq!(
            NormalizedTitle::new("Grant \t  X  Y").as_str(),
            "Grant X Y"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["\" 補助金  A \"", "  a  b ", "", "\"\"", "plain"] {
            let once = NormalizedTitle::new(raw);
            let twice = NormalizedTitle::new(once.as_str());
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn empty_titles_normalize_to_empty_sentinel() {
        assert!(NormalizedTitle::new("").is_empty());
        assert!(NormalizedTitle::new("   ").is_empty());
        assert!(NormalizedTitle::new("\"\"").is_empty());
    }

    #[test]
    fn url_validator_truth_table() {
        assert!(!is_valid_url(None));
        assert!(!is_valid_url(Some("")));
        assert!(!is_valid_url(Some("   ")));
        assert!(!is_valid_url(Some("https://example.com")));
        assert!(!is_valid_url(Some("http://example.com")));
        assert!(!is_valid_url(Some("javascript:alert(1)")));
        assert!(!is_valid_url(Some("https://host/javascript:void(0)")));
        assert!(!is_valid_url(Some("ftp://host/path")));
        assert!(!is_valid_url(Some("not a url")));
        assert!(!is_valid_url(Some("/relative/path")));
        assert!(is_valid_url(Some("https://gov.example.jp/page")));
        assert!(is_valid_url(Some("http://www.mhlw.go.jp/stf/")));
    }

    #[test]
    fn fallback_resolution_order() {
        let dir = default_org_directory();
        // Invalid URL, known organization: fallback wins.
        assert_eq!(
            dir.resolve_url("https://example.com", "山形県"),
            "https://www.pref.yamagata.jp/"
        );
        // Invalid URL, unknown organization: empty string.
        assert_eq!(dir.resolve_url("javascript:void(0)", "不明組織"), "");
        // Valid URL: the directory is never consulted.
        assert_eq!(
            dir.resolve_url("https://www.city.yamagata.yamagata.jp/page", "山形県"),
            "https://www.city.yamagata.yamagata.jp/page"
        );
    }

    #[test]
    fn municipal_classification_needs_city() {
        let mut record = GrantRecord {
            id: 1,
            grant_type: "補助金".into(),
            title: "t".into(),
            description: String::new(),
            organization: "山形市".into(),
            level: Level::Prefecture,
            area_prefecture: "山形県".into(),
            area_city: "山形市".into(),
            industry: String::new(),
            target_type: String::new(),
            max_amount: String::new(),
            subsidy_rate: String::new(),
            url: String::new(),
            source_url: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(record.is_municipal());
        record.area_city = String::new();
        assert!(!record.is_municipal());
        record.area_city = "山形市".into();
        record.level = Level::National;
        assert!(!record.is_municipal());
    }

    #[test]
    fn level_parse_is_lenient() {
        assert_eq!(Level::parse_lenient("prefecture"), Level::Prefecture);
        assert_eq!(Level::parse_lenient("national"), Level::National);
        assert_eq!(Level::parse_lenient("city"), Level::National);
        assert_eq!(Level::parse_lenient(""), Level::National);
    }
}
