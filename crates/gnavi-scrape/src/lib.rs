//! Listing-page scrapers: fetch configured government sites, keep anchors
//! whose text mentions a subsidy keyword, resolve generic anchor text via
//! the linked detail page, and emit canonical CSV rows.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gnavi_core::{GrantDraft, Level};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

pub const CRATE_NAME: &str = "gnavi-scrape";

/// Anchor-text keywords that mark a link as subsidy-related.
pub fn default_keywords() -> Vec<String> {
    ["補助金", "助成金", "支援金", "奨励金"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Boilerplate anchor texts that carry no usable title of their own.
pub fn default_generic_titles() -> Vec<String> {
    [
        "補助金",
        "助成金",
        "支援金",
        "奨励金",
        "補助金一覧",
        "助成金一覧",
        "支援金一覧",
        "一覧",
        "助成金・補助金",
        "補助金・助成金",
        "詳しく見る",
        "続きを読む",
        "こちら",
        "詳細",
        "more",
        "link",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// A title is generic when it is at most three characters long or matches
/// one of the boilerplate phrases (ASCII ones case-insensitively).
pub fn is_generic_title(title: &str, generic_titles: &[String]) -> bool {
    let trimmed = title.trim();
    if trimmed.chars().count() <= 3 {
        return true;
    }
    generic_titles.iter().any(|pattern| {
        if pattern.is_ascii() {
            trimmed.eq_ignore_ascii_case(pattern)
        } else {
            trimmed == pattern
        }
    })
}

/// Resolves a possibly-relative href against the target's base URL.
pub fn absolutize(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix('/') {
        if let Ok(base) = Url::parse(base_url) {
            if let Some(host) = base.host_str() {
                return format!("{}://{}/{}", base.scheme(), host, rest);
            }
        }
    }
    format!("{}/{}", base_url.trim_end_matches('/'), href)
}

/// One anchor kept from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLink {
    pub title: String,
    pub href: String,
}

/// Extracts anchors whose visible text contains a keyword. Document order
/// is preserved.
pub fn extract_candidate_links(html: &str, keywords: &[String]) -> Vec<CandidateLink> {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a").expect("static selector");
    let mut links = Vec::new();
    for element in document.select(&anchor) {
        let title = element.text().collect::<String>().trim().to_string();
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if title.is_empty() || href.is_empty() {
            continue;
        }
        if keywords.iter().any(|keyword| title.contains(keyword)) {
            links.push(CandidateLink {
                title,
                href: href.to_string(),
            });
        }
    }
    links
}

/// Picks a replacement title out of a detail page: primary heading first,
/// then the `<title>` tag (site-name suffix stripped), then a secondary
/// heading. Returns `None` when nothing non-generic is found.
pub fn title_from_detail_page(html: &str, generic_titles: &[String]) -> Option<String> {
    let document = Html::parse_document(html);

    let h1 = Selector::parse("h1").expect("static selector");
    if let Some(text) = first_text(&document, &h1) {
        if !is_generic_title(&text, generic_titles) {
            return Some(text);
        }
    }

    let title_tag = Selector::parse("title").expect("static selector");
    if let Some(text) = first_text(&document, &title_tag) {
        let cleaned = text
            .split('|')
            .next()
            .unwrap_or(&text)
            .split('｜')
            .next()
            .unwrap_or(&text)
            .trim()
            .to_string();
        if !is_generic_title(&cleaned, generic_titles) {
            return Some(cleaned);
        }
    }

    let secondary = Selector::parse("h2, h3").expect("static selector");
    if let Some(text) = first_text(&document, &secondary) {
        if !is_generic_title(&text, generic_titles) {
            return Some(text);
        }
    }

    None
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// One site to scrape, loaded from the workspace `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeTarget {
    /// Registry group: "national", "prefecture" or "city".
    pub group: String,
    pub organization: String,
    pub base_url: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub area_prefecture: String,
    #[serde(default)]
    pub area_city: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_industry")]
    pub industry: String,
    #[serde(default = "default_target_type")]
    pub target_type: String,
}

fn default_industry() -> String {
    "旅館業".to_string()
}

fn default_target_type() -> String {
    "法人".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<ScrapeTarget>,
}

impl TargetRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn group(&self, group: &str) -> Vec<ScrapeTarget> {
        self.targets
            .iter()
            .filter(|target| target.group == group)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub courtesy_delay: Duration,
    pub concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "Mozilla/5.0 (compatible; GrantNaviBot/1.0)".to_string(),
            courtesy_delay: Duration::from_millis(500),
            concurrency: 4,
        }
    }
}

/// Thin fetch wrapper. No automatic retry: a failed path is logged and
/// skipped, and a human re-runs the scrape if needed.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Clone)]
pub struct Scraper {
    fetcher: PageFetcher,
    keywords: Arc<Vec<String>>,
    generic_titles: Arc<Vec<String>>,
    courtesy_delay: Duration,
    concurrency: usize,
}

impl Scraper {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let fetcher = PageFetcher::new(&config)?;
        Ok(Self {
            fetcher,
            keywords: Arc::new(default_keywords()),
            generic_titles: Arc::new(default_generic_titles()),
            courtesy_delay: config.courtesy_delay,
            concurrency: config.concurrency.max(1),
        })
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = Arc::new(keywords);
        self
    }

    pub fn with_generic_titles(mut self, generic_titles: Vec<String>) -> Self {
        self.generic_titles = Arc::new(generic_titles);
        self
    }

    /// Scrapes every target under a bounded worker pool. One target's
    /// failure never aborts the others; its error is logged and its slice
    /// of the output is simply missing.
    pub async fn run(&self, targets: Vec<ScrapeTarget>) -> Vec<GrantDraft> {
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let scraper = self.clone();
            let limit = Arc::clone(&limit);
            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                scraper.scrape_target(&target).await
            }));
        }

        let mut drafts = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(target_drafts) => drafts.extend(target_drafts),
                Err(err) => warn!("scrape task panicked: {err}"),
            }
        }
        drafts
    }

    /// Tries each candidate path for one target; the first path that yields
    /// anything wins. Path-level errors are logged and skipped.
    pub async fn scrape_target(&self, target: &ScrapeTarget) -> Vec<GrantDraft> {
        let mut drafts = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for path in &target.paths {
            let listing_url = format!("{}{}", target.base_url.trim_end_matches('/'), path);
            let html = match self.fetcher.get_text(&listing_url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(organization = %target.organization, url = %listing_url, "listing fetch failed: {err}");
                    continue;
                }
            };

            let candidates = extract_candidate_links(&html, &self.keywords);
            for candidate in candidates {
                let detail_url = absolutize(&candidate.href, &target.base_url);
                let Some(title) = self.resolve_title(&candidate.title, &detail_url).await else {
                    continue;
                };
                if !seen.insert((title.clone(), detail_url.clone())) {
                    continue;
                }
                drafts.push(self.draft_for(target, title, detail_url, &listing_url));
            }

            if !drafts.is_empty() {
                break;
            }
            tokio::time::sleep(self.courtesy_delay).await;
        }

        if drafts.is_empty() {
            info!(organization = %target.organization, "no subsidy links found");
        } else {
            info!(organization = %target.organization, count = drafts.len(), "scraped listings");
        }
        drafts
    }

    /// Generic anchor text is replaced by a title read off the detail page;
    /// candidates that stay generic are dropped entirely.
    async fn resolve_title(&self, anchor_text: &str, detail_url: &str) -> Option<String> {
        if !is_generic_title(anchor_text, &self.generic_titles) {
            return Some(anchor_text.to_string());
        }
        tokio::time::sleep(self.courtesy_delay).await;
        let html = match self.fetcher.get_text(detail_url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(url = %detail_url, "detail fetch failed: {err}");
                return None;
            }
        };
        title_from_detail_page(&html, &self.generic_titles)
    }

    fn draft_for(
        &self,
        target: &ScrapeTarget,
        title: String,
        detail_url: String,
        listing_url: &str,
    ) -> GrantDraft {
        GrantDraft {
            grant_type: target
                .grant_type
                .clone()
                .unwrap_or_else(|| "補助金".to_string()),
            title,
            description: target.description.clone().unwrap_or_else(|| {
                format!(
                    "{}の公式サイトより自動取得された補助金・助成金情報です。",
                    target.organization
                )
            }),
            organization: target.organization.clone(),
            level: target.level,
            area_prefecture: target.area_prefecture.clone(),
            area_city: target.area_city.clone(),
            industry: target.industry.clone(),
            target_type: target.target_type.clone(),
            max_amount: String::new(),
            subsidy_rate: String::new(),
            url: detail_url,
            source_url: listing_url.to_string(),
        }
    }
}

/// Writes drafts in the fixed 13-column schema the sync pipeline ingests.
pub fn write_drafts_csv(path: impl AsRef<Path>, drafts: &[GrantDraft]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record([
            "type",
            "title",
            "description",
            "organization",
            "level",
            "area_prefecture",
            "area_city",
            "industry",
            "target_type",
            "max_amount",
            "subsidy_rate",
            "url",
            "source_url",
        ])
        .context("writing csv header")?;
    for draft in drafts {
        writer
            .write_record([
                draft.grant_type.as_str(),
                draft.title.as_str(),
                draft.description.as_str(),
                draft.organization.as_str(),
                draft.level.as_str(),
                draft.area_prefecture.as_str(),
                draft.area_city.as_str(),
                draft.industry.as_str(),
                draft.target_type.as_str(),
                draft.max_amount.as_str(),
                draft.subsidy_rate.as_str(),
                draft.url.as_str(),
                draft.source_url.as_str(),
            ])
            .context("writing csv row")?;
    }
    writer.flush().context("flushing csv writer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_anchors_are_kept_in_document_order() {
        let html = r#"
            <html><body>
              <a href="/josei/a.html">宿泊施設改修補助金のご案内</a>
              <a href="/news/today.html">本日のお知らせ</a>
              <a href="https://www.pref.yamagata.jp/b.html">雇用支援金について</a>
              <a>補助金テキストだがhref無し</a>
            </body></html>
        "#;
        let links = extract_candidate_links(html, &default_keywords());
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title, "宿泊施設改修補助金のご案内");
        assert_eq!(links[0].href, "/josei/a.html");
        assert_eq!(links[1].href, "https://www.pref.yamagata.jp/b.html");
    }

    #[test]
    fn generic_titles_match_boilerplate_and_short_text() {
        let generics = default_generic_titles();
        assert!(is_generic_title("詳細", &generics));
        assert!(is_generic_title("こちら", &generics));
        assert!(is_generic_title("MORE", &generics));
        assert!(is_generic_title("一覧", &generics));
        assert!(is_generic_title("abc", &generics)); // three chars
        assert!(!is_generic_title("宿泊施設改修補助金", &generics));
    }

    #[test]
    fn absolutize_handles_absolute_rooted_and_relative_hrefs() {
        let base = "https://www.city.yamagata.yamagata.jp";
        assert_eq!(
            absolutize("https://other.example.jp/x", base),
            "https://other.example.jp/x"
        );
        assert_eq!(
            absolutize("/shoko/hojo.html", base),
            "https://www.city.yamagata.yamagata.jp/shoko/hojo.html"
        );
        assert_eq!(
            absolutize("hojo.html", base),
            "https://www.city.yamagata.yamagata.jp/hojo.html"
        );
    }

    #[test]
    fn detail_title_prefers_h1_then_title_then_secondary_heading() {
        let generics = default_generic_titles();

        let with_h1 = "<html><head><title>市公式サイト</title></head>\
                       <body><h1>小規模事業者持続化補助金</h1></body></html>";
        assert_eq!(
            title_from_detail_page(with_h1, &generics).as_deref(),
            Some("小規模事業者持続化補助金")
        );

        let with_title = "<html><head><title>観光施設整備事業費補助金 | 山形市</title></head>\
                          <body><h1>一覧</h1></body></html>";
        assert_eq!(
            title_from_detail_page(with_title, &generics).as_deref(),
            Some("観光施設整備事業費補助金")
        );

        let with_h2 = "<html><head><title>詳細</title></head>\
                       <body><h2>旅館業向け省エネ改修支援事業</h2></body></html>";
        assert_eq!(
            title_from_detail_page(with_h2, &generics).as_deref(),
            Some("旅館業向け省エネ改修支援事業")
        );

        let nothing = "<html><head><title>詳細</title></head><body><h1>一覧</h1></body></html>";
        assert_eq!(title_from_detail_page(nothing, &generics), None);
    }

    #[test]
    fn full_width_title_separator_is_stripped() {
        let generics = default_generic_titles();
        let html = "<html><head><title>創業支援奨励金のご案内｜米沢市</title></head><body></body></html>";
        assert_eq!(
            title_from_detail_page(html, &generics).as_deref(),
            Some("創業支援奨励金のご案内")
        );
    }

    #[test]
    fn csv_output_carries_the_fixed_schema_and_quoting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let draft = GrantDraft {
            grant_type: "補助金".into(),
            title: "設備投資, 改修支援".into(),
            description: "説明".into(),
            organization: "観光庁".into(),
            level: Level::National,
            area_prefecture: "全国".into(),
            industry: "旅館業".into(),
            target_type: "法人".into(),
            url: "https://www.mlit.go.jp/kankocho/page".into(),
            source_url: "https://www.mlit.go.jp/kankocho/".into(),
            ..GrantDraft::default()
        };
        write_drafts_csv(&path, &[draft]).expect("write csv");

        let text = std::fs::read_to_string(&path).expect("read back");
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "type,title,description,organization,level,area_prefecture,area_city,industry,target_type,max_amount,subsidy_rate,url,source_url"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("\"設備投資, 改修支援\""));
        assert!(row.contains("national"));
    }

    #[test]
    fn registry_groups_filter_targets() {
        let yaml = r#"
targets:
  - group: national
    organization: 観光庁
    base_url: https://www.mlit.go.jp
    paths: ["/kankocho/"]
    area_prefecture: 全国
  - group: city
    organization: 山形市
    base_url: https://www.city.yamagata.yamagata.jp
    paths: ["/", "/josei/"]
    level: prefecture
    area_prefecture: 山形県
    area_city: 山形市
"#;
        let registry: TargetRegistry = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(registry.group("national").len(), 1);
        let city = registry.group("city");
        assert_eq!(city.len(), 1);
        assert_eq!(city[0].level, Level::Prefecture);
        assert_eq!(city[0].industry, "旅館業");
        assert_eq!(city[0].target_type, "法人");
    }
}
