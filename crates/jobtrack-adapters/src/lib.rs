//! Scraping adapter contract + generic fixture and HTML listing adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use jobtrack_core::{AdapterKind, ListingSelectors, RawPosting, SourceConfig};
use jobtrack_storage::{FetchError, HttpFetcher, Url};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source `{source_id}` is missing {what}")]
    Misconfigured { source_id: String, what: &'static str },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces the raw postings currently listed by one source.
///
/// An empty list is a legitimate outcome; failures are returned as errors so
/// the caller can retry.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_postings(&self, source: &SourceConfig) -> Result<Vec<RawPosting>, AdapterError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    List(Vec<RawPosting>),
    Wrapped { postings: Vec<RawPosting> },
}

/// Serves postings from a JSON file, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_postings(&self, source: &SourceConfig) -> Result<Vec<RawPosting>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: FixtureFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        let postings = match file {
            FixtureFile::List(postings) | FixtureFile::Wrapped { postings } => postings,
        };

        Ok(postings
            .into_iter()
            .map(|mut posting| {
                if posting.company.trim().is_empty() {
                    posting.company = source.company.clone();
                }
                if posting.source_identifier.is_empty() {
                    posting.source_identifier = source.source_id.clone();
                }
                posting
            })
            .collect())
    }
}

/// Fetches every listing URL of a source and extracts postings with CSS selectors.
#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source_id: String,
    http: Arc<HttpFetcher>,
}

impl HtmlListingAdapter {
    pub fn new(source_id: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_postings(&self, source: &SourceConfig) -> Result<Vec<RawPosting>, AdapterError> {
        let selectors = source.selectors.as_ref().ok_or_else(|| AdapterError::Misconfigured {
            source_id: source.source_id.clone(),
            what: "selectors",
        })?;

        let fetch_id = Uuid::new_v4();
        let mut postings = Vec::new();
        for url in &source.listing_urls {
            let page = self.http.fetch_text(fetch_id, &source.source_id, url).await?;
            let parsed = parse_listing_html(&page.body, &page.final_url, source, selectors)?;
            debug!(source_id = %source.source_id, url, count = parsed.len(), "parsed listing page");
            postings.extend(parsed);
        }
        Ok(postings)
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("invalid selector `{selector}`: {e}")))
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn resolve_href(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

/// Extract one `RawPosting` per `selectors.item` element that has a title.
///
/// Links come from `selectors.link` when set, else from the title element's
/// `href`; relative links resolve against `page_url`.
pub fn parse_listing_html(
    html: &str,
    page_url: &str,
    source: &SourceConfig,
    selectors: &ListingSelectors,
) -> Result<Vec<RawPosting>, AdapterError> {
    let document = Html::parse_document(html);
    let item = parse_selector(&selectors.item)?;
    let title = parse_selector(&selectors.title)?;
    let location = selectors.location.as_deref().map(parse_selector).transpose()?;
    let description = selectors.description.as_deref().map(parse_selector).transpose()?;
    let link = selectors.link.as_deref().map(parse_selector).transpose()?;
    let base = Url::parse(page_url).ok();

    let mut out = Vec::new();
    for node in document.select(&item) {
        let Some(title_node) = node.select(&title).next() else {
            continue;
        };
        let Some(title_text) = text_or_none(title_node.text().collect::<String>()) else {
            continue;
        };

        let link_node = match &link {
            Some(sel) => node.select(sel).next(),
            None => Some(title_node),
        };
        let posting_url = link_node
            .and_then(|n| n.value().attr("href"))
            .map(|href| resolve_href(base.as_ref(), href.trim()))
            .unwrap_or_default();

        out.push(RawPosting {
            company: source.company.clone(),
            title: title_text,
            location: location
                .as_ref()
                .and_then(|sel| select_first_text(node, sel))
                .unwrap_or_default(),
            description: description.as_ref().and_then(|sel| select_first_text(node, sel)),
            post_date: None,
            deadline: None,
            source_identifier: source.source_id.clone(),
            posting_url,
        });
    }
    Ok(out)
}

/// Build the adapter configured for `source`.
///
/// Fixture paths are resolved against `workspace_root`.
pub fn adapter_for_source(
    source: &SourceConfig,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source.adapter {
        AdapterKind::Fixture => {
            let path = source.fixture_path.as_deref().ok_or_else(|| AdapterError::Misconfigured {
                source_id: source.source_id.clone(),
                what: "fixture_path",
            })?;
            Ok(Box::new(FixtureAdapter::new(
                source.source_id.clone(),
                workspace_root.join(path),
            )))
        }
        AdapterKind::HtmlListing => {
            if source.selectors.is_none() {
                return Err(AdapterError::Misconfigured {
                    source_id: source.source_id.clone(),
                    what: "selectors",
                });
            }
            if source.listing_urls.is_empty() {
                return Err(AdapterError::Misconfigured {
                    source_id: source.source_id.clone(),
                    what: "listing_urls",
                });
            }
            Ok(Box::new(HtmlListingAdapter::new(source.source_id.clone(), http)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobtrack_core::SourceRegistry;
    use jobtrack_storage::HttpClientConfig;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
    }

    fn registry() -> SourceRegistry {
        let text = std::fs::read_to_string(workspace_root().join("sources.yaml")).expect("read sources.yaml");
        serde_yaml::from_str(&text).expect("parse sources.yaml")
    }

    fn html_source() -> SourceConfig {
        registry().find("globex-careers").cloned().expect("globex-careers source")
    }

    #[tokio::test]
    async fn fixture_adapter_fills_company_and_source() {
        let registry = registry();
        let source = registry.find("acme-us").expect("acme-us source");
        let adapter = adapter_for_source(source, http(), &workspace_root()).unwrap();
        assert_eq!(adapter.source_id(), "acme-us");

        let postings = adapter.fetch_postings(source).await.unwrap();
        assert!(!postings.is_empty());
        assert!(postings.iter().all(|p| p.company == "Acme Capital"));
        assert!(postings.iter().all(|p| p.source_identifier == "acme-us"));
        assert!(postings.iter().all(|p| p.validate().is_ok()));
    }

    #[tokio::test]
    async fn missing_fixture_file_is_an_error() {
        let source = registry().find("acme-us").cloned().unwrap();
        let adapter = FixtureAdapter::new("acme-us", workspace_root().join("fixtures/nope.json"));
        assert!(adapter.fetch_postings(&source).await.is_err());
    }

    #[test]
    fn listing_html_extracts_items_with_titles() {
        let source = html_source();
        let html = std::fs::read_to_string(workspace_root().join("fixtures/globex-listing.html")).unwrap();
        let postings = parse_listing_html(
            &html,
            "https://careers.globex.example/jobs?page=1",
            &source,
            source.selectors.as_ref().unwrap(),
        )
        .unwrap();

        assert_eq!(postings.len(), 3);
        assert_eq!(postings[0].title, "Quantitative Strategist");
        assert_eq!(postings[0].location, "London");
        assert_eq!(postings[0].posting_url, "https://careers.globex.example/jobs/101");
        assert_eq!(postings[1].location, "New York, NY, United States");
        assert_eq!(postings[2].posting_url, "https://apply.globex.example/2203");
        assert!(postings[2].description.is_none());
        assert!(postings.iter().all(|p| p.company == "Globex Markets"));
    }

    #[test]
    fn invalid_selector_is_reported() {
        let mut source = html_source();
        let selectors = ListingSelectors {
            item: "div[".into(),
            title: "h3".into(),
            location: None,
            link: None,
            description: None,
        };
        source.selectors = Some(selectors.clone());
        let err = parse_listing_html("<html></html>", "https://x.example", &source, &selectors).unwrap_err();
        assert!(err.to_string().contains("invalid selector"));
    }

    #[test]
    fn misconfigured_sources_are_rejected() {
        let mut source = html_source();
        source.listing_urls.clear();
        assert!(matches!(
            adapter_for_source(&source, http(), &workspace_root()),
            Err(AdapterError::Misconfigured { what: "listing_urls", .. })
        ));

        let mut fixture = registry().find("acme-us").cloned().unwrap();
        fixture.fixture_path = None;
        assert!(matches!(
            adapter_for_source(&fixture, http(), &workspace_root()),
            Err(AdapterError::Misconfigured { what: "fixture_path", .. })
        ));
    }
}
