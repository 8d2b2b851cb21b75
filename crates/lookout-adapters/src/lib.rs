//! Collaborator seams for the monitor: page fetching, listing extraction,
//! and notification delivery.

use std::process::Command;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, Utc};
use lookout_core::{Candidate, SourceKind};
use lookout_storage::{canonicalize_url, FetchError, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "lookout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Returns a raw markup snapshot for a source URL. Retrying, pagination,
/// and scrolling live behind this seam.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, source_url: &str) -> Result<String, AdapterError>;
}

/// Pulls candidate listing records out of raw markup. Shape-specific
/// parsing lives entirely here.
pub trait ListingExtractor: Send + Sync {
    fn extract(
        &self,
        raw_markup: &str,
        source_kind: SourceKind,
        source_url: &str,
    ) -> Result<Vec<Candidate>, AdapterError>;
}

/// Fire-and-forget notification delivery. Callers log failures and move on.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str) -> Result<(), AdapterError>;
}

/// HTTP-backed page fetcher over the retrying storage client.
#[derive(Debug)]
pub struct HttpPageFetcher {
    http: HttpFetcher,
}

impl HttpPageFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, source_url: &str) -> Result<String, AdapterError> {
        Ok(self.http.fetch_text(source_url).await?)
    }
}

// Feed post containers and author spans are matched by the class soup the
// site currently ships. Brittle by nature; revisions land here only.
const GROUP_POST_SELECTOR: &str = "div.xdj266r.x11i5rnm.xat24cr.x1mh8g0r.x1vvkbs.x126k92a";
const GROUP_AUTHOR_SELECTOR: &str = "span.html-span";
const GROUP_PERMALINK_SELECTOR: &str = "a[href*=\"/posts/\"]";
const MARKETPLACE_ITEM_SELECTOR: &str = "a[href*=\"/marketplace/item/\"]";

const SITE_ORIGIN: &str = "https://www.facebook.com";

/// Markup-shape extractor for group feeds and marketplace search results.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlListingExtractor;

impl ListingExtractor for HtmlListingExtractor {
    fn extract(
        &self,
        raw_markup: &str,
        source_kind: SourceKind,
        source_url: &str,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let document = Html::parse_document(raw_markup);
        match source_kind {
            SourceKind::Group => extract_group_posts(&document, source_url),
            SourceKind::Marketplace => extract_marketplace_listings(&document, source_url),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_group_posts(
    document: &Html,
    source_url: &str,
) -> Result<Vec<Candidate>, AdapterError> {
    let post_selector = parse_selector(GROUP_POST_SELECTOR)?;
    let author_selector = parse_selector(GROUP_AUTHOR_SELECTOR)?;
    let permalink_selector = parse_selector(GROUP_PERMALINK_SELECTOR)?;

    let now = Utc::now();
    let mut candidates = Vec::new();
    for container in document.select(&post_selector) {
        let body = element_text(container);
        if body.is_empty() {
            continue;
        }

        // The author span lives outside the post body, in the surrounding
        // header markup.
        let author = container
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|parent| parent.select(&author_selector).next())
            .map(element_text)
            .filter(|name| !name.is_empty());

        let permalink = container
            .select(&permalink_selector)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
            .map(|href| absolute_site_url(canonicalize_url(href)));
        let posted_at = container
            .select(&permalink_selector)
            .next()
            .and_then(|anchor| parse_post_time(&element_text(anchor), now));

        candidates.push(Candidate {
            source_kind: SourceKind::Group,
            source_url: source_url.to_string(),
            title: String::new(),
            body,
            url: permalink.unwrap_or_default(),
            author,
            posted_at,
        });
    }
    Ok(candidates)
}

fn extract_marketplace_listings(
    document: &Html,
    source_url: &str,
) -> Result<Vec<Candidate>, AdapterError> {
    let item_selector = parse_selector(MARKETPLACE_ITEM_SELECTOR)?;
    let title_selector = parse_selector("span")?;
    let body_selector = parse_selector("div")?;

    let mut candidates = Vec::new();
    for listing in document.select(&item_selector) {
        let Some(raw_href) = listing.value().attr("href") else {
            continue;
        };
        let clean_path = canonicalize_url(raw_href);
        let url = absolute_site_url(clean_path);

        let title = listing
            .select(&title_selector)
            .next()
            .map(element_text)
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let body = listing
            .select(&body_selector)
            .next()
            .map(element_text)
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| "No description provided".to_string());

        candidates.push(Candidate {
            source_kind: SourceKind::Marketplace,
            source_url: source_url.to_string(),
            title,
            body,
            url,
            author: None,
            posted_at: None,
        });
    }
    Ok(candidates)
}

fn absolute_site_url(path_or_url: &str) -> String {
    if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
        path_or_url.to_string()
    } else {
        format!("{SITE_ORIGIN}{path_or_url}")
    }
}

/// Parse a post time phrase ("5 minutes ago", "2 hours ago", "yesterday",
/// "May 24 at 5:30 PM") relative to `now`. Unparseable input yields `None`.
pub fn parse_post_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("minute") {
        return first_number(&lower).map(|n| now - ChronoDuration::minutes(n));
    }
    if lower.contains("hour") {
        return first_number(&lower).map(|n| now - ChronoDuration::hours(n));
    }
    if lower.contains("yesterday") {
        return Some(now - ChronoDuration::days(1));
    }
    let with_year = format!("{} {}", text.trim(), now.year());
    NaiveDateTime::parse_from_str(&with_year, "%b %d at %I:%M %p %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

fn first_number(text: &str) -> Option<i64> {
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    current.parse().ok()
}

/// Desktop toast via the platform notification command.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandNotifier;

impl Notifier for CommandNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), AdapterError> {
        let message = message.replace('"', "\\\"");
        let status = platform_notify_command(title, &message).status()?;
        if !status.success() {
            return Err(AdapterError::Message(format!(
                "notification command exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn platform_notify_command(title: &str, message: &str) -> Command {
    let mut cmd = Command::new("osascript");
    cmd.arg("-e").arg(format!(
        "display notification \"{message}\" with title \"{title}\" sound name \"default\""
    ));
    cmd
}

#[cfg(not(target_os = "macos"))]
fn platform_notify_command(title: &str, message: &str) -> Command {
    let mut cmd = Command::new("notify-send");
    cmd.arg(title).arg(message);
    cmd
}

/// Log-only notifier for headless runs and dry cycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) -> Result<(), AdapterError> {
        info!(title, message, "match notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 15, 0, 0).single().unwrap()
    }

    #[test]
    fn marketplace_extraction_cleans_tracking_urls() {
        let html = r#"
            <html><body>
              <a href="/marketplace/item/123?ref=browse&tracking=abc">
                <span>Box of kids books</span>
                <div>$10 · Easton, PA</div>
              </a>
              <a href="/marketplace/item/456">
                <span>Wooden bookshelf</span>
              </a>
            </body></html>
        "#;
        let candidates = HtmlListingExtractor
            .extract(html, SourceKind::Marketplace, "https://example.com/marketplace")
            .expect("extract");

        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0].url,
            "https://www.facebook.com/marketplace/item/123"
        );
        assert_eq!(candidates[0].title, "Box of kids books");
        assert_eq!(candidates[0].body, "$10 · Easton, PA");
        assert_eq!(candidates[1].body, "No description provided");
        assert!(candidates[1].author.is_none());
    }

    #[test]
    fn marketplace_listing_without_title_is_skipped() {
        let html = r#"
            <a href="/marketplace/item/789"><div>placeholder tile</div></a>
        "#;
        let candidates = HtmlListingExtractor
            .extract(html, SourceKind::Marketplace, "https://example.com/marketplace")
            .expect("extract");
        assert!(candidates.is_empty());
    }

    #[test]
    fn group_extraction_reads_body_author_and_permalink() {
        let html = r#"
            <html><body>
              <div class="feed">
                <span class="html-span xdj266r">Jamie Doe</span>
                <div class="xdj266r x11i5rnm xat24cr x1mh8g0r x1vvkbs x126k92a">
                  Giving away a pile of kids books.
                  <a href="/groups/42/posts/9001/?comment_id=1">5 minutes ago</a>
                </div>
              </div>
            </body></html>
        "#;
        let candidates = HtmlListingExtractor
            .extract(html, SourceKind::Group, "https://example.com/groups/42")
            .expect("extract");

        assert_eq!(candidates.len(), 1);
        let post = &candidates[0];
        assert!(post.body.contains("kids books"));
        assert_eq!(post.author.as_deref(), Some("Jamie Doe"));
        assert_eq!(post.url, "https://www.facebook.com/groups/42/posts/9001/");
        assert!(post.posted_at.is_some());
        assert_eq!(post.source_url, "https://example.com/groups/42");
    }

    #[test]
    fn empty_group_containers_are_discarded() {
        let html = r#"
            <div class="xdj266r x11i5rnm xat24cr x1mh8g0r x1vvkbs x126k92a"></div>
        "#;
        let candidates = HtmlListingExtractor
            .extract(html, SourceKind::Group, "https://example.com/groups/42")
            .expect("extract");
        assert!(candidates.is_empty());
    }

    #[test]
    fn relative_time_phrases_parse() {
        let now = fixed_now();
        assert_eq!(
            parse_post_time("5 minutes ago", now),
            Some(now - ChronoDuration::minutes(5))
        );
        assert_eq!(
            parse_post_time("2 hours ago", now),
            Some(now - ChronoDuration::hours(2))
        );
        assert_eq!(
            parse_post_time("Yesterday at lunch", now),
            Some(now - ChronoDuration::days(1))
        );
    }

    #[test]
    fn explicit_time_phrase_assumes_current_year() {
        let now = fixed_now();
        let parsed = parse_post_time("May 24 at 5:30 PM", now).expect("parse");
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2026, 5, 24, 17, 30, 0).single().unwrap()
        );
    }

    #[test]
    fn unparseable_time_phrases_yield_none() {
        let now = fixed_now();
        assert_eq!(parse_post_time("", now), None);
        assert_eq!(parse_post_time("just now", now), None);
        assert_eq!(parse_post_time("minutes ago", now), None);
    }
}
