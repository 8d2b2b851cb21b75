//! Durable seen/match state + HTTP fetch utilities for Lookout.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use lookout_core::MatchRecord;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lookout-storage";

/// Content-addressed identifier for a listing, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(Self(line.to_string()))
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the query string and fragment so tracking-parameter variants of
/// the same listing collapse to one key.
pub fn canonicalize_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Deterministic SHA-256 fingerprint of a canonical key.
pub fn fingerprint(canonical_key: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical_key.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Durable set of fingerprints already notified. Append-only file, one hex
/// id per line, mirrored into memory for O(1) membership checks.
#[derive(Debug)]
pub struct SeenStore {
    path: PathBuf,
    seen: HashSet<Fingerprint>,
}

impl SeenStore {
    /// Rebuild the in-memory set from the persisted list. An absent file is
    /// an empty set, not an error; blank lines are ignored and duplicate
    /// lines are harmless because the reload target is a set.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut seen = HashSet::new();
        match fs::read_to_string(&path).await {
            Ok(text) => {
                seen.extend(text.lines().filter_map(Fingerprint::from_line));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading seen store {}", path.display()));
            }
        }
        Ok(Self { path, seen })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.seen.contains(fp)
    }

    /// No-op if already present. Otherwise appends one line to the durable
    /// file and flushes it before the in-memory insert, so a failed append
    /// leaves the item unmarked and eligible for reprocessing next cycle.
    pub async fn mark_seen(&mut self, fp: &Fingerprint) -> anyhow::Result<()> {
        if self.seen.contains(fp) {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening seen store {}", self.path.display()))?;
        file.write_all(format!("{fp}\n").as_bytes())
            .await
            .with_context(|| format!("appending to seen store {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing seen store {}", self.path.display()))?;
        self.seen.insert(fp.clone());
        Ok(())
    }
}

const RECORD_DELIMITER: &str = "----------------------------------------";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reverse-chronological, human-readable audit trail of matched listings,
/// pruned by retention window as a side effect of each append.
#[derive(Debug)]
pub struct MatchLog {
    path: PathBuf,
    retention: ChronoDuration,
}

#[derive(Debug, Clone)]
struct LogBlock {
    text: String,
    found_at: Option<DateTime<Utc>>,
}

impl MatchLog {
    pub fn new(path: impl Into<PathBuf>, retention: ChronoDuration) -> Self {
        Self {
            path: path.into(),
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with `record` prepended ahead of every prior block
    /// not older than the retention window, measured from the new record's
    /// `found_at`. Unreadable existing content is treated as empty: the new
    /// record wins over recovery of old ones.
    pub async fn append(&self, record: &MatchRecord) -> anyhow::Result<()> {
        let cutoff = record.found_at - self.retention;
        let existing = match fs::read_to_string(&self.path).await {
            Ok(text) => parse_blocks(&text),
            Err(_) => Vec::new(),
        };

        let mut output = render_block(record);
        for block in existing {
            // Blocks without a parseable Found line are kept rather than
            // silently discarded.
            if block.found_at.map_or(true, |ts| ts >= cutoff) {
                output.push_str(&block.text);
            }
        }

        self.rewrite_atomically(output.as_bytes()).await
    }

    /// Found timestamps currently in the log, newest first.
    pub async fn found_timestamps(&self) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading match log {}", self.path.display()))?;
        Ok(parse_blocks(&text)
            .into_iter()
            .filter_map(|block| block.found_at)
            .collect())
    }

    async fn rewrite_atomically(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp log file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp log file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp log file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp log {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

fn render_block(record: &MatchRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("Source: {}\n", record.source));
    out.push_str(&format!("User: {}\n", record.author));
    out.push_str(&format!("Content: {}\n", escape_content(&record.content)));
    if let Some(group_url) = &record.group_url {
        out.push_str(&format!("Group URL: {group_url}\n"));
    }
    let post_time = record
        .post_time
        .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    out.push_str(&format!("Post Time: {post_time}\n"));
    out.push_str(&format!(
        "Found: {}\n",
        record.found_at.format(TIMESTAMP_FORMAT)
    ));
    out.push_str(RECORD_DELIMITER);
    out.push('\n');
    out
}

// A content line equal to the record delimiter would end the block early
// on re-parse; a leading space keeps such lines inert without changing how
// the log reads.
fn escape_content(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            if line == RECORD_DELIMITER {
                format!(" {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_blocks(text: &str) -> Vec<LogBlock> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut found_at = None;

    for line in text.lines() {
        current.push_str(line);
        current.push('\n');
        if let Some(stamp) = line.strip_prefix("Found: ") {
            found_at = NaiveDateTime::parse_from_str(stamp.trim(), TIMESTAMP_FORMAT)
                .ok()
                .map(|naive| naive.and_utc());
        }
        if line == RECORD_DELIMITER {
            blocks.push(LogBlock {
                text: std::mem::take(&mut current),
                found_at: found_at.take(),
            });
        }
    }

    // Trailing content without a delimiter (truncated write) is dropped.
    blocks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying HTTP client used to pull page markup snapshots.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, source_url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url = source_url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(source_url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mk_record(content: &str, found_at: DateTime<Utc>) -> MatchRecord {
        MatchRecord {
            source: "Marketplace".to_string(),
            author: "Marketplace".to_string(),
            content: content.to_string(),
            group_url: None,
            post_time: None,
            found_at,
        }
    }

    fn stamp(ts: DateTime<Utc>) -> DateTime<Utc> {
        // Round-trip through the log format: sub-second precision is lost.
        NaiveDateTime::parse_from_str(
            &ts.format(TIMESTAMP_FORMAT).to_string(),
            TIMESTAMP_FORMAT,
        )
        .expect("stamp")
        .and_utc()
    }

    #[test]
    fn canonicalization_strips_query_and_fragment() {
        assert_eq!(
            canonicalize_url("https://example.com/marketplace/item/123?ref=xyz&track=1"),
            "https://example.com/marketplace/item/123"
        );
        assert_eq!(
            canonicalize_url("https://example.com/item/9#photos"),
            "https://example.com/item/9"
        );
        assert_eq!(
            canonicalize_url("https://example.com/item/9"),
            "https://example.com/item/9"
        );
    }

    #[test]
    fn fingerprint_is_deterministic_fixed_width_hex() {
        let a = fingerprint("/marketplace/item/123");
        let b = fingerprint("/marketplace/item/123");
        let c = fingerprint("/marketplace/item/124");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn tracking_variants_fingerprint_identically() {
        let tracked = canonicalize_url("https://example.com/item/123?ref=xyz&track=1");
        let bare = canonicalize_url("https://example.com/item/123");
        assert_eq!(fingerprint(tracked), fingerprint(bare));
    }

    #[tokio::test]
    async fn absent_seen_file_loads_as_empty_set() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::load(dir.path().join("seen.txt"))
            .await
            .expect("load");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent_on_disk_and_in_memory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen.txt");
        let mut store = SeenStore::load(&path).await.expect("load");
        let fp = fingerprint("/item/1");

        store.mark_seen(&fp).await.expect("first mark");
        store.mark_seen(&fp).await.expect("second mark");

        let text = std::fs::read_to_string(&path).expect("read seen file");
        assert_eq!(text, format!("{fp}\n"));
        assert_eq!(store.len(), 1);
        assert!(store.contains(&fp));
    }

    #[tokio::test]
    async fn reload_recovers_persisted_fingerprints() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen.txt");
        let fp_a = fingerprint("/item/a");
        let fp_b = fingerprint("/item/b");
        std::fs::write(&path, format!("{fp_a}\n\n{fp_b}\n")).expect("seed file");

        let store = SeenStore::load(&path).await.expect("load");
        assert_eq!(store.len(), 2);
        assert!(store.contains(&fp_a));
        assert!(store.contains(&fp_b));
        assert!(!store.contains(&fingerprint("/item/c")));
    }

    #[tokio::test]
    async fn match_log_prepends_newest_first() {
        let dir = tempdir().expect("tempdir");
        let log = MatchLog::new(dir.path().join("matched.txt"), ChronoDuration::days(1));
        let now = stamp(Utc::now());

        log.append(&mk_record("first", now)).await.expect("append");
        log.append(&mk_record("second", now)).await.expect("append");

        let text = std::fs::read_to_string(log.path()).expect("read log");
        let first_idx = text.find("Content: first").expect("first present");
        let second_idx = text.find("Content: second").expect("second present");
        assert!(second_idx < first_idx);
    }

    #[tokio::test]
    async fn retention_prunes_stale_records_at_append_time() {
        let dir = tempdir().expect("tempdir");
        let log = MatchLog::new(dir.path().join("matched.txt"), ChronoDuration::days(1));
        let now = stamp(Utc::now());

        let stale = mk_record("stale", now - ChronoDuration::days(3));
        log.append(&stale).await.expect("append stale");
        let text = std::fs::read_to_string(log.path()).expect("read log");
        assert!(text.contains("Content: stale"));

        log.append(&mk_record("fresh", now)).await.expect("append fresh");
        let text = std::fs::read_to_string(log.path()).expect("read log");
        assert!(text.contains("Content: fresh"));
        assert!(!text.contains("Content: stale"));

        let stamps = log.found_timestamps().await.expect("timestamps");
        assert_eq!(stamps, vec![now]);
    }

    #[tokio::test]
    async fn corrupt_log_content_is_replaced_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("matched.txt");
        std::fs::write(&path, "not a log block at all\n").expect("seed garbage");

        let log = MatchLog::new(&path, ChronoDuration::days(1));
        log.append(&mk_record("fresh", stamp(Utc::now())))
            .await
            .expect("append over garbage");

        let text = std::fs::read_to_string(&path).expect("read log");
        assert!(text.contains("Content: fresh"));
        assert!(!text.contains("not a log block"));
    }

    #[tokio::test]
    async fn delimiter_lines_inside_content_do_not_split_blocks() {
        let dir = tempdir().expect("tempdir");
        let log = MatchLog::new(dir.path().join("matched.txt"), ChronoDuration::days(1));
        let now = stamp(Utc::now());

        let tricky = mk_record(
            &format!("selling dashes\n{RECORD_DELIMITER}\nforty of them"),
            now,
        );
        log.append(&tricky).await.expect("append tricky");
        log.append(&mk_record("plain", now)).await.expect("append plain");

        let stamps = log.found_timestamps().await.expect("timestamps");
        assert_eq!(stamps.len(), 2);

        let text = std::fs::read_to_string(log.path()).expect("read log");
        assert_eq!(text.matches("Source: ").count(), 2);
        assert!(text.contains("forty of them"));
        assert!(text.contains(&format!(" {RECORD_DELIMITER}")));
    }

    #[tokio::test]
    async fn group_records_render_all_fields() {
        let dir = tempdir().expect("tempdir");
        let log = MatchLog::new(dir.path().join("matched.txt"), ChronoDuration::days(1));
        let now = stamp(Utc::now());
        let record = MatchRecord {
            source: "Group".to_string(),
            author: "Jamie".to_string(),
            content: "Free kids books on the porch".to_string(),
            group_url: Some("https://example.com/groups/42".to_string()),
            post_time: Some(now - ChronoDuration::minutes(5)),
            found_at: now,
        };

        log.append(&record).await.expect("append");
        let text = std::fs::read_to_string(log.path()).expect("read log");
        assert!(text.contains("Source: Group"));
        assert!(text.contains("User: Jamie"));
        assert!(text.contains("Group URL: https://example.com/groups/42"));
        assert!(text.contains("Post Time: "));
        assert!(!text.contains("Post Time: Unknown"));
        assert!(text.ends_with(&format!("{RECORD_DELIMITER}\n")));
    }

    #[test]
    fn backoff_delays_double_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(900),
        };

        let delays: Vec<Duration> =
            (0..5).map(|attempt| policy.delay_for_attempt(attempt)).collect();
        assert_eq!(
            delays,
            [200u64, 400, 800, 900, 900]
                .map(Duration::from_millis)
                .to_vec()
        );

        // An absurd attempt index saturates the shift and still lands on
        // the cap rather than overflowing.
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(64), policy.max_delay);
    }
}
