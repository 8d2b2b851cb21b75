//! Monitor loop orchestration: configuration, the fetch/extract/filter/
//! notify cycle, and the optional location post-filter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use lookout_adapters::{ListingExtractor, Notifier, PageFetcher};
use lookout_core::{
    clip, Candidate, DictionaryLemmatizer, KeywordProfile, MatchRecord, Source, SourceKind,
    TextMatcher,
};
use lookout_storage::{canonicalize_url, fingerprint, Fingerprint, MatchLog, SeenStore};

pub const CRATE_NAME: &str = "lookout-monitor";

const NOTIFY_SUMMARY_CHARS: usize = 100;

/// On-disk registry file (`lookout.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub poll_interval_minutes: Option<u64>,
    #[serde(default)]
    pub retention_days: Option<i64>,
    #[serde(default)]
    pub min_content_len: Option<usize>,
    #[serde(default)]
    pub seen_file: Option<PathBuf>,
    #[serde(default)]
    pub match_log_file: Option<PathBuf>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub marketplace: Option<MarketplaceSearch>,
    #[serde(default)]
    pub home: Option<HomeLocation>,
}

/// Marketplace search parameters, assembled into a search page URL.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceSearch {
    pub zip: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_miles: f64,
    #[serde(default)]
    pub min_price: u32,
    #[serde(default = "default_max_price")]
    pub max_price: u32,
}

fn default_max_price() -> u32 {
    50
}

impl Default for MarketplaceSearch {
    fn default() -> Self {
        Self {
            zip: "18045".to_string(),
            latitude: 40.6912,
            longitude: -75.2207,
            radius_miles: 20.0,
            min_price: 0,
            max_price: default_max_price(),
        }
    }
}

impl MarketplaceSearch {
    pub fn search_url(&self) -> String {
        format!(
            "https://www.facebook.com/marketplace/{}/\
             ?deliveryMethod=local_pick_up\
             &exact=false\
             &latitude={}\
             &longitude={}\
             &radius={}\
             &minPrice={}\
             &maxPrice={}",
            self.zip, self.latitude, self.longitude, self.radius_miles, self.min_price,
            self.max_price
        )
    }
}

/// Home coordinates used by the optional location post-filter.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HomeLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_miles: f64,
}

/// Validated immutable configuration handed to the loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub keywords: Vec<String>,
    pub sources: Vec<Source>,
    pub marketplace: Option<MarketplaceSearch>,
    pub poll_interval: Duration,
    pub retention_days: i64,
    pub min_content_len: usize,
    pub seen_file: PathBuf,
    pub match_log_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub home: Option<HomeLocation>,
}

impl MonitorConfig {
    /// Read the registry file, apply `LOOKOUT_*` environment overrides,
    /// and validate. Any problem here is fatal: the monitor does not start
    /// on a broken profile.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: RegistryFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let mut config = Self::from_registry(registry)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_registry(registry: RegistryFile) -> Result<Self> {
        Ok(Self {
            keywords: registry.keywords,
            sources: registry.sources,
            marketplace: registry.marketplace,
            poll_interval: Duration::from_secs(
                registry.poll_interval_minutes.unwrap_or(5) * 60,
            ),
            retention_days: registry.retention_days.unwrap_or(1),
            min_content_len: registry.min_content_len.unwrap_or(20),
            seen_file: registry
                .seen_file
                .unwrap_or_else(|| PathBuf::from("seen_posts.txt")),
            match_log_file: registry
                .match_log_file
                .unwrap_or_else(|| PathBuf::from("matched_posts.txt")),
            user_agent: registry
                .user_agent
                .unwrap_or_else(|| "lookout/0.1".to_string()),
            http_timeout_secs: registry.http_timeout_secs.unwrap_or(20),
            home: registry.home,
        })
    }

    /// Explicit registry sources plus, when marketplace search parameters
    /// are configured, a source assembled from them. The assembly happens
    /// here so environment overrides to those parameters are reflected in
    /// the URL actually polled.
    pub fn effective_sources(&self) -> Vec<Source> {
        let mut sources = self.sources.clone();
        if let Some(marketplace) = &self.marketplace {
            sources.push(Source {
                kind: SourceKind::Marketplace,
                url: marketplace.search_url(),
                enabled: true,
            });
        }
        sources
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(keywords) = std::env::var("LOOKOUT_KEYWORDS") {
            self.keywords = keywords
                .split(',')
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect();
        }
        if let Ok(urls) = std::env::var("LOOKOUT_GROUP_URLS") {
            self.sources.retain(|source| source.kind != SourceKind::Group);
            self.sources.extend(
                urls.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(|url| Source {
                        kind: SourceKind::Group,
                        url: url.to_string(),
                        enabled: true,
                    }),
            );
        }
        if let Ok(zip) = std::env::var("LOOKOUT_MARKETPLACE_ZIP") {
            self.marketplace.get_or_insert_with(MarketplaceSearch::default).zip = zip;
        }
        if let Some(latitude) = env_parse::<f64>("LOOKOUT_MARKETPLACE_LATITUDE") {
            self.marketplace
                .get_or_insert_with(MarketplaceSearch::default)
                .latitude = latitude;
        }
        if let Some(longitude) = env_parse::<f64>("LOOKOUT_MARKETPLACE_LONGITUDE") {
            self.marketplace
                .get_or_insert_with(MarketplaceSearch::default)
                .longitude = longitude;
        }
        if let Some(radius) = env_parse::<f64>("LOOKOUT_MARKETPLACE_RADIUS_MILES") {
            self.marketplace
                .get_or_insert_with(MarketplaceSearch::default)
                .radius_miles = radius;
        }
        if let Some(price) = env_parse::<u32>("LOOKOUT_MARKETPLACE_MIN_PRICE") {
            self.marketplace
                .get_or_insert_with(MarketplaceSearch::default)
                .min_price = price;
        }
        if let Some(price) = env_parse::<u32>("LOOKOUT_MARKETPLACE_MAX_PRICE") {
            self.marketplace
                .get_or_insert_with(MarketplaceSearch::default)
                .max_price = price;
        }
        if let Some(minutes) = env_parse::<u64>("LOOKOUT_POLL_INTERVAL_MINUTES") {
            self.poll_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(days) = env_parse::<i64>("LOOKOUT_RETENTION_DAYS") {
            self.retention_days = days;
        }
        if let Some(len) = env_parse::<usize>("LOOKOUT_MIN_CONTENT_LEN") {
            self.min_content_len = len;
        }
        if let Ok(path) = std::env::var("LOOKOUT_SEEN_FILE") {
            self.seen_file = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LOOKOUT_MATCH_LOG_FILE") {
            self.match_log_file = PathBuf::from(path);
        }
        if let Ok(agent) = std::env::var("LOOKOUT_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(secs) = env_parse::<u64>("LOOKOUT_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.keywords.iter().all(|kw| kw.trim().is_empty()) {
            bail!("keyword profile is empty; set `keywords` or LOOKOUT_KEYWORDS");
        }
        if !self.effective_sources().iter().any(|source| source.enabled) {
            bail!("no enabled sources configured");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be at least one minute");
        }
        if self.retention_days < 1 {
            bail!("retention window must be at least one day");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Resolves a free-text place name to coordinates. Injectable so the loop
/// can be tested without network lookups; `None` means unknown and the
/// post-filter fails open.
pub trait Geocoder: Send + Sync {
    fn locate(&self, place: &str) -> Option<(f64, f64)>;
}

/// Listing bodies may carry a `"text; location"` suffix.
pub fn location_hint(text: &str) -> Option<&str> {
    text.split_once(';')
        .map(|(_, place)| place.trim())
        .filter(|place| !place.is_empty())
}

/// Great-circle distance between two (latitude, longitude) pairs.
pub fn haversine_miles(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_MILES: f64 = 3958.8;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let half_dlat = (lat2 - lat1) / 2.0;
    let half_dlon = (lon2 - lon1) / 2.0;
    let h = half_dlat.sin().powi(2) + lat1.cos() * lat2.cos() * half_dlon.sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}

/// Outcome counters for one polling cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_polled: usize,
    pub sources_failed: usize,
    pub candidates_extracted: usize,
    pub matches_found: usize,
}

/// Drives repeated fetch → extract → filter → notify cycles. Owns the
/// durable stores for the process lifetime; sources run sequentially, so
/// store writes are single-writer by construction.
pub struct MonitorLoop {
    config: MonitorConfig,
    matcher: TextMatcher,
    fetcher: Box<dyn PageFetcher>,
    extractor: Box<dyn ListingExtractor>,
    notifier: Box<dyn Notifier>,
    geocoder: Option<Box<dyn Geocoder>>,
    seen: SeenStore,
    log: MatchLog,
}

impl MonitorLoop {
    pub async fn new(
        config: MonitorConfig,
        fetcher: Box<dyn PageFetcher>,
        extractor: Box<dyn ListingExtractor>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let profile = KeywordProfile::build(&config.keywords, &DictionaryLemmatizer);
        let matcher = TextMatcher::new(profile, Box::new(DictionaryLemmatizer));
        let seen = SeenStore::load(&config.seen_file).await?;
        info!(seen = seen.len(), "loaded seen store");
        let log = MatchLog::new(
            &config.match_log_file,
            ChronoDuration::days(config.retention_days),
        );
        Ok(Self {
            config,
            matcher,
            fetcher,
            extractor,
            notifier,
            geocoder: None,
            seen,
            log,
        })
    }

    pub fn with_geocoder(mut self, geocoder: Box<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn seen_store(&self) -> &SeenStore {
        &self.seen
    }

    /// Poll every enabled source once. A failing source is logged and
    /// skipped for this cycle only; it never aborts the cycle. Shutdown is
    /// honored between sources: an in-flight match finishes its
    /// log/seen/notify triple, but no new source is started.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleSummary {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut sources_polled = 0usize;
        let mut sources_failed = 0usize;
        let mut candidates_extracted = 0usize;
        let mut matches_found = 0usize;

        let sources: Vec<Source> = self
            .config
            .effective_sources()
            .into_iter()
            .filter(|source| source.enabled)
            .collect();

        for source in &sources {
            if *shutdown.borrow() {
                break;
            }
            sources_polled += 1;

            let markup = match self.fetcher.fetch(&source.url).await {
                Ok(markup) => markup,
                Err(err) => {
                    warn!(%cycle_id, source_url = %source.url, error = %err, "fetch failed; skipping source");
                    sources_failed += 1;
                    continue;
                }
            };

            let candidates = match self.extractor.extract(&markup, source.kind, &source.url) {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(%cycle_id, source_url = %source.url, error = %err, "extraction failed; skipping source");
                    sources_failed += 1;
                    continue;
                }
            };
            candidates_extracted += candidates.len();

            for candidate in candidates {
                if candidate.body.trim().chars().count() < self.config.min_content_len {
                    continue;
                }

                let fp = fingerprint(&canonical_key(&candidate));
                if self.seen.contains(&fp) {
                    continue;
                }

                if !self.matcher.matches(&candidate.title)
                    && !self.matcher.matches(&candidate.body)
                {
                    continue;
                }

                if self.outside_home_radius(&candidate) {
                    info!(%cycle_id, url = %candidate.url, "match outside home radius; dropped");
                    continue;
                }

                self.handle_match(&candidate, &fp).await;
                matches_found += 1;
            }
        }

        CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            sources_polled,
            sources_failed,
            candidates_extracted,
            matches_found,
        }
    }

    /// Effect order is load-bearing: audit log first (cheapest to lose),
    /// then mark seen (stops re-notification), then the user-visible toast.
    async fn handle_match(&mut self, candidate: &Candidate, fp: &Fingerprint) {
        let record = match_record_for(candidate, Utc::now());

        if let Err(err) = self.log.append(&record).await {
            warn!(url = %candidate.url, error = %err, "match log append failed; continuing");
        }
        if let Err(err) = self.seen.mark_seen(fp).await {
            warn!(%fp, error = %err, "seen store append failed; item may re-notify next cycle");
        }

        let title = format!("Matched {} Post", candidate.source_kind.label());
        let headline = if candidate.title.is_empty() {
            &candidate.body
        } else {
            &candidate.title
        };
        if let Err(err) = self
            .notifier
            .notify(&title, clip(headline, NOTIFY_SUMMARY_CHARS))
        {
            warn!(url = %candidate.url, error = %err, "notification delivery failed");
        }
    }

    fn outside_home_radius(&self, candidate: &Candidate) -> bool {
        let (Some(home), Some(geocoder)) = (&self.config.home, &self.geocoder) else {
            return false;
        };
        let Some(place) = location_hint(&candidate.body) else {
            return false;
        };
        // Unknown places fail open: a false positive is a dismissable alert.
        let Some(coords) = geocoder.locate(place) else {
            return false;
        };
        haversine_miles(coords, (home.latitude, home.longitude)) > home.radius_miles
    }

    /// Repeat cycles until the shutdown signal flips. The inter-cycle sleep
    /// is cancellable; shutdown interrupts it promptly.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let summary = self.run_cycle(&shutdown).await;
            info!(
                cycle_id = %summary.cycle_id,
                sources_polled = summary.sources_polled,
                sources_failed = summary.sources_failed,
                candidates = summary.candidates_extracted,
                matches = summary.matches_found,
                "cycle complete"
            );

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("shutdown requested; stopping monitor");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Dedup key for a candidate: the canonicalized listing URL when one was
/// extracted, otherwise the source URL plus body text.
fn canonical_key(candidate: &Candidate) -> String {
    if candidate.url.is_empty() {
        format!("{}|{}", candidate.source_url, candidate.body)
    } else {
        canonicalize_url(&candidate.url).to_string()
    }
}

fn match_record_for(candidate: &Candidate, found_at: DateTime<Utc>) -> MatchRecord {
    let mut content = String::new();
    if !candidate.title.is_empty() {
        content.push_str(&format!("Title: {}\n", candidate.title));
    }
    content.push_str(&format!("Content: {}", candidate.body));
    if !candidate.url.is_empty() {
        content.push_str(&format!("\nURL: {}", candidate.url));
    }

    MatchRecord {
        source: candidate.source_kind.label().to_string(),
        author: candidate
            .author
            .clone()
            .unwrap_or_else(|| candidate.source_kind.label().to_string()),
        content,
        group_url: (candidate.source_kind == SourceKind::Group)
            .then(|| candidate.source_url.clone()),
        post_time: candidate.posted_at,
        found_at,
    }
}
