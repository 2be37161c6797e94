//! File-based poller
//!
//! Fallback transport that polls the terminal's exported JSON files over
//! HTTP. Each logical feed tries an ordered list of candidate endpoints —
//! a compatibility shim for differing terminal deployments — and only the
//! first well-formed response counts. Bodies may be newline-delimited
//! JSON written incrementally by a non-atomic writer, so every read is
//! treated as potentially torn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::StatusHandle;
use crate::config::PipelineConfig;
use crate::normalize::{latest_record_where, normalize_message, FeedMessage, NormalizedRecord};
use crate::types::TransportKind;

/// Logical feeds served by the file exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Tick,
    Candle,
    Account,
    Symbols,
}

impl Feed {
    pub const ALL: [Feed; 4] = [Feed::Tick, Feed::Candle, Feed::Account, Feed::Symbols];

    /// File name used in endpoint templates
    pub fn file_name(&self) -> &'static str {
        match self {
            Feed::Tick => "tick_data",
            Feed::Candle => "ohlc_data",
            Feed::Account => "account_info",
            Feed::Symbols => "symbols_list",
        }
    }

    /// Does a parsed message match this feed's expected shape?
    fn matches(&self, msg: &FeedMessage) -> bool {
        matches!(
            (self, msg),
            (Feed::Tick, FeedMessage::Tick(_))
                | (Feed::Candle, FeedMessage::Ohlc(_))
                | (Feed::Account, FeedMessage::AccountInfo(_))
                | (Feed::Symbols, FeedMessage::Symbols(_))
        )
    }
}

/// Change-detection marker for one feed: a validator header when the
/// server provides one, the raw body otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    LastModified(String),
    Etag(String),
    Body(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedOutcome {
    Published,
    Unchanged,
    Failed,
}

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct PollReport {
    pub published: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// True once the consecutive-error budget is spent and the poller
    /// has marked itself inactive
    pub exhausted: bool,
}

pub struct FilePoller {
    config: Arc<PipelineConfig>,
    status: Arc<StatusHandle>,
    http: reqwest::Client,
    markers: Mutex<HashMap<&'static str, Marker>>,
    consecutive_errors: AtomicU32,
    parse_failures: AtomicU64,
    active: AtomicBool,
}

impl FilePoller {
    pub fn new(config: Arc<PipelineConfig>, status: Arc<StatusHandle>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            status,
            http,
            markers: Mutex::new(HashMap::new()),
            consecutive_errors: AtomicU32::new(0),
            parse_failures: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Arm the poller and forget previous markers so the first cycle
    /// republishes a full snapshot.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.markers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("file poller activated");
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Drop stored markers so the next cycle republishes everything;
    /// the file-transport equivalent of a snapshot request.
    pub fn force_refresh(&self) {
        self.markers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// One idempotent poll cycle over all feeds. Feeds are fetched
    /// concurrently, each bounded by its own timeout, so one slow feed
    /// cannot stall the rest.
    pub async fn poll(&self) -> PollReport {
        let mut report = PollReport::default();
        if !self.is_active() {
            return report;
        }

        let outcomes = join_all(Feed::ALL.iter().map(|feed| self.poll_feed(*feed))).await;
        for outcome in outcomes {
            match outcome {
                FeedOutcome::Published => report.published += 1,
                FeedOutcome::Unchanged => report.unchanged += 1,
                FeedOutcome::Failed => report.failed += 1,
            }
        }

        if report.failed == Feed::ALL.len() {
            let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
            if errors >= self.config.max_consecutive_errors && self.is_active() {
                self.active.store(false, Ordering::SeqCst);
                report.exhausted = true;
                let detail =
                    format!("file feeds unavailable after {} consecutive failed cycles", errors);
                warn!("{}", detail);
                self.status
                    .set_transport_state(TransportKind::File, false, Some(detail));
            }
        } else {
            self.consecutive_errors.store(0, Ordering::SeqCst);
        }

        report
    }

    /// Probe the file server without publishing anything
    pub async fn test_reachability(&self) -> (bool, String) {
        let feed = Feed::Symbols;
        let mut tried = Vec::new();
        for url in self.config.feed_urls(feed.file_name()) {
            match self.fetch(&url).await {
                Ok((body, _)) => {
                    if latest_record_where(&body, |msg| feed.matches(msg)).is_some() {
                        return (true, format!("reachable via {}", url));
                    }
                    tried.push(format!("{}: malformed body", url));
                }
                Err(e) => tried.push(format!("{}: {}", url, e)),
            }
        }
        (false, format!("no endpoint responded: [{}]", tried.join("; ")))
    }

    async fn poll_feed(&self, feed: Feed) -> FeedOutcome {
        for url in self.config.feed_urls(feed.file_name()) {
            match self.fetch(&url).await {
                Ok((body, marker)) => {
                    match self.ingest(feed, &body, marker) {
                        FeedOutcome::Failed => continue, // malformed; try next endpoint
                        outcome => return outcome,
                    }
                }
                Err(e) => {
                    debug!(feed = feed.file_name(), %url, error = %e, "feed fetch failed");
                    continue;
                }
            }
        }
        FeedOutcome::Failed
    }

    /// Fetch one candidate endpoint, returning the body and its
    /// change-detection marker.
    async fn fetch(&self, url: &str) -> anyhow::Result<(String, Option<Marker>)> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("status {}", response.status());
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let last_modified = header("last-modified");
        let etag = header("etag");
        let body = response.text().await?;
        let marker = last_modified
            .map(Marker::LastModified)
            .or(etag.map(Marker::Etag));
        Ok((body, marker))
    }

    /// Apply change detection and defensive parsing to one fetched body,
    /// publishing the normalized record when it is genuinely new.
    fn ingest(&self, feed: Feed, body: &str, header_marker: Option<Marker>) -> FeedOutcome {
        if body.trim().is_empty() {
            return FeedOutcome::Failed;
        }
        let marker = header_marker.unwrap_or_else(|| Marker::Body(body.to_string()));

        {
            let markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
            if markers.get(feed.file_name()) == Some(&marker) {
                return FeedOutcome::Unchanged;
            }
        }

        let Some(msg) = latest_record_where(body, |msg| feed.matches(msg)) else {
            self.note_parse_failure(feed, "no record of the expected shape");
            return FeedOutcome::Failed;
        };
        let Some(record) = normalize_message(msg) else {
            self.note_parse_failure(feed, "failed validation");
            return FeedOutcome::Failed;
        };

        self.markers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(feed.file_name(), marker);

        if let NormalizedRecord::Pong = record {
            return FeedOutcome::Unchanged;
        }
        self.status.publish_record(record);
        FeedOutcome::Published
    }

    // Malformed reads are routine with a non-atomic writer: keep the log
    // quiet, surfacing at most every tenth failure.
    fn note_parse_failure(&self, feed: Feed, reason: &str) {
        let count = self.parse_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count % 10 == 0 {
            warn!(
                feed = feed.file_name(),
                count, reason, "discarding malformed feed payloads"
            );
        } else {
            debug!(feed = feed.file_name(), reason, "discarding malformed feed payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::types::{Event, EventKind};
    use std::sync::atomic::AtomicUsize;

    fn poller_with_events() -> (FilePoller, Arc<AtomicUsize>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let published = Arc::new(AtomicUsize::new(0));
        let published_clone = published.clone();
        dispatcher.subscribe(EventKind::Tick, move |event| {
            if matches!(event, Event::Tick(_)) {
                published_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let status = Arc::new(StatusHandle::new(
            dispatcher,
            TransportKind::File,
        ));
        let poller = FilePoller::new(Arc::new(PipelineConfig::default()), status);
        poller.activate();
        (poller, published)
    }

    const TICK_BODY: &str = r#"{"type":"TICK","data":{"symbol":"EURUSD","time":1700000000,"bid":1.08,"ask":1.081,"last":1.0805,"volume":5,"flags":0}}"#;

    #[test]
    fn test_unchanged_body_publishes_exactly_once() {
        let (poller, published) = poller_with_events();

        assert_eq!(
            poller.ingest(Feed::Tick, TICK_BODY, None),
            FeedOutcome::Published
        );
        assert_eq!(
            poller.ingest(Feed::Tick, TICK_BODY, None),
            FeedOutcome::Unchanged
        );
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_header_marker_takes_precedence_over_body() {
        let (poller, published) = poller_with_events();
        let marker = Some(Marker::LastModified("Tue, 05 Aug 2025 10:00:00 GMT".into()));

        assert_eq!(
            poller.ingest(Feed::Tick, TICK_BODY, marker.clone()),
            FeedOutcome::Published
        );
        // Same validator, different body: still treated as unchanged.
        let other = TICK_BODY.replace("1.0805", "1.0999");
        assert_eq!(
            poller.ingest(Feed::Tick, &other, marker),
            FeedOutcome::Unchanged
        );
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_body_republishes() {
        let (poller, published) = poller_with_events();

        poller.ingest(Feed::Tick, TICK_BODY, None);
        let newer = TICK_BODY.replace("1700000000", "1700000001");
        assert_eq!(
            poller.ingest(Feed::Tick, &newer, None),
            FeedOutcome::Published
        );
        assert_eq!(published.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_truncated_tail_recovers_last_complete_record() {
        let (poller, published) = poller_with_events();
        let body = format!("{}\n{}", TICK_BODY, r#"{"type":"TICK","data":{"symbol":"EURUSD","time":17000"#);
        assert_eq!(
            poller.ingest(Feed::Tick, &body, None),
            FeedOutcome::Published
        );
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_and_garbage_bodies_fail_quietly() {
        let (poller, published) = poller_with_events();
        assert_eq!(poller.ingest(Feed::Tick, "", None), FeedOutcome::Failed);
        assert_eq!(
            poller.ingest(Feed::Tick, "\n  \n", None),
            FeedOutcome::Failed
        );
        assert_eq!(
            poller.ingest(Feed::Tick, "garbage", None),
            FeedOutcome::Failed
        );
        assert_eq!(published.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrong_shape_for_feed_is_rejected() {
        let (poller, published) = poller_with_events();
        let ohlc = r#"{"type":"OHLC","data":{"symbol":"EURUSD","timestamp":1700000000,"open":1.08,"high":1.09,"low":1.07,"close":1.085,"volume":100}}"#;
        assert_eq!(poller.ingest(Feed::Tick, ohlc, None), FeedOutcome::Failed);
        assert_eq!(published.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_parse_is_retried_after_marker_not_stored() {
        let (poller, published) = poller_with_events();
        // First read is torn mid-record; the next cycle sees the repaired
        // file and must publish even though the failed body was newer.
        let torn = r#"{"type":"TICK","data":{"symbol":"EURUS"#;
        assert_eq!(poller.ingest(Feed::Tick, torn, None), FeedOutcome::Failed);
        assert_eq!(
            poller.ingest(Feed::Tick, TICK_BODY, None),
            FeedOutcome::Published
        );
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_refresh_republishes() {
        let (poller, published) = poller_with_events();
        poller.ingest(Feed::Tick, TICK_BODY, None);
        poller.force_refresh();
        assert_eq!(
            poller.ingest(Feed::Tick, TICK_BODY, None),
            FeedOutcome::Published
        );
        assert_eq!(published.load(Ordering::SeqCst), 2);
    }
}
