//! Deterministic detectors evaluated over one tenant window.
//!
//! A detector sees the window's events (unprocessed and all) plus the tenant's history
//! immediately before the window, and reports at most one candidate per
//! subject. The catalog turns candidates into [`DetectedPattern`]s and is the
//! only place that calls `mark_processed`.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use kite_store::{collect_window, EventWarehouse, InsightStore, StoreResult};
use kite_types::{DetectedPattern, Event, EventQuery, EventType, PatternType, TENANT_SUBJECT};

use crate::config::{
    ContactGapConfig, DetectorsConfig, RateAnomalyConfig, SentimentConfig, SlaConfig,
    VolumeConfig,
};

/// Events visible to detectors for one window.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub tenant_id: &'a str,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub history_start: DateTime<Utc>,
    /// Unprocessed events in `[window_start, window_end)`, in occurrence order.
    pub window: &'a [Event],
    /// Every event in `[window_start, window_end)`, processed or not.
    pub observed: &'a [Event],
    /// Every event in `[history_start, window_start)`.
    pub history: &'a [Event],
}

impl DetectionContext<'_> {
    pub fn window_len(&self) -> Duration {
        self.window_end - self.window_start
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.history.iter().chain(self.window.iter())
    }
}

/// Detector output before ids and window bounds are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternCandidate {
    pub pattern_type: PatternType,
    pub subject_id: String,
    pub confidence: f64,
    pub actionable: bool,
    pub evidence: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

pub trait PatternDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate>;
}

/// Outcome of analysing one window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionReport {
    pub events_consumed: usize,
    pub events_marked: usize,
    pub patterns: Vec<DetectedPattern>,
}

/// Fixed set of detectors plus the shared reporting rules.
pub struct DetectorCatalog {
    config: DetectorsConfig,
    detectors: Vec<Box<dyn PatternDetector>>,
}

impl std::fmt::Debug for DetectorCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorCatalog")
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DetectorCatalog {
    pub fn new(config: DetectorsConfig, detectors: Vec<Box<dyn PatternDetector>>) -> Self {
        Self { config, detectors }
    }

    pub fn from_config(config: DetectorsConfig) -> Self {
        let mut detectors: Vec<Box<dyn PatternDetector>> = Vec::new();
        if config.volume.enabled {
            detectors.push(Box::new(VolumeDetector::new(config.volume.clone())));
        }
        if config.contact_gap.enabled {
            detectors.push(Box::new(ContactGapDetector::new(config.contact_gap.clone())));
        }
        if config.sentiment.enabled {
            detectors.push(Box::new(SentimentShiftDetector::new(config.sentiment.clone())));
        }
        if config.sla.enabled {
            detectors.push(Box::new(SlaRiskDetector::new(config.sla.clone())));
        }
        if config.reply_rate.enabled {
            detectors.push(Box::new(RateAnomalyDetector::low_reply_rate(
                config.reply_rate.clone(),
            )));
        }
        if config.bounce_rate.enabled {
            detectors.push(Box::new(RateAnomalyDetector::bounce_spike(
                config.bounce_rate.clone(),
            )));
        }
        if config.execution_failures.enabled {
            detectors.push(Box::new(RateAnomalyDetector::execution_failures(
                config.execution_failures.clone(),
            )));
        }
        Self::new(config, detectors)
    }

    pub fn config(&self) -> &DetectorsConfig {
        &self.config
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|detector| detector.name()).collect()
    }

    /// Runs every detector and converts reportable candidates into patterns.
    pub fn evaluate(&self, context: &DetectionContext<'_>, now: DateTime<Utc>) -> Vec<DetectedPattern> {
        let mut patterns = Vec::new();
        for detector in &self.detectors {
            let mut candidates = detector.detect(context);
            candidates.sort_by(|left, right| left.subject_id.cmp(&right.subject_id));
            let mut seen = HashSet::new();
            for candidate in candidates {
                if !seen.insert((candidate.pattern_type, candidate.subject_id.clone())) {
                    continue;
                }
                if !candidate.confidence.is_finite() || candidate.confidence < self.config.report_floor {
                    continue;
                }
                patterns.push(self.to_pattern(context, candidate, now));
            }
        }
        patterns
    }

    fn to_pattern(
        &self,
        context: &DetectionContext<'_>,
        candidate: PatternCandidate,
        now: DateTime<Utc>,
    ) -> DetectedPattern {
        let mut evidence = candidate.evidence;
        evidence.truncate(self.config.max_evidence);
        DetectedPattern {
            pattern_id: kite_core::new_id("pat"),
            tenant_id: context.tenant_id.to_string(),
            pattern_type: candidate.pattern_type,
            subject_email: subject_email(context, &candidate.subject_id),
            subject_id: candidate.subject_id,
            window_start: context.window_start,
            window_end: context.window_end,
            confidence: candidate.confidence.clamp(0.0, 1.0),
            evidence,
            actionable: candidate.actionable,
            metrics: candidate.metrics,
            detected_at: now,
            mapped_at: None,
        }
    }

    /// Analyses `[window_start, window_end)` for one tenant and marks the
    /// consumed events processed once the patterns are stored.
    #[tracing::instrument(level = "debug", skip(self, events, insights))]
    pub async fn run_window(
        &self,
        events: &dyn EventWarehouse,
        insights: &dyn InsightStore,
        tenant_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DetectionReport> {
        let observed = collect_window(
            events,
            EventQuery::window(tenant_id, window_start, window_end),
        )
        .await?;
        let window = observed
            .iter()
            .filter(|event| event.processed_at.is_none())
            .cloned()
            .collect::<Vec<_>>();
        let history_start = window_start - self.config.history_span(window_end - window_start);
        let history = collect_window(
            events,
            EventQuery::window(tenant_id, history_start, window_start),
        )
        .await?;

        let context = DetectionContext {
            tenant_id,
            window_start,
            window_end,
            history_start,
            window: &window,
            observed: &observed,
            history: &history,
        };
        let patterns = self.evaluate(&context, now);
        if !patterns.is_empty() {
            insights.insert_patterns(patterns.clone()).await?;
        }

        let consumed = window
            .iter()
            .map(|event| event.event_id.clone())
            .collect::<Vec<_>>();
        let events_marked = if consumed.is_empty() {
            0
        } else {
            events.mark_processed(tenant_id, &consumed).await?
        };
        tracing::debug!(
            tenant_id,
            events = consumed.len(),
            events_marked,
            patterns = patterns.len(),
            "window analysed"
        );
        Ok(DetectionReport {
            events_consumed: consumed.len(),
            events_marked,
            patterns,
        })
    }
}

fn subject_email(context: &DetectionContext<'_>, subject_id: &str) -> Option<String> {
    if subject_id == TENANT_SUBJECT {
        return None;
    }
    context
        .all_events()
        .filter(|event| event.subject_id.as_deref() == Some(subject_id))
        .filter_map(|event| event.payload_str("email"))
        .filter(|email| kite_types::is_plausible_email(email))
        .last()
        .map(kite_types::normalize_email)
}

fn business_events<'a>(events: &'a [Event]) -> impl Iterator<Item = &'a Event> {
    events
        .iter()
        .filter(|event| !event.event_type.is_pipeline_feedback())
}

fn metrics<const N: usize>(entries: [(&str, f64); N]) -> BTreeMap<String, f64> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn days(duration: Duration) -> f64 {
    duration.num_seconds() as f64 / 86_400.0
}

/// Activity volume against the trailing baseline windows.
#[derive(Debug, Clone)]
pub struct VolumeDetector {
    config: VolumeConfig,
}

impl VolumeDetector {
    pub fn new(config: VolumeConfig) -> Self {
        Self { config }
    }
}

impl PatternDetector for VolumeDetector {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate> {
        let baseline_windows = self.config.baseline_windows.max(1);
        let window_len = context.window_len();
        if window_len <= Duration::zero() {
            return Vec::new();
        }

        // Counted over every window event so a shorter cadence that already
        // consumed them does not read as a drop here.
        let mut current: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
        for event in business_events(context.observed) {
            current.entry(event.subject_key()).or_default().push(event);
        }
        let mut baseline: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for event in business_events(context.history) {
            let age = context.window_start - event.occurred_at;
            let bucket = (age.num_milliseconds() - 1).max(0) / window_len.num_milliseconds().max(1);
            let Ok(bucket) = usize::try_from(bucket) else {
                continue;
            };
            if bucket >= baseline_windows as usize {
                continue;
            }
            let counts = baseline
                .entry(event.subject_key())
                .or_insert_with(|| vec![0; baseline_windows as usize]);
            counts[bucket] += 1;
        }

        let subjects = current
            .keys()
            .chain(baseline.keys())
            .copied()
            .collect::<BTreeSet<_>>();
        let mut candidates = Vec::new();
        for subject in subjects {
            let Some(counts) = baseline.get(subject) else {
                continue;
            };
            let window_events = current.get(subject).map(Vec::as_slice).unwrap_or_default();
            let count = window_events.len() as f64;
            let n = counts.len() as f64;
            let mean = counts.iter().map(|value| f64::from(*value)).sum::<f64>() / n;
            let min_events = f64::from(self.config.min_events);
            if count < min_events && mean < min_events {
                continue;
            }
            let variance = counts
                .iter()
                .map(|value| (f64::from(*value) - mean).powi(2))
                .sum::<f64>()
                / n;
            let std_dev = variance.sqrt().max(1.0_f64.max(mean.sqrt()));
            let z_score = (count - mean) / std_dev;
            if z_score == 0.0 {
                continue;
            }
            let confidence = 1.0 - (-z_score.abs() / 2.0).exp();
            candidates.push(PatternCandidate {
                pattern_type: if z_score > 0.0 {
                    PatternType::VolumeSpike
                } else {
                    PatternType::VolumeDrop
                },
                subject_id: subject.to_string(),
                confidence,
                actionable: confidence >= self.config.threshold,
                evidence: window_events
                    .iter()
                    .map(|event| event.event_id.clone())
                    .collect(),
                metrics: metrics([
                    ("window_count", count),
                    ("baseline_mean", mean),
                    ("baseline_std", std_dev),
                    ("z_score", z_score),
                ]),
            });
        }
        candidates
    }
}

/// Subjects active in the window whose last touchpoint is too old.
#[derive(Debug, Clone)]
pub struct ContactGapDetector {
    config: ContactGapConfig,
}

impl ContactGapDetector {
    pub fn new(config: ContactGapConfig) -> Self {
        Self { config }
    }
}

impl PatternDetector for ContactGapDetector {
    fn name(&self) -> &'static str {
        "contact_gap"
    }

    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate> {
        let gap_days = self.config.gap_days.max(1) as f64;
        let mut active: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
        for event in business_events(context.window) {
            if let Some(subject) = event.subject_id.as_deref() {
                active.entry(subject).or_default().push(event);
            }
        }

        let mut last_contact: BTreeMap<&str, &Event> = BTreeMap::new();
        for event in context
            .all_events()
            .filter(|event| event.event_type.is_contact())
        {
            let Some(subject) = event.subject_id.as_deref() else {
                continue;
            };
            let newer = last_contact
                .get(subject)
                .map_or(true, |seen| event.occurred_at >= seen.occurred_at);
            if newer {
                last_contact.insert(subject, event);
            }
        }

        let mut candidates = Vec::new();
        for (subject, events) in active {
            let since = last_contact
                .get(subject)
                .map_or(context.history_start, |event| event.occurred_at);
            let gap = days(context.window_end - since);
            if gap <= gap_days {
                continue;
            }
            let confidence = gap / (gap + gap_days);
            let mut evidence = events
                .iter()
                .map(|event| event.event_id.clone())
                .collect::<Vec<_>>();
            if let Some(contact) = last_contact.get(subject) {
                evidence.insert(0, contact.event_id.clone());
            }
            candidates.push(PatternCandidate {
                pattern_type: PatternType::ContactGap,
                subject_id: subject.to_string(),
                confidence,
                actionable: confidence >= self.config.threshold,
                evidence,
                metrics: metrics([
                    ("gap_days", gap),
                    ("expected_days", gap_days),
                    (
                        "contact_seen",
                        if last_contact.contains_key(subject) { 1.0 } else { 0.0 },
                    ),
                ]),
            });
        }
        candidates
    }
}

/// Mean `payload.sentiment` in the window against history.
#[derive(Debug, Clone)]
pub struct SentimentShiftDetector {
    config: SentimentConfig,
}

impl SentimentShiftDetector {
    pub fn new(config: SentimentConfig) -> Self {
        Self { config }
    }
}

fn sentiment_samples<'a>(events: &'a [Event]) -> BTreeMap<&'a str, Vec<(&'a Event, f64)>> {
    let mut samples: BTreeMap<&str, Vec<(&Event, f64)>> = BTreeMap::new();
    for event in events {
        if let Some(score) = event.payload_f64("sentiment").filter(|score| score.is_finite()) {
            samples
                .entry(event.subject_key())
                .or_default()
                .push((event, score.clamp(-1.0, 1.0)));
        }
    }
    samples
}

fn mean_of(samples: &[(&Event, f64)]) -> f64 {
    samples.iter().map(|(_, score)| score).sum::<f64>() / samples.len() as f64
}

impl PatternDetector for SentimentShiftDetector {
    fn name(&self) -> &'static str {
        "sentiment_shift"
    }

    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate> {
        let min_samples = self.config.min_samples.max(1);
        let current = sentiment_samples(context.window);
        let history = sentiment_samples(context.history);

        let mut candidates = Vec::new();
        for (subject, window_samples) in current {
            let Some(history_samples) = history.get(subject) else {
                continue;
            };
            if window_samples.len() < min_samples || history_samples.len() < min_samples {
                continue;
            }
            let window_mean = mean_of(&window_samples);
            let history_mean = mean_of(history_samples);
            let shift = window_mean - history_mean;
            if shift.abs() < self.config.min_shift {
                continue;
            }
            let n = window_samples.len() as f64;
            let confidence = shift.abs().min(1.0) * n / (n + 1.0);
            candidates.push(PatternCandidate {
                pattern_type: PatternType::SentimentShift,
                subject_id: subject.to_string(),
                confidence,
                // Only a worsening mood warrants an action.
                actionable: shift < 0.0 && confidence >= self.config.threshold,
                evidence: window_samples
                    .iter()
                    .map(|(event, _)| event.event_id.clone())
                    .collect(),
                metrics: metrics([
                    ("window_mean", window_mean),
                    ("history_mean", history_mean),
                    ("shift", shift),
                    ("samples", n),
                ]),
            });
        }
        candidates
    }
}

/// Open SLAs whose deadline falls within the horizon.
#[derive(Debug, Clone)]
pub struct SlaRiskDetector {
    config: SlaConfig,
}

impl SlaRiskDetector {
    pub fn new(config: SlaConfig) -> Self {
        Self { config }
    }
}

impl PatternDetector for SlaRiskDetector {
    fn name(&self) -> &'static str {
        "sla_risk"
    }

    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate> {
        let horizon = Duration::hours(self.config.horizon_hours.max(1));
        let resolved = context
            .all_events()
            .filter(|event| event.event_type == EventType::SlaResolved)
            .filter_map(|event| event.payload_str("sla_id"))
            .collect::<HashSet<_>>();

        let mut worst: BTreeMap<&str, (f64, Vec<String>, f64)> = BTreeMap::new();
        for event in context
            .all_events()
            .filter(|event| event.event_type == EventType::SlaStarted)
        {
            let Some(sla_id) = event.payload_str("sla_id") else {
                continue;
            };
            if resolved.contains(sla_id) {
                continue;
            }
            let Some(due_at) = event
                .payload_str("due_at")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|due| due.with_timezone(&Utc))
            else {
                continue;
            };
            let remaining = due_at - context.window_end;
            if remaining > horizon {
                continue;
            }
            let confidence = if remaining <= Duration::zero() {
                1.0
            } else {
                1.0 - remaining.num_seconds() as f64 / horizon.num_seconds() as f64
            };
            let entry = worst
                .entry(event.subject_key())
                .or_insert_with(|| (0.0, Vec::new(), f64::MAX));
            entry.0 = entry.0.max(confidence);
            entry.1.push(event.event_id.clone());
            entry.2 = entry.2.min(remaining.num_seconds() as f64 / 3_600.0);
        }

        worst
            .into_iter()
            .map(|(subject, (confidence, evidence, hours_remaining))| PatternCandidate {
                pattern_type: PatternType::SlaBreachRisk,
                subject_id: subject.to_string(),
                confidence,
                actionable: confidence >= self.config.threshold,
                evidence,
                metrics: metrics([("hours_remaining", hours_remaining)]),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateDirection {
    Below,
    Above,
}

/// Tenant-wide ratio of two event counts inside the window.
#[derive(Debug, Clone)]
pub struct RateAnomalyDetector {
    name: &'static str,
    pattern_type: PatternType,
    numerator: &'static [EventType],
    denominator: &'static [EventType],
    direction: RateDirection,
    config: RateAnomalyConfig,
}

impl RateAnomalyDetector {
    pub fn low_reply_rate(config: RateAnomalyConfig) -> Self {
        Self {
            name: "low_reply_rate",
            pattern_type: PatternType::LowReplyRate,
            numerator: &[EventType::EmailReplied],
            denominator: &[EventType::EmailSent],
            direction: RateDirection::Below,
            config,
        }
    }

    pub fn bounce_spike(config: RateAnomalyConfig) -> Self {
        Self {
            name: "bounce_spike",
            pattern_type: PatternType::BounceSpike,
            numerator: &[EventType::EmailBounced],
            denominator: &[EventType::EmailSent],
            direction: RateDirection::Above,
            config,
        }
    }

    pub fn execution_failures(config: RateAnomalyConfig) -> Self {
        Self {
            name: "execution_failures",
            pattern_type: PatternType::ExecutionFailureSpike,
            numerator: &[EventType::CardFailed, EventType::CardBlocked],
            denominator: &[
                EventType::CardExecuted,
                EventType::CardFailed,
                EventType::CardBlocked,
            ],
            direction: RateDirection::Above,
            config,
        }
    }
}

impl PatternDetector for RateAnomalyDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn detect(&self, context: &DetectionContext<'_>) -> Vec<PatternCandidate> {
        let hits = context
            .window
            .iter()
            .filter(|event| self.numerator.contains(&event.event_type))
            .collect::<Vec<_>>();
        let samples = context
            .window
            .iter()
            .filter(|event| self.denominator.contains(&event.event_type))
            .count();
        if samples == 0 || samples < self.config.min_samples as usize {
            return Vec::new();
        }

        let n = samples as f64;
        let rate = hits.len() as f64 / n;
        let limit = self.config.rate_limit.max(f64::EPSILON);
        let severity = match self.direction {
            RateDirection::Below if rate < limit => 1.0 - rate / limit,
            RateDirection::Above if rate > limit => ((rate - limit) / limit).min(1.0),
            _ => return Vec::new(),
        };
        let confidence = severity * n / (n + f64::from(self.config.min_samples.max(1)));
        vec![PatternCandidate {
            pattern_type: self.pattern_type,
            subject_id: TENANT_SUBJECT.to_string(),
            confidence,
            actionable: confidence >= self.config.threshold,
            evidence: hits.iter().map(|event| event.event_id.clone()).collect(),
            metrics: metrics([("rate", rate), ("samples", n), ("rate_limit", limit)]),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn event(
        id: &str,
        event_type: EventType,
        subject: Option<&str>,
        at: DateTime<Utc>,
        payload: Value,
    ) -> Event {
        Event {
            event_id: id.to_string(),
            tenant_id: "acme".to_string(),
            event_type,
            subject_id: subject.map(str::to_string),
            natural_key: id.to_string(),
            payload,
            occurred_at: at,
            created_at: at,
            processed_at: None,
        }
    }

    fn context<'a>(window: &'a [Event], history: &'a [Event]) -> DetectionContext<'a> {
        DetectionContext {
            tenant_id: "acme",
            window_start: start(),
            window_end: start() + Duration::hours(1),
            history_start: start() - Duration::days(30),
            window,
            observed: window,
            history,
        }
    }

    fn hourly_orders(subject: &str, per_hour: &[usize]) -> Vec<Event> {
        let mut events = Vec::new();
        for (index, count) in per_hour.iter().enumerate() {
            let hour_start = start() - Duration::hours(index as i64 + 1);
            for n in 0..*count {
                events.push(event(
                    &format!("h-{subject}-{index}-{n}"),
                    EventType::OrderCreated,
                    Some(subject),
                    hour_start + Duration::minutes(n as i64),
                    json!({}),
                ));
            }
        }
        events
    }

    #[test]
    fn unit_volume_drop_scores_by_z_score() {
        let history = hourly_orders("client-1", &[8, 8, 8, 8]);
        let window = Vec::new();
        let detector = VolumeDetector::new(VolumeConfig::default());

        let candidates = detector.detect(&context(&window, &history));
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.pattern_type, PatternType::VolumeDrop);
        // std floor is sqrt(8); z = -8 / sqrt(8)
        let expected_z = -8.0 / 8.0_f64.sqrt();
        assert!((candidate.metrics["z_score"] - expected_z).abs() < 1e-9);
        let expected = 1.0 - (-expected_z.abs() / 2.0).exp();
        assert!((candidate.confidence - expected).abs() < 1e-9);
        assert!(candidate.actionable);
    }

    #[test]
    fn unit_volume_spike_requires_history() {
        let window = (0..6)
            .map(|n| {
                event(
                    &format!("w{n}"),
                    EventType::OrderCreated,
                    Some("new-client"),
                    start() + Duration::minutes(n),
                    json!({}),
                )
            })
            .collect::<Vec<_>>();
        let detector = VolumeDetector::new(VolumeConfig::default());
        assert!(detector.detect(&context(&window, &[])).is_empty());

        let history = hourly_orders("new-client", &[1, 1, 1, 1]);
        let candidates = detector.detect(&context(&window, &history));
        assert_eq!(candidates[0].pattern_type, PatternType::VolumeSpike);
        assert_eq!(candidates[0].evidence.len(), 6);
    }

    #[test]
    fn unit_contact_gap_confidence_grows_with_gap() {
        let window = vec![event(
            "w1",
            EventType::OrderCreated,
            Some("client-9"),
            start() + Duration::minutes(5),
            json!({"email": "Buyer@Client9.com"}),
        )];
        let history = vec![event(
            "h1",
            EventType::EmailSent,
            Some("client-9"),
            start() + Duration::hours(1) - Duration::days(28),
            json!({}),
        )];
        let detector = ContactGapDetector::new(ContactGapConfig::default());

        let candidates = detector.detect(&context(&window, &history));
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 28.0 / 42.0).abs() < 1e-9);
        assert_eq!(candidates[0].evidence[0], "h1");
        assert!(candidates[0].actionable);

        let recent = vec![event(
            "h2",
            EventType::MeetingHeld,
            Some("client-9"),
            start() - Duration::days(2),
            json!({}),
        )];
        assert!(detector.detect(&context(&window, &recent)).is_empty());
    }

    #[test]
    fn unit_sentiment_shift_only_actionable_when_negative() {
        let samples = |prefix: &str, score: f64, base: DateTime<Utc>| {
            (0..3)
                .map(|n| {
                    event(
                        &format!("{prefix}{n}"),
                        EventType::FeedbackReceived,
                        Some("client-2"),
                        base + Duration::minutes(n),
                        json!({"sentiment": score}),
                    )
                })
                .collect::<Vec<_>>()
        };
        let detector = SentimentShiftDetector::new(SentimentConfig::default());

        let history = samples("h", 0.6, start() - Duration::days(3));
        let worse = samples("w", -0.4, start());
        let candidates = detector.detect(&context(&worse, &history));
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 0.75).abs() < 1e-9);
        assert!(candidates[0].actionable);

        let history = samples("h", -0.4, start() - Duration::days(3));
        let better = samples("w", 0.6, start());
        let candidates = detector.detect(&context(&better, &history));
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].actionable);
    }

    #[test]
    fn unit_sla_risk_ignores_resolved_and_distant_deadlines() {
        let window_end = start() + Duration::hours(1);
        let history = vec![
            event(
                "s1",
                EventType::SlaStarted,
                Some("client-3"),
                start() - Duration::hours(20),
                json!({"sla_id": "sla-1", "due_at": (window_end + Duration::hours(6)).to_rfc3339()}),
            ),
            event(
                "s2",
                EventType::SlaStarted,
                Some("client-4"),
                start() - Duration::hours(20),
                json!({"sla_id": "sla-2", "due_at": (window_end - Duration::hours(1)).to_rfc3339()}),
            ),
            event(
                "s3",
                EventType::SlaStarted,
                Some("client-5"),
                start() - Duration::hours(2),
                json!({"sla_id": "sla-3", "due_at": (window_end + Duration::days(5)).to_rfc3339()}),
            ),
        ];
        let window = vec![event(
            "r2",
            EventType::SlaResolved,
            Some("client-4"),
            start() + Duration::minutes(10),
            json!({"sla_id": "sla-2"}),
        )];
        let detector = SlaRiskDetector::new(SlaConfig::default());

        let candidates = detector.detect(&context(&window, &history));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].subject_id, "client-3");
        assert!((candidates[0].confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unit_low_reply_rate_needs_minimum_sample() {
        let sends = |count: usize| {
            (0..count)
                .map(|n| {
                    event(
                        &format!("s{n}"),
                        EventType::EmailSent,
                        Some("contact"),
                        start() + Duration::seconds(n as i64),
                        json!({}),
                    )
                })
                .collect::<Vec<_>>()
        };
        let detector = RateAnomalyDetector::low_reply_rate(DetectorsConfig::default().reply_rate);

        assert!(detector.detect(&context(&sends(9), &[])).is_empty());
        let candidates = detector.detect(&context(&sends(30), &[]));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].subject_id, TENANT_SUBJECT);
        assert!((candidates[0].confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn functional_catalog_applies_report_floor_and_subject_email() {
        let catalog = DetectorCatalog::from_config(DetectorsConfig::default());
        let window = vec![event(
            "w1",
            EventType::OrderCreated,
            Some("client-9"),
            start() + Duration::minutes(5),
            json!({"email": "Buyer@Client9.com"}),
        )];
        let patterns = catalog.evaluate(&context(&window, &[]), start());

        let gap = patterns
            .iter()
            .find(|pattern| pattern.pattern_type == PatternType::ContactGap)
            .expect("contact gap reported");
        assert_eq!(gap.subject_email.as_deref(), Some("buyer@client9.com"));
        assert_eq!(gap.window_start, start());
        assert!(gap.pattern_id.starts_with("pat_"));
        assert!(patterns
            .iter()
            .all(|pattern| pattern.confidence >= catalog.config().report_floor));
    }
}
