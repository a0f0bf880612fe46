use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use kite_types::{Cadence, CardType, PatternType};

/// Thresholds and parameters for the detector catalog (`[detectors]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    /// Patterns scoring below this are not reported at all.
    pub report_floor: f64,
    /// How far before the window start history is read for baselines and gaps.
    pub history_days: i64,
    pub max_evidence: usize,
    pub volume: VolumeConfig,
    pub contact_gap: ContactGapConfig,
    pub sentiment: SentimentConfig,
    pub sla: SlaConfig,
    pub reply_rate: RateAnomalyConfig,
    pub bounce_rate: RateAnomalyConfig,
    pub execution_failures: RateAnomalyConfig,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            report_floor: 0.3,
            history_days: 30,
            max_evidence: 25,
            volume: VolumeConfig::default(),
            contact_gap: ContactGapConfig::default(),
            sentiment: SentimentConfig::default(),
            sla: SlaConfig::default(),
            reply_rate: RateAnomalyConfig {
                enabled: true,
                threshold: 0.5,
                rate_limit: 0.05,
                min_samples: 10,
            },
            bounce_rate: RateAnomalyConfig {
                enabled: true,
                threshold: 0.5,
                rate_limit: 0.10,
                min_samples: 10,
            },
            execution_failures: RateAnomalyConfig {
                enabled: true,
                threshold: 0.5,
                rate_limit: 0.20,
                min_samples: 5,
            },
        }
    }
}

impl DetectorsConfig {
    /// History span for a window of `window_len`.
    pub fn history_span(&self, window_len: Duration) -> Duration {
        let baseline = window_len * i32::try_from(self.volume.baseline_windows).unwrap_or(i32::MAX);
        baseline.max(Duration::days(self.history_days.max(0)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub baseline_windows: u32,
    pub min_events: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            baseline_windows: 4,
            min_events: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactGapConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub gap_days: i64,
}

impl Default for ContactGapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.6,
            gap_days: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub min_samples: usize,
    pub min_shift: f64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            min_samples: 3,
            min_shift: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub horizon_hours: i64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            horizon_hours: 24,
        }
    }
}

/// Tenant-wide ratio detector: flags when `rate` crosses `rate_limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateAnomalyConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub rate_limit: f64,
    pub min_samples: u32,
}

impl Default for RateAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            rate_limit: 0.1,
            min_samples: 10,
        }
    }
}

/// Recommender rule table and cooldown (`[recommender]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    pub cooldown_days: i64,
    pub batch_size: usize,
    pub rules: BTreeMap<PatternType, Vec<CardType>>,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            cooldown_days: 7,
            batch_size: 200,
            rules: default_rules(),
        }
    }
}

impl RecommenderConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::days(self.cooldown_days.max(0))
    }

    pub fn actions_for(&self, pattern_type: PatternType) -> &[CardType] {
        self.rules
            .get(&pattern_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn default_rules() -> BTreeMap<PatternType, Vec<CardType>> {
    BTreeMap::from([
        (
            PatternType::VolumeDrop,
            vec![CardType::FollowUp, CardType::Research],
        ),
        (PatternType::VolumeSpike, vec![CardType::Research]),
        (
            PatternType::ContactGap,
            vec![CardType::SendEmail, CardType::FollowUp],
        ),
        (PatternType::SentimentShift, vec![CardType::ScheduleCall]),
        (PatternType::SlaBreachRisk, vec![CardType::CreateTask]),
        (PatternType::LowReplyRate, vec![CardType::Research]),
        (PatternType::BounceSpike, vec![CardType::CreateTask]),
        (PatternType::ExecutionFailureSpike, vec![CardType::CreateTask]),
    ])
}

/// Cadence schedules and job limits (`[scheduler]`).
///
/// The background loop schedules tenants that have a `[tenants.<id>]` table
/// or received a runtime mode update. A tenant served only through
/// `[defaults]` runs jobs on demand through the API or CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub timezone: String,
    pub hourly_cron: String,
    pub daily_cron: String,
    pub weekly_cron: String,
    pub tick_seconds: u64,
    pub job_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "UTC".to_string(),
            hourly_cron: Cadence::Hourly.default_cron().to_string(),
            daily_cron: Cadence::Daily.default_cron().to_string(),
            weekly_cron: Cadence::Weekly.default_cron().to_string(),
            tick_seconds: 60,
            job_timeout_seconds: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn cron_for(&self, cadence: Cadence) -> &str {
        match cadence {
            Cadence::Hourly => &self.hourly_cron,
            Cadence::Daily => &self.daily_cron,
            Cadence::Weekly => &self.weekly_cron,
        }
    }

    pub fn tick(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_seconds.max(1))
    }

    pub fn job_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.job_timeout_seconds.max(1))
    }
}
