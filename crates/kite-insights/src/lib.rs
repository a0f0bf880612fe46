//! Insight pipeline: pattern detection, strategy recommendation and the
//! cadence jobs that drive them.

mod config;
mod detectors;
mod recommender;
mod scheduler;

pub use config::{
    ContactGapConfig, DetectorsConfig, RateAnomalyConfig, RecommenderConfig, SchedulerConfig,
    SentimentConfig, SlaConfig, VolumeConfig,
};
pub use detectors::{
    ContactGapDetector, DetectionContext, DetectionReport, DetectorCatalog, PatternCandidate,
    PatternDetector, RateAnomalyDetector, SentimentShiftDetector, SlaRiskDetector,
    VolumeDetector,
};
pub use recommender::{RecommendReport, StrategyRecommender};
pub use scheduler::{
    start_insight_scheduler, CadenceSchedules, InsightJobRunner, InsightSchedulerHandle,
    SchedulerJobError,
};
