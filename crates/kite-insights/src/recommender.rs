use chrono::{DateTime, Utc};
use kite_store::{InsightStore, RecommendationInsert, StoreResult};
use kite_types::{
    CallAction, CardAction, CardType, CooldownKey, DetectedPattern, EmailAction, FollowUpAction,
    Priority, Recommendation, RecommendationStatus, ResearchAction, TaskAction, TENANT_SUBJECT,
};

use crate::config::RecommenderConfig;

const RATIONALE_EVIDENCE_IDS: usize = 3;

/// Tallies for one recommender pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecommendReport {
    pub patterns_considered: usize,
    pub created: Vec<Recommendation>,
    /// Candidates dropped because a live recommendation shares their cooldown key.
    pub suppressed: usize,
    /// Candidates that could not be turned into an action (e.g. no email address).
    pub skipped: usize,
}

/// Maps actionable patterns to pending recommendations through the rule table.
#[derive(Debug, Clone, Default)]
pub struct StrategyRecommender {
    config: RecommenderConfig,
}

impl StrategyRecommender {
    pub fn new(config: RecommenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    /// Candidate recommendations for one pattern plus how many rules were skipped.
    pub fn candidates(
        &self,
        pattern: &DetectedPattern,
        now: DateTime<Utc>,
    ) -> (Vec<Recommendation>, usize) {
        let mut candidates = Vec::new();
        let mut skipped = 0;
        for action_type in self.config.actions_for(pattern.pattern_type) {
            match build_action(pattern, *action_type) {
                Some(action) => candidates.push(recommendation_for(pattern, action, now)),
                None => skipped += 1,
            }
        }
        (candidates, skipped)
    }

    #[tracing::instrument(level = "debug", skip(self, insights))]
    pub async fn recommend(
        &self,
        insights: &dyn InsightStore,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RecommendReport> {
        let patterns = insights
            .unmapped_actionable_patterns(tenant_id, self.config.batch_size.max(1))
            .await?;
        let cooldown_since = now - self.config.cooldown();
        let mut report = RecommendReport {
            patterns_considered: patterns.len(),
            ..RecommendReport::default()
        };

        for pattern in &patterns {
            let (candidates, skipped) = self.candidates(pattern, now);
            report.skipped += skipped;
            for candidate in candidates {
                match insights
                    .insert_recommendation_unless_cooling(candidate, cooldown_since)
                    .await?
                {
                    RecommendationInsert::Inserted(recommendation) => {
                        tracing::debug!(
                            tenant_id,
                            recommendation_id = %recommendation.recommendation_id,
                            action_type = %recommendation.action_type,
                            priority = %recommendation.priority,
                            "recommendation created"
                        );
                        report.created.push(recommendation);
                    }
                    RecommendationInsert::Suppressed { existing_id } => {
                        tracing::debug!(
                            tenant_id,
                            existing_id = %existing_id,
                            "recommendation suppressed by cooldown"
                        );
                        report.suppressed += 1;
                    }
                }
            }
            insights
                .mark_patterns_mapped(tenant_id, std::slice::from_ref(&pattern.pattern_id))
                .await?;
        }
        Ok(report)
    }
}

fn recommendation_for(
    pattern: &DetectedPattern,
    action: CardAction,
    now: DateTime<Utc>,
) -> Recommendation {
    let action_type = action.card_type();
    let cooldown_key = CooldownKey {
        tenant_id: pattern.tenant_id.clone(),
        action_type,
        subject_id: pattern.subject_id.clone(),
    };
    Recommendation {
        recommendation_id: kite_core::new_id("rec"),
        pattern_id: pattern.pattern_id.clone(),
        tenant_id: pattern.tenant_id.clone(),
        action_type,
        subject_id: pattern.subject_id.clone(),
        priority: Priority::from_confidence(pattern.confidence),
        confidence: pattern.confidence,
        title: title_for(action_type, pattern),
        rationale: rationale_for(pattern),
        action,
        status: RecommendationStatus::Pending,
        cooldown_key: cooldown_key.to_string(),
        created_at: now,
        updated_at: now,
    }
}

fn subject_label(pattern: &DetectedPattern) -> &str {
    if pattern.subject_id == TENANT_SUBJECT {
        "the account"
    } else {
        &pattern.subject_id
    }
}

fn title_for(action_type: CardType, pattern: &DetectedPattern) -> String {
    let subject = subject_label(pattern);
    match action_type {
        CardType::SendEmail => format!("Email {subject}"),
        CardType::CreateTask => format!("Resolve {} for {subject}", pattern.pattern_type),
        CardType::FollowUp => format!("Follow up with {subject}"),
        CardType::Research => format!("Research {} on {subject}", pattern.pattern_type),
        CardType::ScheduleCall => format!("Call {subject}"),
    }
}

pub(crate) fn rationale_for(pattern: &DetectedPattern) -> String {
    let mut rationale = format!(
        "{} for {} (confidence {:.2}",
        pattern.pattern_type.describe(),
        subject_label(pattern),
        pattern.confidence
    );
    if !pattern.evidence.is_empty() {
        let shown = pattern
            .evidence
            .iter()
            .take(RATIONALE_EVIDENCE_IDS)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let more = pattern.evidence.len().saturating_sub(RATIONALE_EVIDENCE_IDS);
        rationale.push_str(&format!("; {} events: {shown}", pattern.evidence.len()));
        if more > 0 {
            rationale.push_str(&format!(" and {more} more"));
        }
    }
    rationale.push(')');
    rationale
}

/// Builds the concrete payload for one rule; `None` when the pattern lacks
/// what the action needs.
fn build_action(pattern: &DetectedPattern, action_type: CardType) -> Option<CardAction> {
    let subject_id = pattern.subject_id.clone();
    let summary = pattern.pattern_type.describe();
    let action = match action_type {
        CardType::SendEmail => {
            let to = pattern.subject_email.clone()?;
            CardAction::SendEmail(EmailAction {
                to,
                subject: "Checking in".to_string(),
                html: None,
                text: Some(format!(
                    "Hi, it has been a while since we were last in touch. \
                     Is there anything we can help with? ({summary})"
                )),
                contact_id: (subject_id != TENANT_SUBJECT).then_some(subject_id),
            })
        }
        CardType::CreateTask => CardAction::CreateTask(TaskAction {
            title: title_for(action_type, pattern),
            notes: Some(rationale_for(pattern)),
            due_at: None,
        }),
        CardType::FollowUp => CardAction::FollowUp(FollowUpAction {
            subject_id,
            note: summary.to_string(),
            channel: None,
            due_at: None,
        }),
        CardType::Research => CardAction::Research(ResearchAction {
            subject_id,
            topic: summary.to_string(),
        }),
        CardType::ScheduleCall => CardAction::ScheduleCall(CallAction {
            subject_id,
            purpose: summary.to_string(),
            duration_minutes: 30,
        }),
    };
    action.validate().ok()?;
    Some(action)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use chrono::{Duration, TimeZone};
    use kite_store::InMemoryPipelineStore;
    use kite_types::PatternType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn pattern(id: &str, pattern_type: PatternType, confidence: f64) -> DetectedPattern {
        DetectedPattern {
            pattern_id: id.to_string(),
            tenant_id: "acme".to_string(),
            pattern_type,
            subject_id: "client-1".to_string(),
            subject_email: None,
            window_start: now() - Duration::hours(1),
            window_end: now(),
            confidence,
            evidence: vec!["evt_1".to_string(), "evt_2".to_string()],
            actionable: true,
            metrics: BTreeMap::new(),
            detected_at: now(),
            mapped_at: None,
        }
    }

    #[tokio::test]
    async fn functional_confidence_buckets_drive_priority() {
        let store = InMemoryPipelineStore::new();
        let mut low_confidence = pattern("pat_b", PatternType::SentimentShift, 0.55);
        low_confidence.subject_id = "client-2".to_string();
        store
            .insert_patterns(vec![
                pattern("pat_a", PatternType::SentimentShift, 0.95),
                low_confidence,
            ])
            .await
            .expect("insert patterns");

        let report = StrategyRecommender::default()
            .recommend(&store, "acme", now())
            .await
            .expect("recommend");

        assert_eq!(report.patterns_considered, 2);
        let priority_of = |pattern_id: &str| {
            report
                .created
                .iter()
                .find(|item| item.pattern_id == pattern_id)
                .map(|item| item.priority)
        };
        assert_eq!(priority_of("pat_a"), Some(Priority::Critical));
        assert_eq!(priority_of("pat_b"), Some(Priority::Medium));
        assert!(store
            .unmapped_actionable_patterns("acme", 10)
            .await
            .expect("unmapped")
            .is_empty());
    }

    #[tokio::test]
    async fn functional_cooldown_suppresses_second_pattern_for_same_subject() {
        let store = InMemoryPipelineStore::new();
        let recommender = StrategyRecommender::default();
        store
            .insert_patterns(vec![pattern("pat_1", PatternType::VolumeSpike, 0.8)])
            .await
            .expect("insert");
        let first = recommender
            .recommend(&store, "acme", now())
            .await
            .expect("first pass");
        assert_eq!(first.created.len(), 1);

        store
            .insert_patterns(vec![pattern("pat_2", PatternType::VolumeSpike, 0.9)])
            .await
            .expect("insert");
        let second = recommender
            .recommend(&store, "acme", now() + Duration::hours(1))
            .await
            .expect("second pass");
        assert!(second.created.is_empty());
        assert_eq!(second.suppressed, 1);
    }

    #[test]
    fn unit_send_email_candidate_requires_subject_email() {
        let recommender = StrategyRecommender::default();
        let mut gap = pattern("pat_gap", PatternType::ContactGap, 0.8);

        let (candidates, skipped) = recommender.candidates(&gap, now());
        assert_eq!(skipped, 1);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].action_type, CardType::FollowUp);

        gap.subject_email = Some("buyer@client1.com".to_string());
        let (candidates, skipped) = recommender.candidates(&gap, now());
        assert_eq!(skipped, 0);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].cooldown_key, "acme|send_email|client-1");
    }

    #[test]
    fn unit_rationale_references_evidence() {
        let mut volume = pattern("pat_v", PatternType::VolumeDrop, 0.71);
        volume.evidence = (1..=5).map(|n| format!("evt_{n}")).collect();
        let rationale = rationale_for(&volume);
        assert!(rationale.contains("confidence 0.71"));
        assert!(rationale.contains("evt_1, evt_2, evt_3 and 2 more"));
    }
}
