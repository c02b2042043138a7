//! Batch preprocessing: restriction drops, parsing, tenant resolution and
//! event validation.
//!
//! Produces the `EventWithTeam` list the rest of the pipeline works on.
//! Invalid events are dropped here, with a tenant-visible ingestion warning
//! where the tenant is known. Warnings are throttled per tenant and type so
//! a misbehaving SDK cannot flood the warning stream.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use weir_core::{Clock, MemoryRateLimiter};
use weir_event::{EventWithTeam, PipelineEvent, RawMessage, Team};

use crate::metrics::PipelineMetrics;
use crate::restrictions::EventRestrictionManager;
use crate::stores::{IngestionWarning, IngestionWarningSink};
use crate::PipelineError;

/// One warning per tenant and type per hour
const WARNING_BUCKET_CAPACITY: f64 = 1.0;
const WARNING_REFILL_PER_SEC: f64 = 1.0 / 3600.0;

/// Maps API tokens to tenants
#[async_trait]
pub trait TeamResolver: Send + Sync {
    /// Resolve a token; `None` when no tenant owns it
    async fn team_for_token(&self, token: &str) -> Result<Option<Team>, PipelineError>;
}

/// Static token registry used in tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryTeamResolver {
    teams: DashMap<String, Team>,
}

impl InMemoryTeamResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, team: Team) {
        self.teams.insert(team.token.clone(), team);
    }
}

#[async_trait]
impl TeamResolver for InMemoryTeamResolver {
    async fn team_for_token(&self, token: &str) -> Result<Option<Team>, PipelineError> {
        Ok(self.teams.get(token).map(|t| t.clone()))
    }
}

/// Turns raw log messages into validated, tenant-resolved events
pub struct Preprocessor {
    restrictions: Arc<EventRestrictionManager>,
    resolver: Arc<dyn TeamResolver>,
    warnings: Arc<dyn IngestionWarningSink>,
    warning_limiter: MemoryRateLimiter,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
}

impl Preprocessor {
    pub fn new(
        restrictions: Arc<EventRestrictionManager>,
        resolver: Arc<dyn TeamResolver>,
        warnings: Arc<dyn IngestionWarningSink>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            restrictions,
            resolver,
            warnings,
            warning_limiter: MemoryRateLimiter::new(
                WARNING_BUCKET_CAPACITY,
                WARNING_REFILL_PER_SEC,
            ),
            metrics,
            clock,
        }
    }

    /// Run every message through drop restrictions, parsing, tenant
    /// resolution and validation. Dropped messages are counted, never
    /// returned. Tenant resolution failures are transient and fail the
    /// whole batch so the log redelivers it.
    pub async fn preprocess(
        &self,
        messages: &[RawMessage],
    ) -> Result<Vec<EventWithTeam>, PipelineError> {
        let mut out = Vec::with_capacity(messages.len());

        for message in messages {
            // Header fast path: drop restricted traffic without paying for
            // a parse.
            if self.dropped_by_headers(message) {
                self.count_drop();
                continue;
            }

            let event = match PipelineEvent::parse(&message.value) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Dropping unparseable message"
                    );
                    self.count_drop();
                    continue;
                }
            };

            let Some(token) = event.token.clone().filter(|t| !t.is_empty()) else {
                debug!(event = %event.event, "Dropping event without token");
                self.count_drop();
                continue;
            };

            if self
                .restrictions
                .should_drop_event(&token, event.distinct_id.as_deref())
            {
                self.count_drop();
                continue;
            }

            let Some(team) = self.resolver.team_for_token(&token).await? else {
                debug!(token = %token, "Dropping event for unknown token");
                self.count_drop();
                continue;
            };

            if uuid::Uuid::parse_str(&event.uuid).is_err() {
                self.emit_warning_throttled(
                    team.id,
                    "invalid_event_uuid",
                    format!("event {} carried uuid {:?}", event.event, event.uuid),
                );
                self.count_drop();
                continue;
            }

            let skip_person = self
                .restrictions
                .should_skip_person(&token, event.distinct_id.as_deref());

            out.push(EventWithTeam {
                message: message.clone(),
                event,
                team,
                skip_person,
            });
        }

        Ok(out)
    }

    fn dropped_by_headers(&self, message: &RawMessage) -> bool {
        let Some(token) = message
            .header("token")
            .and_then(|v| std::str::from_utf8(v).ok())
        else {
            return false;
        };
        let distinct_id = message
            .header("distinct_id")
            .and_then(|v| std::str::from_utf8(v).ok());
        self.restrictions.should_drop_event(token, distinct_id)
    }

    fn count_drop(&self) {
        self.metrics
            .events_dropped
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn emit_warning_throttled(&self, team_id: i64, warning_type: &str, details: String) {
        let key = format!("{team_id}:{warning_type}");
        if !self.warning_limiter.consume(&key, 1.0, self.clock.now_ms()) {
            return;
        }
        warn!(team_id, warning_type, %details, "Ingestion warning");
        self.warnings.emit(IngestionWarning {
            team_id,
            warning_type: warning_type.to_string(),
            details,
        });
        self.metrics
            .ingestion_warnings
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryWarningSink;
    use smallvec::smallvec;
    use weir_core::MockClock;

    struct Fixture {
        preprocessor: Preprocessor,
        warnings: Arc<InMemoryWarningSink>,
        metrics: Arc<PipelineMetrics>,
        clock: MockClock,
    }

    fn fixture(restrictions: EventRestrictionManager) -> Fixture {
        let resolver = Arc::new(InMemoryTeamResolver::new());
        resolver.register(Team {
            id: 2,
            token: "t_good".to_string(),
            name: "Good Team".to_string(),
        });
        let warnings = Arc::new(InMemoryWarningSink::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let clock = MockClock::at(1_720_000_000_000);
        let preprocessor = Preprocessor::new(
            Arc::new(restrictions),
            resolver,
            warnings.clone(),
            metrics.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            preprocessor,
            warnings,
            metrics,
            clock,
        }
    }

    fn raw(payload: serde_json::Value) -> RawMessage {
        RawMessage {
            topic: "events-main".to_string(),
            partition: 0,
            offset: 1,
            timestamp_ms: 1_720_000_000_000,
            key: None,
            value: payload.to_string().into_bytes(),
            headers: smallvec![],
        }
    }

    fn valid_event(token: &str, distinct_id: &str) -> serde_json::Value {
        serde_json::json!({
            "uuid": "550e8400-e29b-41d4-a716-446655440000",
            "event": "$pageview",
            "token": token,
            "distinct_id": distinct_id,
        })
    }

    #[tokio::test]
    async fn test_valid_event_passes_through() {
        let f = fixture(EventRestrictionManager::default());
        let out = f
            .preprocessor
            .preprocess(&[raw(valid_event("t_good", "user-1"))])
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].team.id, 2);
        assert!(!out[0].skip_person);
    }

    #[tokio::test]
    async fn test_unparseable_and_unknown_token_are_dropped() {
        let f = fixture(EventRestrictionManager::default());
        let mut garbage = raw(serde_json::json!({}));
        garbage.value = b"not json".to_vec();

        let out = f
            .preprocessor
            .preprocess(&[garbage, raw(valid_event("t_unknown", "user-1"))])
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(f.metrics.snapshot().events_dropped, 2);
    }

    #[tokio::test]
    async fn test_drop_restriction_via_headers_skips_parse() {
        let f = fixture(EventRestrictionManager::new(
            &["t_good:spammer".to_string()],
            &[],
            &[],
        ));
        let mut message = raw(valid_event("t_good", "spammer"));
        message.headers = smallvec![
            ("token".to_string(), b"t_good".to_vec()),
            ("distinct_id".to_string(), b"spammer".to_vec()),
        ];
        // Unparseable on purpose: the header fast path must not parse it.
        message.value = b"not json".to_vec();

        let out = f.preprocessor.preprocess(&[message]).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(f.metrics.snapshot().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_drop_restriction_via_parsed_event() {
        let f = fixture(EventRestrictionManager::new(
            &["t_good".to_string()],
            &[],
            &[],
        ));
        let out = f
            .preprocessor
            .preprocess(&[raw(valid_event("t_good", "user-1"))])
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_skip_person_flag_is_set() {
        let f = fixture(EventRestrictionManager::new(
            &[],
            &["t_good:anonymous".to_string()],
            &[],
        ));
        let out = f
            .preprocessor
            .preprocess(&[
                raw(valid_event("t_good", "anonymous")),
                raw(valid_event("t_good", "user-1")),
            ])
            .await
            .unwrap();

        assert!(out[0].skip_person);
        assert!(!out[1].skip_person);
    }

    #[tokio::test]
    async fn test_invalid_uuid_warns_and_drops() {
        let f = fixture(EventRestrictionManager::default());
        let mut payload = valid_event("t_good", "user-1");
        payload["uuid"] = serde_json::json!("not-a-uuid");

        let out = f.preprocessor.preprocess(&[raw(payload)]).await.unwrap();
        assert!(out.is_empty());

        let warnings = f.warnings.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].team_id, 2);
        assert_eq!(warnings[0].warning_type, "invalid_event_uuid");
    }

    #[tokio::test]
    async fn test_warnings_throttled_per_team_and_type() {
        let f = fixture(EventRestrictionManager::default());
        let mut payload = valid_event("t_good", "user-1");
        payload["uuid"] = serde_json::json!("not-a-uuid");

        for _ in 0..5 {
            f.preprocessor
                .preprocess(&[raw(payload.clone())])
                .await
                .unwrap();
        }
        assert_eq!(f.warnings.warnings().len(), 1);

        // After an hour the bucket has one token again.
        f.clock.advance(std::time::Duration::from_secs(3600));
        f.preprocessor.preprocess(&[raw(payload)]).await.unwrap();
        assert_eq!(f.warnings.warnings().len(), 2);
    }
}
