//! Per-key ingestion restrictions.
//!
//! Operators can drop events, skip person-state processing, or force
//! overflow routing for a whole token or a single `token:distinct_id`
//! identity. Lists come from configuration at startup and can be swapped
//! at runtime without a restart.

use ahash::AHashSet;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct RestrictionSet {
    keys: RwLock<AHashSet<String>>,
}

impl RestrictionSet {
    fn from_keys(keys: &[String]) -> Self {
        Self {
            keys: RwLock::new(keys.iter().cloned().collect()),
        }
    }

    /// A key matches when either the bare token or the full
    /// `token:distinct_id` pair is listed.
    fn matches(&self, token: &str, distinct_id: Option<&str>) -> bool {
        let keys = self.keys.read();
        if keys.contains(token) {
            return true;
        }
        match distinct_id {
            Some(id) => keys.contains(&format!("{token}:{id}")),
            None => false,
        }
    }

    fn replace(&self, keys: Vec<String>) {
        *self.keys.write() = keys.into_iter().collect();
    }
}

/// Lookup for the three restriction policies
#[derive(Debug, Default)]
pub struct EventRestrictionManager {
    drop_events: RestrictionSet,
    skip_person: RestrictionSet,
    force_overflow: RestrictionSet,
}

impl EventRestrictionManager {
    pub fn new(
        drop_events: &[String],
        skip_person: &[String],
        force_overflow: &[String],
    ) -> Self {
        Self {
            drop_events: RestrictionSet::from_keys(drop_events),
            skip_person: RestrictionSet::from_keys(skip_person),
            force_overflow: RestrictionSet::from_keys(force_overflow),
        }
    }

    pub fn should_drop_event(&self, token: &str, distinct_id: Option<&str>) -> bool {
        self.drop_events.matches(token, distinct_id)
    }

    pub fn should_skip_person(&self, token: &str, distinct_id: Option<&str>) -> bool {
        self.skip_person.matches(token, distinct_id)
    }

    pub fn should_force_overflow(&self, token: &str, distinct_id: Option<&str>) -> bool {
        self.force_overflow.matches(token, distinct_id)
    }

    /// Replace the drop list wholesale
    pub fn set_drop_events(&self, keys: Vec<String>) {
        self.drop_events.replace(keys);
    }

    /// Replace the skip-person list wholesale
    pub fn set_skip_person(&self, keys: Vec<String>) {
        self.skip_person.replace(keys);
    }

    /// Replace the force-overflow list wholesale
    pub fn set_force_overflow(&self, keys: Vec<String>) {
        self.force_overflow.replace(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EventRestrictionManager {
        EventRestrictionManager::new(
            &["blocked_token".to_string(), "t1:spammer".to_string()],
            &["t2:anonymous".to_string()],
            &["hot_token".to_string()],
        )
    }

    #[test]
    fn test_token_wide_restriction_matches_any_distinct_id() {
        let m = manager();
        assert!(m.should_drop_event("blocked_token", Some("anyone")));
        assert!(m.should_drop_event("blocked_token", None));
        assert!(!m.should_drop_event("t1", Some("other")));
    }

    #[test]
    fn test_scoped_restriction_matches_exact_pair_only() {
        let m = manager();
        assert!(m.should_drop_event("t1", Some("spammer")));
        assert!(!m.should_drop_event("t1", Some("legit")));
        assert!(!m.should_drop_event("t1", None));
    }

    #[test]
    fn test_policies_are_independent() {
        let m = manager();
        assert!(m.should_skip_person("t2", Some("anonymous")));
        assert!(!m.should_drop_event("t2", Some("anonymous")));
        assert!(m.should_force_overflow("hot_token", Some("anyone")));
        assert!(!m.should_force_overflow("t2", Some("anonymous")));
    }

    #[test]
    fn test_runtime_replacement() {
        let m = manager();
        m.set_drop_events(vec!["other_token".to_string()]);
        assert!(!m.should_drop_event("blocked_token", None));
        assert!(m.should_drop_event("other_token", None));
    }
}
