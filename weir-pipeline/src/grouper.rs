//! Grouping by `(token, distinct_id)`.
//!
//! Events for the same identity must be applied in arrival order; events
//! for different identities have no ordering relationship and are processed
//! concurrently. Events without a distinct id group under the empty string
//! so they still process sequentially per token.

use ahash::AHashMap;

use weir_event::{EventWithTeam, EventsForKey};

/// Partition a batch into per-identity groups, preserving arrival order
/// within each group and first-appearance order across groups.
pub fn group_events_by_key(events: Vec<EventWithTeam>) -> Vec<EventsForKey> {
    let mut groups: Vec<EventsForKey> = Vec::new();
    let mut index: AHashMap<(String, String), usize> = AHashMap::new();

    for event in events {
        let token = event.team.token.clone();
        let distinct_id = event.event.distinct_id.clone().unwrap_or_default();

        match index.get(&(token.clone(), distinct_id.clone())) {
            Some(&i) => groups[i].events.push(event),
            None => {
                index.insert((token.clone(), distinct_id.clone()), groups.len());
                groups.push(EventsForKey {
                    token,
                    distinct_id,
                    events: vec![event],
                });
            }
        }
    }

    groups
}
