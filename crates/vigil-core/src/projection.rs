//! Entity projection: the in-memory fold of the event stream.
//!
//! A [`Projection`] is plain state with transition functions -- no
//! locks, no channels. Exactly one writer exists (the source task),
//! which publishes [`ProjectionSnapshot`]s through a `watch` channel
//! after each mutation; readers never touch the projection directly.
//!
//! Per-state counters are adjusted by -1/+1 on every transition, never
//! recomputed by rescanning, so they stay O(1) on the hot path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use vigil_api::StreamEvent;

/// A domain object tracked by the projection, keyed by business key
/// (MAC address, session id, ...). Fields are an opaque bag merged
/// from successive events.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub key: String,
    pub state: String,
    pub fields: Value,
    pub discovered_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(key: impl Into<String>, state: impl Into<String>, fields: Value) -> Self {
        Self {
            key: key.into(),
            state: state.into(),
            fields,
            discovered_at: Utc::now(),
        }
    }
}

/// Point-in-time view of the projection, published to subscribers.
#[derive(Debug, Clone, Default)]
pub struct ProjectionSnapshot {
    /// Entities in discovery order.
    pub entities: Vec<Arc<EntityRecord>>,
    /// Entity count per state. `sum(values) == entities.len()`.
    pub counts: HashMap<String, usize>,
}

/// State an entity starts in when its discovery payload names none.
const DEFAULT_STATE: &str = "discovered";

/// The mutable projection. Owned by the source task.
#[derive(Debug, Default)]
pub struct Projection {
    entities: IndexMap<String, EntityRecord>,
    counts: HashMap<String, usize>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one entity-lifecycle event. Returns `true` if the
    /// projection changed (callers republish the snapshot on `true`).
    ///
    /// Non-entity events (`Established`, `Heartbeat`, `SessionStatus`,
    /// `Error`, `Unknown`) are not this module's business and are
    /// ignored here.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Discovered { key, fields } => self.discovered(key, fields),
            StreamEvent::StateChanged {
                key,
                previous,
                state,
                extra,
            } => self.state_changed(key, previous.as_deref(), state, extra),
            _ => false,
        }
    }

    /// Insert a newly discovered entity. A second discovery for an
    /// existing key is a no-op: nothing is overwritten.
    fn discovered(&mut self, key: &str, fields: &Value) -> bool {
        if self.entities.contains_key(key) {
            tracing::debug!(key, "duplicate discovery ignored");
            return false;
        }

        let state = fields
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STATE)
            .to_owned();

        *self.counts.entry(state.clone()).or_insert(0) += 1;
        self.entities
            .insert(key.to_owned(), EntityRecord::new(key, state, fields.clone()));
        true
    }

    /// Transition an existing entity. Events for unknown keys are
    /// dropped -- a state change never conjures a placeholder entity.
    fn state_changed(
        &mut self,
        key: &str,
        previous: Option<&str>,
        state: &str,
        extra: &Value,
    ) -> bool {
        let Some(record) = self.entities.get_mut(key) else {
            tracing::warn!(key, state, "state change for unknown entity dropped");
            return false;
        };

        if let Some(prev) = previous {
            if prev != record.state {
                tracing::debug!(
                    key,
                    expected = prev,
                    actual = %record.state,
                    "state change arrived out of step with local state"
                );
            }
        }

        decrement(&mut self.counts, &record.state);
        *self.counts.entry(state.to_owned()).or_insert(0) += 1;

        record.state = state.to_owned();
        merge_shallow(&mut record.fields, extra);
        true
    }

    /// Imperative overwrite for callers hydrating from a non-streaming
    /// source. Counters are rebuilt from the incoming set (not a hot
    /// path).
    pub fn replace_all(&mut self, entities: Vec<EntityRecord>) {
        self.entities.clear();
        self.counts.clear();
        for record in entities {
            *self.counts.entry(record.state.clone()).or_insert(0) += 1;
            self.entities.insert(record.key.clone(), record);
        }
    }

    pub fn get(&self, key: &str) -> Option<&EntityRecord> {
        self.entities.get(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities currently in the given state.
    pub fn count_in_state(&self, state: &str) -> usize {
        self.counts.get(state).copied().unwrap_or(0)
    }

    /// Build the snapshot subscribers receive.
    pub fn snapshot(&self) -> ProjectionSnapshot {
        ProjectionSnapshot {
            entities: self
                .entities
                .values()
                .map(|r| Arc::new(r.clone()))
                .collect(),
            counts: self.counts.clone(),
        }
    }
}

fn decrement(counts: &mut HashMap<String, usize>, state: &str) {
    if let Some(n) = counts.get_mut(state) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            counts.remove(state);
        }
    }
}

/// Merge `patch` onto `base`, one top-level key at a time.
pub(crate) fn merge_shallow(base: &mut Value, patch: &Value) {
    let Some(patch_obj) = patch.as_object() else {
        return;
    };
    if !base.is_object() {
        *base = Value::Object(serde_json::Map::new());
    }
    if let Some(base_obj) = base.as_object_mut() {
        for (k, v) in patch_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}
