//! Presence tracking for one topic.
//!
//! `presence_state` replaces the whole map; `presence_diff` applies joins
//! then leaves. A diff that arrives before the first state of a join
//! generation is held back and replayed once that state lands.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

/// Diffs held back while waiting for the first state. Older ones are dropped
/// beyond this; the state that ends the wait supersedes them anyway.
pub const MAX_PENDING_DIFFS: usize = 256;

/// `key -> metas`, metas in arrival order.
pub type PresenceState = BTreeMap<String, Vec<Value>>;

/// Callback receiving `(key, previous_metas, changed_metas)`.
pub type PresenceCallback = Box<dyn Fn(&str, Option<&[Value]>, &[Value]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChangeKind {
    Join,
    Leave,
}

/// One join or leave produced by applying a state or diff.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    pub kind: PresenceChangeKind,
    pub key: String,
    /// Metas the key held before the change.
    pub previous: Option<Vec<Value>>,
    pub changed: Vec<Value>,
}

#[derive(Default)]
pub struct Presence {
    state: PresenceState,
    pending_diffs: VecDeque<(PresenceState, PresenceState)>,
    synced: bool,
    on_join: Option<PresenceCallback>,
    on_leave: Option<PresenceCallback>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("state", &self.state)
            .field("pending_diffs", &self.pending_diffs.len())
            .field("synced", &self.synced)
            .finish()
    }
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_join(&mut self, callback: impl Fn(&str, Option<&[Value]>, &[Value]) + Send + Sync + 'static) {
        self.on_join = Some(Box::new(callback));
    }

    pub fn on_leave(&mut self, callback: impl Fn(&str, Option<&[Value]>, &[Value]) + Send + Sync + 'static) {
        self.on_leave = Some(Box::new(callback));
    }

    /// Replace the map wholesale, then replay any diffs that were waiting.
    pub fn apply_state(&mut self, mut snapshot: PresenceState) -> Vec<PresenceChange> {
        snapshot.retain(|_, metas| !metas.is_empty());
        let previous = std::mem::replace(&mut self.state, snapshot);
        let mut changes = Vec::new();

        for (key, metas) in &self.state {
            let before = previous.get(key);
            let joined: Vec<Value> = metas
                .iter()
                .filter(|m| !before.is_some_and(|b| contains_meta(b, m)))
                .cloned()
                .collect();
            if !joined.is_empty() {
                changes.push(PresenceChange {
                    kind: PresenceChangeKind::Join,
                    key: key.clone(),
                    previous: before.cloned(),
                    changed: joined,
                });
            }
        }
        for (key, metas) in &previous {
            let now = self.state.get(key);
            let left: Vec<Value> = metas
                .iter()
                .filter(|m| !now.is_some_and(|n| contains_meta(n, m)))
                .cloned()
                .collect();
            if !left.is_empty() {
                changes.push(PresenceChange {
                    kind: PresenceChangeKind::Leave,
                    key: key.clone(),
                    previous: Some(metas.clone()),
                    changed: left,
                });
            }
        }

        self.synced = true;
        self.notify(&changes);

        while let Some((joins, leaves)) = self.pending_diffs.pop_front() {
            let replayed = self.merge_diff(joins, leaves);
            self.notify(&replayed);
            changes.extend(replayed);
        }
        changes
    }

    /// Apply one diff: joins first, then leaves.
    pub fn apply_diff(&mut self, joins: PresenceState, leaves: PresenceState) -> Vec<PresenceChange> {
        if !self.synced {
            if self.pending_diffs.len() >= MAX_PENDING_DIFFS {
                self.pending_diffs.pop_front();
                warn!(max = MAX_PENDING_DIFFS, "Presence diff queue full, dropped oldest diff");
            }
            self.pending_diffs.push_back((joins, leaves));
            debug!(queued = self.pending_diffs.len(), "Presence diff before state, queueing");
            return Vec::new();
        }
        let changes = self.merge_diff(joins, leaves);
        self.notify(&changes);
        changes
    }

    fn merge_diff(&mut self, joins: PresenceState, leaves: PresenceState) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        for (key, metas) in joins {
            if metas.is_empty() {
                continue;
            }
            let previous = self.state.get(&key).cloned();
            let entry = self.state.entry(key.clone()).or_default();
            for meta in &metas {
                if !contains_meta(entry.as_slice(), meta) {
                    entry.push(meta.clone());
                }
            }
            changes.push(PresenceChange {
                kind: PresenceChangeKind::Join,
                key,
                previous,
                changed: metas,
            });
        }

        for (key, metas) in leaves {
            let Some(current) = self.state.get_mut(&key) else {
                continue;
            };
            let previous = current.clone();
            current.retain(|m| !contains_meta(&metas, m));
            if current.is_empty() {
                self.state.remove(&key);
            }
            changes.push(PresenceChange {
                kind: PresenceChangeKind::Leave,
                key,
                previous: Some(previous),
                changed: metas,
            });
        }

        changes
    }

    fn notify(&self, changes: &[PresenceChange]) {
        for change in changes {
            let callback = match change.kind {
                PresenceChangeKind::Join => &self.on_join,
                PresenceChangeKind::Leave => &self.on_leave,
            };
            if let Some(cb) = callback {
                cb(&change.key, change.previous.as_deref(), &change.changed);
            }
        }
    }

    /// Forget everything ahead of a rejoin. Callbacks are kept.
    pub fn reset(&mut self) {
        self.state.clear();
        self.pending_diffs.clear();
        self.synced = false;
    }

    pub fn is_online(&self, key: &str) -> bool {
        self.state.get(key).is_some_and(|metas| !metas.is_empty())
    }

    pub fn online_keys(&self) -> BTreeSet<String> {
        self.state.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<(String, Vec<Value>)> {
        self.state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Whether a `presence_state` has arrived since the last reset.
    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

/// Metas are the same presence when their `phx_ref`s match, or, lacking
/// refs, when they are equal.
fn same_meta(a: &Value, b: &Value) -> bool {
    match (a.get("phx_ref"), b.get("phx_ref")) {
        (Some(ra), Some(rb)) => ra == rb,
        _ => a == b,
    }
}

fn contains_meta(metas: &[Value], meta: &Value) -> bool {
    metas.iter().any(|m| same_meta(m, meta))
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

/// Parse `{ "key": { "metas": [...] } }`. Entries without `metas` are skipped.
pub fn parse_state(value: &Value) -> PresenceState {
    let mut result = PresenceState::new();
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            if let Some(metas) = val.get("metas").and_then(|m| m.as_array()) {
                result.insert(key.clone(), metas.clone());
            }
        }
    }
    result
}

/// Parse a `presence_diff` payload into `(joins, leaves)`.
pub fn parse_diff(value: &Value) -> (PresenceState, PresenceState) {
    let joins = value.get("joins").map(parse_state).unwrap_or_default();
    let leaves = value.get("leaves").map(parse_state).unwrap_or_default();
    (joins, leaves)
}
