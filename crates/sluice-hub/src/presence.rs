//! Per-topic presence state.
//!
//! An OR-set over `phx_ref`: every tracked meta carries a globally unique ref
//! minted on track, entries union by ref, and joins/leaves fall out of set
//! difference over refs. A key disappears only when its last meta is removed,
//! so multiple sessions may share one key.
use serde_json::{Map, Value, json};
use sluice_common::ids::SessionRef;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    pub phx_ref: String,
    pub session: SessionRef,
    pub payload: Value,
}

impl Meta {
    fn to_json(&self) -> Value {
        // The client payload is spread into the meta object alongside the ref.
        let mut object = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        object.insert("phx_ref".to_string(), json!(self.phx_ref));
        Value::Object(object)
    }

    fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let phx_ref = object.get("phx_ref")?.as_str()?.to_string();
        let mut payload = object.clone();
        payload.remove("phx_ref");
        Some(Self {
            phx_ref,
            // Remote metas are not tied to a local session.
            session: SessionRef::new(),
            payload: Value::Object(payload),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    entries: HashMap<String, Vec<Meta>>,
}

impl PresenceState {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a meta under `key` and return the `presence_diff` payload
    /// describing the join.
    pub fn track(&mut self, key: &str, meta: Meta) -> Value {
        let diff = diff_payload([(key, std::slice::from_ref(&meta))], []);
        self.entries.entry(key.to_string()).or_default().push(meta);
        diff
    }

    /// Remove every meta owned by `session`. Returns the leave diff, or None
    /// if the session had nothing tracked.
    pub fn untrack_session(&mut self, session: SessionRef) -> Option<Value> {
        let mut leaves: Vec<(String, Vec<Meta>)> = Vec::new();
        self.entries.retain(|key, metas| {
            let removed: Vec<Meta> = metas
                .iter()
                .filter(|meta| meta.session == session)
                .cloned()
                .collect();
            if !removed.is_empty() {
                metas.retain(|meta| meta.session != session);
                leaves.push((key.clone(), removed));
            }
            !metas.is_empty()
        });
        if leaves.is_empty() {
            return None;
        }
        Some(diff_payload(
            [],
            leaves.iter().map(|(key, metas)| (key.as_str(), &metas[..])),
        ))
    }

    /// Full `presence_state` payload sent on subscribe.
    pub fn state_payload(&self) -> Value {
        let mut state = Map::new();
        for (key, metas) in &self.entries {
            state.insert(key.clone(), metas_json(metas));
        }
        Value::Object(state)
    }

    /// OR-set merge of a remote node's full state. Returns the join diff for
    /// refs we had not seen, or None if the merge added nothing.
    pub fn merge_remote(&mut self, remote_state: &Value) -> Option<Value> {
        let remote = remote_state.as_object()?;
        let mut joins: Vec<(String, Vec<Meta>)> = Vec::new();
        for (key, value) in remote {
            let Some(metas) = value.get("metas").and_then(Value::as_array) else {
                continue;
            };
            let known = self.entries.entry(key.clone()).or_default();
            let mut added = Vec::new();
            for meta in metas.iter().filter_map(Meta::from_json) {
                if !known.iter().any(|existing| existing.phx_ref == meta.phx_ref) {
                    known.push(meta.clone());
                    added.push(meta);
                }
            }
            if added.is_empty() {
                self.drop_if_empty(key);
            } else {
                joins.push((key.clone(), added));
            }
        }
        if joins.is_empty() {
            return None;
        }
        Some(diff_payload(
            joins.iter().map(|(key, metas)| (key.as_str(), &metas[..])),
            [],
        ))
    }

    /// Drop the refs named in a remote leave diff.
    pub fn apply_remote_leaves(&mut self, leaves: &Value) -> Option<Value> {
        let leaves = leaves.as_object()?;
        let mut removed: Vec<(String, Vec<Meta>)> = Vec::new();
        for (key, value) in leaves {
            let Some(metas) = value.get("metas").and_then(Value::as_array) else {
                continue;
            };
            let refs: Vec<&str> = metas
                .iter()
                .filter_map(|meta| meta.get("phx_ref").and_then(Value::as_str))
                .collect();
            if let Some(known) = self.entries.get_mut(key) {
                let gone: Vec<Meta> = known
                    .iter()
                    .filter(|meta| refs.contains(&meta.phx_ref.as_str()))
                    .cloned()
                    .collect();
                if !gone.is_empty() {
                    known.retain(|meta| !refs.contains(&meta.phx_ref.as_str()));
                    removed.push((key.clone(), gone));
                }
            }
            self.drop_if_empty(key);
        }
        if removed.is_empty() {
            return None;
        }
        Some(diff_payload(
            [],
            removed.iter().map(|(key, metas)| (key.as_str(), &metas[..])),
        ))
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Vec::is_empty) {
            self.entries.remove(key);
        }
    }
}

fn metas_json(metas: &[Meta]) -> Value {
    json!({"metas": metas.iter().map(Meta::to_json).collect::<Vec<_>>()})
}

fn diff_payload<'a>(
    joins: impl IntoIterator<Item = (&'a str, &'a [Meta])>,
    leaves: impl IntoIterator<Item = (&'a str, &'a [Meta])>,
) -> Value {
    let mut join_map = Map::new();
    for (key, metas) in joins {
        join_map.insert(key.to_string(), metas_json(metas));
    }
    let mut leave_map = Map::new();
    for (key, metas) in leaves {
        leave_map.insert(key.to_string(), metas_json(metas));
    }
    json!({"joins": join_map, "leaves": leave_map})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session: SessionRef, phx_ref: &str) -> Meta {
        Meta {
            phx_ref: phx_ref.to_string(),
            session,
            payload: json!({"status": "online"}),
        }
    }

    #[test]
    fn track_reports_join_diff() {
        let mut state = PresenceState::default();
        let diff = state.track("alice", meta(SessionRef::new(), "r1"));
        assert_eq!(diff["joins"]["alice"]["metas"][0]["phx_ref"], "r1");
        assert_eq!(diff["joins"]["alice"]["metas"][0]["status"], "online");
        assert!(diff["leaves"].as_object().unwrap().is_empty());
    }

    #[test]
    fn shared_key_survives_partial_untrack() {
        let mut state = PresenceState::default();
        let first = SessionRef::new();
        let second = SessionRef::new();
        state.track("team", meta(first, "r1"));
        state.track("team", meta(second, "r2"));

        let diff = state.untrack_session(first).expect("leave diff");
        assert_eq!(diff["leaves"]["team"]["metas"][0]["phx_ref"], "r1");
        // The key is still present through the second session.
        assert!(state.state_payload()["team"]["metas"][0]["phx_ref"] == "r2");
    }

    #[test]
    fn untrack_last_meta_removes_key() {
        let mut state = PresenceState::default();
        let session = SessionRef::new();
        state.track("solo", meta(session, "r1"));
        state.untrack_session(session).expect("diff");
        assert!(state.is_empty());
    }

    #[test]
    fn untrack_without_tracks_is_none() {
        let mut state = PresenceState::default();
        assert!(state.untrack_session(SessionRef::new()).is_none());
    }

    #[test]
    fn merge_remote_is_idempotent() {
        let mut local = PresenceState::default();
        local.track("alice", meta(SessionRef::new(), "r1"));

        let mut remote = PresenceState::default();
        remote.track("alice", meta(SessionRef::new(), "r2"));
        remote.track("bob", meta(SessionRef::new(), "r3"));
        let remote_state = remote.state_payload();

        let diff = local.merge_remote(&remote_state).expect("joins");
        let joins = diff["joins"].as_object().unwrap();
        assert!(joins.contains_key("alice"));
        assert!(joins.contains_key("bob"));

        // Merging the same state again adds nothing.
        assert!(local.merge_remote(&remote_state).is_none());
    }

    #[test]
    fn remote_leaves_drop_by_ref() {
        let mut local = PresenceState::default();
        local.track("alice", meta(SessionRef::new(), "r1"));
        local.track("alice", meta(SessionRef::new(), "r2"));

        let leaves = json!({"alice": {"metas": [{"phx_ref": "r1"}]}});
        let diff = local.apply_remote_leaves(&leaves).expect("diff");
        assert_eq!(diff["leaves"]["alice"]["metas"][0]["phx_ref"], "r1");
        assert_eq!(local.state_payload()["alice"]["metas"][0]["phx_ref"], "r2");
    }

    #[test]
    fn state_payload_round_trips_through_merge() {
        let mut source = PresenceState::default();
        source.track("k", meta(SessionRef::new(), "r9"));
        let mut sink = PresenceState::default();
        sink.merge_remote(&source.state_payload()).expect("joined");
        assert_eq!(sink.state_payload()["k"]["metas"][0]["phx_ref"], "r9");
    }
}
