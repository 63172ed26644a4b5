//! Subscription set and long-poll cursor.
//!
//! [`SubscriptionSet`] is plain data. [`SharedState`] owns it behind a single
//! readers-writer lock and only hands out closure-scoped access, so no lock is
//! ever held across an `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::protocol::{self, EnvelopeMetadata};
use crate::types::{Error, StateOperation, SubscribeOperation, UnsubscribeOperation};

/// Position in the message stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// `0` means "catch up from now".
    pub timetoken: u64,
    pub region: i32,
}

/// Everything one long-poll needs, captured under a single read lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PollSnapshot {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub cursor: Cursor,
    pub state: BTreeMap<String, Value>,
}

impl PollSnapshot {
    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionSet {
    channels: BTreeSet<String>,
    groups: BTreeSet<String>,
    /// Entities subscribed only for presence, stored by base name.
    presence_channels: BTreeSet<String>,
    presence_groups: BTreeSet<String>,
    state: BTreeMap<String, Value>,
    cursor: Cursor,
    /// Cursor override consumed by the first response after a mutation.
    stored_timetoken: Option<u64>,
    /// Whether `Connected` was announced for the current set.
    announced: bool,
}

impl SubscriptionSet {
    pub(crate) fn adapt_subscribe(&mut self, op: &SubscribeOperation) {
        for name in &op.channels {
            add_entity(
                &mut self.channels,
                &mut self.presence_channels,
                name,
                op.presence_enabled,
            );
        }
        for name in &op.channel_groups {
            add_entity(
                &mut self.groups,
                &mut self.presence_groups,
                name,
                op.presence_enabled,
            );
        }
        for (name, value) in &op.state {
            let base = protocol::base_name(name);
            if self.contains(base) {
                self.state.insert(base.to_string(), value.clone());
            }
        }

        self.announced = false;
        if let Some(timetoken) = op.timetoken.filter(|tt| *tt != 0) {
            self.cursor.timetoken = timetoken;
        }
        self.stash_cursor();
    }

    pub(crate) fn adapt_unsubscribe(&mut self, op: &UnsubscribeOperation) {
        for name in &op.channels {
            remove_entity(&mut self.channels, &mut self.presence_channels, name);
        }
        for name in &op.channel_groups {
            remove_entity(&mut self.groups, &mut self.presence_groups, name);
        }
        let subscribed: Vec<String> = self
            .state
            .keys()
            .filter(|name| self.contains(name))
            .cloned()
            .collect();
        self.state.retain(|name, _| subscribed.contains(name));

        self.announced = false;
        if self.is_empty() {
            self.cursor = Cursor::default();
            self.stored_timetoken = None;
        } else {
            self.stash_cursor();
        }
    }

    /// Replace the state of listed entities that are currently subscribed.
    pub(crate) fn adapt_state(&mut self, op: &StateOperation) {
        for name in op.channels.iter().chain(&op.channel_groups) {
            let base = protocol::base_name(name);
            if self.contains(base) {
                self.state.insert(base.to_string(), op.state.clone());
            }
        }
        self.announced = false;
    }

    /// Channel names in wire order: data channels, then presence companions
    /// when `include_presence` is set.
    pub(crate) fn prepare_channel_list(&self, include_presence: bool) -> Vec<String> {
        wire_list(&self.channels, &self.presence_channels, include_presence)
    }

    pub(crate) fn prepare_group_list(&self, include_presence: bool) -> Vec<String> {
        wire_list(&self.groups, &self.presence_groups, include_presence)
    }

    pub(crate) fn create_state_payload(&self) -> BTreeMap<String, Value> {
        self.state
            .iter()
            .filter(|(name, _)| self.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn has_non_presence_channels(&self) -> bool {
        !self.channels.is_empty() || !self.groups.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.has_non_presence_channels()
            && self.presence_channels.is_empty()
            && self.presence_groups.is_empty()
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub(crate) fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            channels: self.prepare_channel_list(true),
            groups: self.prepare_group_list(true),
            cursor: self.cursor,
            state: self.create_state_payload(),
        }
    }

    /// Returns true exactly once per subscription change.
    pub(crate) fn take_announcement(&mut self) -> bool {
        !std::mem::replace(&mut self.announced, true)
    }

    pub(crate) fn mark_announced(&mut self) {
        self.announced = true;
    }

    /// Move the cursor after a successful poll. A pending override wins over
    /// the server cursor; an unparsable server timetoken leaves the cursor
    /// untouched.
    pub(crate) fn advance_cursor(&mut self, metadata: &EnvelopeMetadata) -> Result<Cursor, Error> {
        let timetoken = match self.stored_timetoken.take() {
            Some(stored) => stored,
            None => protocol::parse_timetoken(&metadata.timetoken)?,
        };
        self.cursor = Cursor {
            timetoken,
            region: metadata.region,
        };
        Ok(self.cursor)
    }

    /// Park the current cursor so the next poll starts from "now" and the
    /// following one resumes from the parked position.
    fn stash_cursor(&mut self) {
        if self.cursor.timetoken != 0 {
            self.stored_timetoken = Some(self.cursor.timetoken);
        }
        self.cursor.timetoken = 0;
    }

    fn contains(&self, base: &str) -> bool {
        self.channels.contains(base)
            || self.groups.contains(base)
            || self.presence_channels.contains(base)
            || self.presence_groups.contains(base)
    }
}

fn add_entity(
    data: &mut BTreeSet<String>,
    presence: &mut BTreeSet<String>,
    name: &str,
    presence_enabled: bool,
) {
    let base = protocol::base_name(name);
    if base.is_empty() {
        return;
    }
    if presence_enabled || protocol::is_presence_name(name) {
        data.remove(base);
        presence.insert(base.to_string());
    } else {
        presence.remove(base);
        data.insert(base.to_string());
    }
}

fn remove_entity(data: &mut BTreeSet<String>, presence: &mut BTreeSet<String>, name: &str) {
    let base = protocol::base_name(name);
    if !protocol::is_presence_name(name) {
        data.remove(base);
    }
    presence.remove(base);
}

fn wire_list(
    data: &BTreeSet<String>,
    presence: &BTreeSet<String>,
    include_presence: bool,
) -> Vec<String> {
    let mut names: Vec<String> = data.iter().cloned().collect();
    if include_presence {
        names.extend(presence.iter().map(|base| protocol::presence_name(base)));
    }
    names
}

/// Shared handle to the subscription set. Clone is a cheap Arc refcount bump.
#[derive(Clone, Default)]
pub(crate) struct SharedState {
    inner: Arc<RwLock<SubscriptionSet>>,
}

impl SharedState {
    pub(crate) fn read<R>(&self, f: impl FnOnce(&SubscriptionSet) -> R) -> R {
        let set = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&set)
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut SubscriptionSet) -> R) -> R {
        let mut set = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribe(channels: &[&str], groups: &[&str], presence: bool) -> SubscribeOperation {
        SubscribeOperation {
            channels: channels.iter().map(|s| s.to_string()).collect(),
            channel_groups: groups.iter().map(|s| s.to_string()).collect(),
            presence_enabled: presence,
            ..Default::default()
        }
    }

    fn unsubscribe(channels: &[&str], groups: &[&str]) -> UnsubscribeOperation {
        UnsubscribeOperation {
            channels: channels.iter().map(|s| s.to_string()).collect(),
            channel_groups: groups.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn metadata(timetoken: &str, region: i32) -> EnvelopeMetadata {
        EnvelopeMetadata {
            timetoken: timetoken.to_string(),
            region,
        }
    }

    #[test]
    fn channel_lists_with_and_without_presence() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["b", "a"], &["g1"], false));
        set.adapt_subscribe(&subscribe(&["lobby"], &["g2"], true));

        assert_eq!(set.prepare_channel_list(false), vec!["a", "b"]);
        assert_eq!(
            set.prepare_channel_list(true),
            vec!["a", "b", "lobby-pnpres"]
        );
        assert_eq!(set.prepare_group_list(false), vec!["g1"]);
        assert_eq!(set.prepare_group_list(true), vec!["g1", "g2-pnpres"]);
    }

    #[test]
    fn entity_is_data_or_presence_never_both() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["room"], &[], false));
        set.adapt_subscribe(&subscribe(&["room"], &[], true));
        assert_eq!(set.prepare_channel_list(true), vec!["room-pnpres"]);
        assert!(set.prepare_channel_list(false).is_empty());

        set.adapt_subscribe(&subscribe(&["room"], &[], false));
        assert_eq!(set.prepare_channel_list(true), vec!["room"]);
    }

    #[test]
    fn presence_list_is_union_without_duplicates() {
        let ops: Vec<Box<dyn Fn(&mut SubscriptionSet)>> = vec![
            Box::new(|s| s.adapt_subscribe(&subscribe(&["a", "b"], &[], false))),
            Box::new(|s| s.adapt_subscribe(&subscribe(&["b", "c"], &[], true))),
            Box::new(|s| s.adapt_subscribe(&subscribe(&["d-pnpres"], &[], false))),
            Box::new(|s| s.adapt_unsubscribe(&unsubscribe(&["a"], &[]))),
            Box::new(|s| s.adapt_subscribe(&subscribe(&["a", "c"], &[], false))),
            Box::new(|s| s.adapt_unsubscribe(&unsubscribe(&["d-pnpres"], &[]))),
        ];
        let mut set = SubscriptionSet::default();
        for op in ops {
            op(&mut set);
            let with = set.prepare_channel_list(true);
            let mut expected = set.prepare_channel_list(false);
            expected.extend(set.presence_channels.iter().map(|c| protocol::presence_name(c)));
            assert_eq!(with, expected);
            let unique: BTreeSet<&String> = with.iter().collect();
            assert_eq!(unique.len(), with.len());
        }
    }

    #[test]
    fn suffixed_names_are_presence_entities() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["room", "room-pnpres"], &[], false));
        assert_eq!(set.prepare_channel_list(true), vec!["room-pnpres"]);

        set.adapt_unsubscribe(&unsubscribe(&["room-pnpres"], &[]));
        assert!(set.is_empty());
    }

    #[test]
    fn unsubscribe_all_resets_cursor() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["a"], &["g"], false));
        set.advance_cursor(&metadata("100", 3)).unwrap();
        set.adapt_subscribe(&SubscribeOperation {
            channels: vec!["b".into()],
            timetoken: Some(50),
            ..Default::default()
        });
        assert_eq!(set.stored_timetoken, Some(50));

        set.adapt_unsubscribe(&unsubscribe(&["a", "b"], &["g"]));
        assert!(set.is_empty());
        assert_eq!(set.cursor(), Cursor::default());
        assert_eq!(set.stored_timetoken, None);
    }

    #[test]
    fn partial_unsubscribe_parks_cursor() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["a", "b"], &[], false));
        set.advance_cursor(&metadata("100", 3)).unwrap();
        set.adapt_unsubscribe(&unsubscribe(&["a"], &[]));
        assert_eq!(set.cursor().timetoken, 0);
        assert_eq!(set.stored_timetoken, Some(100));
    }

    #[test]
    fn stored_timetoken_applies_once() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&SubscribeOperation {
            channels: vec!["a".into()],
            timetoken: Some(777),
            ..Default::default()
        });
        assert_eq!(set.snapshot().cursor.timetoken, 0);

        let cursor = set.advance_cursor(&metadata("900", 1)).unwrap();
        assert_eq!(cursor, Cursor { timetoken: 777, region: 1 });

        let cursor = set.advance_cursor(&metadata("901", 1)).unwrap();
        assert_eq!(cursor.timetoken, 901);
    }

    #[test]
    fn mutation_keeps_pending_override() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&SubscribeOperation {
            channels: vec!["a".into()],
            timetoken: Some(777),
            ..Default::default()
        });
        set.adapt_subscribe(&subscribe(&["b"], &[], false));
        assert_eq!(set.stored_timetoken, Some(777));
    }

    #[test]
    fn bad_timetoken_leaves_cursor() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["a"], &[], false));
        set.advance_cursor(&metadata("100", 2)).unwrap();
        assert!(set.advance_cursor(&metadata("oops", 5)).is_err());
        assert_eq!(set.cursor(), Cursor { timetoken: 100, region: 2 });
    }

    #[test]
    fn state_payload_is_filtered_to_subscribed() {
        let mut set = SubscriptionSet::default();
        let mut op = subscribe(&["a", "b"], &["g"], false);
        op.state.insert("a".into(), json!({"mood": "happy"}));
        op.state.insert("zzz".into(), json!(1));
        set.adapt_subscribe(&op);
        set.adapt_state(&StateOperation {
            channels: vec!["b".into(), "nope".into()],
            channel_groups: vec!["g".into()],
            state: json!({"k": 2}),
        });

        let payload = set.create_state_payload();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.get("a"), Some(&json!({"mood": "happy"})));
        assert_eq!(payload.get("b"), Some(&json!({"k": 2})));
        assert_eq!(payload.get("g"), Some(&json!({"k": 2})));

        set.adapt_unsubscribe(&unsubscribe(&["a"], &[]));
        assert!(!set.create_state_payload().contains_key("a"));
    }

    #[test]
    fn announcement_is_taken_once_per_change() {
        let mut set = SubscriptionSet::default();
        set.adapt_subscribe(&subscribe(&["a"], &[], false));
        assert!(set.take_announcement());
        assert!(!set.take_announcement());

        set.adapt_state(&StateOperation::default());
        assert!(set.take_announcement());

        set.mark_announced();
        assert!(!set.take_announcement());
    }

    #[test]
    fn membership_predicates() {
        let mut set = SubscriptionSet::default();
        assert!(set.is_empty());
        assert!(!set.has_non_presence_channels());

        set.adapt_subscribe(&subscribe(&["a"], &[], true));
        assert!(!set.is_empty());
        assert!(!set.has_non_presence_channels());

        set.adapt_subscribe(&subscribe(&[], &["g"], false));
        assert!(set.has_non_presence_channels());
    }

    #[test]
    fn shared_state_snapshot() {
        let state = SharedState::default();
        state.write(|s| s.adapt_subscribe(&subscribe(&["a"], &["g"], true)));
        let snapshot = state.read(SubscriptionSet::snapshot);
        assert_eq!(snapshot.channels, vec!["a-pnpres"]);
        assert_eq!(snapshot.groups, vec!["g-pnpres"]);
        assert!(!snapshot.is_empty());
        assert!(PollSnapshot::default().is_empty());
    }
}
