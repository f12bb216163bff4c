//! Topic subscription tracking.
//!
//! Keeps the topic set the client *wants* (derived from identity and open
//! conversations) apart from the set the current broker session has
//! actually acknowledged.

use std::collections::BTreeSet;

use tracing::debug;

use conchat_shared::types::Topic;

/// Topics to add and remove to bring the session in line with the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDiff {
    pub added: Vec<Topic>,
    pub removed: Vec<Topic>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    desired: BTreeSet<Topic>,
    active: BTreeSet<Topic>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired set and return what the live session must change.
    pub fn replace_desired(&mut self, topics: BTreeSet<Topic>) -> TopicDiff {
        self.desired = topics;

        let diff = TopicDiff {
            added: self.desired.difference(&self.active).copied().collect(),
            removed: self.active.difference(&self.desired).copied().collect(),
        };

        debug!(
            desired = self.desired.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Desired topic set replaced"
        );
        diff
    }

    /// Desired topics not yet acknowledged by the session.
    pub fn pending(&self) -> Vec<Topic> {
        self.desired.difference(&self.active).copied().collect()
    }

    pub fn on_subscribed(&mut self, topic: Topic) {
        self.active.insert(topic);
    }

    pub fn on_unsubscribed(&mut self, topic: &Topic) {
        self.active.remove(topic);
    }

    /// Forget session-side state after the connection dropped.  The desired
    /// set survives so it can be re-subscribed.
    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    /// Forget everything (explicit disconnect).
    pub fn clear(&mut self) {
        self.desired.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conchat_shared::types::{GroupId, UserId};

    fn topics(items: &[Topic]) -> BTreeSet<Topic> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_diff_against_active() {
        let me = UserId::new();
        let g1 = Topic::Group(GroupId::new());
        let g2 = Topic::Group(GroupId::new());

        let mut subs = SubscriptionSet::new();
        let diff = subs.replace_desired(topics(&[Topic::Direct(me), g1]));
        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());

        subs.on_subscribed(Topic::Direct(me));
        subs.on_subscribed(g1);
        assert!(subs.pending().is_empty());

        let diff = subs.replace_desired(topics(&[Topic::Direct(me), g2]));
        assert_eq!(diff.added, vec![g2]);
        assert_eq!(diff.removed, vec![g1]);
    }

    #[test]
    fn test_clear_active_keeps_desired() {
        let me = UserId::new();
        let mut subs = SubscriptionSet::new();
        subs.replace_desired(topics(&[Topic::Direct(me), Topic::User(me)]));
        subs.on_subscribed(Topic::Direct(me));
        subs.on_subscribed(Topic::User(me));
        assert!(subs.pending().is_empty());

        subs.clear_active();
        assert_eq!(subs.pending().len(), 2);

        subs.clear();
        assert!(subs.pending().is_empty());
        let diff = subs.replace_desired(topics(&[Topic::Direct(me)]));
        assert_eq!(diff.added, vec![Topic::Direct(me)]);
    }
}
