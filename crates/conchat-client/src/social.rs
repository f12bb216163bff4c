//! Friend requests and the friend directory.
//!
//! Friend requests arrive out of band on the user topic.  The reducer keeps
//! the pending list and the badge counter; accepting or rejecting goes
//! through the REST backend behind [`SocialDirectory`].

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use conchat_shared::protocol::{
    Event, EventBody, FriendAction, FriendRequestPayload, FriendStatusPayload,
};
use conchat_shared::types::UserId;

use crate::error::DirectoryError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingFriendRequest {
    pub requester_id: UserId,
    pub username: String,
    pub name: String,
    pub pfp_url: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl PendingFriendRequest {
    pub fn from_payload(payload: &FriendRequestPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            requester_id: payload.requester_id,
            username: payload.requester_username.clone(),
            name: payload.requester_name.clone(),
            pfp_url: payload.requester_pfp_url.clone(),
            received_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friend {
    pub user_id: UserId,
    pub username: String,
    pub name: String,
    pub pfp_url: Option<String>,
}

/// The REST backend's friend endpoints.
#[async_trait]
pub trait SocialDirectory: Send + Sync + 'static {
    async fn pending_friend_requests(&self) -> Result<Vec<PendingFriendRequest>, DirectoryError>;

    async fn respond_to_friend_request(
        &self,
        requester: UserId,
        action: FriendAction,
    ) -> Result<(), DirectoryError>;

    async fn friends(&self) -> Result<Vec<Friend>, DirectoryError>;
}

/// What the session should do after a social event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialOutcome {
    PendingChanged,
    RefreshFriends,
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct SocialReducer {
    pending: Vec<PendingFriendRequest>,
    badge: u32,
}

impl SocialReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace local state with the backend's pending list.
    pub fn seed(&mut self, pending: Vec<PendingFriendRequest>) {
        self.badge = u32::try_from(pending.len()).unwrap_or(u32::MAX);
        self.pending = pending;
    }

    pub fn apply(&mut self, event: &Event) -> SocialOutcome {
        match &event.body {
            EventBody::FriendRequestReceived(payload) => {
                info!(requester = %payload.requester_id, "Friend request received");
                self.pending
                    .push(PendingFriendRequest::from_payload(payload, event.timestamp));
                self.badge = self.badge.saturating_add(1);
                SocialOutcome::PendingChanged
            }
            EventBody::FriendStatusUpdate(FriendStatusPayload {
                action: FriendAction::Accept,
                user_id,
                ..
            }) => {
                info!(user = %user_id, "Friend request accepted by peer");
                SocialOutcome::RefreshFriends
            }
            EventBody::FriendStatusUpdate(FriendStatusPayload {
                action: FriendAction::Reject,
                user_id,
                ..
            }) => {
                info!(user = %user_id, "Friend request rejected by peer");
                SocialOutcome::Ignored
            }
            other => {
                debug!(event_type = other.event_type(), "Not a social event");
                SocialOutcome::Ignored
            }
        }
    }

    /// Drop every pending entry for `requester` after a successful local
    /// accept or reject.  The badge falls by the number of entries removed
    /// and never goes below zero.
    pub fn resolve(&mut self, requester: &UserId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|r| &r.requester_id != requester);
        let removed = before - self.pending.len();
        self.badge = self
            .badge
            .saturating_sub(u32::try_from(removed).unwrap_or(u32::MAX));
        removed > 0
    }

    pub fn pending(&self) -> &[PendingFriendRequest] {
        &self.pending
    }

    pub fn badge(&self) -> u32 {
        self.badge
    }
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DirectoryState {
    pending: Vec<PendingFriendRequest>,
    friends: Vec<Friend>,
    responses: Vec<(UserId, FriendAction)>,
    failing: bool,
}

/// Directory backed by process memory, for tests and offline runs.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_pending(&self, request: PendingFriendRequest) {
        self.lock().pending.push(request);
    }

    pub fn add_friend(&self, friend: Friend) {
        self.lock().friends.push(friend);
    }

    /// Every accept/reject received so far, in order.
    pub fn responses(&self) -> Vec<(UserId, FriendAction)> {
        self.lock().responses.clone()
    }

    /// Make every call fail with [`DirectoryError::Request`].
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }
}

#[async_trait]
impl SocialDirectory for MemoryDirectory {
    async fn pending_friend_requests(&self) -> Result<Vec<PendingFriendRequest>, DirectoryError> {
        let state = self.lock();
        if state.failing {
            return Err(DirectoryError::Request("directory unavailable".into()));
        }
        Ok(state.pending.clone())
    }

    async fn respond_to_friend_request(
        &self,
        requester: UserId,
        action: FriendAction,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        if state.failing {
            return Err(DirectoryError::Request("directory unavailable".into()));
        }
        let idx = state
            .pending
            .iter()
            .position(|r| r.requester_id == requester)
            .ok_or(DirectoryError::NotFound)?;
        let request = state.pending.remove(idx);
        state.pending.retain(|r| r.requester_id != requester);

        if action == FriendAction::Accept {
            state.friends.push(Friend {
                user_id: request.requester_id,
                username: request.username,
                name: request.name,
                pfp_url: request.pfp_url,
            });
        }
        state.responses.push((requester, action));
        Ok(())
    }

    async fn friends(&self) -> Result<Vec<Friend>, DirectoryError> {
        let state = self.lock();
        if state.failing {
            return Err(DirectoryError::Request("directory unavailable".into()));
        }
        Ok(state.friends.clone())
    }
}
