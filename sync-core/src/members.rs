//! Per-channel member registry.
//!
//! Members hold an identity key into the shared [`UserInfoStore`], never a
//! copy of the user info.

use std::collections::HashMap;

use chatsync_types::{Identity, MemberDescriptor, UserInfo, UserInfoUpdate};

use crate::users::UserInfoStore;

/// A channel member as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Key into the user info store.
    pub identity: Identity,
    /// Index of the last message this member consumed.
    pub last_consumed: Option<u64>,
}

/// A member resolved against the user info store.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberView {
    /// The member's identity.
    pub identity: Identity,
    /// Current shared user info.
    pub user: UserInfo,
    /// Index of the last message this member consumed.
    pub last_consumed: Option<u64>,
}

/// What [`MemberRegistry::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    /// A new member was added.
    Joined,
    /// An existing member changed.
    Changed,
    /// Nothing changed.
    Unchanged,
}

/// Members of one channel, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct MemberRegistry {
    members: HashMap<Identity, Member>,
    populated: bool,
}

impl MemberRegistry {
    /// Create an empty, unpopulated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a full roster has been loaded.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Add or refresh a member. User info goes to the shared store.
    ///
    /// Returns what happened to the member and which user info fields the
    /// descriptor changed in the store.
    pub fn upsert(
        &mut self,
        descriptor: MemberDescriptor,
        users: &mut UserInfoStore,
    ) -> (MemberChange, Vec<UserInfoUpdate>) {
        let identity = descriptor.user.identity.clone();
        let updates = users.upsert(descriptor.user);
        let member = Member {
            identity: identity.clone(),
            last_consumed: descriptor.last_consumed_message_index,
        };
        let change = match self.members.insert(identity, member.clone()) {
            None => MemberChange::Joined,
            Some(previous) if previous != member => MemberChange::Changed,
            Some(_) => MemberChange::Unchanged,
        };
        (change, updates)
    }

    /// Remove a member. Returns the removed entry.
    pub fn remove(&mut self, identity: &Identity) -> Option<Member> {
        self.members.remove(identity)
    }

    /// Replace the whole roster and mark the registry populated.
    ///
    /// Returns the user info changes the roster carried.
    pub fn replace_roster(
        &mut self,
        roster: Vec<MemberDescriptor>,
        users: &mut UserInfoStore,
    ) -> Vec<(Identity, UserInfoUpdate)> {
        self.members.clear();
        let mut changed = Vec::new();
        for descriptor in roster {
            let identity = descriptor.user.identity.clone();
            let (_, updates) = self.upsert(descriptor, users);
            changed.extend(updates.into_iter().map(|update| (identity.clone(), update)));
        }
        self.populated = true;
        changed
    }

    /// The raw entry for `identity`, populated or not.
    pub fn get(&self, identity: &Identity) -> Option<&Member> {
        self.members.get(identity)
    }

    /// Set a member's consumption index. Returns true if it changed.
    pub fn set_last_consumed(&mut self, identity: &Identity, index: Option<u64>) -> bool {
        match self.members.get_mut(identity) {
            Some(member) if member.last_consumed != index => {
                member.last_consumed = index;
                true
            }
            _ => false,
        }
    }

    /// Resolve one member. `None` if unknown or the roster is not loaded.
    pub fn view(&self, identity: &Identity, users: &UserInfoStore) -> Option<MemberView> {
        if !self.populated {
            return None;
        }
        self.members.get(identity).map(|member| resolve(member, users))
    }

    /// Resolve every member, sorted by identity. Empty until populated.
    pub fn views(&self, users: &UserInfoStore) -> Vec<MemberView> {
        if !self.populated {
            return Vec::new();
        }
        let mut views: Vec<MemberView> = self.members.values().map(|m| resolve(m, users)).collect();
        views.sort_by(|a, b| a.identity.cmp(&b.identity));
        views
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if there are no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn resolve(member: &Member, users: &UserInfoStore) -> MemberView {
    let user = users
        .get(&member.identity)
        .unwrap_or_else(|| UserInfo::new(member.identity.clone()));
    MemberView {
        identity: member.identity.clone(),
        user,
        last_consumed: member.last_consumed,
    }
}
