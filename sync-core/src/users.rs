//! Process-wide user info table.
//!
//! Every member of every channel refers to its user by identity; the
//! [`UserInfo`] itself lives here exactly once, so one update is visible
//! through every channel the user appears in.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chatsync_types::{Identity, UserInfo, UserInfoUpdate};

/// Shared table of [`UserInfo`] keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct UserInfoStore {
    users: HashMap<Identity, UserInfo>,
    reachability_enabled: bool,
}

impl UserInfoStore {
    /// Create an empty store with reachability reporting disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the backend reports online/notifiable flags.
    pub fn reachability_enabled(&self) -> bool {
        self.reachability_enabled
    }

    /// Enable or disable reachability reporting.
    pub fn set_reachability_enabled(&mut self, enabled: bool) {
        self.reachability_enabled = enabled;
    }

    /// Look up a user. Reachability flags read as false while disabled.
    pub fn get(&self, identity: &Identity) -> Option<UserInfo> {
        self.users.get(identity).map(|user| self.masked(user))
    }

    /// Look up a user, creating a bare entry on first reference.
    pub fn get_or_create(&mut self, identity: &Identity) -> UserInfo {
        let user = self
            .users
            .entry(identity.clone())
            .or_insert_with(|| UserInfo::new(identity.clone()))
            .clone();
        self.masked(&user)
    }

    fn masked(&self, user: &UserInfo) -> UserInfo {
        let mut user = user.clone();
        if !self.reachability_enabled {
            user.online = false;
            user.notifiable = false;
        }
        user
    }

    /// Store `user`, returning which fields changed.
    ///
    /// A user seen for the first time reports no changes.
    pub fn upsert(&mut self, user: UserInfo) -> Vec<UserInfoUpdate> {
        let mut slot = match self.users.entry(user.identity.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(user);
                return Vec::new();
            }
            Entry::Occupied(occupied) => occupied,
        };
        let existing = slot.get_mut();

        let mut changed = Vec::new();
        if existing.friendly_name != user.friendly_name {
            changed.push(UserInfoUpdate::FriendlyName);
        }
        if existing.attributes != user.attributes {
            changed.push(UserInfoUpdate::Attributes);
        }
        if existing.online != user.online {
            changed.push(UserInfoUpdate::ReachabilityOnline);
        }
        if existing.notifiable != user.notifiable {
            changed.push(UserInfoUpdate::ReachabilityNotifiable);
        }
        *existing = user;
        changed
    }

    /// Apply one field of `user` as named by `update`.
    ///
    /// Returns false when the stored value already matched.
    pub fn apply_update(&mut self, user: &UserInfo, update: UserInfoUpdate) -> bool {
        let entry = self
            .users
            .entry(user.identity.clone())
            .or_insert_with(|| UserInfo::new(user.identity.clone()));
        match update {
            UserInfoUpdate::FriendlyName => {
                replace_if_changed(&mut entry.friendly_name, &user.friendly_name)
            }
            UserInfoUpdate::Attributes => replace_if_changed(&mut entry.attributes, &user.attributes),
            UserInfoUpdate::ReachabilityOnline => replace_if_changed(&mut entry.online, &user.online),
            UserInfoUpdate::ReachabilityNotifiable => {
                replace_if_changed(&mut entry.notifiable, &user.notifiable)
            }
        }
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True if no users are known.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Forget every user.
    pub fn clear(&mut self) {
        self.users.clear();
    }
}

fn replace_if_changed<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
    if slot == value {
        return false;
    }
    *slot = value.clone();
    true
}
