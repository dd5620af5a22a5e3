//! Channel directory: every channel the client knows, by sid and unique name.

use std::collections::{HashMap, HashSet};

use chatsync_types::{ChannelDescriptor, ChannelSid};

use crate::channel::ChannelState;

/// Map of sid to channel, plus a unique-name index kept in step with it.
#[derive(Debug, Clone, Default)]
pub struct ChannelDirectory {
    channels: HashMap<ChannelSid, ChannelState>,
    unique_names: HashMap<String, ChannelSid>,
}

impl ChannelDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `name` from the index if it still points at `sid`.
    fn unindex(&mut self, name: &str, sid: &ChannelSid) {
        if self.unique_names.get(name) == Some(sid) {
            self.unique_names.remove(name);
        }
    }

    /// Insert or replace a channel.
    pub fn insert(&mut self, channel: ChannelState) {
        let sid = channel.sid().clone();
        let previous = self
            .channels
            .get(&sid)
            .and_then(|previous| previous.unique_name())
            .map(str::to_string);
        if let Some(name) = previous {
            self.unindex(&name, &sid);
        }
        if let Some(name) = channel.unique_name() {
            self.unique_names.insert(name.to_string(), sid.clone());
        }
        self.channels.insert(sid, channel);
    }

    /// Apply backend metadata to a known channel, or insert a new one.
    ///
    /// Returns `(is_new, changed)`.
    pub fn upsert_descriptor(&mut self, descriptor: ChannelDescriptor) -> (bool, bool) {
        let sid = descriptor.sid.clone();
        let new_name = descriptor.unique_name.clone();
        let Some(channel) = self.channels.get_mut(&sid) else {
            self.insert(ChannelState::from_descriptor(descriptor));
            return (true, true);
        };

        let old_name = channel.unique_name().map(str::to_string);
        let changed = channel.apply_descriptor(descriptor);
        if old_name != new_name {
            if let Some(old) = old_name {
                self.unindex(&old, &sid);
            }
            if let Some(new) = new_name {
                self.unique_names.insert(new, sid);
            }
        }
        (false, changed)
    }

    /// Remove a channel.
    pub fn remove(&mut self, sid: &ChannelSid) -> Option<ChannelState> {
        let channel = self.channels.remove(sid)?;
        if let Some(name) = channel.unique_name() {
            self.unindex(name, sid);
        }
        Some(channel)
    }

    /// Look up by sid.
    pub fn get(&self, sid: &ChannelSid) -> Option<&ChannelState> {
        self.channels.get(sid)
    }

    /// Look up by sid for mutation.
    ///
    /// Callers must not change the unique name through this reference; use
    /// [`ChannelDirectory::upsert_descriptor`] for that.
    pub fn get_mut(&mut self, sid: &ChannelSid) -> Option<&mut ChannelState> {
        self.channels.get_mut(sid)
    }

    /// Look up by unique name.
    pub fn by_unique_name(&self, name: &str) -> Option<&ChannelState> {
        self.unique_names
            .get(name)
            .and_then(|sid| self.channels.get(sid))
    }

    /// True if the channel is known.
    pub fn contains(&self, sid: &ChannelSid) -> bool {
        self.channels.contains_key(sid)
    }

    /// All channels, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.values()
    }

    /// All channels, for mutation.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelState> {
        self.channels.values_mut()
    }

    /// All sids, sorted.
    pub fn sids(&self) -> Vec<ChannelSid> {
        let mut sids: Vec<ChannelSid> = self.channels.keys().cloned().collect();
        sids.sort();
        sids
    }

    /// Remove every channel whose sid is not in `keep`, returning the removed channels in sid order.
    pub fn retain_only(&mut self, keep: &HashSet<ChannelSid>) -> Vec<ChannelState> {
        self.sids()
            .into_iter()
            .filter(|sid| !keep.contains(sid))
            .filter_map(|sid| self.remove(&sid))
            .collect()
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.unique_names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(sid: &str, unique: Option<&str>) -> ChannelDescriptor {
        let mut desc = ChannelDescriptor::new(ChannelSid::new(sid));
        desc.unique_name = unique.map(str::to_string);
        desc
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let mut directory = ChannelDirectory::new();
        assert_eq!(directory.upsert_descriptor(named("CH1", None)), (true, true));
        assert_eq!(directory.upsert_descriptor(named("CH1", None)), (false, false));
        assert_eq!(directory.upsert_descriptor(named("CH1", Some("general"))), (false, true));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn unique_name_index_follows_renames() {
        let mut directory = ChannelDirectory::new();
        directory.upsert_descriptor(named("CH1", Some("general")));
        assert!(directory.by_unique_name("general").is_some());

        directory.upsert_descriptor(named("CH1", Some("lobby")));
        assert!(directory.by_unique_name("general").is_none());
        assert_eq!(
            directory.by_unique_name("lobby").map(|c| c.sid().clone()),
            Some(ChannelSid::new("CH1"))
        );

        directory.remove(&ChannelSid::new("CH1"));
        assert!(directory.by_unique_name("lobby").is_none());
    }

    #[test]
    fn retain_only_reports_removed() {
        let mut directory = ChannelDirectory::new();
        for sid in ["CH1", "CH2", "CH3"] {
            directory.upsert_descriptor(named(sid, None));
        }
        let keep: HashSet<ChannelSid> = [ChannelSid::new("CH2")].into_iter().collect();

        let gone: Vec<ChannelSid> = directory
            .retain_only(&keep)
            .iter()
            .map(|channel| channel.sid().clone())
            .collect();
        assert_eq!(gone, vec![ChannelSid::new("CH1"), ChannelSid::new("CH3")]);
        assert_eq!(directory.sids(), vec![ChannelSid::new("CH2")]);
    }

    #[test]
    fn taken_unique_name_survives_previous_holder() {
        let mut directory = ChannelDirectory::new();
        directory.upsert_descriptor(named("CH1", Some("general")));
        directory.upsert_descriptor(named("CH2", None));

        // CH2 claims the name before CH1 lets go of it.
        directory.upsert_descriptor(named("CH2", Some("general")));
        directory.upsert_descriptor(named("CH1", Some("lobby")));
        assert_eq!(
            directory.by_unique_name("general").map(|c| c.sid().clone()),
            Some(ChannelSid::new("CH2"))
        );

        directory.upsert_descriptor(named("CH3", Some("lobby")));
        directory.remove(&ChannelSid::new("CH1"));
        assert_eq!(
            directory.by_unique_name("lobby").map(|c| c.sid().clone()),
            Some(ChannelSid::new("CH3"))
        );
        assert!(directory.by_unique_name("general").is_some());
    }
}
