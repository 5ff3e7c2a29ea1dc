use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

/// Locally inferred participant status: raised hands and screen sharing.
///
/// The transport never carries these flags. Entries come only from
/// local actions and from publish events this client observed.
/// Raised hands are queued by raise time.
#[derive(Debug, Default, Clone)]
pub struct ParticipantStatusMap {
    /// (raised at epoch ms, insertion seq) -> uid
    raised_hands: BTreeMap<(i64, u64), String>,
    screen_sharing: HashSet<String>,
    seq: u64,
}

impl ParticipantStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `uid`'s hand at `at`. Raising twice keeps the original
    /// queue position. Returns the 1-based position.
    pub fn raise_hand(&mut self, uid: &str, at: DateTime<Utc>) -> u32 {
        if let Some(position) = self.hand_position(uid) {
            return position;
        }
        self.seq += 1;
        self.raised_hands
            .insert((at.timestamp_millis(), self.seq), uid.to_string());
        self.hand_position(uid).unwrap_or(0)
    }

    /// Returns `true` if the hand was raised.
    pub fn lower_hand(&mut self, uid: &str) -> bool {
        let before = self.raised_hands.len();
        self.raised_hands.retain(|_, u| u != uid);
        self.raised_hands.len() != before
    }

    pub fn is_hand_raised(&self, uid: &str) -> bool {
        self.raised_hands.values().any(|u| u == uid)
    }

    pub fn hand_position(&self, uid: &str) -> Option<u32> {
        self.raised_hands
            .values()
            .position(|u| u == uid)
            .map(|i| i as u32 + 1)
    }

    pub fn raised_hands(&self) -> Vec<String> {
        self.raised_hands.values().cloned().collect()
    }

    /// Returns `true` if the flag changed.
    pub fn set_screen_sharing(&mut self, uid: &str, sharing: bool) -> bool {
        if sharing {
            self.screen_sharing.insert(uid.to_string())
        } else {
            self.screen_sharing.remove(uid)
        }
    }

    pub fn is_screen_sharing(&self, uid: &str) -> bool {
        self.screen_sharing.contains(uid)
    }

    /// Forget everything about a participant that left.
    pub fn remove(&mut self, uid: &str) {
        self.lower_hand(uid);
        self.screen_sharing.remove(uid);
    }

    pub fn clear(&mut self) {
        self.raised_hands.clear();
        self.screen_sharing.clear();
    }
}
