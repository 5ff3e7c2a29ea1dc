use crate::events::{RemoteParticipant, Role, TrackSource};

/// Remote participants in join order.
///
/// Owned by a transport backend and updated from its event loop.
/// Everything else reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct RemoteRoster {
    participants: Vec<RemoteParticipant>,
    local_uid: Option<String>,
}

impl RemoteRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_uid(&mut self, uid: String) {
        self.local_uid = Some(uid);
    }

    pub fn local_uid(&self) -> Option<&str> {
        self.local_uid.as_deref()
    }

    /// Returns `false` if the uid is already present or is the local participant.
    pub fn add(&mut self, participant: RemoteParticipant) -> bool {
        if self.local_uid.as_deref() == Some(participant.uid.as_str())
            || self.participants.iter().any(|p| p.uid == participant.uid)
        {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn remove(&mut self, uid: &str) -> Option<RemoteParticipant> {
        let index = self.participants.iter().position(|p| p.uid == uid)?;
        Some(self.participants.remove(index))
    }

    pub fn get(&self, uid: &str) -> Option<&RemoteParticipant> {
        self.participants.iter().find(|p| p.uid == uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut RemoteParticipant> {
        self.participants.iter_mut().find(|p| p.uid == uid)
    }

    /// Record a published/unpublished remote track. Returns the updated entry.
    /// Role is left alone; it only changes through [`RemoteRoster::set_role`].
    pub fn set_media(
        &mut self,
        uid: &str,
        source: TrackSource,
        active: bool,
    ) -> Option<RemoteParticipant> {
        let p = self.get_mut(uid)?;
        match source {
            TrackSource::Microphone => p.has_audio = active,
            TrackSource::Camera => p.has_video = active,
            TrackSource::ScreenShare | TrackSource::Unknown => {}
        }
        Some(p.clone())
    }

    pub fn set_role(&mut self, uid: &str, role: Role) -> Option<RemoteParticipant> {
        let p = self.get_mut(uid)?;
        p.role = role;
        Some(p.clone())
    }

    pub fn participants(&self) -> &[RemoteParticipant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.local_uid = None;
    }
}
