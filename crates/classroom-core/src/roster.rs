//! Presentation-ready roster derived from the transport's participant list.
//!
//! Everything here is a pure function of its inputs.

use crate::events::{RemoteParticipant, Role};
use crate::status::ParticipantStatusMap;

/// Column count for a video grid of `count` tiles.
pub fn grid_columns(count: usize) -> usize {
    match count {
        0 | 1 => 1,
        2..=4 => 2,
        5..=9 => 3,
        _ => 4,
    }
}

/// Local participant as shown in its own grid (self-view).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPresence {
    pub uid: String,
    pub has_audio: bool,
    pub has_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantTile {
    pub uid: String,
    pub name: Option<String>,
    pub is_local: bool,
    pub has_audio: bool,
    pub has_video: bool,
    pub hand_position: Option<u32>,
    pub screen_sharing: bool,
}

/// One line of the status dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub uid: String,
    pub name: Option<String>,
    pub role: Role,
    pub mic_on: bool,
    pub camera_on: bool,
    pub hand_position: Option<u32>,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterLayout {
    /// Nobody on stage yet.
    WaitingForHost,
    Grid {
        columns: usize,
        tiles: Vec<ParticipantTile>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterView {
    pub layout: RosterLayout,
    pub rows: Vec<StatusRow>,
    pub audience_count: usize,
}

impl Default for RosterView {
    fn default() -> Self {
        Self {
            layout: RosterLayout::WaitingForHost,
            rows: Vec::new(),
            audience_count: 0,
        }
    }
}

impl RosterView {
    /// `local` is `Some` only while the local participant is a host.
    pub fn derive(
        local: Option<&LocalPresence>,
        remotes: &[RemoteParticipant],
        statuses: &ParticipantStatusMap,
    ) -> Self {
        let mut tiles = Vec::with_capacity(remotes.len() + 1);

        if let Some(local) = local {
            tiles.push(ParticipantTile {
                uid: local.uid.clone(),
                name: None,
                is_local: true,
                has_audio: local.has_audio,
                has_video: local.has_video,
                hand_position: statuses.hand_position(&local.uid),
                screen_sharing: statuses.is_screen_sharing(&local.uid),
            });
        }

        tiles.extend(remotes.iter().filter(|p| p.is_on_stage()).map(|p| {
            ParticipantTile {
                uid: p.uid.clone(),
                name: p.name.clone(),
                is_local: false,
                has_audio: p.has_audio,
                has_video: p.has_video,
                hand_position: statuses.hand_position(&p.uid),
                screen_sharing: statuses.is_screen_sharing(&p.uid),
            }
        }));

        let rows = remotes
            .iter()
            .map(|p| StatusRow {
                uid: p.uid.clone(),
                name: p.name.clone(),
                role: p.role,
                mic_on: p.has_audio,
                camera_on: p.has_video,
                hand_position: statuses.hand_position(&p.uid),
                screen_sharing: statuses.is_screen_sharing(&p.uid),
            })
            .collect();

        let audience_count = remotes.iter().filter(|p| !p.is_on_stage()).count();

        let layout = if tiles.is_empty() {
            RosterLayout::WaitingForHost
        } else {
            RosterLayout::Grid {
                columns: grid_columns(tiles.len()),
                tiles,
            }
        };

        Self {
            layout,
            rows,
            audience_count,
        }
    }

    pub fn is_waiting_for_host(&self) -> bool {
        matches!(self.layout, RosterLayout::WaitingForHost)
    }

    pub fn tiles(&self) -> &[ParticipantTile] {
        match &self.layout {
            RosterLayout::WaitingForHost => &[],
            RosterLayout::Grid { tiles, .. } => tiles,
        }
    }

    /// One row per remote participant, in join order.
    pub fn status_rows(&self) -> &[StatusRow] {
        &self.rows
    }

    pub fn columns(&self) -> usize {
        match &self.layout {
            RosterLayout::WaitingForHost => 0,
            RosterLayout::Grid { columns, .. } => *columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn host(uid: &str) -> RemoteParticipant {
        RemoteParticipant {
            role: Role::Host,
            has_audio: true,
            has_video: true,
            ..RemoteParticipant::new(uid)
        }
    }

    #[test]
    fn grid_columns_thresholds() {
        assert_eq!(grid_columns(1), 1);
        for n in 2..=4 {
            assert_eq!(grid_columns(n), 2, "count {n}");
        }
        for n in 5..=9 {
            assert_eq!(grid_columns(n), 3, "count {n}");
        }
        assert_eq!(grid_columns(10), 4);
        assert_eq!(grid_columns(250), 4);
    }

    #[test]
    fn empty_roster_waits_for_host() {
        let view = RosterView::derive(None, &[], &ParticipantStatusMap::new());
        assert!(view.is_waiting_for_host());
        assert!(view.tiles().is_empty());
    }

    #[test]
    fn audience_only_roster_waits_for_host() {
        let remotes = vec![RemoteParticipant::new("a1"), RemoteParticipant::new("a2")];
        let view = RosterView::derive(None, &remotes, &ParticipantStatusMap::new());
        assert!(view.is_waiting_for_host());
        assert_eq!(view.audience_count, 2);
        assert_eq!(view.rows.len(), 2);
    }

    #[test]
    fn local_host_tile_comes_first() {
        let local = LocalPresence {
            uid: "me".into(),
            has_audio: true,
            has_video: false,
        };
        let remotes = vec![host("h1")];
        let view = RosterView::derive(Some(&local), &remotes, &ParticipantStatusMap::new());
        let tiles = view.tiles();
        assert_eq!(tiles.len(), 2);
        assert!(tiles[0].is_local);
        assert_eq!(tiles[1].uid, "h1");
        assert_eq!(view.columns(), 2);
    }

    #[test]
    fn five_hosts_use_three_columns() {
        let remotes: Vec<_> = (0..5).map(|i| host(&format!("h{i}"))).collect();
        let view = RosterView::derive(None, &remotes, &ParticipantStatusMap::new());
        assert_eq!(view.columns(), 3);
    }

    #[test]
    fn inferred_status_is_merged_into_rows() {
        let mut statuses = ParticipantStatusMap::new();
        statuses.raise_hand("a1", Utc::now());
        statuses.set_screen_sharing("h1", true);
        let remotes = vec![host("h1"), RemoteParticipant::new("a1")];

        let view = RosterView::derive(None, &remotes, &statuses);

        let a1 = view.rows.iter().find(|r| r.uid == "a1").unwrap();
        assert_eq!(a1.hand_position, Some(1));
        assert!(!a1.mic_on);
        assert!(view.tiles()[0].screen_sharing);
    }
}
