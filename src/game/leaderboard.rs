//! Cross-round leaderboard aggregation

use std::collections::HashMap;
use uuid::Uuid;

use crate::ws::protocol::LeaderboardRow;

/// Per-player aggregate across rounds. Average placement is derived, never
/// stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaderboardEntry {
    pub wins: u32,
    pub games: u32,
    pub total_place: u32,
}

impl LeaderboardEntry {
    pub fn average_place(&self) -> f32 {
        if self.games == 0 {
            return 0.0;
        }
        self.total_place as f32 / self.games as f32
    }
}

/// In-memory leaderboard for one room. Entries outlive disconnects so a
/// reconnect under the same identity keeps its record; the rendered view
/// filters to players that are still present.
#[derive(Debug, Default)]
pub struct Leaderboard {
    entries: HashMap<Uuid, LeaderboardEntry>,
}

impl Leaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finished round's 1-based placements into the aggregates.
    pub fn record_round(&mut self, placements: &[(Uuid, u32)]) {
        for &(player_id, place) in placements {
            let entry = self.entries.entry(player_id).or_default();
            entry.games += 1;
            entry.total_place += place;
            if place == 1 {
                entry.wins += 1;
            }
        }
    }

    pub fn entry(&self, player_id: &Uuid) -> Option<&LeaderboardEntry> {
        self.entries.get(player_id)
    }

    /// Ranked read-only view: wins descending, then average placement
    /// ascending, then games descending. Players absent from `connected`
    /// are omitted (their stats stay in memory).
    pub fn ranked(&self, connected: &[(Uuid, String)]) -> Vec<LeaderboardRow> {
        let mut rows: Vec<LeaderboardRow> = connected
            .iter()
            .filter_map(|(id, name)| {
                self.entries.get(id).map(|e| LeaderboardRow {
                    id: *id,
                    name: name.clone(),
                    wins: e.wins,
                    games: e.games,
                    total_place: e.total_place,
                    avg_place: e.average_place(),
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            b.wins
                .cmp(&a.wins)
                .then(a.avg_place.total_cmp(&b.avg_place))
                .then(b.games.cmp(&a.games))
                .then(a.id.cmp(&b.id))
        });
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn test_record_round_accumulates() {
        let mut board = Leaderboard::new();
        board.record_round(&[(uid(1), 1), (uid(2), 2)]);
        board.record_round(&[(uid(1), 2), (uid(2), 1)]);

        let a = board.entry(&uid(1)).unwrap();
        assert_eq!(a.wins, 1);
        assert_eq!(a.games, 2);
        assert_eq!(a.total_place, 3);
        assert!((a.average_place() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_ranking_prefers_better_average_on_equal_wins() {
        let mut board = Leaderboard::new();
        // Equal wins; uid(2) carries the better (lower) average placement
        // despite fewer games, so it must rank first.
        board.record_round(&[(uid(1), 1), (uid(2), 1)]);
        board.record_round(&[(uid(1), 1), (uid(2), 1)]);
        board.record_round(&[(uid(1), 2), (uid(2), 2)]);
        board.record_round(&[(uid(1), 2)]);
        assert!((board.entry(&uid(1)).unwrap().average_place() - 1.5).abs() < 1e-6);
        assert!(board.entry(&uid(2)).unwrap().average_place() < 1.5);

        let connected = vec![(uid(1), "a".to_string()), (uid(2), "b".to_string())];
        let rows = board.ranked(&connected);
        assert_eq!(rows[0].id, uid(2));
        assert_eq!(rows[1].id, uid(1));
    }

    #[test]
    fn test_ranked_omits_disconnected_but_keeps_entry() {
        let mut board = Leaderboard::new();
        board.record_round(&[(uid(1), 1), (uid(2), 2)]);

        let connected = vec![(uid(2), "b".to_string())];
        let rows = board.ranked(&connected);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, uid(2));
        // Underlying statistic is retained for a reconnect
        assert!(board.entry(&uid(1)).is_some());
    }

    #[test]
    fn test_more_games_breaks_average_tie() {
        let mut board = Leaderboard::new();
        board.record_round(&[(uid(1), 1), (uid(2), 1)]);
        board.record_round(&[(uid(1), 3), (uid(2), 2)]);
        board.record_round(&[(uid(2), 3)]);
        // Both: wins 1, average 2.0; uid(2) has more games played
        assert_eq!(board.entry(&uid(1)).unwrap().games, 2);
        assert_eq!(board.entry(&uid(2)).unwrap().games, 3);

        let connected = vec![(uid(1), "a".to_string()), (uid(2), "b".to_string())];
        let rows = board.ranked(&connected);
        assert_eq!(rows[0].id, uid(2));
    }
}
