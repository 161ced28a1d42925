use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use parking_lot::RwLock;
use realtime_core::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Best,
    Set,
    Increment,
    Decrement,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaderboardMetadata {
    pub id: String,
    pub authoritative: bool,
    pub sort_order: SortOrder,
    pub operator: Operator,
    pub reset_schedule: Option<String>,
    pub duration: Option<u64>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub max_size: Option<u32>,
    pub max_num_score: Option<u32>,
    pub join_required: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaderboardRecord {
    pub leaderboard_id: String,
    pub owner_id: UserId,
    pub score: i64,
    pub subscore: i64,
    pub num_score: u32,
    pub metadata: serde_json::Value,
    pub expire_time: Option<u64>,
    pub create_time: u64,
    pub update_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ScoreKey {
    score: i64,
    subscore: i64,
    update_time: u64,
}

/// Sorted structure over one board's live records, keyed `(score, subscore,
/// updateTime, owner)` so an exact score tie breaks in favor of whichever
/// record updated earlier, per the rank contract. Ordering is flipped at
/// insert time for `Descending` boards rather than threaded through every
/// comparison, which is what lets `rank_of`/`top_n` use the same ascending
/// `BTreeSet` walk regardless of the board's sort order -- `update_time` is
/// never flipped, since "earlier wins a tie" holds for both sort orders.
struct BoardRanking {
    sort_order: SortOrder,
    by_rank: BTreeSet<(ScoreKey, UserId)>,
    by_owner: HashMap<UserId, ScoreKey>,
}

impl BoardRanking {
    fn new(sort_order: SortOrder) -> Self {
        Self {
            sort_order,
            by_rank: BTreeSet::new(),
            by_owner: HashMap::new(),
        }
    }

    fn ordered_key(&self, score: i64, subscore: i64, update_time: u64) -> ScoreKey {
        match self.sort_order {
            SortOrder::Ascending => ScoreKey { score, subscore, update_time },
            SortOrder::Descending => ScoreKey {
                score: -score,
                subscore: -subscore,
                update_time,
            },
        }
    }

    fn upsert(&mut self, owner_id: UserId, score: i64, subscore: i64, update_time: u64) {
        let key = self.ordered_key(score, subscore, update_time);
        if let Some(old) = self.by_owner.insert(owner_id, key) {
            self.by_rank.remove(&(old, owner_id));
        }
        self.by_rank.insert((key, owner_id));
    }

    fn remove(&mut self, owner_id: UserId) {
        if let Some(old) = self.by_owner.remove(&owner_id) {
            self.by_rank.remove(&(old, owner_id));
        }
    }

    /// 1-based rank, best score first regardless of sort order. `range` over
    /// the backing `BTreeSet` walks only the entries ahead of this one.
    fn rank_of(&self, owner_id: UserId) -> Option<u64> {
        let key = *self.by_owner.get(&owner_id)?;
        let ahead = self.by_rank.range(..(key, owner_id)).count();
        Some(ahead as u64 + 1)
    }

    fn top_n(&self, n: usize) -> Vec<UserId> {
        self.by_rank.iter().take(n).map(|(_, owner)| *owner).collect()
    }

    fn len(&self) -> usize {
        self.by_owner.len()
    }
}

/// Leaderboard Cache & Scheduler (spec §4.K): board metadata plus, per board,
/// a live record table and a rank cache keyed by the board's current expiry
/// epoch so a reset can invalidate ranking without touching metadata.
pub struct LeaderboardCache {
    boards: DashMap<String, LeaderboardMetadata>,
    records: DashMap<(String, UserId), LeaderboardRecord>,
    rankings: DashMap<(String, u64), Arc<RwLock<BoardRanking>>>,
    expire_epoch: DashMap<String, u64>,
}

impl LeaderboardCache {
    pub fn new() -> Self {
        Self {
            boards: DashMap::new(),
            records: DashMap::new(),
            rankings: DashMap::new(),
            expire_epoch: DashMap::new(),
        }
    }

    pub fn create(&self, metadata: LeaderboardMetadata) {
        let id = metadata.id.clone();
        self.boards.insert(id.clone(), metadata);
        self.expire_epoch.insert(id, 0);
    }

    pub fn get(&self, board_id: &str) -> Option<LeaderboardMetadata> {
        self.boards.get(board_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<LeaderboardMetadata> {
        self.boards.iter().map(|e| e.value().clone()).collect()
    }

    pub fn delete(&self, board_id: &str) {
        self.boards.remove(board_id);
        self.expire_epoch.remove(board_id);
        self.records.retain(|(id, _), _| id != board_id);
        self.rankings.retain(|(id, _), _| id != board_id);
    }

    fn current_epoch(&self, board_id: &str) -> u64 {
        self.expire_epoch.get(board_id).map(|e| *e.value()).unwrap_or(0)
    }

    fn ranking_for(&self, board_id: &str, sort_order: SortOrder) -> Arc<RwLock<BoardRanking>> {
        let epoch = self.current_epoch(board_id);
        Arc::clone(
            self.rankings
                .entry((board_id.to_string(), epoch))
                .or_insert_with(|| Arc::new(RwLock::new(BoardRanking::new(sort_order))))
                .value(),
        )
    }

    /// Writes a record according to the board's operator and updates its
    /// rank cache entry. `Set`/`Best` overwrite, `Increment`/`Decrement`
    /// apply against the existing score (defaulting to zero).
    pub fn submit_score(
        &self,
        board_id: &str,
        owner_id: UserId,
        score: i64,
        subscore: i64,
        metadata: serde_json::Value,
    ) -> Result<LeaderboardRecord, realtime_core::RealtimeError> {
        let board = self
            .get(board_id)
            .ok_or_else(|| realtime_core::RealtimeError::not_found(format!("no such leaderboard {board_id}")))?;
        let now = now_millis();
        let key = (board_id.to_string(), owner_id);

        let existing = self.records.get(&key).map(|e| e.value().clone());
        let (new_score, new_subscore) = match (board.operator, &existing) {
            (Operator::Set, _) => (score, subscore),
            (Operator::Increment, Some(prev)) => (prev.score + score, prev.subscore + subscore),
            (Operator::Increment, None) => (score, subscore),
            (Operator::Decrement, Some(prev)) => (prev.score - score, prev.subscore - subscore),
            (Operator::Decrement, None) => (-score, -subscore),
            (Operator::Best, Some(prev)) => match board.sort_order {
                SortOrder::Ascending if score < prev.score => (score, subscore),
                SortOrder::Descending if score > prev.score => (score, subscore),
                _ => (prev.score, prev.subscore),
            },
            (Operator::Best, None) => (score, subscore),
        };

        let record = LeaderboardRecord {
            leaderboard_id: board_id.to_string(),
            owner_id,
            score: new_score,
            subscore: new_subscore,
            num_score: existing.as_ref().map(|p| p.num_score + 1).unwrap_or(1),
            metadata,
            expire_time: board.end_time,
            create_time: existing.as_ref().map(|p| p.create_time).unwrap_or(now),
            update_time: now,
        };
        self.records.insert(key, record.clone());

        let ranking = self.ranking_for(board_id, board.sort_order);
        ranking.write().upsert(owner_id, new_score, new_subscore, now);
        Ok(record)
    }

    pub fn rank_of(&self, board_id: &str, owner_id: UserId) -> Option<u64> {
        let board = self.get(board_id)?;
        self.ranking_for(board_id, board.sort_order).read().rank_of(owner_id)
    }

    pub fn top_n(&self, board_id: &str, n: usize) -> Vec<UserId> {
        let Some(board) = self.get(board_id) else {
            return Vec::new();
        };
        self.ranking_for(board_id, board.sort_order).read().top_n(n)
    }

    pub fn record_count(&self, board_id: &str) -> usize {
        let Some(board) = self.get(board_id) else {
            return 0;
        };
        self.ranking_for(board_id, board.sort_order).read().len()
    }

    /// Fires at a board's computed reset instant: bumps its expiry epoch
    /// (which makes every subsequent `ranking_for` call start a fresh,
    /// empty `BoardRanking` for that board) and drops the now-stale live
    /// record rows. Archiving a snapshot before reset is left to the
    /// embedding binary -- this cache only holds live state.
    pub fn reset_board(&self, board_id: &str) {
        self.expire_epoch.entry(board_id.to_string()).and_modify(|e| *e += 1).or_insert(1);
        self.records.retain(|(id, _), _| id != board_id);
    }

    /// Next fire instant for a board's cron `resetSchedule`, if it has one.
    fn next_reset(&self, board_id: &str) -> Option<SystemTime> {
        let board = self.get(board_id)?;
        let expr = board.reset_schedule?;
        let schedule = Schedule::from_str(&expr).ok()?;
        let next = schedule.upcoming(Utc).next()?;
        Some(UNIX_EPOCH + Duration::from_millis(next.timestamp_millis().max(0) as u64))
    }
}

impl Default for LeaderboardCache {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One scheduler task per board with a cron-based reset, computing its own
/// next fire instant after every reset rather than polling on a fixed
/// interval -- the teacher's tick-loop idiom generalized from a fixed period
/// to a recomputed deadline.
pub fn spawn_reset_scheduler(
    cache: Arc<LeaderboardCache>,
    board_id: String,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(deadline) = cache.next_reset(&board_id) else {
                tracing::debug!(board_id = %board_id, "no reset schedule configured, scheduler exiting");
                return;
            };
            let sleep_for = deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::from_secs(0));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    tracing::info!(board_id = %board_id, "resetting leaderboard");
                    cache.reset_board(&board_id);
                }
                _ = shutdown.notified() => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(operator: Operator, sort_order: SortOrder) -> LeaderboardMetadata {
        LeaderboardMetadata {
            id: "board-1".into(),
            authoritative: true,
            sort_order,
            operator,
            reset_schedule: None,
            duration: None,
            start_time: 0,
            end_time: None,
            max_size: None,
            max_num_score: None,
            join_required: false,
        }
    }

    #[test]
    fn descending_board_ranks_highest_score_first() {
        let cache = LeaderboardCache::new();
        cache.create(board(Operator::Best, SortOrder::Descending));
        let alice = UserId::new();
        let bob = UserId::new();
        cache.submit_score("board-1", alice, 100, 0, serde_json::Value::Null).unwrap();
        cache.submit_score("board-1", bob, 200, 0, serde_json::Value::Null).unwrap();

        assert_eq!(cache.rank_of("board-1", bob), Some(1));
        assert_eq!(cache.rank_of("board-1", alice), Some(2));
        assert_eq!(cache.top_n("board-1", 2), vec![bob, alice]);
    }

    #[test]
    fn best_operator_keeps_the_better_score_on_a_descending_board() {
        let cache = LeaderboardCache::new();
        cache.create(board(Operator::Best, SortOrder::Descending));
        let alice = UserId::new();
        cache.submit_score("board-1", alice, 50, 0, serde_json::Value::Null).unwrap();
        let record = cache.submit_score("board-1", alice, 30, 0, serde_json::Value::Null).unwrap();
        assert_eq!(record.score, 50);
    }

    #[test]
    fn increment_operator_accumulates() {
        let cache = LeaderboardCache::new();
        cache.create(board(Operator::Increment, SortOrder::Descending));
        let alice = UserId::new();
        cache.submit_score("board-1", alice, 10, 0, serde_json::Value::Null).unwrap();
        let record = cache.submit_score("board-1", alice, 5, 0, serde_json::Value::Null).unwrap();
        assert_eq!(record.score, 15);
        assert_eq!(record.num_score, 2);
    }

    #[test]
    fn reset_clears_records_and_starts_a_fresh_rank_cache() {
        let cache = LeaderboardCache::new();
        cache.create(board(Operator::Set, SortOrder::Descending));
        let alice = UserId::new();
        cache.submit_score("board-1", alice, 10, 0, serde_json::Value::Null).unwrap();
        assert_eq!(cache.record_count("board-1"), 1);

        cache.reset_board("board-1");
        assert_eq!(cache.record_count("board-1"), 0);
        assert_eq!(cache.rank_of("board-1", alice), None);
    }

    #[test]
    fn submit_to_unknown_board_is_not_found() {
        let cache = LeaderboardCache::new();
        let err = cache
            .submit_score("missing", UserId::new(), 1, 0, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, realtime_core::RealtimeError::NotFound(_)));
    }

    #[test]
    fn equal_scores_break_ties_by_earlier_update_time() {
        let cache = LeaderboardCache::new();
        cache.create(board(Operator::Set, SortOrder::Descending));
        let earlier = UserId::new();
        let later = UserId::new();
        cache.submit_score("board-1", earlier, 100, 0, serde_json::Value::Null).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.submit_score("board-1", later, 100, 0, serde_json::Value::Null).unwrap();

        assert_eq!(cache.rank_of("board-1", earlier), Some(1));
        assert_eq!(cache.rank_of("board-1", later), Some(2));
    }
}
