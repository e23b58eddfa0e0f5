//! Daily token budget for batch submissions.
//!
//! The window is a UTC calendar day. On a new day the spent counter
//! resets; within a day, pending chunks are taken in index order as the
//! largest prefix that still fits. When nothing fits while pending
//! chunks remain, the run stops cleanly and an operator restarts it the
//! next day.

use publink_common::{PublinkError, Result};

use crate::progress::{Chunk, ChunkStatus, DailyTokens};

pub fn today_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Roll the window over if the stored date is not `today`.
pub fn roll_window(daily: &mut DailyTokens, today: &str) {
    if daily.date != today {
        daily.date = today.to_string();
        daily.tokens = 0;
    }
}

/// Indices of the pending chunks to upload now: the largest prefix (in
/// index order) whose summed estimate fits the remaining budget.
///
/// Returns an empty vec when no chunks are pending. Raises
/// `DailyBudgetExhausted` when pending chunks exist but not even the
/// first fits today.
pub fn select_uploadable(
    chunks: &[Chunk],
    daily: &DailyTokens,
    max_tokens_per_day: u64,
) -> Result<Vec<usize>> {
    let remaining = max_tokens_per_day.saturating_sub(daily.tokens);

    let mut selected = Vec::new();
    let mut budget = remaining;
    let mut first_pending_tokens = None;

    for chunk in chunks.iter().filter(|c| c.status == ChunkStatus::Pending) {
        first_pending_tokens.get_or_insert(chunk.estimated_tokens);
        if chunk.estimated_tokens <= budget {
            budget -= chunk.estimated_tokens;
            selected.push(chunk.index);
        } else {
            break;
        }
    }

    if selected.is_empty() {
        if let Some(needed) = first_pending_tokens {
            return Err(PublinkError::DailyBudgetExhausted { needed, remaining });
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(index: usize, tokens: u64) -> Chunk {
        Chunk::new(index, format!("chunk_{index:04}.jsonl"), 1, tokens, 100)
    }

    #[test]
    fn test_window_rolls_on_new_day() {
        let mut daily = DailyTokens { date: "2026-08-01".to_string(), tokens: 500 };
        roll_window(&mut daily, "2026-08-01");
        assert_eq!(daily.tokens, 500);
        roll_window(&mut daily, "2026-08-02");
        assert_eq!(daily.tokens, 0);
        assert_eq!(daily.date, "2026-08-02");
    }

    #[test]
    fn test_selects_largest_fitting_prefix() {
        let chunks = vec![pending(0, 40), pending(1, 40), pending(2, 40)];
        let daily = DailyTokens { date: "2026-08-01".to_string(), tokens: 0 };
        let selected = select_uploadable(&chunks, &daily, 100).unwrap();
        assert_eq!(selected, vec![0, 1]);
    }

    #[test]
    fn test_exhausted_when_first_pending_does_not_fit() {
        let chunks = vec![pending(0, 60), pending(1, 60), pending(2, 60)];
        let daily = DailyTokens { date: "2026-08-01".to_string(), tokens: 60 };
        let err = select_uploadable(&chunks, &daily, 100).unwrap_err();
        match err {
            PublinkError::DailyBudgetExhausted { needed, remaining } => {
                assert_eq!(needed, 60);
                assert_eq!(remaining, 40);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_pending_chunks_is_empty_not_error() {
        let mut done = pending(0, 60);
        done.advance(ChunkStatus::Uploaded).unwrap();
        let daily = DailyTokens { date: "2026-08-01".to_string(), tokens: 0 };
        assert!(select_uploadable(&[done], &daily, 100).unwrap().is_empty());
    }

    #[test]
    fn test_three_day_drain_of_sixty_token_chunks() {
        // Scenario from the daily-budget contract: 3×60 tokens, 100/day.
        let mut chunks = vec![pending(0, 60), pending(1, 60), pending(2, 60)];
        let mut daily = DailyTokens::default();
        let mut uploaded_per_day = Vec::new();

        for day in ["d1", "d2", "d3"] {
            roll_window(&mut daily, day);
            let selected = select_uploadable(&chunks, &daily, 100).unwrap();
            uploaded_per_day.push(selected.len());
            for index in selected {
                daily.tokens += chunks[index].estimated_tokens;
                chunks[index].advance(ChunkStatus::Uploaded).unwrap();
            }
            // A second attempt on the same day must exhaust, not upload.
            if chunks.iter().any(|c| c.status == ChunkStatus::Pending) {
                assert!(select_uploadable(&chunks, &daily, 100).is_err());
            }
            assert!(daily.tokens <= 100);
        }

        assert_eq!(uploaded_per_day, vec![1, 1, 1]);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Uploaded));
    }
}
