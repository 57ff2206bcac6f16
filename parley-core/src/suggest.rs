// ABOUTME: "Did you mean" matching for unresolved command names
// ABOUTME: Normalised Levenshtein similarity plus one-shot pending suggestions per sender

use crate::sync::lock;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a suggestion waits for its confirmation
pub const SUGGESTION_TTL: Duration = Duration::from_secs(60);

/// Replies that accept a pending suggestion
pub const CONFIRMATIONS: [&str; 2] = [".", "。"];

/// Edit distance, one rolling row
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let n = b_chars.len();

    let mut prev_row: Vec<usize> = (0..=n).collect();
    let mut curr_row = vec![0usize; n + 1];

    for (i, a_ch) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;
        for (j, b_ch) in b_chars.iter().enumerate() {
            let cost = usize::from(a_ch != b_ch);
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[n]
}

/// `1 - distance / longer length`, in 0..=1
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Most similar candidate at or above `coefficient`. Ties go to the
/// candidate that comes first.
pub fn best_match<'a, I>(target: &str, candidates: I, coefficient: f64) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let score = similarity(target, candidate);
        if score < coefficient {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Who a suggestion was offered to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuggestionKey {
    pub platform: String,
    pub channel: String,
    pub user: String,
}

struct Pending {
    text: String,
    offered_at: Instant,
}

/// One outstanding suggestion per (platform, channel, user)
#[derive(Default)]
pub struct SuggestionBook {
    pending: Mutex<HashMap<SuggestionKey, Pending>>,
}

impl SuggestionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the corrected command line, replacing any earlier offer
    pub fn offer(&self, key: SuggestionKey, text: String) {
        let mut pending = lock(&self.pending);
        pending.retain(|_, p| p.offered_at.elapsed() < SUGGESTION_TTL);
        pending.insert(
            key,
            Pending {
                text,
                offered_at: Instant::now(),
            },
        );
    }

    /// Take the offer for `key` if it has not expired
    pub fn accept(&self, key: &SuggestionKey) -> Option<String> {
        let pending = lock(&self.pending).remove(key)?;
        (pending.offered_at.elapsed() < SUGGESTION_TTL).then_some(pending.text)
    }

    pub fn is_pending(&self, key: &SuggestionKey) -> bool {
        lock(&self.pending)
            .get(key)
            .is_some_and(|p| p.offered_at.elapsed() < SUGGESTION_TTL)
    }
}
