//! Sentence aggregator.
//!
//! Collects finalized sentences in arrival order until the orchestrator
//! consumes them. Vendors sometimes commit a comma-terminated fragment and
//! its continuation back-to-back; two finals arriving within the merge
//! window with no intervening partial of new content are concatenated into
//! one sentence.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use lumina_core::Transcript;

struct Inner {
    queue: Vec<String>,
    last_final_at: Option<Instant>,
    partial_since_last_final: bool,
}

/// In-order, consume-once queue of finalized sentences.
pub struct SentenceAggregator {
    inner: Mutex<Inner>,
    merge_window: Duration,
}

impl SentenceAggregator {
    pub fn new(merge_window_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                last_final_at: None,
                partial_since_last_final: false,
            }),
            merge_window: Duration::from_millis(merge_window_ms),
        }
    }

    /// Append a finalized sentence, merging rapid fragments.
    pub fn push_sentence(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mergeable = !inner.partial_since_last_final
            && inner
                .last_final_at
                .is_some_and(|at| now.duration_since(at) <= self.merge_window);

        match inner.queue.last_mut() {
            Some(last) if mergeable => {
                last.push(' ');
                last.push_str(trimmed);
                tracing::debug!(merged = %last, "merged rapid sentence fragment");
            }
            _ => inner.queue.push(trimmed.to_string()),
        }

        inner.last_final_at = Some(now);
        inner.partial_since_last_final = false;
    }

    /// Record a partial; new content between finals blocks merging.
    pub fn note_partial(&self, transcript: &Transcript) {
        if !transcript.is_empty() {
            self.inner.lock().partial_since_last_final = true;
        }
    }

    /// Atomically drain the queue. Every sentence is returned exactly once.
    pub fn consume_all(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().queue)
    }

    /// Discard everything (reset path).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.last_final_at = None;
        inner.partial_since_last_final = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rapid_fragments_merge() {
        let agg = SentenceAggregator::new(200);

        agg.push_sentence("okay,");
        tokio::time::advance(Duration::from_millis(150)).await;
        agg.push_sentence(" let's go");

        assert_eq!(agg.consume_all(), vec!["okay, let's go".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fragments_stay_separate() {
        let agg = SentenceAggregator::new(200);

        agg.push_sentence("okay,");
        tokio::time::advance(Duration::from_millis(150)).await;
        agg.push_sentence(" let's go");

        assert_eq!(agg.consume_all(), vec!["okay, let's go".to_string()]);

        tokio::time::advance(Duration::from_millis(350)).await;
        agg.push_sentence(" now.");
        assert_eq!(agg.consume_all(), vec!["now.".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intervening_partial_blocks_merge() {
        let agg = SentenceAggregator::new(200);

        agg.push_sentence("first.");
        agg.note_partial(&Transcript::partial("second thing", 7));
        tokio::time::advance(Duration::from_millis(50)).await;
        agg.push_sentence("second thing.");

        assert_eq!(
            agg.consume_all(),
            vec!["first.".to_string(), "second thing.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_partials_do_not_block_merge() {
        let agg = SentenceAggregator::new(200);

        agg.push_sentence("hello,");
        agg.note_partial(&Transcript::partial("", 3));
        agg.push_sentence("world");

        assert_eq!(agg.consume_all(), vec!["hello, world".to_string()]);
    }

    #[tokio::test]
    async fn test_consume_is_exactly_once() {
        let agg = SentenceAggregator::new(200);
        agg.push_sentence("one.");

        assert_eq!(agg.consume_all().len(), 1);
        assert!(agg.consume_all().is_empty());
        assert!(agg.is_empty());
    }

    #[tokio::test]
    async fn test_blank_sentences_dropped() {
        let agg = SentenceAggregator::new(200);
        agg.push_sentence("   ");
        assert!(agg.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let agg = SentenceAggregator::new(200);
        agg.push_sentence("stale.");
        agg.clear();
        assert!(agg.consume_all().is_empty());
    }
}
