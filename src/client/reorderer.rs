//! In-order release of revision-tagged items.
//!
//! Items that arrive ahead of the expected revision are buffered until the
//! gap closes. A gap that stays open for longer than the timeout is reported
//! once through [`Reorderer::poll_timeout`], which is the owner's cue to
//! recover. The reorderer never sleeps itself; the owner waits on
//! [`Reorderer::deadline`].

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

pub struct Reorderer<T> {
    next_expected: u64,
    items: BTreeMap<u64, T>,
    timeout: Duration,
    timeout_enabled: bool,
    deadline: Option<Instant>,
    queue_until_skip: bool,
}

impl<T> Reorderer<T> {
    pub fn new(first_expected: u64, timeout: Duration) -> Self {
        Self {
            next_expected: first_expected,
            items: BTreeMap::new(),
            timeout,
            timeout_enabled: true,
            deadline: None,
            queue_until_skip: false,
        }
    }

    pub fn next_expected_version(&self) -> u64 {
        self.next_expected
    }

    /// Number of items waiting for a gap to close
    pub fn buffered_len(&self) -> usize {
        self.items.len()
    }

    /// Take an item. Returns every item that can now be released, in order.
    pub fn accept(&mut self, version: u64, item: T) -> Vec<(u64, T)> {
        if version < self.next_expected {
            trace!(
                "Dropping stale version {} (expecting {})",
                version,
                self.next_expected
            );
            return Vec::new();
        }

        let had_buffered = !self.items.is_empty();
        self.items.insert(version, item);

        if self.queue_until_skip {
            return Vec::new();
        }

        if version == self.next_expected {
            self.cancel_timeout();
            let released = self.release_contiguous();
            // Whatever is still buffered sits behind a new gap.
            self.schedule_timeout_if_necessary();
            released
        } else {
            // Only the first miss arms the timer, so a busy stream cannot keep
            // pushing the deadline out.
            if !had_buffered {
                self.schedule_timeout();
            }
            Vec::new()
        }
    }

    /// When the pending timeout fires, if one is armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire the timeout if it is due. Returns the last version released.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<u64> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(self.next_expected.saturating_sub(1))
            }
            _ => None,
        }
    }

    /// Continue at `next_version`, typically after the gap was filled out of
    /// band. Buffered items below it are dropped and any contiguous run from
    /// it is released.
    pub fn skip_to_version(&mut self, next_version: u64) -> Vec<(u64, T)> {
        self.next_expected = next_version;
        self.queue_until_skip = false;
        self.cancel_timeout();
        self.items = self.items.split_off(&next_version);

        let released = self.release_contiguous();
        self.schedule_timeout_if_necessary();
        released
    }

    /// Go back to `version`, which was released but never took effect. The
    /// timeout is armed even with nothing buffered, so the gap is reported.
    pub fn reopen_gap(&mut self, version: u64) {
        if version >= self.next_expected {
            return;
        }
        trace!(
            "Reopening gap at version {} (was expecting {})",
            version,
            self.next_expected
        );
        self.next_expected = version;
        self.schedule_timeout();
    }

    /// Buffer everything and release nothing until the next skip
    pub fn queue_until_skip(&mut self) {
        self.queue_until_skip = true;
    }

    pub fn set_timeout_enabled(&mut self, enabled: bool) {
        self.timeout_enabled = enabled;
        if enabled {
            self.schedule_timeout_if_necessary();
        } else {
            self.cancel_timeout();
        }
    }

    pub fn cleanup(&mut self) {
        self.set_timeout_enabled(false);
        self.items.clear();
    }

    fn release_contiguous(&mut self) -> Vec<(u64, T)> {
        let mut released = Vec::new();
        while let Some(item) = self.items.remove(&self.next_expected) {
            released.push((self.next_expected, item));
            self.next_expected += 1;
        }
        released
    }

    fn schedule_timeout_if_necessary(&mut self) {
        if !self.items.is_empty() {
            self.schedule_timeout();
        }
    }

    fn schedule_timeout(&mut self) {
        if self.timeout_enabled {
            self.deadline = Some(Instant::now() + self.timeout);
        }
    }

    fn cancel_timeout(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions<T>(released: Vec<(u64, T)>) -> Vec<u64> {
        released.into_iter().map(|(v, _)| v).collect()
    }

    #[test]
    fn test_releases_in_order() {
        let mut reorderer = Reorderer::new(1, Duration::from_secs(5));
        let mut seen = Vec::new();

        for version in [3, 1, 4, 2] {
            seen.extend(versions(reorderer.accept(version, format!("op{}", version))));
        }

        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(reorderer.next_expected_version(), 5);
        assert_eq!(reorderer.buffered_len(), 0);
        assert!(reorderer.deadline().is_none());
    }

    #[test]
    fn test_stale_items_dropped() {
        let mut reorderer = Reorderer::new(3, Duration::from_secs(5));
        assert!(reorderer.accept(2, ()).is_empty());
        assert_eq!(versions(reorderer.accept(3, ())), vec![3]);
        assert!(reorderer.accept(3, ()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_per_gap() {
        let mut reorderer = Reorderer::new(1, Duration::from_millis(100));
        assert_eq!(versions(reorderer.accept(1, ())), vec![1]);
        assert!(reorderer.deadline().is_none());

        // Revision 2 never arrives.
        reorderer.accept(3, ());
        let deadline = reorderer.deadline().unwrap();
        reorderer.accept(4, ());
        assert_eq!(reorderer.deadline(), Some(deadline));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reorderer.poll_timeout(Instant::now()), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reorderer.poll_timeout(Instant::now()), Some(1));

        // Still pending, but not reported again.
        reorderer.accept(5, ());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reorderer.poll_timeout(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_rearms_for_next_gap() {
        let mut reorderer = Reorderer::new(1, Duration::from_millis(100));
        reorderer.accept(2, ());
        reorderer.accept(4, ());
        assert!(reorderer.deadline().is_some());

        assert_eq!(versions(reorderer.accept(1, ())), vec![1, 2]);
        // 3 is missing now, and 4 is waiting behind it.
        assert!(reorderer.deadline().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reorderer.poll_timeout(Instant::now()), Some(2));
    }

    #[test]
    fn test_skip_to_version() {
        let mut reorderer = Reorderer::new(1, Duration::from_secs(5));
        reorderer.accept(3, "c");
        reorderer.accept(6, "f");
        reorderer.accept(7, "g");

        let released = reorderer.skip_to_version(6);
        assert_eq!(versions(released), vec![6, 7]);
        assert_eq!(reorderer.next_expected_version(), 8);
        assert_eq!(reorderer.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopened_gap_is_reported() {
        let mut reorderer = Reorderer::new(1, Duration::from_millis(100));
        assert_eq!(versions(reorderer.accept(1, ())), vec![1]);
        assert!(reorderer.deadline().is_none());

        reorderer.reopen_gap(1);
        assert_eq!(reorderer.next_expected_version(), 1);
        assert!(reorderer.deadline().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reorderer.poll_timeout(Instant::now()), Some(0));

        // Nothing to go back to.
        reorderer.reopen_gap(4);
        assert_eq!(reorderer.next_expected_version(), 1);
        assert!(reorderer.deadline().is_none());

        assert_eq!(versions(reorderer.accept(1, ())), vec![1]);
    }

    #[test]
    fn test_queue_until_skip() {
        let mut reorderer = Reorderer::new(1, Duration::from_secs(5));
        reorderer.queue_until_skip();
        assert!(reorderer.accept(1, ()).is_empty());
        assert!(reorderer.accept(2, ()).is_empty());
        assert_eq!(versions(reorderer.skip_to_version(1)), vec![1, 2]);
    }

    #[test]
    fn test_disabled_timeout_and_cleanup() {
        let mut reorderer = Reorderer::new(1, Duration::from_secs(5));
        reorderer.set_timeout_enabled(false);
        reorderer.accept(3, ());
        assert!(reorderer.deadline().is_none());

        reorderer.set_timeout_enabled(true);
        assert!(reorderer.deadline().is_some());

        reorderer.cleanup();
        assert!(reorderer.deadline().is_none());
        assert_eq!(reorderer.buffered_len(), 0);
    }
}
