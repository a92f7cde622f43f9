use std::collections::BTreeMap;

/// Handle to a pending timer, used to cancel it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerId {
    timeout_time_ms: u64,
    seq: u64,
}

/// Cancellable timers on an integer millisecond timeline.
///
/// Timers expire in order of their timeout, and in order of creation for equal timeouts. A timer
/// may be set for the current step time, in which case it expires on the next pop.
pub struct TimerQueue<T> {
    timers: BTreeMap<(u64, u64), T>,
    next_seq: u64,
    last_step_time_ms: u64,
}

impl<T> TimerQueue<T> {
    pub fn new(now_ms: u64) -> Self {
        Self {
            timers: BTreeMap::new(),
            next_seq: 0,
            last_step_time_ms: now_ms,
        }
    }

    pub fn set_timer(&mut self, timeout_time_ms: u64, data: T) -> TimerId {
        assert!(
            timeout_time_ms >= self.last_step_time_ms,
            "attempt to set timer in the past"
        );

        let seq = self.next_seq;
        self.next_seq += 1;

        self.timers.insert((timeout_time_ms, seq), data);

        TimerId {
            timeout_time_ms,
            seq,
        }
    }

    /// Cancels a timer, returning its data if it had not yet expired.
    pub fn unset_timer(&mut self, timer_id: TimerId) -> Option<T> {
        self.timers.remove(&(timer_id.timeout_time_ms, timer_id.seq))
    }

    /// Removes and returns the earliest timer due at or before `now_ms`.
    ///
    /// Expiring one timer at a time means a handler may cancel any timer still pending, including
    /// ones due at the same instant.
    pub fn pop_expired(&mut self, now_ms: u64) -> Option<(TimerId, T)> {
        assert!(
            now_ms >= self.last_step_time_ms,
            "attempt to step in the past"
        );

        self.last_step_time_ms = now_ms;

        let mut entry = self.timers.first_entry()?;

        let &(timeout_time_ms, seq) = entry.key();

        if timeout_time_ms > now_ms {
            return None;
        }

        let data = entry.remove();

        Some((
            TimerId {
                timeout_time_ms,
                seq,
            },
            data,
        ))
    }

    pub fn next_expiration_time_ms(&self) -> Option<u64> {
        self.timers.keys().next().map(|&(timeout_time_ms, _)| timeout_time_ms)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut TimerQueue<u32>, now_ms: u64) -> Vec<u32> {
        let mut expired = Vec::new();

        while let Some((_, data)) = queue.pop_expired(now_ms) {
            expired.push(data);
        }

        expired
    }

    #[test]
    fn expires_in_order() {
        let mut queue = TimerQueue::new(0);

        queue.set_timer(30, 3);
        queue.set_timer(10, 1);
        queue.set_timer(20, 2);
        queue.set_timer(10, 4);

        assert_eq!(queue.next_expiration_time_ms(), Some(10));
        assert_eq!(drain(&mut queue, 9), vec![]);
        assert_eq!(drain(&mut queue, 20), vec![1, 4, 2]);
        assert_eq!(queue.next_expiration_time_ms(), Some(30));
        assert_eq!(drain(&mut queue, 100), vec![3]);
        assert!(queue.is_empty());
        assert_eq!(queue.next_expiration_time_ms(), None);
    }

    #[test]
    fn unset_prevents_expiry() {
        let mut queue = TimerQueue::new(0);

        let a = queue.set_timer(5, 1);
        let b = queue.set_timer(5, 2);

        assert_eq!(queue.unset_timer(a), Some(1));
        assert_eq!(queue.unset_timer(a), None);
        assert_eq!(drain(&mut queue, 5), vec![2]);
        assert_eq!(queue.unset_timer(b), None);
    }

    #[test]
    fn set_during_step_at_now() {
        // A handler rescheduling for the current time is picked up by the same drain loop
        let mut queue = TimerQueue::new(0);
        let mut fired = Vec::new();

        queue.set_timer(0, 0);

        while let Some((_, count)) = queue.pop_expired(0) {
            fired.push(count);

            if count < 3 {
                queue.set_timer(0, count + 1);
            }
        }

        assert_eq!(fired, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancel_sibling_due_at_same_time() {
        let mut queue = TimerQueue::new(0);

        queue.set_timer(10, 1);
        let sibling = queue.set_timer(10, 2);

        let (_, first) = queue.pop_expired(10).unwrap();
        assert_eq!(first, 1);

        queue.unset_timer(sibling);

        assert!(queue.pop_expired(10).is_none());
    }

    #[test]
    #[should_panic]
    fn set_in_past() {
        let mut queue = TimerQueue::<u32>::new(0);

        queue.pop_expired(100);
        queue.set_timer(50, 0);
    }
}
