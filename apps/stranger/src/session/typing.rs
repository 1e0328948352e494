use std::time::Duration;

use tokio::time::Instant;

/// Debounces local typing activity into at most one `typing=true` per burst
/// and exactly one `typing=false` after it.
#[derive(Debug, Default)]
pub struct TypingTimer {
    last_sent: bool,
    deadline: Option<Instant>,
}

impl TypingTimer {
    /// Records a keystroke and re-arms the idle deadline. Returns `true`
    /// when `typing=true` must be sent.
    pub fn keystroke(&mut self, now: Instant, idle: Duration) -> bool {
        self.deadline = Some(now + idle);
        if self.last_sent {
            false
        } else {
            self.last_sent = true;
            true
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Called when the deadline may have passed. Returns `true` when
    /// `typing=false` must be sent.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => self.stop(),
            _ => false,
        }
    }

    /// Ends the burst early, e.g. because the message was sent. Returns
    /// `true` when `typing=false` must be sent.
    pub fn stop(&mut self) -> bool {
        self.deadline = None;
        std::mem::take(&mut self.last_sent)
    }

    /// Forgets the burst without announcing anything.
    pub fn clear(&mut self) {
        self.deadline = None;
        self.last_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_millis(2000);

    #[test]
    fn burst_collapses_into_one_start_and_one_stop() {
        let start = Instant::now();
        let mut timer = TypingTimer::default();
        let mut sent = Vec::new();

        for offset in [0, 300, 600, 900] {
            let now = start + Duration::from_millis(offset);
            if timer.keystroke(now, IDLE) {
                sent.push((offset, true));
            }
        }
        assert_eq!(timer.deadline(), Some(start + Duration::from_millis(2900)));

        assert!(!timer.expire(start + Duration::from_millis(2899)));
        if timer.expire(start + Duration::from_millis(2900)) {
            sent.push((2900, false));
        }
        assert!(!timer.expire(start + Duration::from_millis(5000)));

        assert_eq!(sent, vec![(0, true), (2900, false)]);
    }

    #[test]
    fn stop_only_reports_when_started() {
        let mut timer = TypingTimer::default();
        assert!(!timer.stop());
        assert!(timer.keystroke(Instant::now(), IDLE));
        assert!(timer.stop());
        assert!(!timer.stop());
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn clear_is_silent() {
        let mut timer = TypingTimer::default();
        timer.keystroke(Instant::now(), IDLE);
        timer.clear();
        assert_eq!(timer.deadline(), None);
        assert!(!timer.stop());
    }
}
