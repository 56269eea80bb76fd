use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to close the connection after no activity
    Idle = 1,
    /// When to give up on a handshake that has not completed
    HandshakeTimeout = 2,
    /// When the close timer expires, the connection has been gracefully terminated
    Close = 3,
}

impl Timer {
    pub(crate) const VALUES: [Self; 4] = [
        Self::LossDetection,
        Self::Idle,
        Self::HandshakeTimeout,
        Self::Close,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 4],
}

impl TimerTable {
    pub(super) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    #[cfg(test)]
    pub(super) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(super) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// Earliest armed deadline
    pub(super) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Disarm and return the first timer that has expired at `now`, if any
    pub(super) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        Timer::VALUES
            .into_iter()
            .find(|&timer| self.data[timer as usize].map_or(false, |t| t <= now))
            .map(|timer| {
                self.stop(timer);
                timer
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timer_table() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Idle, now - 3 * sec);
        timers.set(Timer::Close, now - 2 * sec);
        timers.set(Timer::LossDetection, now + sec);

        assert_eq!(timers.next_timeout(), Some(now - 3 * sec));
        assert_eq!(timers.expire_before(now), Some(Timer::Idle));
        assert_eq!(timers.expire_before(now), Some(Timer::Close));
        assert_eq!(timers.expire_before(now), None);
        assert_eq!(timers.get(Timer::LossDetection), Some(now + sec));
    }
}
