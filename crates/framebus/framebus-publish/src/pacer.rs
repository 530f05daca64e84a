//! Absolute-deadline frame cadence.
//!
//! Deadline `n` is `origin + n * den / num` seconds, computed from the
//! origin every time rather than by adding a period to the previous wakeup,
//! so rounding and scheduling jitter never accumulate into drift. A frame
//! that misses its deadline is reported as late and the next one is due at
//! its own absolute time, which lets the producer catch up.

use std::time::Duration;

use crate::PublishError;

const NANOS_PER_SEC: u128 = 1_000_000_000;

pub struct Pacer {
    origin_ns: u64,
    num: u64,
    den: u64,
    ticks: u64,
}

impl Pacer {
    /// Starts the cadence now. `num / den` is the frame rate in frames per second.
    pub fn new(frame_rate_num: u32, frame_rate_den: u32) -> Result<Self, PublishError> {
        if frame_rate_num == 0 || frame_rate_den == 0 {
            return Err(PublishError::InvalidRate {
                num: frame_rate_num,
                den: frame_rate_den,
            });
        }
        Ok(Self {
            origin_ns: now_ns(),
            num: frame_rate_num as u64,
            den: frame_rate_den as u64,
            ticks: 0,
        })
    }

    /// Nominal time between frames.
    pub fn period(&self) -> Duration {
        Duration::from_nanos((self.den as u128 * NANOS_PER_SEC / self.num as u128) as u64)
    }

    fn deadline_ns(&self, tick: u64) -> u64 {
        self.origin_ns + (tick as u128 * self.den as u128 * NANOS_PER_SEC / self.num as u128) as u64
    }

    /// Sleeps until the next frame is due. Returns how late we already were
    /// if the deadline had passed.
    pub fn wait(&mut self) -> Option<Duration> {
        self.ticks += 1;
        let deadline = self.deadline_ns(self.ticks);
        let now = now_ns();
        if now >= deadline {
            return Some(Duration::from_nanos(now - deadline));
        }
        sleep_until_ns(deadline);
        None
    }

    /// Frames paced so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Restarts the cadence from now, e.g. after a long stall.
    pub fn resync(&mut self) {
        self.origin_ns = now_ns();
        self.ticks = 0;
    }
}

#[cfg(target_os = "linux")]
fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(target_os = "linux")]
fn sleep_until_ns(deadline: u64) {
    let ts = libc::timespec {
        tv_sec: (deadline / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline % 1_000_000_000) as libc::c_long,
    };
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            break;
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(not(target_os = "linux"))]
fn sleep_until_ns(deadline: u64) {
    let now = now_ns();
    if deadline > now {
        std::thread::sleep(Duration::from_nanos(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn ntsc_period_is_exact_to_the_nanosecond() {
        let p = Pacer::new(30_000, 1_001).unwrap();
        assert_eq!(p.period(), Duration::from_nanos(33_366_666));
        // 30000 frames of 30000/1001 fps take exactly 1001 seconds.
        assert_eq!(p.deadline_ns(30_000) - p.origin_ns, 1_001 * 1_000_000_000);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(Pacer::new(0, 1), Err(PublishError::InvalidRate { .. })));
        assert!(matches!(Pacer::new(25, 0), Err(PublishError::InvalidRate { .. })));
    }

    #[test]
    fn cadence_does_not_drift() {
        let start = Instant::now();
        let mut p = Pacer::new(200, 1).unwrap();
        for _ in 0..20 {
            p.wait();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "too slow: {elapsed:?}");
    }

    #[test]
    fn stall_is_reported_as_lateness() {
        let mut p = Pacer::new(1_000, 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let late = p.wait().expect("deadline already passed");
        assert!(late >= Duration::from_millis(15));
        p.resync();
        assert_eq!(p.ticks(), 0);
    }
}
