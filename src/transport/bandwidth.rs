//! Rolling-window bandwidth accounting

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default window length in seconds
pub const DEFAULT_WINDOW_SECS: u64 = 10;

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

/// Tracks bytes transferred over the last `window` and reports a rate.
///
/// Shared between the send path and the receive task, so all methods take
/// `&self`.
#[derive(Debug)]
pub struct BandwidthMonitor {
    window: Duration,
    inner: Mutex<Window>,
}

impl BandwidthMonitor {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs.max(1)),
            inner: Mutex::new(Window::default()),
        }
    }

    /// Record `bytes` transferred now
    pub fn add(&self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    pub(crate) fn add_at(&self, at: Instant, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.samples.push_back((at, bytes));
        inner.total += bytes;
        Self::prune(&mut inner, self.window, at);
    }

    /// Average bytes per second over the window
    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second_at(Instant::now())
    }

    pub(crate) fn bytes_per_second_at(&self, now: Instant) -> u64 {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.window, now);
        inner.total / self.window.as_secs()
    }

    /// Bytes currently inside the window
    pub fn bytes_in_window(&self) -> u64 {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.window, Instant::now());
        inner.total
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.total = 0;
    }

    fn prune(inner: &mut Window, window: Duration, now: Instant) {
        while let Some(&(at, bytes)) = inner.samples.front() {
            if now.saturating_duration_since(at) < window {
                break;
            }
            inner.samples.pop_front();
            inner.total -= bytes;
        }
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}
