//! Interpolation of a remote clock from periodic (local time, remote time) samples.
//!
//! The remote side of an audio connection only reports its playback position
//! now and then, and every report is skewed by transport jitter. A
//! [`Smoother`] keeps a short history of such reports, fits a line through
//! them, and blends from its previous estimate toward the new line over a
//! fixed adjustment window, so the reported clock never jumps.
//!
//! All times are in microseconds.

use arrayvec::ArrayVec;

/// Upper bound on the number of retained samples.
pub const HISTORY_MAX: usize = 64;

/// Tuning parameters of a [`Smoother`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmootherConfig {
    /// Time over which a new estimate is blended in.
    pub adjust_usec: u64,
    /// Samples older than this are forgotten...
    pub history_usec: u64,
    /// ...unless fewer than this many would remain.
    pub min_history: usize,
    /// If set, [`Smoother::get`] never returns less than it returned before,
    /// and fitted slopes are never negative.
    pub monotonic: bool,
}

impl Default for SmootherConfig {
    #[inline(always)]
    fn default() -> Self {
        Self {
            adjust_usec: 1_000_000,
            history_usec: 5_000_000,
            min_history: 4,
            monotonic: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Smoother {
    config: SmootherConfig,
    time_offset: u64,

    history: ArrayVec<(u64, u64), HISTORY_MAX>,

    // blend start
    px: u64,
    py: u64,
    // blend end, extrapolated with slope `de` afterwards
    ex: u64,
    ey: u64,
    de: f64,

    last_y: u64,

    paused: bool,
    pause_time: u64,

    primed: bool,
}

impl Smoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            time_offset: 0,
            history: ArrayVec::new_const(),
            px: 0,
            py: 0,
            ex: 0,
            ey: 0,
            de: 1.,
            last_y: 0,
            paused: false,
            pause_time: 0,
            primed: false,
        }
    }

    #[inline(always)]
    pub const fn config(&self) -> &SmootherConfig {
        &self.config
    }

    #[inline(always)]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Local times passed to this smoother are shifted back by `offset`.
    #[inline(always)]
    pub fn set_time_offset(&mut self, offset: u64) {
        self.time_offset = offset;
    }

    /// Forgets every sample and estimate, keeping the configuration.
    pub fn reset(&mut self, time_offset: u64, paused: bool) {
        *self = Self::new(self.config);
        self.time_offset = time_offset;
        self.paused = paused;
        self.pause_time = time_offset;
    }

    #[inline(always)]
    fn local(&self, x: u64) -> u64 {
        let x = if self.paused { self.pause_time } else { x };
        x.saturating_sub(self.time_offset)
    }

    /// Feeds a sample: at local time `x` the remote clock read `y`.
    pub fn put(&mut self, x: u64, y: u64) {
        let x = self.local(x).max(self.px);

        if !self.primed {
            self.primed = true;
            self.px = x;
            self.py = y;
            self.ex = x;
            self.ey = y;
            self.de = 1.;
            self.history.push((x, y));
            return;
        }

        // the blend restarts from wherever the current estimate is
        self.py = self.estimate(x);
        self.px = x;

        self.record(x, y);

        let mut m = self.slope();
        if self.config.monotonic && m < 0. {
            m = 0.;
        }

        let adjust = self.config.adjust_usec;
        self.ex = x.saturating_add(adjust);

        let ey = y as f64 + m * adjust as f64;
        self.ey = if ey <= 0. { 0 } else { ey as u64 };

        if self.config.monotonic && self.ey < self.py {
            self.ey = self.py;
        }

        self.de = m;
    }

    /// Remote clock estimate at local time `x`.
    ///
    /// Returns zero until the first sample arrived.
    pub fn get(&mut self, x: u64) -> u64 {
        if !self.primed {
            return 0;
        }

        let x = self.local(x);
        let mut y = self.estimate(x);

        if self.config.monotonic {
            y = y.max(self.last_y);
            self.last_y = y;
        }

        y
    }

    /// Freezes the clock at local time `x`.
    #[inline]
    pub fn pause(&mut self, x: u64) {
        if self.paused {
            return;
        }

        self.paused = true;
        self.pause_time = x;
    }

    /// Lets the clock run again from local time `x`, continuing where it
    /// was frozen.
    #[inline]
    pub fn resume(&mut self, x: u64) {
        if !self.paused {
            return;
        }

        let x = x.max(self.pause_time);
        self.time_offset = self.time_offset.saturating_add(x - self.pause_time);
        self.paused = false;
    }

    fn estimate(&self, x: u64) -> u64 {
        if x >= self.ex {
            let dx = (x - self.ex) as f64;
            return self.ey.saturating_add((dx * self.de) as u64);
        }

        if x <= self.px || self.ex == self.px {
            return self.py;
        }

        // linear blend between (px, py) and (ex, ey)
        let t = (x - self.px) as f64 / (self.ex - self.px) as f64;
        let y = self.py as f64 + (self.ey as f64 - self.py as f64) * t;

        if y <= 0. { 0 } else { y as u64 }
    }

    fn record(&mut self, x: u64, y: u64) {
        let horizon = x.saturating_sub(self.config.history_usec);
        let keep = self.config.min_history.max(1);

        if self.history.is_full() {
            self.history.remove(0);
        }
        self.history.push((x, y));

        let mut expired = 0;
        while self.history.len() - expired > keep && self.history[expired].0 < horizon {
            expired += 1;
        }
        self.history.drain(..expired);
    }

    // least squares slope through the retained history
    fn slope(&self) -> f64 {
        let n = self.history.len();
        if n < 2 {
            return 1.;
        }

        // relative to the first sample, keeps the sums small
        let (x0, y0) = self.history[0];
        let (mut sx, mut sy) = (0., 0.);
        for &(x, y) in &self.history {
            sx += x as f64 - x0 as f64;
            sy += y as f64 - y0 as f64;
        }
        let (mx, my) = (sx / n as f64, sy / n as f64);

        let (mut cov, mut var) = (0., 0.);
        for &(x, y) in &self.history {
            let dx = x as f64 - x0 as f64 - mx;
            let dy = y as f64 - y0 as f64 - my;
            cov += dx * dy;
            var += dx * dx;
        }

        if var == 0. { 1. } else { cov / var }
    }
}
