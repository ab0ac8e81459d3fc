//! Pull-to-refresh tracking. The caller feeds raw touch positions and gets
//! back the pull distance to render and, on release, whether to refresh.

pub const DEFAULT_PULL_THRESHOLD: f32 = 80.0;
const RESISTANCE: f32 = 0.5;
const MAX_PULL: f32 = 120.0;
const INDICATOR_VISIBLE_AFTER: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRelease {
    Refresh,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullIndicator {
    Hidden,
    PullToRefresh,
    ReleaseToRefresh,
    Refreshing,
}

#[derive(Debug, Clone)]
pub struct PullGesture {
    threshold: f32,
    start_y: f32,
    started_at_top: bool,
    distance: f32,
}

impl Default for PullGesture {
    fn default() -> Self {
        Self::new(DEFAULT_PULL_THRESHOLD)
    }
}

impl PullGesture {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            start_y: 0.0,
            started_at_top: false,
            distance: 0.0,
        }
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    /// `scroll_top` is the list's scroll offset when the finger lands.
    pub fn touch_start(&mut self, y: f32, scroll_top: f32) {
        self.started_at_top = scroll_top <= 0.0;
        self.start_y = y;
        self.distance = 0.0;
    }

    /// Returns the damped pull distance. Only a downward drag that started
    /// and stays at the top of the list counts.
    pub fn touch_move(&mut self, y: f32, scroll_top: f32, refreshing: bool) -> f32 {
        if !self.started_at_top || refreshing {
            return self.distance;
        }
        let delta = y - self.start_y;
        if scroll_top <= 0.0 && delta > 0.0 {
            self.distance = (delta * RESISTANCE).min(MAX_PULL);
        }
        self.distance
    }

    pub fn touch_end(&mut self, refreshing: bool) -> PullRelease {
        let pulled = self.distance;
        let armed = self.started_at_top;
        self.distance = 0.0;
        self.started_at_top = false;
        if armed && pulled >= self.threshold && !refreshing {
            PullRelease::Refresh
        } else {
            PullRelease::Cancel
        }
    }

    pub fn indicator(&self, refreshing: bool) -> PullIndicator {
        if refreshing {
            PullIndicator::Refreshing
        } else if self.distance >= self.threshold {
            PullIndicator::ReleaseToRefresh
        } else if self.distance > INDICATOR_VISIBLE_AFTER {
            PullIndicator::PullToRefresh
        } else {
            PullIndicator::Hidden
        }
    }
}
