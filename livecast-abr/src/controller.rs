//! The adaptive decision engine.
//!
//! Pure state machine: consumes one stats sample per second plus an
//! injected clock and emits switch decisions. The session driver applies
//! them and reports connect outcomes back.

use crate::levels::{Level, PenaltyBox};
use crate::metrics::{MetricsWindow, TickSample};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tunables; defaults carry the production thresholds.
#[derive(Debug, Clone)]
pub struct AbrConfig {
    pub loss_downgrade: f64,
    pub rtt_downgrade_ms: f64,
    pub fps_downgrade: f64,
    /// Downgrade when measured bitrate drops below this fraction of the
    /// level's expected bitrate.
    pub bitrate_factor: f64,
    pub downgrade_ticks: u32,
    pub loss_upgrade: f64,
    pub rtt_upgrade_ms: f64,
    pub fps_upgrade: f64,
    pub upgrade_ticks: u32,
    pub critical_rtt_ms: f64,
    pub critical_fps: f64,
    /// Quality-based downgrade triggers are suppressed this long after a
    /// successful connect.
    pub honeymoon: Duration,
    /// No auto-decision fires this long after any switch.
    pub switch_cooldown: Duration,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            loss_downgrade: 0.10,
            rtt_downgrade_ms: 500.0,
            fps_downgrade: 10.0,
            bitrate_factor: 0.7,
            downgrade_ticks: 4,
            loss_upgrade: 0.05,
            rtt_upgrade_ms: 200.0,
            fps_upgrade: 25.0,
            upgrade_ticks: 8,
            critical_rtt_ms: 3000.0,
            critical_fps: 1.0,
            honeymoon: Duration::from_secs(10),
            switch_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    GettingCodecs,
    Running,
    Switching,
    Restarting,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Downgrade,
    CriticalDowngrade,
    Upgrade,
}

/// Emitted by [`AbrEngine::on_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub target: usize,
    pub reason: SwitchReason,
}

/// Sans-IO adaptive controller over an ordered (high → low) level table.
pub struct AbrEngine {
    config: AbrConfig,
    levels: Vec<Level>,
    state: ControllerState,
    current: usize,
    /// Level a pending switch is trying to reach.
    pending: Option<(usize, SwitchReason)>,
    metrics: MetricsWindow,
    penalties: PenaltyBox,
    bad_streak: u32,
    good_streak: u32,
    connected_at: Option<Instant>,
    last_switch_at: Option<Instant>,
}

impl AbrEngine {
    #[must_use]
    pub fn new(levels: Vec<Level>, initial: usize, config: AbrConfig) -> Self {
        assert!(!levels.is_empty());
        let initial = initial.min(levels.len() - 1);
        Self {
            config,
            levels,
            state: ControllerState::GettingCodecs,
            current: initial,
            pending: None,
            metrics: MetricsWindow::new(),
            penalties: PenaltyBox::new(),
            bad_streak: 0,
            good_streak: 0,
            connected_at: None,
            last_switch_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    #[must_use]
    pub fn current_level(&self) -> &Level {
        &self.levels[self.current]
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    #[must_use]
    pub fn penalties(&self) -> &PenaltyBox {
        &self.penalties
    }

    /// A switch attempt begins (auto or manual); starts the cooldown.
    pub fn begin_switch(&mut self, target: usize, reason: SwitchReason, now: Instant) {
        self.pending = Some((target, reason));
        self.state = ControllerState::Switching;
        self.last_switch_at = Some(now);
        self.bad_streak = 0;
        self.good_streak = 0;
    }

    /// The initial connect (and a restart) is not a switch: no cooldown.
    pub fn begin_initial(&mut self, target: usize) {
        self.pending = Some((target, SwitchReason::Downgrade));
        self.state = ControllerState::Switching;
        self.bad_streak = 0;
        self.good_streak = 0;
    }

    /// A manual switch clears the target's penalties before attempting it.
    pub fn manual_switch(&mut self, target: usize, now: Instant) {
        self.penalties.clear(target);
        self.begin_switch(target, SwitchReason::Downgrade, now);
    }

    /// The pending (or initial) session produced its first track.
    pub fn on_connect_success(&mut self, now: Instant) {
        if let Some((target, _)) = self.pending.take() {
            self.current = target;
        }
        self.state = ControllerState::Running;
        self.connected_at = Some(now);
        self.metrics.reset();
        self.bad_streak = 0;
        self.good_streak = 0;
        info!(level = %self.levels[self.current].id, "level active");
    }

    /// The pending switch failed after its codec chain was exhausted.
    ///
    /// The failed level is penalised. For a downgrade the intent stands:
    /// the next lower non-banned level is returned for the driver to try.
    /// For an upgrade the controller falls back to the still-open current
    /// session.
    pub fn on_switch_failure(&mut self, now: Instant) -> Option<usize> {
        let Some((failed, reason)) = self.pending.take() else {
            return None;
        };
        let ban = self.penalties.record_failure(failed, now);
        info!(
            level = %self.levels[failed].id,
            failures = self.penalties.failure_count(failed),
            ban_secs = ban.as_secs(),
            "level banned after failed attempt"
        );

        match reason {
            SwitchReason::Upgrade => {
                self.state = ControllerState::Running;
                None
            }
            SwitchReason::Downgrade | SwitchReason::CriticalDowngrade => {
                match self.next_down_from(failed, now) {
                    Some(target) => {
                        self.pending = Some((target, reason));
                        Some(target)
                    }
                    None => {
                        self.state = ControllerState::Running;
                        None
                    }
                }
            }
        }
    }

    /// The running session's transport failed; the driver reopens the
    /// current level.
    pub fn on_restart(&mut self) {
        self.state = ControllerState::Restarting;
        self.metrics.reset();
    }

    /// Every recovery path is exhausted.
    pub fn on_failed(&mut self) {
        self.state = ControllerState::Failed;
    }

    pub fn on_closed(&mut self) {
        self.state = ControllerState::Closed;
    }

    /// Feed the 1 Hz stats sample; may emit a switch decision.
    pub fn on_tick(&mut self, sample: TickSample, now: Instant) -> Option<Decision> {
        if self.state != ControllerState::Running {
            return None;
        }

        let level = &self.levels[self.current];
        let audio_only = level.audio_only;
        let m = self.metrics.update(sample);

        let in_honeymoon = self
            .connected_at
            .is_some_and(|t| now.duration_since(t) < self.config.honeymoon);
        let in_cooldown = self
            .last_switch_at
            .is_some_and(|t| now.duration_since(t) < self.config.switch_cooldown);

        debug!(
            rtt = m.rtt,
            loss = m.loss,
            fps = m.fps,
            bitrate = m.bitrate_inst_kbps,
            "tick"
        );

        if in_cooldown {
            return None;
        }

        // critical conditions skip the persistence requirement
        let critical = m.rtt_inst > self.config.critical_rtt_ms
            || (!audio_only && !in_honeymoon && m.fps3s <= self.config.critical_fps);
        if critical {
            if let Some(target) = self.next_down_from(self.current, now) {
                self.begin_switch(target, SwitchReason::CriticalDowngrade, now);
                return Some(Decision {
                    target,
                    reason: SwitchReason::CriticalDowngrade,
                });
            }
            return None;
        }

        let expected_kbps = f64::from(level.max_bitrate_kbps);
        let starved = expected_kbps > 0.0
            && m.bitrate_inst_kbps < self.config.bitrate_factor * expected_kbps;
        let degraded = m.loss > self.config.loss_downgrade
            || m.rtt > self.config.rtt_downgrade_ms
            || (!audio_only && !in_honeymoon && m.fps < self.config.fps_downgrade)
            || (!audio_only && !in_honeymoon && starved);

        let healthy = m.loss <= self.config.loss_upgrade
            && m.rtt < self.config.rtt_upgrade_ms
            && (audio_only || m.fps >= self.config.fps_upgrade);

        if degraded {
            self.bad_streak += 1;
            self.good_streak = 0;
            if self.bad_streak >= self.config.downgrade_ticks {
                if let Some(target) = self.next_down_from(self.current, now) {
                    self.begin_switch(target, SwitchReason::Downgrade, now);
                    return Some(Decision {
                        target,
                        reason: SwitchReason::Downgrade,
                    });
                }
                self.bad_streak = 0;
            }
        } else if healthy {
            self.good_streak += 1;
            self.bad_streak = 0;
            if self.good_streak >= self.config.upgrade_ticks {
                if let Some(target) = self.next_up(now) {
                    self.begin_switch(target, SwitchReason::Upgrade, now);
                    return Some(Decision {
                        target,
                        reason: SwitchReason::Upgrade,
                    });
                }
                self.good_streak = 0;
            }
        } else {
            self.bad_streak = 0;
            self.good_streak = 0;
        }

        None
    }

    /// Next lower (worse) level below `from`, skipping banned entries.
    fn next_down_from(&self, from: usize, now: Instant) -> Option<usize> {
        ((from + 1)..self.levels.len()).find(|&idx| !self.penalties.is_banned(idx, now))
    }

    /// The next better level, and only that one: a banned upgrade target
    /// blocks upgrading until its ban expires.
    fn next_up(&self, now: Instant) -> Option<usize> {
        let target = self.current.checked_sub(1)?;
        (!self.penalties.is_banned(target, now)).then_some(target)
    }
}
