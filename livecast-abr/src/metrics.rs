//! Per-tick connection metrics and their exponential moving averages.

use std::collections::VecDeque;

/// Smoothing factor for all EMAs.
pub const EMA_ALPHA: f64 = 0.15;

/// Ticks that make up the FPS observation window (~3 s at 1 Hz).
const FPS_WINDOW_TICKS: usize = 3;

/// FPS substituted for audio-only sessions so video triggers stay inert.
const AUDIO_ONLY_FPS: f64 = 30.0;

/// Raw cumulative counters sampled from the peer connection, once per
/// second.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSample {
    /// Current round-trip time of the active candidate pair, milliseconds.
    pub rtt_ms: Option<f64>,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Cumulative decoded frames; `None` on audio-only sessions.
    pub frames_decoded: Option<u64>,
}

/// Derived per-tick metrics plus the running averages.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickMetrics {
    pub rtt_inst: f64,
    pub loss_inst: f64,
    pub bitrate_inst_kbps: f64,
    pub fps3s: f64,
    pub rtt: f64,
    pub loss: f64,
    pub fps: f64,
}

/// Accumulates samples and produces smoothed metrics.
#[derive(Debug, Default)]
pub struct MetricsWindow {
    prev: Option<TickSample>,
    frames: VecDeque<u64>,
    seeded: bool,
    rtt: f64,
    loss: f64,
    fps: f64,
}

impl MetricsWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample, get the derived metrics.
    pub fn update(&mut self, sample: TickSample) -> TickMetrics {
        let rtt_inst = sample.rtt_ms.unwrap_or(0.0);

        // a fresh session's counters start at zero, so the first tick's
        // cumulative values are its first interval
        let prev = self.prev.unwrap_or_default();
        let d_lost = sample.packets_lost.saturating_sub(prev.packets_lost) as f64;
        let d_recv = sample
            .packets_received
            .saturating_sub(prev.packets_received) as f64;
        let loss_inst = if d_lost + d_recv > 0.0 {
            (d_lost / (d_lost + d_recv)).max(0.0)
        } else {
            0.0
        };
        let d_bytes = sample.bytes_received.saturating_sub(prev.bytes_received) as f64;
        let bitrate_inst_kbps = d_bytes * 8.0 / 1000.0;

        let fps3s = match sample.frames_decoded {
            None => AUDIO_ONLY_FPS,
            Some(frames) => {
                self.frames.push_back(frames);
                while self.frames.len() > FPS_WINDOW_TICKS + 1 {
                    self.frames.pop_front();
                }
                if self.frames.len() >= 2 {
                    let oldest = *self.frames.front().unwrap();
                    let span = (self.frames.len() - 1) as f64;
                    frames.saturating_sub(oldest) as f64 / span
                } else {
                    AUDIO_ONLY_FPS
                }
            }
        };

        if self.seeded {
            self.rtt = EMA_ALPHA * rtt_inst + (1.0 - EMA_ALPHA) * self.rtt;
            self.loss = EMA_ALPHA * loss_inst + (1.0 - EMA_ALPHA) * self.loss;
            self.fps = EMA_ALPHA * fps3s + (1.0 - EMA_ALPHA) * self.fps;
        } else {
            // first tick seeds the averages directly
            self.rtt = rtt_inst;
            self.loss = loss_inst;
            self.fps = fps3s;
            self.seeded = true;
        }

        self.prev = Some(sample);
        TickMetrics {
            rtt_inst,
            loss_inst,
            bitrate_inst_kbps,
            fps3s,
            rtt: self.rtt,
            loss: self.loss,
            fps: self.fps,
        }
    }

    /// Forget history; used when a new session replaces the old one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lost: u64, recv: u64, bytes: u64, frames: u64) -> TickSample {
        TickSample {
            rtt_ms: Some(100.0),
            packets_lost: lost,
            packets_received: recv,
            bytes_received: bytes,
            frames_decoded: Some(frames),
        }
    }

    #[test]
    fn test_first_tick_seeds_directly() {
        let mut window = MetricsWindow::new();
        let m = window.update(sample(0, 0, 0, 0));
        assert_eq!(m.rtt, 100.0);
        assert_eq!(m.loss, 0.0);
    }

    #[test]
    fn test_loss_is_delta_based() {
        let mut window = MetricsWindow::new();
        window.update(sample(0, 0, 0, 0));
        // 10 lost, 90 received in the interval -> 10%
        let m = window.update(sample(10, 90, 10_000, 30));
        assert!((m.loss_inst - 0.10).abs() < 1e-9);
        // bitrate: 10 kB * 8 / 1000 = 80 kbps
        assert!((m.bitrate_inst_kbps - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_converges() {
        let mut window = MetricsWindow::new();
        window.update(TickSample {
            rtt_ms: Some(0.0),
            ..Default::default()
        });
        let mut last = 0.0;
        for _ in 0..60 {
            last = window
                .update(TickSample {
                    rtt_ms: Some(600.0),
                    ..Default::default()
                })
                .rtt;
        }
        assert!(last > 590.0, "EMA should approach the steady input, got {last}");
    }

    #[test]
    fn test_fps_window() {
        let mut window = MetricsWindow::new();
        for i in 0..5u64 {
            window.update(sample(0, i * 100, 0, i * 30));
        }
        let m = window.update(sample(0, 500, 0, 150));
        // 30 fps steady over the 3 s window
        assert!((m.fps3s - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_audio_only_fps_is_30() {
        let mut window = MetricsWindow::new();
        let m = window.update(TickSample {
            rtt_ms: Some(50.0),
            frames_decoded: None,
            ..Default::default()
        });
        assert_eq!(m.fps3s, 30.0);
    }
}
