use std::cell::RefCell;
use std::rc::Rc;

use web_time::Instant;

use tether_core::{FlushReport, Runtime, WatcherId};

/// Rolling flush statistics.
pub struct FlushHud {
    flush_count: u64,
    runs_total: u64,
    halted_total: u64,
    last_flush: Option<Instant>,
    flush_ms_smooth: f32,
    rate_smooth: f32,
    pub last_report: Option<FlushReport>,
}

impl Default for FlushHud {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushHud {
    pub fn new() -> Self {
        Self {
            flush_count: 0,
            runs_total: 0,
            halted_total: 0,
            last_flush: None,
            flush_ms_smooth: 0.0,
            rate_smooth: 0.0,
            last_report: None,
        }
    }

    pub fn record(&mut self, report: &FlushReport) {
        self.record_at(report, Instant::now());
    }

    fn record_at(&mut self, report: &FlushReport, now: Instant) {
        const ALPHA: f32 = 0.2;
        let ema = |prev: f32, sample: f32| {
            if prev == 0.0 {
                sample
            } else {
                (1.0 - ALPHA) * prev + ALPHA * sample
            }
        };

        self.flush_count += 1;
        self.runs_total += report.ran as u64;
        self.halted_total += report.halted.len() as u64;
        let ms = report.duration.as_secs_f32() * 1000.0;
        self.flush_ms_smooth = ema(self.flush_ms_smooth, ms);
        if let Some(prev) = self.last_flush.replace(now) {
            let dt = (now - prev).as_secs_f32();
            if dt > 0.0 {
                self.rate_smooth = ema(self.rate_smooth, 1.0 / dt);
            }
        }
        if !report.halted.is_empty() {
            log::warn!("flush #{} halted watchers {:?}", self.flush_count, report.halted);
        }
        self.last_report = Some(report.clone());
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn runs_total(&self) -> u64 {
        self.runs_total
    }

    pub fn halted_total(&self) -> u64 {
        self.halted_total
    }

    /// Smoothed flush duration in milliseconds.
    pub fn flush_ms(&self) -> f32 {
        self.flush_ms_smooth
    }

    /// Smoothed flushes per second.
    pub fn flush_rate(&self) -> f32 {
        self.rate_smooth
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("flush: {}", self.flush_count),
            format!("flush time: {:.2} ms", self.flush_ms_smooth),
            format!("rate: {:.1}/s", self.rate_smooth),
            format!("runs: {}", self.runs_total),
        ];
        if let Some(report) = &self.last_report {
            lines.push(format!("last: {} run(s)", report.ran));
        }
        if self.halted_total > 0 {
            lines.push(format!("halted: {}", self.halted_total));
        }
        lines.join("  |  ")
    }
}

/// Feeds a [`FlushHud`] from a runtime's flush reports.
pub struct Inspector {
    pub enabled: bool,
    hud: Rc<RefCell<FlushHud>>,
}

impl Inspector {
    pub fn attach(runtime: &Runtime) -> Self {
        let hud = Rc::new(RefCell::new(FlushHud::new()));
        let sink = Rc::downgrade(&hud);
        runtime.on_flush(move |report| {
            if let Some(hud) = sink.upgrade() {
                hud.borrow_mut().record(report);
            }
        });
        log::debug!("flush inspector attached");
        Self { enabled: true, hud }
    }

    pub fn hud(&self) -> std::cell::Ref<'_, FlushHud> {
        self.hud.borrow()
    }

    /// Watchers halted by the loop detector in the most recent flush.
    pub fn last_halted(&self) -> Vec<WatcherId> {
        self.hud
            .borrow()
            .last_report
            .as_ref()
            .map(|report| report.halted.clone())
            .unwrap_or_default()
    }

    /// Summary line, or `None` while disabled.
    pub fn frame(&self) -> Option<String> {
        self.enabled.then(|| self.hud.borrow().summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Object, Value};
    use web_time::Duration;

    fn report(ran: usize, halted: Vec<WatcherId>, ms: u64) -> FlushReport {
        FlushReport {
            ran,
            halted,
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn hud_smooths_durations() {
        let mut hud = FlushHud::new();
        let start = Instant::now();
        hud.record_at(&report(2, vec![], 10), start);
        assert!((hud.flush_ms() - 10.0).abs() < 1e-3);
        hud.record_at(&report(1, vec![7], 20), start + Duration::from_millis(500));
        assert!((hud.flush_ms() - 12.0).abs() < 1e-3);
        assert!((hud.flush_rate() - 2.0).abs() < 1e-3);
        assert_eq!(hud.flush_count(), 2);
        assert_eq!(hud.runs_total(), 3);
        assert_eq!(hud.halted_total(), 1);

        let summary = hud.summary();
        assert!(summary.starts_with("flush: 2  |  "));
        assert!(summary.ends_with("halted: 1"));
    }

    #[test]
    fn inspector_tracks_runtime_flushes() {
        let rt = Runtime::new();
        let inspector = Inspector::attach(&rt);
        let state = Value::from([("a", 1)].into_iter().collect::<Object>());
        rt.observe(&state);
        let _w = rt.watch("a").context(state.clone()).build().unwrap();

        state.as_object().unwrap().set("a", 2).unwrap();
        rt.run_until_idle().unwrap();
        assert_eq!(inspector.hud().flush_count(), 1);
        assert_eq!(inspector.hud().runs_total(), 1);
        assert!(inspector.last_halted().is_empty());
        assert!(inspector.frame().is_some_and(|line| line.contains("last: 1 run(s)")));
    }
}
