use core::fmt;

use tracing::{debug, warn};

use crate::{sample::TelemetrySample, supervisor::workload_log::FpsEntry};

// Counters of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub log_entries: usize,
    pub updated: usize,
    pub already_reconciled: usize,
    pub unmatched: usize,
    pub missing_power: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.log_entries == 0 {
            return f.write_str("No FPS values found in the workload log");
        }

        write!(
            f,
            "FPS values: {}, samples updated: {}, already annotated: {}, without sample: {}, without power draw: {}",
            self.log_entries,
            self.updated,
            self.already_reconciled,
            self.unmatched,
            self.missing_power
        )
    }
}

// Annotate the samples taken at the same second as a log entry with its
// FPS and the efficiency in FPS per watt. The log only records the time of
// day so entries are matched against the given day ("%Y-%m-%d").
// A sample is annotated at most once
pub fn reconcile(
    samples: &mut [TelemetrySample],
    entries: &[FpsEntry],
    day: &str,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        log_entries: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        let date = format!("{day} {}", entry.time);

        let Some(sample) = samples.iter_mut().find(|sample| sample.date == date) else {
            debug!("No sample at {date} for FPS value {}", entry.fps);
            report.unmatched += 1;

            continue;
        };

        if sample.is_reconciled() {
            report.already_reconciled += 1;
            continue;
        }

        if sample.reading.power_draw_mw == 0 {
            warn!("Sample at {date} has no board power draw");
            report.missing_power += 1;

            continue;
        }

        let efficiency = f64::from(entry.fps) / sample.reading.power_draw_w();
        sample.fps = Some(entry.fps);
        sample.efficiency = Some(efficiency);

        debug!("{date} FPS: {}, efficiency: {efficiency:.3} FPS/W", entry.fps);
        report.updated += 1;
    }

    report
}
