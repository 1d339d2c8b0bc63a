use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::rpc::WireValue;

// Format of the sample dates, also used to match the workload log lines
pub const SAMPLE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// The tunable parameters in effect on the GPU
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ParameterPoint {
    pub power_limit_mw: u32,
    pub core_clock_offset_mhz: i32,
    pub mem_clock_offset_mhz: i32,
}

impl ParameterPoint {
    pub fn new(
        power_limit_mw: u32,
        core_clock_offset_mhz: i32,
        mem_clock_offset_mhz: i32,
    ) -> Self {
        Self {
            power_limit_mw,
            core_clock_offset_mhz,
            mem_clock_offset_mhz,
        }
    }

    pub fn power_limit_w(&self) -> f64 {
        f64::from(self.power_limit_mw) / 1000.0
    }

    // (power limit, core offset, memory offset)
    pub fn to_wire(&self) -> WireValue {
        WireValue::List(vec![
            self.power_limit_mw.into(),
            self.core_clock_offset_mhz.into(),
            self.mem_clock_offset_mhz.into(),
        ])
    }

    pub fn from_wire(value: &WireValue) -> Option<Self> {
        let [limit, core, mem] = value.as_list()? else {
            return None;
        };

        Some(Self {
            power_limit_mw: u32::try_from(limit.as_i64()?).ok()?,
            core_clock_offset_mhz: i32::try_from(core.as_i64()?).ok()?,
            mem_clock_offset_mhz: i32::try_from(mem.as_i64()?).ok()?,
        })
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} W, core {:+} MHz, mem {:+} MHz",
            self.power_limit_w(),
            self.core_clock_offset_mhz,
            self.mem_clock_offset_mhz
        )
    }
}

// One instantaneous reading of the GPU sensors
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReading {
    // Current and max boost frequencies
    pub gpu_clock_mhz: u32,
    pub mem_clock_mhz: u32,
    pub max_gpu_clock_mhz: u32,

    pub temperature_c: u32,

    pub fan_speed_percent: u32,
    pub fan_speed_rpm: Option<u32>,

    pub memory_used_mb: f64,

    // Utilization
    pub gpu_load_percent: u32,
    pub mem_controller_load_percent: u32,

    // Board power draw, enforced limit and max limit
    pub power_draw_mw: u32,
    pub power_limit_mw: u32,
    pub power_limit_max_mw: u32,

    // Overclocking frequency offsets, not every driver reports them
    pub core_clock_offset_mhz: Option<i32>,
    pub mem_clock_offset_mhz: Option<i32>,

    // NVML doesn't report the core voltage
    pub voltage_v: Option<f64>,
}

impl GpuReading {
    pub fn power_draw_w(&self) -> f64 {
        f64::from(self.power_draw_mw) / 1000.0
    }

    // Power draw as a percentage of the max power limit
    pub fn power_consumption_percent(&self) -> f64 {
        percent_of(self.power_draw_mw, self.power_limit_max_mw)
    }

    // Enforced power limit as a percentage of the max power limit
    pub fn tdp_limit_percent(&self) -> f64 {
        percent_of(self.power_limit_mw, self.power_limit_max_mw)
    }

    // Parameters the GPU was running with when the reading was taken,
    // unknown when the driver doesn't report the offsets
    pub fn point(&self) -> Option<ParameterPoint> {
        Some(ParameterPoint {
            power_limit_mw: self.power_limit_mw,
            core_clock_offset_mhz: self.core_clock_offset_mhz?,
            mem_clock_offset_mhz: self.mem_clock_offset_mhz?,
        })
    }
}

fn percent_of(value: u32, max: u32) -> f64 {
    if max == 0 {
        return 0.0;
    }

    f64::from(value) / f64::from(max) * 100.0
}

// A reading stored in a collection, later annotated with the
// performance reported by the workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub date: String,
    pub workload: String,
    pub point: ParameterPoint,
    pub reading: GpuReading,

    pub fps: Option<u32>,
    // Frames per second per watt of board power draw
    pub efficiency: Option<f64>,
}

impl TelemetrySample {
    pub fn new(
        reading: GpuReading,
        workload: &str,
        point: ParameterPoint,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            date: now.format(SAMPLE_DATE_FORMAT).to_string(),
            workload: workload.to_string(),
            point,
            reading,
            fps: None,
            efficiency: None,
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.fps.is_some()
    }
}

// Why a run was not stable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    SensorUnavailable,
    StoreUnavailable,
    LaunchFailed,
    MissingShutdownMarker,
    LogUnreadable,
    LingeringProcess,
}

impl RunFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunFailure::SensorUnavailable => "sensor_unavailable",
            RunFailure::StoreUnavailable => "store_unavailable",
            RunFailure::LaunchFailed => "launch_failed",
            RunFailure::MissingShutdownMarker => "missing_shutdown_marker",
            RunFailure::LogUnreadable => "log_unreadable",
            RunFailure::LingeringProcess => "lingering_process",
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RunFailure::SensorUnavailable,
            RunFailure::StoreUnavailable,
            RunFailure::LaunchFailed,
            RunFailure::MissingShutdownMarker,
            RunFailure::LogUnreadable,
            RunFailure::LingeringProcess,
        ]
        .into_iter()
        .find(|failure| failure.as_str() == s)
        .ok_or_else(|| format!("Unknown run failure \"{s}\""))
    }
}

// Outcome of one benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub succeeded: bool,
    pub sample_count: usize,
    pub abnormal_termination: bool,
    pub failure: Option<RunFailure>,
}

impl RunResult {
    pub fn completed(sample_count: usize) -> Self {
        Self {
            succeeded: true,
            sample_count,
            abnormal_termination: false,
            failure: None,
        }
    }

    pub fn failed(sample_count: usize, failure: RunFailure) -> Self {
        Self {
            succeeded: false,
            sample_count,
            abnormal_termination: false,
            failure: Some(failure),
        }
    }

    // The run went to the end but the workload didn't shut down cleanly
    pub fn abnormal(sample_count: usize, failure: RunFailure) -> Self {
        Self {
            succeeded: true,
            sample_count,
            abnormal_termination: true,
            failure: Some(failure),
        }
    }

    pub fn is_stable(&self) -> bool {
        self.succeeded && !self.abnormal_termination
    }

    // (succeeded, sample count, abnormal termination, reason or None)
    pub fn to_wire(&self) -> WireValue {
        WireValue::List(vec![
            self.succeeded.into(),
            self.sample_count.into(),
            self.abnormal_termination.into(),
            self.failure.map(|failure| failure.as_str()).into(),
        ])
    }

    pub fn from_wire(value: &WireValue) -> Option<Self> {
        // A bare boolean only tells whether the run succeeded
        if let Some(succeeded) = value.as_bool() {
            return Some(Self {
                succeeded,
                sample_count: 0,
                abnormal_termination: false,
                failure: None,
            });
        }

        let [succeeded, count, abnormal, failure] = value.as_list()? else {
            return None;
        };

        let failure = match failure {
            WireValue::Null => None,
            other => Some(other.as_str()?.parse().ok()?),
        };

        Some(Self {
            succeeded: succeeded.as_bool()?,
            sample_count: usize::try_from(count.as_i64()?).ok()?,
            abnormal_termination: abnormal.as_bool()?,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_run_result_stability() {
        assert!(RunResult::completed(45).is_stable());
        assert!(!RunResult::failed(20, RunFailure::SensorUnavailable).is_stable());
        assert!(
            !RunResult::abnormal(45, RunFailure::MissingShutdownMarker).is_stable()
        );
    }

    #[test]
    fn test_run_result_wire_form() {
        let result = RunResult::failed(20, RunFailure::SensorUnavailable);
        let encoded = result.to_wire().encode();

        assert_eq!(encoded, "(False, 20, False, sensor_unavailable)");
        assert_eq!(
            RunResult::from_wire(&WireValue::decode(&encoded)),
            Some(result)
        );

        let encoded = RunResult::completed(45).to_wire().encode();
        assert_eq!(encoded, "(True, 45, False, None)");
    }

    #[test]
    fn test_run_result_from_bare_bool() {
        let result = RunResult::from_wire(&WireValue::Bool(false)).unwrap();

        assert!(!result.succeeded);
        assert!(!result.is_stable());
    }

    #[test]
    fn test_run_result_rejects_garbage() {
        assert_eq!(
            RunResult::from_wire(&WireValue::from("Server error")),
            None
        );
        assert_eq!(
            RunResult::from_wire(&WireValue::decode("(True, 1, False, bogus)")),
            None
        );
    }

    #[test]
    fn test_parameter_point_wire_form() {
        let point = ParameterPoint::new(215_000, -50, 400);

        assert_eq!(point.to_wire().encode(), "(215000, -50, 400)");
        assert_eq!(ParameterPoint::from_wire(&point.to_wire()), Some(point));
        assert_eq!(
            ParameterPoint::from_wire(&WireValue::decode("(1, 2)")),
            None
        );
    }

    #[test]
    fn test_sample_fields() {
        let reading = GpuReading {
            power_draw_mw: 150_000,
            power_limit_mw: 200_000,
            power_limit_max_mw: 400_000,
            core_clock_offset_mhz: Some(100),
            mem_clock_offset_mhz: Some(200),
            ..Default::default()
        };
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let point = reading.point().unwrap();
        assert_eq!(point, ParameterPoint::new(200_000, 100, 200));

        let sample = TelemetrySample::new(reading, "glmsi01", point, now);

        assert_eq!(sample.date, "2024-03-09 14:05:07");
        assert_eq!(sample.point, point);
        assert_eq!(sample.reading.tdp_limit_percent(), 50.0);
        assert_eq!(sample.reading.power_consumption_percent(), 37.5);
        assert!(!sample.is_reconciled());
    }

    #[test]
    fn test_unreported_offsets_give_no_point() {
        let reading = GpuReading {
            power_limit_mw: 200_000,
            core_clock_offset_mhz: None,
            mem_clock_offset_mhz: Some(200),
            ..Default::default()
        };

        assert_eq!(reading.point(), None);
    }
}
