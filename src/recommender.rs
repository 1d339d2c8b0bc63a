// Pick the parameter point to recommend from the samples of a sweep and
// keep it in a small text file between invocations.

use core::fmt;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use tunegpud::sample::{ParameterPoint, TelemetrySample};

// Keeps the score finite when the power draw is missing
const EPSILON: f64 = 1e-9;

const POWER_LIMIT_PREFIX: &str = "Power limit (W)";
const CORE_OFFSET_PREFIX: &str = "GPU clock offset (MHz)";
const MEM_OFFSET_PREFIX: &str = "Memory clock offset (MHz)";

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error("No sample annotated with FPS values, nothing to recommend")]
    NoData,
}

#[derive(Debug, Error)]
pub enum OptimalParamsError {
    #[error("Failed to access the optimal parameters file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("The optimal parameters file {path:?} must contain exactly 3 lines, found {found}")]
    LineCount { path: PathBuf, found: usize },
    #[error("Invalid line \"{line}\" in the optimal parameters file {path:?}")]
    Malformed { path: PathBuf, line: String },
}

// Samples in, candidate point out
pub trait Recommender: Send + Sync {
    fn recommend(&self, samples: &[TelemetrySample]) -> Result<ParameterPoint, RecommendError>;
}

// Measured performance of one parameter point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointScore {
    pub point: ParameterPoint,
    pub samples: usize,
    pub mean_fps: f64,
    pub mean_power_w: f64,
    pub score: f64,
}

// Trade performance against power draw: alpha = 0 only looks at FPS,
// alpha = 1 only at the power draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EfficiencyRecommender {
    alpha: f64,
}

impl EfficiencyRecommender {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn objective(&self, mean_fps: f64, mean_power_w: f64) -> f64 {
        mean_fps * (1.0 - self.alpha) / (mean_power_w * self.alpha + EPSILON)
    }

    // Score every point having FPS annotated samples, best first
    pub fn rank(&self, samples: &[TelemetrySample]) -> Vec<PointScore> {
        let mut totals: HashMap<ParameterPoint, (usize, f64, f64)> = HashMap::new();

        for sample in samples.iter() {
            let Some(fps) = sample.fps else {
                continue;
            };

            let total = totals.entry(sample.point).or_default();
            total.0 += 1;
            total.1 += f64::from(fps);
            total.2 += sample.reading.power_draw_w();
        }

        let mut scores: Vec<PointScore> = totals
            .into_iter()
            .map(|(point, (count, fps, power))| {
                let mean_fps = fps / count as f64;
                let mean_power_w = power / count as f64;

                PointScore {
                    point,
                    samples: count,
                    mean_fps,
                    mean_power_w,
                    score: self.objective(mean_fps, mean_power_w),
                }
            })
            .collect();

        // Ties go to the lowest power limit, then to the smallest offsets
        scores.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| {
                let key = |s: &PointScore| {
                    (
                        s.point.power_limit_mw,
                        s.point.core_clock_offset_mhz,
                        s.point.mem_clock_offset_mhz,
                    )
                };
                key(a).cmp(&key(b))
            })
        });

        scores
    }
}

impl Default for EfficiencyRecommender {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Recommender for EfficiencyRecommender {
    fn recommend(&self, samples: &[TelemetrySample]) -> Result<ParameterPoint, RecommendError> {
        let ranking = self.rank(samples);

        for score in ranking.iter().take(5) {
            debug!(
                "Recommender: {} -> {:.1} FPS, {:.1} W, score {:.4} ({} samples)",
                score.point, score.mean_fps, score.mean_power_w, score.score, score.samples
            );
        }

        let best = ranking.first().ok_or(RecommendError::NoData)?;
        info!("Recommender: Best point {} (score {:.4})", best.point, best.score);

        Ok(best.point)
    }
}

// Averages of the FPS annotated samples of one collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSummary {
    pub collection: String,
    pub samples: usize,
    pub mean_fps: f64,
    pub mean_power_w: f64,
    pub mean_efficiency: f64,
}

impl CollectionSummary {
    pub fn from_samples(collection: &str, samples: &[TelemetrySample]) -> Option<Self> {
        let annotated: Vec<&TelemetrySample> =
            samples.iter().filter(|sample| sample.is_reconciled()).collect();
        if annotated.is_empty() {
            return None;
        }

        let count = annotated.len() as f64;
        let mean = |value: fn(&TelemetrySample) -> f64| {
            annotated.iter().map(|sample| value(sample)).sum::<f64>() / count
        };

        Some(Self {
            collection: collection.to_string(),
            samples: annotated.len(),
            mean_fps: mean(|sample| sample.fps.map_or(0.0, f64::from)),
            mean_power_w: mean(|sample| sample.reading.power_draw_w()),
            mean_efficiency: mean(|sample| sample.efficiency.unwrap_or_default()),
        })
    }
}

impl fmt::Display for CollectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.1} FPS, {:.1} W, {:.3} FPS/W over {} samples",
            self.collection, self.mean_fps, self.mean_power_w, self.mean_efficiency, self.samples
        )
    }
}

// Point saved by the validation experiment and read back to apply it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalParams {
    pub power_limit_w: f64,
    pub core_clock_offset_mhz: i32,
    pub mem_clock_offset_mhz: i32,
}

impl OptimalParams {
    pub fn point(&self) -> ParameterPoint {
        ParameterPoint::new(
            (self.power_limit_w * 1000.0).round() as u32,
            self.core_clock_offset_mhz,
            self.mem_clock_offset_mhz,
        )
    }

    pub async fn load(path: &Path) -> Result<Self, OptimalParamsError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| OptimalParamsError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        Self::parse(&text, path)
    }

    pub async fn save(&self, path: &Path) -> Result<(), OptimalParamsError> {
        let to_error = |source: io::Error| OptimalParamsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(to_error)?;
        }
        fs::write(path, self.to_string()).await.map_err(to_error)?;

        info!("Optimal parameters saved to {:?}", path);

        Ok(())
    }

    fn parse(text: &str, path: &Path) -> Result<Self, OptimalParamsError> {
        let lines: Vec<&str> = text.lines().collect();
        let &[power, core, mem] = lines.as_slice() else {
            return Err(OptimalParamsError::LineCount {
                path: path.to_path_buf(),
                found: lines.len(),
            });
        };

        let malformed = |line: &str| OptimalParamsError::Malformed {
            path: path.to_path_buf(),
            line: line.to_string(),
        };

        Ok(Self {
            power_limit_w: value(power).ok_or_else(|| malformed(power))?,
            core_clock_offset_mhz: value(core).ok_or_else(|| malformed(core))?,
            mem_clock_offset_mhz: value(mem).ok_or_else(|| malformed(mem))?,
        })
    }
}

impl From<ParameterPoint> for OptimalParams {
    fn from(point: ParameterPoint) -> Self {
        Self {
            power_limit_w: point.power_limit_w(),
            core_clock_offset_mhz: point.core_clock_offset_mhz,
            mem_clock_offset_mhz: point.mem_clock_offset_mhz,
        }
    }
}

impl fmt::Display for OptimalParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{POWER_LIMIT_PREFIX}: {:.3}", self.power_limit_w)?;
        writeln!(f, "{CORE_OFFSET_PREFIX}: {}", self.core_clock_offset_mhz)?;
        write!(f, "{MEM_OFFSET_PREFIX}: {}", self.mem_clock_offset_mhz)
    }
}

// Value after the "<label>: " prefix of a line
fn value<T: std::str::FromStr>(line: &str) -> Option<T> {
    let (_, value) = line.split_once(": ")?;

    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use tunegpud::sample::GpuReading;

    use super::*;

    fn sample(point: ParameterPoint, fps: Option<u32>, power_draw_mw: u32) -> TelemetrySample {
        let reading = GpuReading {
            power_limit_mw: point.power_limit_mw,
            power_draw_mw,
            core_clock_offset_mhz: Some(point.core_clock_offset_mhz),
            mem_clock_offset_mhz: Some(point.mem_clock_offset_mhz),
            ..Default::default()
        };

        TelemetrySample {
            date: "2024-03-09 14:05:07".to_string(),
            workload: "glfurrytorus".to_string(),
            point,
            reading,
            fps,
            efficiency: fps.map(|fps| f64::from(fps) * 1000.0 / f64::from(power_draw_mw)),
        }
    }

    #[test]
    fn test_recommend_most_efficient_point() {
        let stock = ParameterPoint::new(350_000, 0, 0);
        let tuned = ParameterPoint::new(250_000, 100, 400);

        let samples = vec![
            sample(stock, Some(200), 340_000),
            sample(stock, Some(210), 345_000),
            sample(tuned, Some(190), 245_000),
            sample(tuned, Some(185), 240_000),
            // Not annotated, ignored
            sample(ParameterPoint::new(100_000, 0, 0), None, 1),
        ];

        let recommender = EfficiencyRecommender::default();
        assert_eq!(recommender.recommend(&samples).unwrap(), tuned);

        let ranking = recommender.rank(&samples);
        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0].samples, 2);
        assert!((ranking[0].mean_fps - 187.5).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_zero_favours_fps() {
        let stock = ParameterPoint::new(350_000, 0, 0);
        let tuned = ParameterPoint::new(250_000, 100, 400);

        let samples = vec![
            sample(stock, Some(200), 340_000),
            sample(tuned, Some(190), 245_000),
        ];

        assert_eq!(EfficiencyRecommender::new(0.0).recommend(&samples).unwrap(), stock);
    }

    #[test]
    fn test_no_annotated_samples() {
        let samples = vec![sample(ParameterPoint::new(350_000, 0, 0), None, 340_000)];

        assert!(matches!(
            EfficiencyRecommender::default().recommend(&samples),
            Err(RecommendError::NoData)
        ));
    }

    #[test]
    fn test_summary() {
        let point = ParameterPoint::new(350_000, 0, 0);
        let samples = vec![
            sample(point, Some(100), 200_000),
            sample(point, Some(300), 400_000),
            sample(point, None, 400_000),
        ];

        let summary = CollectionSummary::from_samples("gpu_data_default_params", &samples).unwrap();
        assert_eq!(summary.samples, 2);
        assert!((summary.mean_fps - 200.0).abs() < 1e-9);
        assert!((summary.mean_power_w - 300.0).abs() < 1e-9);

        assert!(CollectionSummary::from_samples("empty", &[]).is_none());
    }

    #[tokio::test]
    async fn test_optimal_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimal_params.txt");

        let params = OptimalParams::from(ParameterPoint::new(252_500, 100, -200));
        params.save(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Power limit (W): 252.500\nGPU clock offset (MHz): 100\nMemory clock offset (MHz): -200"
        );

        let loaded = OptimalParams::load(&path).await.unwrap();
        assert_eq!(loaded.point(), ParameterPoint::new(252_500, 100, -200));
    }

    #[test]
    fn test_optimal_params_must_have_three_lines() {
        let path = Path::new("optimal_params.txt");

        assert!(matches!(
            OptimalParams::parse("Power limit (W): 250\n", path),
            Err(OptimalParamsError::LineCount { found: 1, .. })
        ));
        assert!(matches!(
            OptimalParams::parse(
                "Power limit (W): 250\nGPU clock offset (MHz): fast\nMemory clock offset (MHz): 0",
                path
            ),
            Err(OptimalParamsError::Malformed { .. })
        ));
    }
}
