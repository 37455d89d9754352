//! Scripted straight-line placement detection.
//!
//! People dragging by hand do not place a dozen pixels within a few seconds
//! that are collinear to a third of a pixel and evenly spaced. Scripts do.
//! Each origin keeps a short ring buffer of placements; every new placement
//! re-runs [`detect_line`] over the recent burst.

use crate::config::LineDetectorConfig;
use crate::origin::Origin;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One pixel placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub color: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Placement {
    pub fn new(x: f64, y: f64, color: u32, timestamp_ms: u64) -> Self {
        Self {
            x,
            y,
            color,
            timestamp_ms,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    fn distance(&self, other: &Placement) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineDirection {
    Horizontal,
    Vertical,
    Diagonal45,
    Diagonal,
}

impl LineDirection {
    /// Classify an angle in degrees, `tolerance` degrees either side of each axis.
    pub fn from_angle(degrees: f64, tolerance: f64) -> Self {
        let a = degrees.rem_euclid(180.0);
        let near = |target: f64| (a - target).abs() <= tolerance;

        if near(0.0) || near(180.0) {
            LineDirection::Horizontal
        } else if near(90.0) {
            LineDirection::Vertical
        } else if near(45.0) || near(135.0) {
            LineDirection::Diagonal45
        } else {
            LineDirection::Diagonal
        }
    }
}

/// Outcome of a detection pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LineDetection {
    NotDetected,
    Detected {
        point_count: usize,
        length: f64,
        median_spacing: f64,
        angle_degrees: f64,
        direction: LineDirection,
        /// Range within the burst, sorted by time.
        start_index: usize,
        end_index: usize,
    },
}

impl LineDetection {
    pub fn is_detected(&self) -> bool {
        matches!(self, LineDetection::Detected { .. })
    }
}

struct LineShape {
    length: f64,
    median_spacing: f64,
    angle_degrees: f64,
}

/// Look for a scripted line among `points`.
///
/// Only points within the burst window of the newest one are considered. They
/// are ordered by time, then x, then y, and every suffix of at least
/// `min_points` is tested from the longest down. The first passing suffix wins.
pub fn detect_line(points: &[Placement], config: &LineDetectorConfig) -> LineDetection {
    let min_points = config.min_points.max(2);
    if points.len() < min_points || points.iter().any(|p| !p.is_finite()) {
        return LineDetection::NotDetected;
    }

    let Some(newest) = points.iter().map(|p| p.timestamp_ms).max() else {
        return LineDetection::NotDetected;
    };
    let cutoff = newest.saturating_sub(config.burst_window_ms);

    let mut burst: Vec<Placement> = points
        .iter()
        .filter(|p| p.timestamp_ms >= cutoff)
        .copied()
        .collect();
    if burst.len() < min_points {
        return LineDetection::NotDetected;
    }

    burst.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.x.total_cmp(&b.x))
            .then_with(|| a.y.total_cmp(&b.y))
    });

    let end_index = burst.len() - 1;
    for start in 0..=burst.len() - min_points {
        if let Some(shape) = test_window(&burst[start..], config) {
            return LineDetection::Detected {
                point_count: burst.len() - start,
                length: shape.length,
                median_spacing: shape.median_spacing,
                angle_degrees: shape.angle_degrees,
                direction: LineDirection::from_angle(
                    shape.angle_degrees,
                    config.angle_tolerance_degrees,
                ),
                start_index: start,
                end_index,
            };
        }
    }

    LineDetection::NotDetected
}

fn test_window(window: &[Placement], config: &LineDetectorConfig) -> Option<LineShape> {
    let first = window.first()?;
    let last = window.last()?;

    let dx = last.x - first.x;
    let dy = last.y - first.y;
    let length = dx.hypot(dy);
    if length < config.min_line_length {
        return None;
    }

    let (ux, uy) = (dx / length, dy / length);
    let mut previous = f64::NEG_INFINITY;
    for point in window {
        let rx = point.x - first.x;
        let ry = point.y - first.y;
        let along = rx * ux + ry * uy;
        let across = (rx * uy - ry * ux).abs();

        if across > config.collinearity_tolerance || along <= previous {
            return None;
        }
        previous = along;
    }

    let spacings: Vec<f64> = window.windows(2).map(|w| w[0].distance(&w[1])).collect();
    if spacings.iter().any(|&s| s < config.degenerate_spacing) {
        return None;
    }

    let median_spacing = median(&spacings)?;
    if median_spacing < config.min_spacing || median_spacing > config.max_spacing {
        return None;
    }

    let allowed = config.spacing_tolerance * median_spacing;
    if spacings.iter().any(|&s| (s - median_spacing).abs() > allowed) {
        return None;
    }

    Some(LineShape {
        length,
        median_spacing,
        angle_degrees: dy.atan2(dx).to_degrees(),
    })
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

struct History {
    points: VecDeque<Placement>,
    last_seen: Instant,
}

/// Per-origin placement histories.
pub struct LineDetector {
    config: LineDetectorConfig,
    histories: DashMap<String, History>,
}

impl LineDetector {
    pub fn new(config: LineDetectorConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LineDetectorConfig {
        &self.config
    }

    /// Record a placement and test the origin's recent burst.
    pub fn record_event(
        &self,
        origin: &Origin,
        x: f64,
        y: f64,
        color: u32,
        timestamp_ms: u64,
    ) -> LineDetection {
        let placement = Placement::new(x, y, color, timestamp_ms);
        if !placement.is_finite() {
            debug!(origin = %origin, "Ignoring placement with non-finite coordinates");
            return LineDetection::NotDetected;
        }

        let key = origin.key();
        if self.histories.len() >= self.config.max_tracked_origins
            && !self.histories.contains_key(&key)
        {
            return LineDetection::NotDetected;
        }

        let capacity = self.config.capacity.max(1);
        let snapshot: Vec<Placement> = {
            let mut history = self.histories.entry(key).or_insert_with(|| History {
                points: VecDeque::with_capacity(capacity),
                last_seen: Instant::now(),
            });
            history.last_seen = Instant::now();

            while history.points.len() >= capacity {
                history.points.pop_front();
            }
            history.points.push_back(placement);

            // Window is centred on the incoming event so a stray future
            // timestamp cannot pin the history.
            let window = self.config.history_window_ms;
            let oldest = timestamp_ms.saturating_sub(window);
            let newest = timestamp_ms.saturating_add(window);
            history
                .points
                .retain(|p| (oldest..=newest).contains(&p.timestamp_ms));

            history.points.iter().copied().collect()
        };

        let detection = detect_line(&snapshot, &self.config);
        if let LineDetection::Detected {
            point_count,
            direction,
            median_spacing,
            ..
        } = &detection
        {
            if self.config.log_detections {
                info!(
                    origin = %origin,
                    points = point_count,
                    direction = ?direction,
                    spacing = median_spacing,
                    "Scripted line detected"
                );
            } else {
                debug!(origin = %origin, points = point_count, "Scripted line detected");
            }
        }
        detection
    }

    /// Drop histories idle longer than the inactivity timeout.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let timeout = Duration::from_secs(self.config.inactivity_timeout_seconds);
        let before = self.histories.len();
        self.histories
            .retain(|_, history| now.saturating_duration_since(history.last_seen) < timeout);
        before.saturating_sub(self.histories.len())
    }

    pub fn tracked_origins(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LineDetectorConfig {
        LineDetectorConfig::default()
    }

    fn line(count: usize, step: f64) -> Vec<Placement> {
        (0..count)
            .map(|i| Placement::new(100.0 + i as f64 * step, 100.0, 0, 1_000 + i as u64 * 100))
            .collect()
    }

    #[test]
    fn test_horizontal_unit_step() {
        let points = line(15, 1.0);
        match detect_line(&points, &config()) {
            LineDetection::Detected {
                point_count,
                length,
                median_spacing,
                direction,
                start_index,
                end_index,
                ..
            } => {
                assert_eq!(point_count, 15);
                assert!((length - 14.0).abs() < 1e-9);
                assert!((median_spacing - 1.0).abs() < 1e-9);
                assert_eq!(direction, LineDirection::Horizontal);
                assert_eq!(start_index, 0);
                assert_eq!(end_index, 14);
            }
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_wider_step() {
        let points = line(15, 3.0);
        match detect_line(&points, &config()) {
            LineDetection::Detected { median_spacing, .. } => {
                assert!((median_spacing - 3.0).abs() < 1e-9);
            }
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_alternating_spacing_rejected() {
        let mut x = 100.0;
        let points: Vec<Placement> = (0..15)
            .map(|i| {
                let p = Placement::new(x, 100.0, 0, 1_000 + i * 100);
                x += if i % 2 == 0 { 1.0 } else { 3.0 };
                p
            })
            .collect();
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_zigzag_rejected() {
        let points: Vec<Placement> = (0..15)
            .map(|i| {
                let y = if i % 2 == 0 { 100.0 } else { 102.0 };
                Placement::new(100.0 + i as f64, y, 0, 1_000 + i as u64 * 100)
            })
            .collect();
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_scattered_points_rejected() {
        let coords = [
            (12.0, 80.0),
            (47.0, 3.0),
            (90.0, 55.0),
            (5.0, 61.0),
            (33.0, 19.0),
            (71.0, 92.0),
            (18.0, 44.0),
            (64.0, 7.0),
            (88.0, 30.0),
            (26.0, 73.0),
            (52.0, 66.0),
            (9.0, 15.0),
            (79.0, 48.0),
            (40.0, 97.0),
            (58.0, 24.0),
        ];
        let points: Vec<Placement> = coords
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| Placement::new(x, y, 0, 1_000 + i as u64 * 100))
            .collect();
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_too_few_points() {
        let points = line(8, 1.0);
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_identical_points_rejected() {
        let points: Vec<Placement> = (0..15)
            .map(|i| Placement::new(50.0, 50.0, 0, 1_000 + i * 100))
            .collect();
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_slow_points_outside_burst_window() {
        // One point every two seconds: only eight fall within 15s of the newest.
        let points: Vec<Placement> = (0..15)
            .map(|i| Placement::new(100.0 + i as f64, 100.0, 0, i * 2_000))
            .collect();
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_line_after_noise_found_at_offset() {
        let mut points = vec![
            Placement::new(300.0, 20.0, 0, 500),
            Placement::new(10.0, 250.0, 0, 600),
        ];
        points.extend(line(13, 2.0));

        match detect_line(&points, &config()) {
            LineDetection::Detected {
                start_index,
                point_count,
                ..
            } => {
                assert_eq!(start_index, 2);
                assert_eq!(point_count, 13);
            }
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_vertical_and_diagonal() {
        let vertical: Vec<Placement> = (0..12)
            .map(|i| Placement::new(40.0, 10.0 + i as f64 * 2.0, 0, i * 50))
            .collect();
        match detect_line(&vertical, &config()) {
            LineDetection::Detected { direction, .. } => {
                assert_eq!(direction, LineDirection::Vertical)
            }
            other => panic!("expected detection, got {:?}", other),
        }

        let diagonal: Vec<Placement> = (0..12)
            .map(|i| Placement::new(i as f64, i as f64, 0, i * 50))
            .collect();
        match detect_line(&diagonal, &config()) {
            LineDetection::Detected { direction, .. } => {
                assert_eq!(direction, LineDirection::Diagonal45)
            }
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_direction_bands() {
        assert_eq!(LineDirection::from_angle(3.0, 7.5), LineDirection::Horizontal);
        assert_eq!(LineDirection::from_angle(-178.0, 7.5), LineDirection::Horizontal);
        assert_eq!(LineDirection::from_angle(-90.0, 7.5), LineDirection::Vertical);
        assert_eq!(LineDirection::from_angle(137.0, 7.5), LineDirection::Diagonal45);
        assert_eq!(LineDirection::from_angle(25.0, 7.5), LineDirection::Diagonal);
    }

    #[test]
    fn test_backtracking_rejected() {
        let mut points = line(14, 1.0);
        points.push(Placement::new(105.0, 100.0, 0, 10_000));
        // Every suffix ends on the point that doubles back.
        assert_eq!(detect_line(&points, &config()), LineDetection::NotDetected);
    }

    #[test]
    fn test_detector_records_per_origin() {
        let detector = LineDetector::new(config());
        let bot = Origin::parse("192.0.2.1").unwrap();
        let human = Origin::parse("192.0.2.2").unwrap();

        let mut last = LineDetection::NotDetected;
        for (i, p) in line(15, 1.0).iter().enumerate() {
            last = detector.record_event(&bot, p.x, p.y, p.color, p.timestamp_ms);
            if i < 11 {
                assert!(!last.is_detected());
            }
            detector.record_event(&human, 5.0 * i as f64, (i * i) as f64, 1, p.timestamp_ms);
        }
        assert!(last.is_detected());
        assert_eq!(detector.tracked_origins(), 2);
    }

    #[test]
    fn test_detector_ignores_non_finite() {
        let detector = LineDetector::new(config());
        let o = Origin::parse("192.0.2.3").unwrap();
        let result = detector.record_event(&o, f64::NAN, 1.0, 0, 0);
        assert_eq!(result, LineDetection::NotDetected);
        assert_eq!(detector.tracked_origins(), 0);
    }

    #[test]
    fn test_ring_buffer_capacity() {
        let detector = LineDetector::new(LineDetectorConfig {
            capacity: 12,
            ..config()
        });
        let o = Origin::parse("192.0.2.4").unwrap();

        // A line followed by one stray point: the buffer only ever holds 12.
        for p in line(12, 1.0) {
            detector.record_event(&o, p.x, p.y, p.color, p.timestamp_ms);
        }
        let stray = detector.record_event(&o, 400.0, 400.0, 0, 3_000);
        assert!(!stray.is_detected());
    }

    #[test]
    fn test_far_future_timestamp_does_not_pin_history() {
        let detector = LineDetector::new(config());
        let o = Origin::parse("192.0.2.6").unwrap();

        detector.record_event(&o, 0.0, 0.0, 0, u64::MAX / 2);

        let mut detected = false;
        for p in line(30, 1.0) {
            detected |= detector
                .record_event(&o, p.x, p.y, p.color, p.timestamp_ms)
                .is_detected();
        }
        assert!(detected);
    }

    #[test]
    fn test_detection_without_info_logging() {
        let detector = LineDetector::new(LineDetectorConfig {
            log_detections: false,
            ..config()
        });
        let o = Origin::parse("192.0.2.7").unwrap();

        let mut last = LineDetection::NotDetected;
        for p in line(15, 1.0) {
            last = detector.record_event(&o, p.x, p.y, p.color, p.timestamp_ms);
        }
        assert!(last.is_detected());
    }

    #[test]
    fn test_cleanup() {
        let detector = LineDetector::new(config());
        let o = Origin::parse("192.0.2.5").unwrap();
        detector.record_event(&o, 1.0, 1.0, 0, 0);

        let later = Instant::now() + Duration::from_secs(601);
        assert_eq!(detector.cleanup_at(later), 1);
        assert_eq!(detector.tracked_origins(), 0);
    }
}
