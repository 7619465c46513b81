//! Battery time-to-live estimation.
//!
//! Each earpiece keeps a short log of discharge samples. Only drops are
//! recorded; charging wipes the log since old drain rates no longer apply.
//! The estimate is a least-squares slope over recent samples, smoothed
//! against the previous estimate so it does not jump on every report.

use std::{
   borrow::Borrow,
   time::{Duration, Instant},
};

use heapless::Deque;
use log::{debug, info};

use crate::airpods::protocol::{BatteryInfo, BatteryState};

const HISTORY_SIZE: usize = 32;
const MIN_SAMPLES: usize = 4;
const MAX_SAMPLE_AGE: Duration = Duration::from_secs(2 * 60 * 60);
const MAX_ESTIMATE_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy)]
struct Sample {
   at: Instant,
   level: u8,
}

#[derive(Debug, Clone, Default)]
struct DrainLog {
   samples: Deque<Sample, HISTORY_SIZE>,
}

impl DrainLog {
   fn is_empty(&self) -> bool {
      self.samples.is_empty()
   }

   fn clear(&mut self) {
      self.samples.clear();
   }

   fn record(&mut self, at: Instant, level: u8) {
      if let Some(last) = self.samples.back() {
         if level >= last.level {
            return;
         }
         debug!("Battery dropped from {} to {level}", last.level);
      }
      if self.samples.is_full() {
         self.samples.pop_front();
      }
      let _ = self.samples.push_back(Sample { at, level });
   }

   /// Drain rate in percent per hour plus the smoothing factor to apply.
   fn drain_rate(&self, since: Option<Instant>) -> Option<(f64, f64)> {
      let recent: heapless::Vec<_, HISTORY_SIZE> = self
         .samples
         .iter()
         .filter(|s| since.is_none_or(|t| s.at >= t))
         .map(|s| (s.at, s.level))
         .collect();
      if recent.len() < MIN_SAMPLES {
         return None;
      }
      let rate = calculate_slope(&recent)?;
      let alpha = if recent.len() >= 10 { 0.3 } else { 0.1 };
      Some((rate, alpha))
   }
}

/// Per-device battery history and the last published estimate.
#[derive(Debug, Clone, Default)]
pub struct BatteryTracker {
   logs: [DrainLog; 2],
   last_estimate: Option<u32>,
}

/// The battery readings that drive the estimate: both earpieces, or the
/// single unit of over-ear models.
fn tracked(info: &BatteryInfo) -> [Option<BatteryState>; 2] {
   if info.left.is_some() || info.right.is_some() {
      [info.left, info.right]
   } else {
      [info.headphone, None]
   }
}

impl BatteryTracker {
   pub fn new() -> Self {
      Self::default()
   }

   /// Feeds one battery report into the drain logs.
   pub fn observe(&mut self, info: &BatteryInfo, now: Instant) {
      for (history, state) in self.logs.iter_mut().zip(tracked(info)) {
         let Some(state) = state else { continue };
         if state.is_charging() {
            if !history.is_empty() {
               debug!("Earpiece started charging, clearing battery history");
               history.clear();
            }
         } else {
            history.record(now, state.level.get());
         }
      }
   }

   pub fn reset(&mut self) {
      for history in &mut self.logs {
         history.clear();
      }
      self.last_estimate = None;
   }

   /// Estimated minutes until the emptiest earpiece runs out.
   pub fn estimate(&mut self, info: &BatteryInfo, now: Instant) -> Option<u32> {
      let sides = tracked(info);
      let present = sides.iter().flatten();
      if present.clone().next().is_none() || present.clone().any(BatteryState::is_charging) {
         return self.unavailable("charging or no readings");
      }

      let since = now.checked_sub(MAX_SAMPLE_AGE);
      let rate = self
         .logs
         .iter()
         .filter_map(|history| history.drain_rate(since))
         .reduce(|(r1, a1), (r2, a2)| (r1.max(r2), a1.min(a2)));
      let Some((drain_rate, alpha)) = rate else {
         return self.unavailable("not enough samples");
      };

      let min_level = present.map(|s| s.level.get()).min().unwrap_or(0);
      let minutes = (f64::from(min_level) / drain_rate * 60.0) as u32;
      if minutes == 0 || minutes >= MAX_ESTIMATE_MINUTES {
         return self.unavailable("unreasonable estimate");
      }

      let smoothed = match self.last_estimate {
         Some(prev) => (f64::from(minutes) * alpha + f64::from(prev) * (1.0 - alpha)).round() as u32,
         None => {
            info!("Battery TTL estimation now available: {minutes} minutes remaining");
            minutes
         },
      };
      self.last_estimate = Some(smoothed);
      Some(smoothed)
   }

   fn unavailable(&mut self, reason: &str) -> Option<u32> {
      if self.last_estimate.take().is_some() {
         debug!("Battery TTL estimation unavailable: {reason}");
      }
      None
   }
}

/// Least-squares slope of level over time, as a positive drain in percent
/// per hour. `None` when the level is not falling.
fn calculate_slope<I>(samples: I) -> Option<f64>
where
   I: IntoIterator<Item: Borrow<(Instant, u8)>>,
   I::IntoIter: ExactSizeIterator,
{
   let samples = samples.into_iter();
   if samples.len() < 2 {
      return None;
   }

   let n = samples.len() as f64;
   let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
   let mut origin = None;
   for sample in samples {
      let (at, level) = *sample.borrow();
      let origin = *origin.get_or_insert(at);
      let x = at.duration_since(origin).as_secs_f64() / 3600.0;
      let y = f64::from(level);
      sum_x += x;
      sum_y += y;
      sum_xy += x * y;
      sum_xx += x * x;
   }

   let denominator = n * sum_xx - sum_x * sum_x;
   if denominator.abs() < f64::EPSILON {
      return None;
   }
   let slope = (n * sum_xy - sum_x * sum_y) / denominator;
   (slope < 0.0).then_some(-slope)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::{BatteryStatus, Percent};

   fn state(level: u8, status: BatteryStatus) -> Option<BatteryState> {
      Some(BatteryState {
         level: Percent::new(level).unwrap(),
         status,
      })
   }

   fn buds(left: u8, right: u8) -> BatteryInfo {
      BatteryInfo {
         left: state(left, BatteryStatus::Discharging),
         right: state(right, BatteryStatus::Discharging),
         case: state(80, BatteryStatus::Normal),
         headphone: None,
      }
   }

   /// Six reports ten minutes apart, two percent per step (12 %/h).
   fn drain(tracker: &mut BatteryTracker, start: Instant) -> Instant {
      for i in 0..6u8 {
         let at = start + Duration::from_secs(u64::from(i) * 600);
         tracker.observe(&buds(60 - i * 2, 70 - i * 2), at);
      }
      start + Duration::from_secs(3000)
   }

   #[test]
   fn only_drops_are_logged() {
      let mut history = DrainLog::default();
      let t = Instant::now();
      history.record(t, 90);
      history.record(t, 90);
      history.record(t, 91);
      history.record(t, 89);
      assert_eq!(history.samples.len(), 2);
   }

   #[test]
   fn log_keeps_most_recent_samples() {
      let mut history = DrainLog::default();
      let t = Instant::now();
      for i in 0..80u8 {
         history.record(t + Duration::from_secs(u64::from(i)), 100 - i);
      }
      assert_eq!(history.samples.len(), HISTORY_SIZE);
      assert_eq!(history.samples.front().map(|s| s.level), Some(100 - 48));
   }

   #[test]
   fn slope_matches_known_drain() {
      let start = Instant::now();
      let samples: Vec<_> = (0..6u64)
         .map(|i| (start + Duration::from_secs(i * 600), (100 - i * 2) as u8))
         .collect();
      let rate = calculate_slope(&samples).unwrap();
      assert!(rate > 11.0 && rate < 13.0, "rate was {rate}");
   }

   #[test]
   fn estimates_minutes_from_emptiest_bud() {
      let mut tracker = BatteryTracker::new();
      let now = drain(&mut tracker, Instant::now());
      let ttl = tracker.estimate(&buds(50, 60), now).unwrap();
      // 50% at ~12%/h is a little over four hours.
      assert!(ttl > 200 && ttl < 300, "ttl was {ttl}");
   }

   #[test]
   fn charging_disables_estimate() {
      let mut tracker = BatteryTracker::new();
      let now = drain(&mut tracker, Instant::now());
      let mut info = buds(50, 60);
      info.left = state(50, BatteryStatus::Charging);
      assert!(tracker.estimate(&info, now).is_none());
   }

   #[test]
   fn too_few_samples_gives_nothing() {
      let mut tracker = BatteryTracker::new();
      let start = Instant::now();
      for i in 0..3u8 {
         tracker.observe(&buds(60 - i, 70 - i), start + Duration::from_secs(u64::from(i) * 600));
      }
      assert!(tracker.estimate(&buds(58, 68), start + Duration::from_secs(1800)).is_none());
   }

   #[test]
   fn reset_forgets_history() {
      let mut tracker = BatteryTracker::new();
      let now = drain(&mut tracker, Instant::now());
      tracker.reset();
      assert!(tracker.estimate(&buds(50, 60), now).is_none());
   }
}
