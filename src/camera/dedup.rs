use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

const ALARM_TTL: Duration = Duration::from_secs(4 * 3600);
const TRACK_TTL: Duration = Duration::from_secs(8 * 3600);
const ALARM_MAX: usize = 50_000;
const TRACK_MAX: usize = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmDecision {
    /// Never seen: process and cache.
    New,
    /// Seen without media; this occurrence carries the video. Re-emit.
    VideoUpdate,
    /// Already processed in full.
    Duplicate,
}

/// Per-process camera dedup state: alarms keyed by the vendor GUID with the
/// video-update rule, backfilled GPS points keyed by `(imei, gps_time)`.
#[derive(Default)]
pub struct CameraDedup {
    alarms: Mutex<HashMap<String, (Instant, bool)>>,
    tracks: Mutex<HashMap<(i64, NaiveDateTime), Instant>>,
}

impl CameraDedup {
    pub fn check_alarm(&self, guid: &str, has_video: bool) -> AlarmDecision {
        if guid.is_empty() {
            return AlarmDecision::New;
        }
        let alarms = self.alarms.lock().unwrap();
        match alarms.get(guid) {
            None => AlarmDecision::New,
            Some((_, true)) => AlarmDecision::Duplicate,
            Some((_, false)) if has_video => AlarmDecision::VideoUpdate,
            Some((_, false)) => AlarmDecision::Duplicate,
        }
    }

    pub fn mark_alarm(&self, guid: &str, has_video: bool) {
        if guid.is_empty() {
            return;
        }
        self.alarms.lock().unwrap().insert(guid.to_string(), (Instant::now(), has_video));
    }

    /// True when this track point was already emitted.
    pub fn seen_track(&self, imei: i64, gps_time: NaiveDateTime) -> bool {
        let mut tracks = self.tracks.lock().unwrap();
        match tracks.get(&(imei, gps_time)) {
            Some(at) if at.elapsed() < TRACK_TTL => true,
            _ => {
                tracks.insert((imei, gps_time), Instant::now());
                false
            }
        }
    }

    /// Evict expired entries; trim to half capacity when oversized.
    pub fn sweep(&self) -> (usize, usize) {
        let mut alarms = self.alarms.lock().unwrap();
        let before_alarms = alarms.len();
        alarms.retain(|_, (at, _)| at.elapsed() < ALARM_TTL);
        if alarms.len() > ALARM_MAX {
            let mut entries: Vec<(String, Instant)> =
                alarms.iter().map(|(k, (at, _))| (k.clone(), *at)).collect();
            entries.sort_by_key(|(_, at)| *at);
            let to_remove = alarms.len() - ALARM_MAX / 2;
            for (key, _) in entries.into_iter().take(to_remove) {
                alarms.remove(&key);
            }
        }
        let removed_alarms = before_alarms - alarms.len();
        drop(alarms);

        let mut tracks = self.tracks.lock().unwrap();
        let before_tracks = tracks.len();
        tracks.retain(|_, at| at.elapsed() < TRACK_TTL);
        if tracks.len() > TRACK_MAX {
            let mut entries: Vec<((i64, NaiveDateTime), Instant)> =
                tracks.iter().map(|(k, at)| (*k, *at)).collect();
            entries.sort_by_key(|(_, at)| *at);
            let to_remove = tracks.len() - TRACK_MAX / 2;
            for (key, _) in entries.into_iter().take(to_remove) {
                tracks.remove(&key);
            }
        }
        (removed_alarms, before_tracks - tracks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    #[test]
    fn alarm_video_update_rule() {
        let dedup = CameraDedup::default();
        assert_eq!(dedup.check_alarm("g1", false), AlarmDecision::New);
        dedup.mark_alarm("g1", false);

        // Same alarm again without video: true duplicate.
        assert_eq!(dedup.check_alarm("g1", false), AlarmDecision::Duplicate);
        // Video arrived: re-emit.
        assert_eq!(dedup.check_alarm("g1", true), AlarmDecision::VideoUpdate);
        dedup.mark_alarm("g1", true);
        // Once cached with video it never re-emits.
        assert_eq!(dedup.check_alarm("g1", true), AlarmDecision::Duplicate);
        assert_eq!(dedup.check_alarm("g1", false), AlarmDecision::Duplicate);
    }

    #[test]
    fn missing_guid_always_processes() {
        let dedup = CameraDedup::default();
        assert_eq!(dedup.check_alarm("", true), AlarmDecision::New);
        dedup.mark_alarm("", true);
        assert_eq!(dedup.check_alarm("", true), AlarmDecision::New);
    }

    #[test]
    fn track_dedup_by_key() {
        let dedup = CameraDedup::default();
        assert!(!dedup.seen_track(100, ts()));
        assert!(dedup.seen_track(100, ts()));
        assert!(!dedup.seen_track(101, ts()));
    }
}
