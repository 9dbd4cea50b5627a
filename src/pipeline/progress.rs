use crate::media::TrackKind;

const UNSET: i64 = i64::MAX;

/// Progress shared by both tracks, computed from the slower one.
#[derive(Debug)]
pub struct Progress {
    duration_us: i64,
    has_video: bool,
    has_audio: bool,
    last_video_us: i64,
    last_audio_us: i64,
    video_ended: bool,
    audio_ended: bool,
    percent: u8,
    drained: bool,
}

impl Progress {
    pub fn new(duration_us: i64, has_video: bool, has_audio: bool) -> Self {
        Self {
            duration_us,
            has_video,
            has_audio,
            last_video_us: UNSET,
            last_audio_us: UNSET,
            video_ended: false,
            audio_ended: false,
            percent: 0,
            drained: false,
        }
    }

    pub fn record(&mut self, kind: TrackKind, pts_us: i64) {
        match kind {
            TrackKind::Video => self.last_video_us = pts_us,
            TrackKind::Audio => self.last_audio_us = pts_us,
        }
    }

    /// Marks a track finished; returns true the first time every present
    /// track has finished.
    pub fn mark_end(&mut self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.video_ended = true,
            TrackKind::Audio => self.audio_ended = true,
        }
        let all_ended =
            (!self.has_video || self.video_ended) && (!self.has_audio || self.audio_ended);
        if all_ended && !self.drained {
            self.drained = true;
            return true;
        }
        false
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// The new percentage to report, if it grew.
    pub fn update(&mut self) -> Option<u8> {
        let percent = if self.drained {
            100
        } else {
            let position = self.last_video_us.min(self.last_audio_us);
            if position == UNSET || self.duration_us <= 0 {
                return None;
            }
            (i128::from(position.max(0)) * 100 / i128::from(self.duration_us)).min(100) as u8
        };
        if percent > self.percent {
            self.percent = percent;
            return Some(percent);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uses_slowest_track() {
        let mut progress = Progress::new(10_000_000, true, true);
        progress.record(TrackKind::Video, 5_000_000);
        assert_eq!(progress.update(), Some(50));
        progress.record(TrackKind::Audio, 2_000_000);
        assert_eq!(progress.update(), None);
        assert_eq!(progress.percent(), 50);
        progress.record(TrackKind::Audio, 6_000_000);
        assert_eq!(progress.update(), None);
        progress.record(TrackKind::Video, 7_500_000);
        assert_eq!(progress.update(), Some(60));
    }

    #[test]
    fn test_unset_until_first_sample() {
        let mut progress = Progress::new(10_000_000, true, false);
        assert_eq!(progress.update(), None);
        progress.record(TrackKind::Video, 0);
        assert_eq!(progress.update(), None);
        progress.record(TrackKind::Video, 999_999);
        assert_eq!(progress.update(), Some(9));
    }

    #[test]
    fn test_clamped_and_forced_to_hundred() {
        let mut progress = Progress::new(1_000_000, false, true);
        progress.record(TrackKind::Audio, 900_000);
        assert_eq!(progress.update(), Some(90));
        assert!(progress.mark_end(TrackKind::Audio));
        assert!(!progress.mark_end(TrackKind::Audio));
        assert!(progress.is_drained());
        assert_eq!(progress.update(), Some(100));
        assert_eq!(progress.update(), None);

        let mut overshoot = Progress::new(1_000_000, true, false);
        overshoot.record(TrackKind::Video, 3_000_000);
        assert_eq!(overshoot.update(), Some(100));
    }

    #[test]
    fn test_drained_needs_every_present_track() {
        let mut progress = Progress::new(1_000_000, true, true);
        assert!(!progress.mark_end(TrackKind::Video));
        assert!(!progress.is_drained());
        assert!(progress.mark_end(TrackKind::Audio));
    }
}
