//! Conforms a decoded video timeline to an evenly spaced output timeline.
//!
//! The render loop asks for one output picture at a time, stamped
//! `T = index / fps`. Given the decoded frames waiting in the decoder's output
//! buffers, [`select`] decides whether the picture for `T` is a new frame, a
//! repeat of the previous one, or whether more decoded frames are needed first.
//! Frames that fall between two output times are dropped.

use std::collections::VecDeque;

use crate::media::MICROS_PER_SECOND;

/// A decoded frame still owned by the decoder, identified by its output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFrame {
    pub buffer: usize,
    pub pts_us: i64,
}

/// The frame most recently handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered {
    pub output_us: i64,
    pub source_pts_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Draw the previous picture again.
    Repeat,
    /// Render this frame; it has been removed from the pending list.
    Consume(PendingFrame),
    /// Not enough decoded frames yet to decide.
    Wait,
    /// Decoding ended without producing any frame to render.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Frames removed from the pending list without being rendered.
    pub dropped: Vec<PendingFrame>,
    pub selection: Selection,
}

/// Output time of the frame at `index` for the given frame rate.
pub fn output_time_us(index: u64, fps: u32) -> i64 {
    (index as i64 * MICROS_PER_SECOND) / i64::from(fps.max(1))
}

pub fn select(
    pending: &mut VecDeque<PendingFrame>,
    last: Option<Rendered>,
    decode_eos: bool,
    target_us: i64,
) -> Decision {
    let mut dropped = Vec::new();
    let selection = loop {
        if let Some(last) = last
            && (last.output_us >= target_us || last.source_pts_us >= target_us)
        {
            break Selection::Repeat;
        }

        let Some(&f0) = pending.front() else {
            break match (decode_eos, last) {
                (true, Some(_)) => Selection::Repeat,
                (true, None) => Selection::Exhausted,
                (false, _) => Selection::Wait,
            };
        };

        if last.is_none() || f0.pts_us >= target_us {
            pending.pop_front();
            break Selection::Consume(f0);
        }

        let Some(&f1) = pending.get(1) else {
            if decode_eos {
                pending.pop_front();
                break Selection::Consume(f0);
            }
            break Selection::Wait;
        };

        if f1.pts_us > target_us {
            pending.pop_front();
            break Selection::Consume(f0);
        }

        // f0 is older than the target and f1 is a closer match
        pending.pop_front();
        dropped.push(f0);
        if f1.pts_us == target_us {
            pending.pop_front();
            break Selection::Consume(f1);
        }
    };

    Decision { dropped, selection }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(pts: &[i64]) -> VecDeque<PendingFrame> {
        pts.iter()
            .enumerate()
            .map(|(buffer, &pts_us)| PendingFrame { buffer, pts_us })
            .collect()
    }

    fn rendered(output_us: i64, source_pts_us: i64) -> Option<Rendered> {
        Some(Rendered {
            output_us,
            source_pts_us,
        })
    }

    #[test]
    fn test_output_time() {
        assert_eq!(output_time_us(0, 15), 0);
        assert_eq!(output_time_us(1, 15), 66_666);
        assert_eq!(output_time_us(150, 15), 10_000_000);
        assert_eq!(output_time_us(3, 30), 100_000);
    }

    #[test]
    fn test_first_frame_is_consumed_regardless_of_pts() {
        let mut pending = frames(&[40_000, 80_000]);
        let decision = select(&mut pending, None, false, 0);
        assert_eq!(
            decision.selection,
            Selection::Consume(PendingFrame {
                buffer: 0,
                pts_us: 40_000
            })
        );
        assert!(decision.dropped.is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_repeat_when_previous_source_is_ahead() {
        let mut pending = frames(&[133_332]);
        let decision = select(&mut pending, rendered(33_333, 66_666), false, 66_666);
        assert_eq!(decision.selection, Selection::Repeat);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_repeat_at_end_of_stream() {
        let mut pending = VecDeque::new();
        let decision = select(&mut pending, rendered(0, 0), true, 33_333);
        assert_eq!(decision.selection, Selection::Repeat);
    }

    #[test]
    fn test_exhausted_without_any_frame() {
        let mut pending = VecDeque::new();
        assert_eq!(select(&mut pending, None, true, 0).selection, Selection::Exhausted);
    }

    #[test]
    fn test_wait_for_more_frames() {
        let mut pending = VecDeque::new();
        assert_eq!(select(&mut pending, rendered(0, 0), false, 66_666).selection, Selection::Wait);

        let mut pending = frames(&[33_333]);
        let decision = select(&mut pending, rendered(0, 0), false, 66_666);
        assert_eq!(decision.selection, Selection::Wait);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_last_frame_consumed_at_end_of_stream() {
        let mut pending = frames(&[33_333]);
        let decision = select(&mut pending, rendered(0, 0), true, 66_666);
        assert_eq!(
            decision.selection,
            Selection::Consume(PendingFrame {
                buffer: 0,
                pts_us: 33_333
            })
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_f0_kept_when_f1_overshoots() {
        let mut pending = frames(&[50_000, 90_000]);
        let decision = select(&mut pending, rendered(0, 0), false, 66_666);
        assert_eq!(decision.selection, Selection::Consume(PendingFrame { buffer: 0, pts_us: 50_000 }));
        assert!(decision.dropped.is_empty());
    }

    #[test]
    fn test_exact_f1_match_drops_f0() {
        // 30 fps source, 15 fps output: frame 1 is skipped, frame 2 lands exactly on T
        let mut pending = frames(&[33_333, 66_666, 100_000]);
        let decision = select(&mut pending, rendered(0, 0), false, 66_666);
        assert_eq!(decision.selection, Selection::Consume(PendingFrame { buffer: 1, pts_us: 66_666 }));
        assert_eq!(decision.dropped, vec![PendingFrame { buffer: 0, pts_us: 33_333 }]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_drops_several_frames() {
        let mut pending = frames(&[10_000, 20_000, 30_000, 40_000, 70_000]);
        let decision = select(&mut pending, rendered(0, 0), false, 50_000);
        assert_eq!(decision.dropped.len(), 3);
        assert_eq!(decision.selection, Selection::Consume(PendingFrame { buffer: 3, pts_us: 40_000 }));
        assert_eq!(pending.front().map(|f| f.pts_us), Some(70_000));
    }

    #[test]
    fn test_drop_then_wait() {
        let mut pending = frames(&[10_000, 20_000]);
        let decision = select(&mut pending, rendered(0, 0), false, 50_000);
        assert_eq!(decision.dropped.len(), 1);
        assert_eq!(decision.selection, Selection::Wait);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_upsampling_duplicates() {
        // 15 fps source rendered at 30 fps
        let source: Vec<i64> = (0..4).map(|i| output_time_us(i, 15)).collect();
        let mut pending = frames(&source);
        let mut last = None;
        let mut repeats = 0;
        for index in 0..6 {
            let target = output_time_us(index, 30);
            let decision = select(&mut pending, last, false, target);
            match decision.selection {
                Selection::Consume(frame) => {
                    last = rendered(target, frame.pts_us);
                }
                Selection::Repeat => {
                    repeats += 1;
                    last = last.map(|l| Rendered { output_us: target, ..l });
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(repeats >= 2);
    }
}
