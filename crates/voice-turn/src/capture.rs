use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::orchestrator::Supervisor;
use crate::{AudioFrame, MuteGate, VoiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Enqueued,
    DiscardedMuted,
    /// Queue full; the new frame was refused.
    DroppedFull,
    Closed,
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    enqueued: AtomicU64,
    discarded_muted: AtomicU64,
    dropped_full: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCounts {
    pub enqueued: u64,
    /// Whole frames thrown away while the gate was closed.
    pub discarded_muted: u64,
    pub dropped_full: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounts {
        CaptureCounts {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            discarded_muted: self.discarded_muted.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
        }
    }
}

/// Device-callback side of the audio queue.
///
/// Never blocks: muted input is thrown away before it reaches the queue and a
/// full queue refuses the newest frame.
pub struct AudioCapture {
    gate: MuteGate,
    tx: mpsc::Sender<AudioFrame>,
    stats: Arc<CaptureStats>,
    frame_samples: usize,
    pending: Vec<i16>,
    /// Muted samples not yet adding up to a whole frame.
    muted_samples: usize,
    supervisor: Option<Supervisor>,
}

impl AudioCapture {
    pub fn new(gate: MuteGate, tx: mpsc::Sender<AudioFrame>, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            gate,
            tx,
            stats: Arc::new(CaptureStats::default()),
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            muted_samples: 0,
            supervisor: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue one complete frame.
    pub fn push_frame(&self, frame: AudioFrame) -> CaptureOutcome {
        if self.gate.is_muted() {
            self.stats.discarded_muted.fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::DiscardedMuted;
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                CaptureOutcome::Enqueued
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_full.fetch_add(1, Ordering::Relaxed);
                trace!("audio queue full, dropping frame");
                CaptureOutcome::DroppedFull
            }
            Err(TrySendError::Closed(_)) => CaptureOutcome::Closed,
        }
    }

    /// Accumulate device samples and enqueue each complete frame.
    ///
    /// While muted the samples and any partial frame are discarded, and
    /// counted in whole frames.
    pub fn push_samples(&mut self, samples: &[i16]) {
        if self.gate.is_muted() {
            self.muted_samples += self.pending.len() + samples.len();
            self.pending.clear();
            let frames = self.muted_samples / self.frame_samples;
            self.muted_samples %= self.frame_samples;
            if frames > 0 {
                self.stats
                    .discarded_muted
                    .fetch_add(frames as u64, Ordering::Relaxed);
            }
            return;
        }
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let frame = AudioFrame::from_samples(&self.pending);
            self.pending = rest;
            self.push_frame(frame);
        }
    }

    /// Report an unrecoverable device failure; brings the pipeline down.
    pub fn report_fault(&self, error: VoiceError) {
        match &self.supervisor {
            Some(supervisor) => supervisor.fail("capture", error),
            None => tracing::error!(error = %error, "audio capture fault"),
        }
    }

    /// Handle for reporting faults from contexts that cannot borrow the capture.
    pub fn supervisor(&self) -> Option<Supervisor> {
        self.supervisor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_util::sync::CancellationToken;

    fn frame() -> AudioFrame {
        AudioFrame::from_samples(&[0; 16])
    }

    #[test]
    fn test_enqueues_when_unmuted() {
        let (tx, mut rx) = mpsc::channel(4);
        let capture = AudioCapture::new(MuteGate::new(), tx, 16);
        assert_eq!(capture.push_frame(frame()), CaptureOutcome::Enqueued);
        assert!(rx.try_recv().is_ok());
        assert_eq!(capture.stats().snapshot().enqueued, 1);
    }

    #[test]
    fn test_frames_while_muted_never_reach_queue() {
        let gate = MuteGate::new();
        let (tx, mut rx) = mpsc::channel(8);
        let capture = AudioCapture::new(gate.clone(), tx, 16);

        let guard = gate.hold();
        for _ in 0..5 {
            assert_eq!(capture.push_frame(frame()), CaptureOutcome::DiscardedMuted);
        }
        drop(guard);

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let counts = capture.stats().snapshot();
        assert_eq!(counts.discarded_muted, 5);
        assert_eq!(counts.enqueued, 0);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (tx, mut rx) = mpsc::channel(2);
        let capture = AudioCapture::new(MuteGate::new(), tx, 1);
        capture.push_frame(AudioFrame::from_samples(&[1]));
        capture.push_frame(AudioFrame::from_samples(&[2]));
        assert_eq!(
            capture.push_frame(AudioFrame::from_samples(&[3])),
            CaptureOutcome::DroppedFull
        );

        assert_eq!(rx.try_recv().unwrap().as_bytes(), &[1, 0]);
        assert_eq!(rx.try_recv().unwrap().as_bytes(), &[2, 0]);
        assert!(rx.try_recv().is_err());
        assert_eq!(capture.stats().snapshot().dropped_full, 1);
    }

    #[test]
    fn test_push_samples_builds_fixed_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut capture = AudioCapture::new(MuteGate::new(), tx, 4);
        capture.push_samples(&[1, 2, 3]);
        assert!(rx.try_recv().is_err());
        capture.push_samples(&[4, 5, 6, 7, 8, 9]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first, AudioFrame::from_samples(&[1, 2, 3, 4]));
        assert_eq!(second, AudioFrame::from_samples(&[5, 6, 7, 8]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mute_discards_partial_frame() {
        let gate = MuteGate::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut capture = AudioCapture::new(gate.clone(), tx, 4);
        capture.push_samples(&[1, 2]);
        {
            let _guard = gate.hold();
            capture.push_samples(&[3, 4]);
        }
        capture.push_samples(&[5, 6, 7, 8]);
        assert_eq!(rx.try_recv().unwrap(), AudioFrame::from_samples(&[5, 6, 7, 8]));
    }

    #[test]
    fn test_muted_samples_are_counted_in_frames() {
        let gate = MuteGate::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut capture = AudioCapture::new(gate.clone(), tx, 4);
        let guard = gate.hold();
        for _ in 0..6 {
            capture.push_samples(&[1, 2]);
        }
        capture.push_frame(AudioFrame::from_samples(&[1, 2, 3, 4]));
        drop(guard);

        assert!(rx.try_recv().is_err());
        assert_eq!(capture.stats().snapshot().discarded_muted, 4);
    }

    #[test]
    fn test_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let capture = AudioCapture::new(MuteGate::new(), tx, 4);
        assert!(capture.is_closed());
        assert_eq!(capture.push_frame(frame()), CaptureOutcome::Closed);
    }

    #[test]
    fn test_fault_cancels_pipeline() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::new(token.clone());
        let (tx, _rx) = mpsc::channel(1);
        let capture = AudioCapture::new(MuteGate::new(), tx, 4).with_supervisor(supervisor.clone());
        capture.report_fault(VoiceError::Device("unplugged".into()));
        assert!(token.is_cancelled());
        assert!(matches!(supervisor.take_error(), Some(VoiceError::Device(_))));
    }
}
