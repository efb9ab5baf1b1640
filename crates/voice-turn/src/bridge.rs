//! Bridge between the audio queue and the speech engine.
//!
//! Frames go out to the engine only while the gate is open and the engine is
//! connected; otherwise they are drained and dropped so nothing stale is
//! replayed later. Transcript events come back on a channel and only final,
//! non-blank ones become utterances.

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    AudioFrame, MuteGate, PipelineConfig, Result, SpeechToText, SttEvent, SttEventReceiver,
    TranscriptEvent, Utterance, VoiceError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub frames_forwarded: u64,
    pub frames_discarded: u64,
    pub utterances: u64,
    /// Transcripts ignored because they arrived while muted.
    pub transcripts_muted: u64,
    pub reconnects: u64,
}

pub struct TranscriptionBridge {
    stt: Box<dyn SpeechToText>,
    events: SttEventReceiver,
    audio: mpsc::Receiver<AudioFrame>,
    utterances: mpsc::Sender<Utterance>,
    gate: MuteGate,
    poll_interval: Duration,
    max_reconnect_attempts: u32,
    reconnect_backoff: Duration,
    connected: bool,
    /// Set when the bridge closes the engine itself; the engine's own report
    /// of that close is ignored until it says `Connected` again.
    closing: bool,
    stats: BridgeStats,
}

impl TranscriptionBridge {
    pub fn new(
        stt: Box<dyn SpeechToText>,
        events: SttEventReceiver,
        audio: mpsc::Receiver<AudioFrame>,
        utterances: mpsc::Sender<Utterance>,
        gate: MuteGate,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            stt,
            events,
            audio,
            utterances,
            gate,
            poll_interval: config.poll_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff(),
            connected: false,
            closing: false,
            stats: BridgeStats::default(),
        }
    }

    /// Run until shutdown. Errors only when the engine cannot be reached again
    /// or one of the queues disappears.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<BridgeStats> {
        self.connect(&shutdown, false).await?;

        while !shutdown.is_cancelled() {
            if self.gate.is_muted() {
                self.drain_backlog();
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => {
                        return Err(VoiceError::ConnectionClosed(
                            "speech engine dropped its event channel".into(),
                        ))
                    }
                },
                frame = tokio::time::timeout(self.poll_interval, self.audio.recv()) => match frame {
                    Ok(Some(frame)) => self.forward(frame, &shutdown).await,
                    Ok(None) => return Err(VoiceError::ChannelClosed("audio queue")),
                    Err(_) => {}
                },
            }

            if !self.connected && !shutdown.is_cancelled() {
                self.connect(&shutdown, true).await?;
            }
        }

        self.close().await;
        info!(
            forwarded = self.stats.frames_forwarded,
            discarded = self.stats.frames_discarded,
            utterances = self.stats.utterances,
            "Speech recognition stopped"
        );
        Ok(self.stats)
    }

    async fn forward(&mut self, frame: AudioFrame, shutdown: &CancellationToken) {
        if self.gate.is_muted() || !self.connected {
            self.stats.frames_discarded += 1;
            return;
        }
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                self.stats.frames_discarded += 1;
                return;
            }
            sent = self.stt.send_audio(&frame) => sent,
        };
        match sent {
            Ok(()) => self.stats.frames_forwarded += 1,
            Err(e) => {
                warn!(error = %e, "Speech engine rejected audio");
                self.stats.frames_discarded += 1;
                self.connected = false;
            }
        }
    }

    fn handle_event(&mut self, event: SttEvent) -> Result<()> {
        match event {
            SttEvent::Connected => {
                self.connected = true;
                self.closing = false;
                debug!("Speech engine reports connected");
            }
            SttEvent::Transcript(transcript) => self.handle_transcript(transcript)?,
            SttEvent::Error(message) if self.closing || !self.connected => {
                debug!(error = %message, "Ignoring speech error from a closed connection");
            }
            SttEvent::Closed if self.closing || !self.connected => {
                debug!("Ignoring close report from a closed connection");
            }
            SttEvent::Error(message) => {
                warn!(error = %message, "Speech error");
                self.connected = false;
            }
            SttEvent::Closed => {
                warn!("Speech connection closed");
                self.connected = false;
            }
        }
        Ok(())
    }

    fn handle_transcript(&mut self, transcript: TranscriptEvent) -> Result<()> {
        if !transcript.is_final {
            return Ok(());
        }
        if self.gate.is_muted() {
            debug!(text = %transcript.text, "Dropping transcript captured while muted");
            self.stats.transcripts_muted += 1;
            return Ok(());
        }
        let Some(utterance) = transcript.into_utterance() else {
            return Ok(());
        };
        info!(id = %utterance.id, "Heard: {}", utterance.text);
        match self.utterances.try_send(utterance) {
            Ok(()) => {
                self.stats.utterances += 1;
                Ok(())
            }
            Err(TrySendError::Full(utterance)) => {
                warn!(id = %utterance.id, "Utterance queue full, dropping: {}", utterance.text);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(VoiceError::ChannelClosed("utterance queue")),
        }
    }

    fn drain_backlog(&mut self) {
        let mut drained = 0u64;
        while self.audio.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            self.stats.frames_discarded += drained;
            debug!(drained, "Discarded queued audio");
        }
    }

    /// Connect, retrying with linear backoff. The first attempt of the initial
    /// connection is immediate.
    async fn connect(&mut self, shutdown: &CancellationToken, reconnecting: bool) -> Result<()> {
        if reconnecting {
            self.close().await;
        }
        let attempts = self.max_reconnect_attempts + 1;
        for attempt in 1..=attempts {
            let first = attempt == 1 && !reconnecting;
            if !first {
                let backoff = self.reconnect_backoff * attempt;
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                result = self.stt.connect() => result,
            };
            match result {
                Ok(()) => {
                    self.connected = true;
                    if reconnecting {
                        self.stats.reconnects += 1;
                    }
                    self.drain_backlog();
                    info!(attempt, "Connected to speech engine");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Speech engine connection failed"),
            }
        }
        Err(VoiceError::ConnectionClosed(format!(
            "speech engine unreachable after {attempts} attempts"
        )))
    }

    async fn close(&mut self) {
        self.connected = false;
        self.closing = true;
        if tokio::time::timeout(self.poll_interval, self.stt.close())
            .await
            .is_err()
        {
            warn!("Speech engine did not close in time");
        }
    }
}
