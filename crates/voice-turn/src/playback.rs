//! Speaks replies, one at a time, with the microphone gated off.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    AudioDecoder, AudioEncoding, AudioSink, MuteDuration, MuteGate, PcmStream, PipelineConfig,
    Reply, Result, SynthesisRequest, TextToSpeech, VoiceError,
};

/// Chunks buffered between the decoder and the speaker thread.
const SPEAKER_QUEUE_CHUNKS: usize = 8;
const PREVIEW_CHARS: usize = 50;

pub struct PlaybackController {
    tts: Arc<dyn TextToSpeech>,
    decoder: Arc<dyn AudioDecoder>,
    sink: Arc<Mutex<Box<dyn AudioSink>>>,
    gate: MuteGate,
    serial: tokio::sync::Mutex<()>,
    chunk_bytes: usize,
    voice: Option<String>,
    format: AudioEncoding,
    sample_rate_hz: u32,
    fast_speech: bool,
    post_playback_mute: Option<Duration>,
}

impl PlaybackController {
    pub fn new(
        tts: Arc<dyn TextToSpeech>,
        decoder: Arc<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
        gate: MuteGate,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            tts,
            decoder,
            sink: Arc::new(Mutex::new(sink)),
            gate,
            serial: tokio::sync::Mutex::new(()),
            chunk_bytes: config.playback_chunk_bytes.max(2),
            voice: config.voice.clone(),
            format: config.synthesis_format,
            sample_rate_hz: config.sample_rate_hz,
            fast_speech: config.fast_speech,
            post_playback_mute: config.post_playback_mute(),
        }
    }

    /// Speak `text`. Returns whether playback completed; never errors.
    ///
    /// Calls are serialized. The gate is held for the whole call and released
    /// on every exit path.
    pub async fn speak(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            debug!("Nothing to say");
            return false;
        }

        let _turn = self.serial.lock().await;
        let _mute = self.gate.hold();
        info!("Speaking: {}", preview(text));

        let result = self.play(text).await;
        if let Some(tail) = self.post_playback_mute {
            self.gate.mute(MuteDuration::For(tail));
        }
        match result {
            Ok(bytes) => {
                info!(bytes, "Playback done");
                true
            }
            Err(e) => {
                warn!(error = %e, "Playback failed");
                false
            }
        }
    }

    /// Speak replies as they arrive until shutdown.
    pub async fn run(&self, mut replies: mpsc::Receiver<Reply>, shutdown: CancellationToken) {
        loop {
            let reply = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = replies.recv() => match next {
                    Some(reply) => reply,
                    None => break,
                },
            };
            if reply.fallback {
                debug!(id = ?reply.utterance_id, "Speaking fallback reply");
            }
            self.speak(&reply.text).await;
        }
        debug!("Playback stopped");
    }

    async fn play(&self, text: &str) -> Result<usize> {
        let request = SynthesisRequest {
            text: self.prepare_text(text),
            voice: self.voice.clone(),
            format: self.format,
            sample_rate_hz: self.sample_rate_hz,
        };
        let encoded = self.tts.synthesize(&request).await?;
        let mut pcm = self.decoder.decode(encoded).await?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(SPEAKER_QUEUE_CHUNKS);
        let sink = Arc::clone(&self.sink);
        let writer = tokio::task::spawn_blocking(move || write_to_sink(&sink, rx));

        let fed = self.feed(&mut pcm, &tx).await;
        drop(tx);
        // The speaker must be idle before the caller releases the gate.
        let written = writer
            .await
            .map_err(|e| VoiceError::Playback(format!("speaker thread: {e}")))?;
        fed?;
        written
    }

    /// Re-chunk decoded PCM into fixed-size speaker writes.
    async fn feed(&self, pcm: &mut PcmStream, tx: &mpsc::Sender<Vec<u8>>) -> Result<()> {
        let mut pending = Vec::with_capacity(self.chunk_bytes * 2);
        while let Some(chunk) = pcm.next_chunk().await {
            pending.extend_from_slice(&chunk?);
            while pending.len() >= self.chunk_bytes {
                let rest = pending.split_off(self.chunk_bytes);
                let piece = std::mem::replace(&mut pending, rest);
                if tx.send(piece).await.is_err() {
                    // Speaker thread gave up; its error is reported by `play`.
                    return Ok(());
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(pending).await;
        }
        Ok(())
    }

    fn prepare_text(&self, text: &str) -> String {
        if self.fast_speech {
            format!("<speak><prosody rate='fast'>{}</prosody></speak>", escape_xml(text))
        } else {
            text.to_string()
        }
    }
}

fn write_to_sink(sink: &Mutex<Box<dyn AudioSink>>, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<usize> {
    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let mut written = 0;
    while let Some(chunk) = rx.blocking_recv() {
        sink.write(&chunk)?;
        written += chunk.len();
    }
    sink.finish()?;
    Ok(written)
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}
