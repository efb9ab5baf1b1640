use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Result;

/// Capture and playback format: 16 kHz, mono, signed 16-bit little endian.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BYTES_PER_SAMPLE: usize = 2;
/// Samples per captured frame (~96 ms at 16 kHz).
pub const DEFAULT_FRAME_SAMPLES: usize = 1536;

/// One fixed-size buffer of captured PCM. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Vec<u8>,
}

impl AudioFrame {
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        Self { bytes }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / BYTES_PER_SAMPLE
    }

    pub fn duration_ms(&self) -> u64 {
        (self.sample_count() as u64 * 1000) / SAMPLE_RATE_HZ as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    #[serde(rename = "isFinal")]
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }

    /// Promote to an utterance when final and non-blank.
    pub fn into_utterance(self) -> Option<Utterance> {
        if !self.is_final {
            return None;
        }
        let text = self.text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Utterance::new(text))
    }
}

/// Everything a speech-to-text collaborator reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Connected,
    Transcript(TranscriptEvent),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: Uuid,
    pub text: String,
    pub received_at: OffsetDateTime,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A reply headed for the speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// `None` for replies not tied to an utterance (the startup greeting).
    pub utterance_id: Option<Uuid>,
    pub text: String,
    /// Set when inference failed and the fallback text was substituted.
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Pcm,
    Wav,
    Mp3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub format: AudioEncoding,
    pub sample_rate_hz: u32,
}

/// Chunked audio flowing out of a collaborator. Ends when the producer drops
/// its sender; a producer-side failure arrives as an `Err` chunk.
pub struct AudioStream {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
}

/// Encoded bytes as returned by a synthesis engine.
pub type EncodedAudio = AudioStream;
/// Decoded 16 kHz mono s16le bytes.
pub type PcmStream = AudioStream;

impl AudioStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// A finished stream holding the given chunks.
    pub fn from_chunks(chunks: Vec<Result<Vec<u8>>>) -> Self {
        let (tx, stream) = Self::channel(chunks.len());
        for chunk in chunks {
            // Capacity matches the chunk count.
            let _ = tx.try_send(chunk);
        }
        stream
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_samples_is_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2]);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(frame.sample_count(), 2);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::from_samples(&vec![0; DEFAULT_FRAME_SAMPLES]);
        assert_eq!(frame.duration_ms(), 96);
    }

    #[test]
    fn test_only_final_non_blank_transcripts_promote() {
        assert!(TranscriptEvent::partial("hello").into_utterance().is_none());
        assert!(TranscriptEvent::final_text("   ").into_utterance().is_none());
        assert!(TranscriptEvent::final_text("").into_utterance().is_none());

        let utterance = TranscriptEvent::final_text("  What's the weather like? ")
            .into_utterance()
            .unwrap();
        assert_eq!(utterance.text, "What's the weather like?");
    }

    #[test]
    fn test_transcript_event_wire_shape() {
        let event: TranscriptEvent =
            serde_json::from_str(r#"{"text":"hi there","isFinal":true}"#).unwrap();
        assert_eq!(event, TranscriptEvent::final_text("hi there"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","text":"ok"}"#);
    }

    #[tokio::test]
    async fn test_stream_from_chunks_ends() {
        let mut stream = AudioStream::from_chunks(vec![Ok(vec![1, 2]), Ok(vec![3])]);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), vec![1, 2]);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), vec![3]);
        assert!(stream.next_chunk().await.is_none());
    }
}
