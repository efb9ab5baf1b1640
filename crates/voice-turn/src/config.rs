use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::types::{AudioEncoding, DEFAULT_FRAME_SAMPLES, SAMPLE_RATE_HZ};
use crate::{Result, VoiceError};

const DEFAULT_SYSTEM_PROMPT: &str = "You're a voice assistant. Be helpful, be conversational, ask lots of questions. \
But keep your responses short. Speak in simple and informal language. Ensure you use commas and full stops. \
The text will be converted to audio, so don't use any special characters or markdown.";

const DEFAULT_FALLBACK_REPLY: &str = "Sorry, my brain stopped working. Try again!";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_rate_hz: u32,
    pub frame_samples: usize,
    pub audio_queue_capacity: usize,
    pub utterance_queue_capacity: usize,
    pub reply_queue_capacity: usize,
    /// Bridge dequeue timeout and muted-drain cadence.
    pub poll_interval_ms: u64,
    pub inference_timeout_ms: u64,
    pub playback_chunk_bytes: usize,
    /// Extra mute held after each playback; 0 disables it.
    pub post_playback_mute_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub voice: Option<String>,
    /// Encoding requested from the synthesis engine.
    pub synthesis_format: AudioEncoding,
    /// Wrap synthesized text in SSML fast prosody.
    pub fast_speech: bool,
    pub system_prompt: String,
    pub fallback_reply: String,
    pub greeting: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            audio_queue_capacity: 64,
            utterance_queue_capacity: 16,
            reply_queue_capacity: 4,
            poll_interval_ms: 100,
            inference_timeout_ms: 30_000,
            playback_chunk_bytes: 1024,
            post_playback_mute_ms: 0,
            shutdown_grace_ms: 2_000,
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            voice: Some("Annabelle".to_string()),
            synthesis_format: AudioEncoding::Pcm,
            fast_speech: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            greeting: Some("Say something!".to_string()),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file, writing the defaults there if it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&contents)
                .map_err(|e| VoiceError::Config(format!("{}: {e}", path.display())))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("frame_samples", self.frame_samples),
            ("audio_queue_capacity", self.audio_queue_capacity),
            ("utterance_queue_capacity", self.utterance_queue_capacity),
            ("reply_queue_capacity", self.reply_queue_capacity),
            ("playback_chunk_bytes", self.playback_chunk_bytes),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(VoiceError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.playback_chunk_bytes % 2 != 0 {
            return Err(VoiceError::Config(
                "playback_chunk_bytes must hold whole 16-bit samples".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1_000 {
            return Err(VoiceError::Config(
                "poll_interval_ms must be within 1..=1000".to_string(),
            ));
        }
        if self.sample_rate_hz != SAMPLE_RATE_HZ {
            return Err(VoiceError::Config(format!(
                "only {SAMPLE_RATE_HZ} Hz is supported, got {}",
                self.sample_rate_hz
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn post_playback_mute(&self) -> Option<Duration> {
        (self.post_playback_mute_ms > 0).then(|| Duration::from_millis(self.post_playback_mute_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_samples, 1536);
        assert_eq!(config.post_playback_mute(), None);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_slow_poll_interval() {
        let config = PipelineConfig {
            poll_interval_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = PipelineConfig {
            utterance_queue_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("utterance_queue_capacity"));
    }

    #[test]
    fn test_load_writes_defaults_then_reads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voicebot.json");

        let first = PipelineConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.voice.as_deref(), Some("Annabelle"));

        fs::write(&path, r#"{"voice":"Brian","post_playback_mute_ms":250}"#).unwrap();
        let second = PipelineConfig::load(&path).unwrap();
        assert_eq!(second.voice.as_deref(), Some("Brian"));
        assert_eq!(second.post_playback_mute(), Some(Duration::from_millis(250)));
        assert_eq!(second.audio_queue_capacity, 64);
    }
}
