use thiserror::Error;

pub type Result<T, E = VoiceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("audio device could not be opened: {0}")]
    DeviceOpen(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("transcription error: {0}")]
    Transcription(String),
    #[error("transcription connection closed: {0}")]
    ConnectionClosed(String),
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Connection- and device-level failures. These are the only errors that
    /// leave their component and bring the pipeline down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceOpen(_)
                | VoiceError::Device(_)
                | VoiceError::ConnectionClosed(_)
                | VoiceError::ChannelClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(VoiceError::DeviceOpen("no mic".into()).is_fatal());
        assert!(VoiceError::ConnectionClosed("gone".into()).is_fatal());
        assert!(!VoiceError::Inference("500".into()).is_fatal());
        assert!(!VoiceError::Synthesis("quota".into()).is_fatal());
        assert!(!VoiceError::Timeout(30_000).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = VoiceError::Decode("ffmpeg exited with 1".into());
        assert_eq!(err.to_string(), "audio decode failed: ffmpeg exited with 1");
    }
}
