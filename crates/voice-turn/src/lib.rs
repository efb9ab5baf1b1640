//! voice-turn: a turn-taking voice pipeline. The microphone is muted while the
//! assistant speaks so it never transcribes its own voice.

mod error;
pub use error::{Result, VoiceError};

mod types;
pub use types::{
    AudioEncoding, AudioFrame, AudioStream, EncodedAudio, Message, PcmStream, Reply, Role,
    SttEvent, SynthesisRequest, TranscriptEvent, Utterance, BYTES_PER_SAMPLE, CHANNELS,
    DEFAULT_FRAME_SAMPLES, SAMPLE_RATE_HZ,
};

mod config;
pub use config::PipelineConfig;

mod traits;
pub use traits::{
    AudioDecoder, AudioSink, AudioSource, Inference, SpeechToText, SttEventReceiver,
    SttEventSender, TextToSpeech,
};

mod mute;
pub use mute::{MuteDuration, MuteGate, MuteGuard};

pub mod bridge;
pub mod capture;
pub mod decode;
pub mod orchestrator;
pub mod playback;
pub mod turn;

pub use capture::AudioCapture;
pub use orchestrator::{Collaborators, Orchestrator, SessionReport, Supervisor};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "audio")]
pub mod mic;
#[cfg(feature = "audio")]
pub mod speaker;

#[cfg(feature = "http")]
pub mod openai;
