use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::capture::AudioCapture;
use crate::{AudioFrame, EncodedAudio, Message, PcmStream, Result, SttEvent, SynthesisRequest};

/// Speech engines report on this channel; it may be fed from any thread.
pub type SttEventSender = mpsc::UnboundedSender<SttEvent>;
pub type SttEventReceiver = mpsc::UnboundedReceiver<SttEvent>;

/// Streaming speech-to-text engine.
///
/// Results are not returned from these calls: the engine publishes
/// [`SttEvent`]s on the sender it was constructed with.
#[async_trait]
pub trait SpeechToText: Send {
    /// Open a connection and publish [`SttEvent::Connected`] once it is up.
    async fn connect(&mut self) -> Result<()>;

    /// Forward one captured frame. An error means the connection is unusable.
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// The engine may report [`SttEvent::Closed`] for a close it was asked to do.
    async fn close(&mut self);
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<EncodedAudio>;
}

/// Turns encoded engine output into 16 kHz mono s16le.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, input: EncodedAudio) -> Result<PcmStream>;
}

#[async_trait]
pub trait Inference: Send + Sync {
    /// Produce the next assistant reply for the whole history.
    async fn complete(&self, history: &[Message]) -> Result<String>;
}

/// Speaker output. Calls may block; they are driven from a blocking thread.
pub trait AudioSink: Send {
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Block until everything written so far has been played.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Microphone input. `start` hands the capture to the device callback and
/// fails if the device cannot be opened.
pub trait AudioSource: Send {
    fn start(&mut self, capture: AudioCapture) -> Result<()>;

    fn stop(&mut self);
}
