//! In-process collaborators for running the pipeline without real engines or devices.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::AudioCapture;
use crate::{
    AudioEncoding, AudioFrame, AudioSink, AudioSource, AudioStream, EncodedAudio, Inference, Message, MuteGate,
    Result, Role, SpeechToText, SttEvent, SttEventSender, SynthesisRequest, TextToSpeech,
    TranscriptEvent, VoiceError, BYTES_PER_SAMPLE,
};

/// Speech engine that records what it was sent and, optionally, emits a
/// scripted line every `frames_per_utterance` frames.
pub struct MockStt {
    events: SttEventSender,
    script: VecDeque<String>,
    frames_per_utterance: usize,
    frames_since_emit: usize,
    connect_failures: u32,
    connected: bool,
    received: Arc<Mutex<Vec<AudioFrame>>>,
    connects: Arc<AtomicUsize>,
}

impl MockStt {
    pub fn new(events: SttEventSender) -> Self {
        Self {
            events,
            script: VecDeque::new(),
            frames_per_utterance: 0,
            frames_since_emit: 0,
            connect_failures: 0,
            connected: false,
            received: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script<I, S>(mut self, lines: I, frames_per_utterance: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = lines.into_iter().map(Into::into).collect();
        self.frames_per_utterance = frames_per_utterance.max(1);
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn with_connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    pub fn received(&self) -> Arc<Mutex<Vec<AudioFrame>>> {
        Arc::clone(&self.received)
    }

    pub fn connects(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn connect(&mut self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(VoiceError::Transcription("mock connection refused".into()));
        }
        self.connected = true;
        let _ = self.events.send(SttEvent::Connected);
        Ok(())
    }

    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if !self.connected {
            return Err(VoiceError::ConnectionClosed("mock not connected".into()));
        }
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());

        if self.script.is_empty() {
            return Ok(());
        }
        self.frames_since_emit += 1;
        if self.frames_since_emit >= self.frames_per_utterance {
            self.frames_since_emit = 0;
            if let Some(line) = self.script.pop_front() {
                let partial: String = line.chars().take(line.len() / 2).collect();
                let _ = self
                    .events
                    .send(SttEvent::Transcript(TranscriptEvent::partial(partial)));
                let _ = self
                    .events
                    .send(SttEvent::Transcript(TranscriptEvent::final_text(line)));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

/// Synthesizes a short 440 Hz tone as s16le, sized by text length. Only the
/// raw PCM format is supported.
pub struct MockTts {
    fail: bool,
    requests: Arc<Mutex<Vec<SynthesisRequest>>>,
}

impl MockTts {
    pub fn new() -> Self {
        Self {
            fail: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<SynthesisRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl Default for MockTts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<EncodedAudio> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if self.fail {
            return Err(VoiceError::Synthesis("mock synthesis unavailable".into()));
        }
        if request.format != AudioEncoding::Pcm {
            return Err(VoiceError::Synthesis(format!(
                "mock synthesis only produces pcm, not {:?}",
                request.format
            )));
        }

        let sr = request.sample_rate_hz.max(8000);
        let dur_s = (request.text.len() as f32 / 10.0).clamp(0.2, 1.0);
        let frames = (sr as f32 * dur_s) as usize;
        let freq = 440.0_f32;
        let mut pcm = Vec::with_capacity(frames * BYTES_PER_SAMPLE);
        for n in 0..frames {
            let t = n as f32 / sr as f32;
            let s = (2.0 * std::f32::consts::PI * freq * t).sin();
            let v = (s * 3000.0) as i16;
            pcm.extend_from_slice(&v.to_le_bytes());
        }
        let chunks = pcm.chunks(4096).map(|c| Ok(c.to_vec())).collect();
        Ok(AudioStream::from_chunks(chunks))
    }
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(String),
    /// Never answers; exercises timeouts and shutdown.
    Hang,
}

/// Scripted inference. Once the script runs out it echoes the last user message.
pub struct MockInference {
    script: Mutex<VecDeque<MockReply>>,
    delay: Option<Duration>,
    seen: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockInference {
    pub fn echo() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            delay: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The history passed to each call, in call order.
    pub fn seen(&self) -> Arc<Mutex<Vec<Vec<Message>>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Inference for MockInference {
    async fn complete(&self, history: &[Message]) -> Result<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(history.to_vec());
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(reason)) => Err(VoiceError::Inference(reason)),
            Some(MockReply::Hang) => std::future::pending().await,
            None => {
                let last = history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.text.as_str())
                    .unwrap_or_default();
                Ok(format!("You said: {last}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkWrite {
    pub bytes: Vec<u8>,
    /// Gate state observed during the write, when a gate is attached.
    pub muted: Option<bool>,
}

/// Speaker that keeps every write in memory.
#[derive(Default)]
pub struct MemorySink {
    writes: Arc<Mutex<Vec<SinkWrite>>>,
    finished: Arc<AtomicUsize>,
    gate: Option<MuteGate>,
    fail_after: Option<usize>,
    write_delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observing(mut self, gate: MuteGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail every write after the first `writes` succeed.
    pub fn failing_after(mut self, writes: usize) -> Self {
        self.fail_after = Some(writes);
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn writes(&self) -> Arc<Mutex<Vec<SinkWrite>>> {
        Arc::clone(&self.writes)
    }

    pub fn finished(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.finished)
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fail_after.is_some_and(|limit| writes.len() >= limit) {
            return Err(VoiceError::Playback("mock speaker write failed".into()));
        }
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        writes.push(SinkWrite {
            bytes: pcm.to_vec(),
            muted: self.gate.as_ref().map(MuteGate::is_muted),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Speaker that only counts bytes.
#[derive(Debug, Default)]
pub struct NullSink {
    pub bytes: usize,
}

impl AudioSink for NullSink {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.bytes += pcm.len();
        Ok(())
    }
}

/// Microphone producing silent frames at real-time cadence on its own thread.
pub struct MockMicrophone {
    fail_open: bool,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            fail_open: false,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn unavailable() -> Self {
        let mut mic = Self::new();
        mic.fail_open = true;
        mic
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockMicrophone {
    fn start(&mut self, capture: AudioCapture) -> Result<()> {
        if self.fail_open {
            return Err(VoiceError::DeviceOpen("mock microphone unavailable".into()));
        }
        let stop = Arc::clone(&self.stop);
        let samples = capture.frame_samples();
        let cadence = Duration::from_millis((samples as u64 * 1000) / 16_000);
        let thread = std::thread::Builder::new()
            .name("mock-mic".to_string())
            .spawn(move || {
                let silence = vec![0i16; samples];
                while !stop.load(Ordering::Acquire) && !capture.is_closed() {
                    capture.push_frame(AudioFrame::from_samples(&silence));
                    std::thread::park_timeout(cadence);
                }
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for MockMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
