//! Wires the queues, starts every stage and supervises shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{BridgeStats, TranscriptionBridge};
use crate::capture::{AudioCapture, CaptureCounts};
use crate::playback::PlaybackController;
use crate::turn::{ConversationHistory, TurnEngine};
use crate::{
    AudioDecoder, AudioSink, AudioSource, Inference, MuteGate, PipelineConfig, Reply, Result,
    SpeechToText, SttEventReceiver, TextToSpeech, VoiceError,
};

/// Owns the shutdown signal and remembers the first fatal error.
#[derive(Debug, Clone)]
pub struct Supervisor {
    token: CancellationToken,
    error: Arc<Mutex<Option<VoiceError>>>,
}

impl Supervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Record a fatal error from `stage` and bring the whole pipeline down.
    pub fn fail(&self, stage: &'static str, error: VoiceError) {
        error!(stage, error = %error, "Stage failed, shutting down");
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn take_error(&self) -> Option<VoiceError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spawn<T, F>(&self, stage: &'static str, work: F) -> JoinHandle<Option<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            match work.await {
                Ok(value) => Some(value),
                Err(e) => {
                    supervisor.fail(stage, e);
                    None
                }
            }
        })
    }
}

/// The external engines and devices the pipeline runs against.
pub struct Collaborators {
    pub source: Box<dyn AudioSource>,
    pub stt: Box<dyn SpeechToText>,
    pub stt_events: SttEventReceiver,
    pub tts: Arc<dyn TextToSpeech>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub inference: Arc<dyn Inference>,
    pub sink: Box<dyn AudioSink>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub capture: CaptureCounts,
    pub bridge: Option<BridgeStats>,
    pub history: Option<ConversationHistory>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    gate: MuteGate,
    supervisor: Supervisor,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            gate: MuteGate::new(),
            supervisor: Supervisor::new(CancellationToken::new()),
        })
    }

    pub fn gate(&self) -> MuteGate {
        self.gate.clone()
    }

    /// Cancel this token to stop the pipeline.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.supervisor.token()
    }

    /// Run until the shutdown token is cancelled or a stage fails fatally.
    pub async fn run(self, collaborators: Collaborators) -> Result<SessionReport> {
        let Self {
            config,
            gate,
            supervisor,
        } = self;
        let shutdown = supervisor.token();
        let Collaborators {
            mut source,
            stt,
            stt_events,
            tts,
            decoder,
            inference,
            sink,
        } = collaborators;

        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue_capacity);
        let (utterance_tx, utterance_rx) = mpsc::channel(config.utterance_queue_capacity);
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>(config.reply_queue_capacity);

        let capture = AudioCapture::new(gate.clone(), audio_tx, config.frame_samples)
            .with_supervisor(supervisor.clone());
        let capture_stats = capture.stats();
        source.start(capture)?;
        info!("Microphone started");

        let playback = Arc::new(PlaybackController::new(tts, decoder, sink, gate.clone(), &config));
        let playback_task = {
            let playback = Arc::clone(&playback);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { playback.run(reply_rx, shutdown).await })
        };

        if let Some(greeting) = config.greeting.clone() {
            queue_greeting(&reply_tx, greeting);
        }

        let bridge = TranscriptionBridge::new(
            stt,
            stt_events,
            audio_rx,
            utterance_tx,
            gate.clone(),
            &config,
        );
        let bridge_task = supervisor.spawn("transcription", bridge.run(shutdown.clone()));

        let turns = TurnEngine::new(inference, reply_tx, &config);
        let turn_task = supervisor.spawn("conversation", turns.run(utterance_rx, shutdown.clone()));

        info!("Voice chatbot running");
        shutdown.cancelled().await;
        info!("Shutting down");

        source.stop();
        let grace = config.shutdown_grace();
        let bridge = join_stage("transcription", bridge_task, grace).await.flatten();
        let history = join_stage("conversation", turn_task, grace).await.flatten();
        if join_stage("playback", playback_task, grace).await.is_none() {
            warn!("Abandoned in-flight playback");
        }

        if let Some(error) = supervisor.take_error() {
            return Err(error);
        }
        Ok(SessionReport {
            capture: capture_stats.snapshot(),
            bridge,
            history,
        })
    }
}

fn queue_greeting(replies: &mpsc::Sender<Reply>, text: String) -> bool {
    let greeting = Reply {
        utterance_id: None,
        text,
        fallback: false,
    };
    match replies.try_send(greeting) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Could not queue greeting");
            false
        }
    }
}

/// Wait up to `grace` for a stage to finish, aborting it otherwise.
async fn join_stage<T>(stage: &'static str, mut task: JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(stage, error = %e, "Stage task panicked");
            None
        }
        Err(_) => {
            warn!(stage, "Stage did not stop in time, aborting");
            task.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::PcmPassthrough;
    use crate::mock::{MemorySink, MockInference, MockMicrophone, MockReply, MockStt, MockTts, SinkWrite};
    use crate::{Role, SttEvent, TranscriptEvent};

    struct Fixture {
        orchestrator: Orchestrator,
        collaborators: Collaborators,
        events: crate::SttEventSender,
        writes: Arc<Mutex<Vec<SinkWrite>>>,
    }

    fn fixture(config: PipelineConfig, source: MockMicrophone, inference: MockInference) -> Fixture {
        fixture_with_stt(config, source, inference, MockStt::new)
    }

    fn fixture_with_stt(
        config: PipelineConfig,
        source: MockMicrophone,
        inference: MockInference,
        make_stt: impl FnOnce(crate::SttEventSender) -> MockStt,
    ) -> Fixture {
        let orchestrator = Orchestrator::new(config).unwrap();
        let (events, stt_events) = mpsc::unbounded_channel();
        let sink = MemorySink::new().observing(orchestrator.gate());
        let writes = sink.writes();
        let collaborators = Collaborators {
            source: Box::new(source),
            stt: Box::new(make_stt(events.clone())),
            stt_events,
            tts: Arc::new(MockTts::new()),
            decoder: Arc::new(PcmPassthrough),
            inference: Arc::new(inference),
            sink: Box::new(sink),
        };
        Fixture {
            orchestrator,
            collaborators,
            events,
            writes,
        }
    }

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            greeting: None,
            shutdown_grace_ms: 500,
            ..Default::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_greeting_reports_full_reply_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(queue_greeting(&tx, "Say something!".into()));
        assert!(!queue_greeting(&tx, "Say something again!".into()));
        assert_eq!(rx.try_recv().unwrap().text, "Say something!");
        drop(rx);
        assert!(!queue_greeting(&tx, "anyone?".into()));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PipelineConfig {
            reply_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(Orchestrator::new(config), Err(VoiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_device_open_failure_is_fatal() {
        let f = fixture(quiet_config(), MockMicrophone::unavailable(), MockInference::echo());
        let err = f.orchestrator.run(f.collaborators).await.unwrap_err();
        assert!(matches!(err, VoiceError::DeviceOpen(_)));
    }

    #[tokio::test]
    async fn test_end_to_end_turn() {
        let f = fixture(
            quiet_config(),
            MockMicrophone::new(),
            MockInference::scripted([
                MockReply::Fail("overloaded".into()),
                MockReply::Text("It's sunny".into()),
            ]),
        );
        let gate = f.orchestrator.gate();
        let shutdown = f.orchestrator.shutdown_token();
        let writes = Arc::clone(&f.writes);
        let run = tokio::spawn(f.orchestrator.run(f.collaborators));

        f.events
            .send(SttEvent::Transcript(TranscriptEvent::final_text("hello?")))
            .unwrap();
        wait_for(|| !writes.lock().unwrap().is_empty() && !gate.is_muted()).await;
        f.events
            .send(SttEvent::Transcript(TranscriptEvent::final_text(
                "What's the weather like?",
            )))
            .unwrap();
        let first_len = writes.lock().unwrap().len();
        wait_for(|| writes.lock().unwrap().len() > first_len && !gate.is_muted()).await;

        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert!(writes.lock().unwrap().iter().all(|w| w.muted == Some(true)));
        let history = report.history.unwrap();
        let assistant: Vec<_> = history
            .messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(
            assistant,
            vec![PipelineConfig::default().fallback_reply.as_str(), "It's sunny"]
        );
        assert_eq!(report.bridge.unwrap().utterances, 2);
        assert!(report.capture.enqueued > 0 || report.capture.discarded_muted > 0);
    }

    #[tokio::test]
    async fn test_greeting_is_spoken_muted() {
        let config = PipelineConfig {
            greeting: Some("Say something!".into()),
            shutdown_grace_ms: 500,
            ..Default::default()
        };
        let f = fixture(config, MockMicrophone::new(), MockInference::echo());
        let gate = f.orchestrator.gate();
        let shutdown = f.orchestrator.shutdown_token();
        let writes = Arc::clone(&f.writes);
        let run = tokio::spawn(f.orchestrator.run(f.collaborators));

        wait_for(|| !writes.lock().unwrap().is_empty() && !gate.is_muted()).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(writes.lock().unwrap().iter().all(|w| w.muted == Some(true)));
    }

    #[tokio::test]
    async fn test_unreachable_speech_engine_shuts_everything_down() {
        let config = PipelineConfig {
            max_reconnect_attempts: 1,
            reconnect_backoff_ms: 10,
            ..quiet_config()
        };
        let f = fixture_with_stt(config, MockMicrophone::new(), MockInference::echo(), |events| {
            MockStt::new(events).with_connect_failures(2)
        });
        let shutdown = f.orchestrator.shutdown_token();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            f.orchestrator.run(f.collaborators),
        )
        .await
        .unwrap();

        let err = outcome.unwrap_err();
        assert!(matches!(err, VoiceError::ConnectionClosed(_)));
        assert!(err.is_fatal());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_external_cancel_returns_report() {
        let f = fixture(quiet_config(), MockMicrophone::new(), MockInference::echo());
        let shutdown = f.orchestrator.shutdown_token();
        let run = tokio::spawn(f.orchestrator.run(f.collaborators));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.history.unwrap().len(), 1);
        assert_eq!(report.bridge.unwrap().utterances, 0);
        assert!(report.capture.enqueued > 0);
    }
}
