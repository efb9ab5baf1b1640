use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use voice_turn::decode::{FfmpegDecoder, PcmPassthrough};
use voice_turn::mock::{MockInference, MockMicrophone, MockStt, MockTts, NullSink};
use voice_turn::{
    AudioDecoder, AudioEncoding, AudioSink, AudioSource, Collaborators, Inference, Orchestrator,
    PipelineConfig, SpeechToText, TextToSpeech,
};

mod typed;
use typed::TypedTranscriber;

#[derive(Parser)]
#[command(name = "voicebot")]
#[command(about = "Turn-taking voice chatbot")]
struct Args {
    /// Pipeline configuration file (written with defaults if missing)
    #[arg(long, default_value = "voicebot.json")]
    config: String,

    /// Speech recognition backend: mock or typed
    #[arg(long, default_value = "typed")]
    backend: String,

    /// Reply backend: mock or openai
    #[arg(long, default_value = "mock")]
    inference: String,

    /// Chat completions endpoint for the openai backend
    #[arg(long)]
    endpoint: Option<String>,

    /// Model name sent to the openai backend
    #[arg(long, default_value = "meta.llama-3.3-70b-instruct")]
    model: String,

    /// Speech synthesis backend: mock or openai
    #[arg(long, default_value = "mock")]
    tts: String,

    /// Base URL of the openai speech backend
    #[arg(long)]
    speech_url: Option<String>,

    /// Model name sent to the openai speech backend
    #[arg(long)]
    speech_model: Option<String>,

    /// Voice name, overriding the configured voice
    #[arg(long)]
    voice: Option<String>,

    /// Skip the startup greeting
    #[arg(long)]
    no_greeting: bool,

    /// Do not open audio devices
    #[arg(long)]
    no_audio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let mut config = PipelineConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", args.config, e))?;
    if args.no_greeting {
        config.greeting = None;
    }
    info!(
        "Backend: {}, inference: {}, tts: {}",
        args.backend, args.inference, args.tts
    );
    let tts = build_tts(&args, &mut config)?;

    let orchestrator = Orchestrator::new(config.clone())
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    let shutdown = orchestrator.shutdown_token();

    let (events_tx, stt_events) = mpsc::unbounded_channel();
    let stt: Box<dyn SpeechToText> = match args.backend.as_str() {
        "typed" => Box::new(TypedTranscriber::new(events_tx).with_eof_shutdown(shutdown.clone())),
        "mock" => Box::new(
            MockStt::new(events_tx).with_script(["Hello there", "What's the weather like?"], 20),
        ),
        other => {
            error!("Unknown speech backend: {}", other);
            return Err(anyhow::anyhow!("Unknown speech backend"));
        }
    };

    let inference = build_inference(&args)?;
    let decoder: Arc<dyn AudioDecoder> = match config.synthesis_format {
        AudioEncoding::Pcm => Arc::new(PcmPassthrough),
        _ => Arc::new(FfmpegDecoder::default()),
    };
    let (source, sink) = open_devices(args.no_audio)?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
        });
    }

    let report = orchestrator
        .run(Collaborators {
            source,
            stt,
            stt_events,
            tts,
            decoder,
            inference,
            sink,
        })
        .await
        .map_err(|e| anyhow::anyhow!("Voice pipeline failed: {}", e))?;

    info!(
        enqueued = report.capture.enqueued,
        discarded_muted = report.capture.discarded_muted,
        dropped_full = report.capture.dropped_full,
        "Capture summary"
    );
    if let Some(history) = report.history {
        info!("Conversation ended after {} turns", history.turns());
    }
    Ok(())
}

/// Pick the speech engine and adjust the playback settings it needs.
fn build_tts(args: &Args, config: &mut PipelineConfig) -> Result<Arc<dyn TextToSpeech>> {
    if let Some(voice) = &args.voice {
        config.voice = Some(voice.clone());
    }
    match args.tts.as_str() {
        "mock" => {
            if config.synthesis_format != AudioEncoding::Pcm {
                warn!("Mock speech only produces pcm; ignoring configured format");
                config.synthesis_format = AudioEncoding::Pcm;
            }
            Ok(Arc::new(MockTts::new()))
        }
        #[cfg(feature = "openai")]
        "openai" => {
            use voice_turn::openai::{
                OpenAiSpeech, DEFAULT_SPEECH_BASE_URL, DEFAULT_SPEECH_MODEL, DEFAULT_SPEECH_VOICE,
            };
            // Raw pcm from these servers is not 16 kHz, so always go through the decoder.
            if config.synthesis_format == AudioEncoding::Pcm {
                config.synthesis_format = AudioEncoding::Mp3;
            }
            if config.fast_speech {
                info!("SSML is not supported by the openai speech backend; speaking plain text");
                config.fast_speech = false;
            }
            if args.voice.is_none() {
                config.voice = Some(DEFAULT_SPEECH_VOICE.to_string());
            }
            let base_url = args
                .speech_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SPEECH_BASE_URL.to_string());
            let model = args
                .speech_model
                .clone()
                .unwrap_or_else(|| DEFAULT_SPEECH_MODEL.to_string());
            let mut speech = OpenAiSpeech::new(base_url, model)
                .map_err(|e| anyhow::anyhow!("Failed to create speech client: {}", e))?;
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                speech = speech.with_api_key(key);
            }
            Ok(Arc::new(speech))
        }
        other => {
            error!("Unknown speech synthesis backend: {}", other);
            Err(anyhow::anyhow!("Unknown speech synthesis backend"))
        }
    }
}

fn build_inference(args: &Args) -> Result<Arc<dyn Inference>> {
    match args.inference.as_str() {
        "mock" => Ok(Arc::new(MockInference::echo())),
        #[cfg(feature = "openai")]
        "openai" => {
            let endpoint = args
                .endpoint
                .clone()
                .unwrap_or_else(|| voice_turn::openai::DEFAULT_ENDPOINT.to_string());
            let mut chat = voice_turn::openai::OpenAiChat::new(endpoint, args.model.clone())
                .map_err(|e| anyhow::anyhow!("Failed to create chat client: {}", e))?;
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                chat = chat.with_api_key(key);
            }
            Ok(Arc::new(chat))
        }
        other => {
            error!("Unknown inference backend: {}", other);
            Err(anyhow::anyhow!("Unknown inference backend"))
        }
    }
}

#[cfg(feature = "audio")]
fn open_devices(no_audio: bool) -> Result<(Box<dyn AudioSource>, Box<dyn AudioSink>)> {
    if no_audio {
        return Ok((Box::new(MockMicrophone::new()), Box::new(NullSink::default())));
    }
    let speaker = voice_turn::speaker::CpalSpeaker::open()
        .map_err(|e| anyhow::anyhow!("Failed to open speaker: {}", e))?;
    Ok((
        Box::new(voice_turn::mic::CpalMicrophone::new()),
        Box::new(speaker),
    ))
}

#[cfg(not(feature = "audio"))]
fn open_devices(no_audio: bool) -> Result<(Box<dyn AudioSource>, Box<dyn AudioSink>)> {
    if !no_audio {
        warn!("Built without the audio feature; using silent devices");
    }
    Ok((Box::new(MockMicrophone::new()), Box::new(NullSink::default())))
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
