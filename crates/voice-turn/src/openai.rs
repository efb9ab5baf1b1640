//! HTTP clients for OpenAI-compatible chat completion and speech servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    AudioEncoding, AudioStream, EncodedAudio, Inference, Message, Result, Role, SynthesisRequest,
    TextToSpeech, VoiceError,
};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";
pub const DEFAULT_SPEECH_BASE_URL: &str = "http://127.0.0.1:8080/v1";
pub const DEFAULT_SPEECH_MODEL: &str = "tts-1";
pub const DEFAULT_SPEECH_VOICE: &str = "alloy";

/// Encoded chunks buffered between the HTTP body and the decoder.
const SPEECH_QUEUE_CHUNKS: usize = 32;

const TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.9;
const MAX_TOKENS: u32 = 4000;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Config(format!("http client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            client,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn request<'a>(&'a self, history: &'a [Message]) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: history
                .iter()
                .map(|m| ChatMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: &m.text,
                })
                .collect(),
            temperature: TEMPERATURE,
            top_p: TOP_P,
            max_tokens: MAX_TOKENS,
            stream: false,
        }
    }
}

#[async_trait]
impl Inference for OpenAiChat {
    async fn complete(&self, history: &[Message]) -> Result<String> {
        let start = std::time::Instant::now();
        let mut req = self.client.post(&self.endpoint).json(&self.request(history));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| VoiceError::Inference(format!("request: {e}")))?;
        if !resp.status().is_success() {
            return Err(VoiceError::Inference(format!("HTTP {}", resp.status())));
        }
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| VoiceError::Inference(format!("response body: {e}")))?;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Chat completion received");

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| VoiceError::Inference("response had no content".into()))
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// Streams synthesized audio from an OpenAI-compatible `/audio/speech` endpoint.
pub struct OpenAiSpeech {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            client,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self) -> String {
        format!("{}/audio/speech", self.base_url.trim_end_matches('/'))
    }

    fn request<'a>(&'a self, request: &'a SynthesisRequest) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.model,
            input: &request.text,
            voice: request.voice.as_deref().unwrap_or(DEFAULT_SPEECH_VOICE),
            response_format: match request.format {
                AudioEncoding::Pcm => "pcm",
                AudioEncoding::Wav => "wav",
                AudioEncoding::Mp3 => "mp3",
            },
        }
    }
}

#[async_trait]
impl TextToSpeech for OpenAiSpeech {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<EncodedAudio> {
        let mut req = self.client.post(self.url()).json(&self.request(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let mut resp = req
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("request: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("HTTP {status}: {body}")));
        }

        let (tx, audio) = AudioStream::channel(SPEECH_QUEUE_CHUNKS);
        tokio::spawn(async move {
            let mut bytes = 0usize;
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        bytes += chunk.len();
                        if tx.send(Ok(chunk.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(VoiceError::Synthesis(format!("response body: {e}"))))
                            .await;
                        return;
                    }
                }
            }
            debug!(bytes, "Speech stream finished");
        });
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_history_and_sampling() {
        let chat = OpenAiChat::new(DEFAULT_ENDPOINT, "llama").unwrap();
        let history = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let body = serde_json::to_value(chat.request(&history)).unwrap();
        assert_eq!(body["model"], "llama");
        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["stream"], false);
        let roles: Vec<_> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant"]);
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_parses_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"It's sunny"}}]}"#;
        let body: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            body.choices[0].message.content.as_deref(),
            Some("It's sunny")
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_inference_error() {
        let chat = OpenAiChat::new("http://127.0.0.1:9/v1/chat/completions", "m").unwrap();
        let err = chat.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, VoiceError::Inference(_)));
    }

    fn synthesis(format: AudioEncoding, voice: Option<&str>) -> SynthesisRequest {
        SynthesisRequest {
            text: "Say something!".into(),
            voice: voice.map(str::to_string),
            format,
            sample_rate_hz: crate::SAMPLE_RATE_HZ,
        }
    }

    #[test]
    fn test_speech_request_shape() {
        let tts = OpenAiSpeech::new("http://localhost:8080/v1/", DEFAULT_SPEECH_MODEL).unwrap();
        assert_eq!(tts.url(), "http://localhost:8080/v1/audio/speech");

        let request = synthesis(AudioEncoding::Mp3, Some("nova"));
        let body = serde_json::to_value(tts.request(&request)).unwrap();
        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["input"], "Say something!");
        assert_eq!(body["voice"], "nova");
        assert_eq!(body["response_format"], "mp3");

        let request = synthesis(AudioEncoding::Wav, None);
        let body = serde_json::to_value(tts.request(&request)).unwrap();
        assert_eq!(body["voice"], DEFAULT_SPEECH_VOICE);
        assert_eq!(body["response_format"], "wav");
    }

    #[tokio::test]
    async fn test_unreachable_speech_server_is_synthesis_error() {
        let tts = OpenAiSpeech::new("http://127.0.0.1:9/v1", DEFAULT_SPEECH_MODEL).unwrap();
        let err = tts
            .synthesize(&synthesis(AudioEncoding::Mp3, None))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Synthesis(_)));
        assert!(!err.is_fatal());
    }
}
