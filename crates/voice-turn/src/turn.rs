use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Inference, Message, PipelineConfig, Reply, Result, Utterance, VoiceError};

/// Append-only conversation log with a single leading system message.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Completed user/assistant exchanges.
    pub fn turns(&self) -> usize {
        (self.messages.len() - 1) / 2
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Single consumer of the utterance queue. Each utterance is fully handled
/// (append, infer, append reply, emit) before the next one is taken.
pub struct TurnEngine {
    history: ConversationHistory,
    inference: Arc<dyn Inference>,
    replies: mpsc::Sender<Reply>,
    timeout: Duration,
    fallback_reply: String,
}

impl TurnEngine {
    pub fn new(
        inference: Arc<dyn Inference>,
        replies: mpsc::Sender<Reply>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            history: ConversationHistory::new(config.system_prompt.clone()),
            inference,
            replies,
            timeout: config.inference_timeout(),
            fallback_reply: config.fallback_reply.clone(),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run one turn. Returns `None` if shutdown interrupted the inference call;
    /// a reply arriving after shutdown is discarded.
    pub async fn process(
        &mut self,
        utterance: &Utterance,
        shutdown: &CancellationToken,
    ) -> Option<Reply> {
        self.history.push(Message::user(utterance.text.clone()));

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            outcome = tokio::time::timeout(
                self.timeout,
                self.inference.complete(self.history.messages()),
            ) => outcome,
        };
        if shutdown.is_cancelled() {
            debug!(id = %utterance.id, "Discarding reply that arrived after shutdown");
            return None;
        }

        let reply = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err(VoiceError::Inference("empty reply".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Timeout(self.timeout.as_millis() as u64)),
        };
        let (text, fallback) = match reply {
            Ok(text) => (text, false),
            Err(e) => {
                warn!(id = %utterance.id, error = %e, "Inference failed, using fallback reply");
                (self.fallback_reply.clone(), true)
            }
        };

        self.history.push(Message::assistant(text.clone()));
        Some(Reply {
            utterance_id: Some(utterance.id),
            text,
            fallback,
        })
    }

    /// Consume utterances until shutdown or until the queue closes.
    pub async fn run(
        mut self,
        mut utterances: mpsc::Receiver<Utterance>,
        shutdown: CancellationToken,
    ) -> Result<ConversationHistory> {
        info!("Conversation ready");
        loop {
            let utterance = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = utterances.recv() => match next {
                    Some(utterance) => utterance,
                    None => break,
                },
            };
            info!(id = %utterance.id, "Processing: {}", utterance.text);

            let Some(reply) = self.process(&utterance, &shutdown).await else {
                break;
            };

            // Waits for a free slot in the reply queue, never for playback.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent = self.replies.send(reply) => {
                    if sent.is_err() {
                        return Err(VoiceError::ChannelClosed("reply queue"));
                    }
                }
            }
        }
        info!(turns = self.history.turns(), "Conversation stopped");
        Ok(self.history)
    }
}
