//! Keyboard stand-in for a speech engine: each line typed on stdin becomes a
//! final transcript.

use async_trait::async_trait;
use std::io::BufRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voice_turn::{AudioFrame, Result, SpeechToText, SttEvent, SttEventSender, TranscriptEvent};

pub struct TypedTranscriber {
    events: SttEventSender,
    eof_shutdown: Option<CancellationToken>,
    reader_started: bool,
}

impl TypedTranscriber {
    pub fn new(events: SttEventSender) -> Self {
        Self {
            events,
            eof_shutdown: None,
            reader_started: false,
        }
    }

    /// Cancel `token` when stdin reaches end of file.
    pub fn with_eof_shutdown(mut self, token: CancellationToken) -> Self {
        self.eof_shutdown = Some(token);
        self
    }

    fn spawn_reader(&self) -> Result<()> {
        let events = self.events.clone();
        let eof = self.eof_shutdown.clone();
        std::thread::Builder::new()
            .name("stdin".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "stdin read failed");
                            break;
                        }
                    };
                    let event = SttEvent::Transcript(TranscriptEvent::final_text(line));
                    if events.send(event).is_err() {
                        return;
                    }
                }
                debug!("stdin closed");
                if let Some(token) = eof {
                    token.cancel();
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl SpeechToText for TypedTranscriber {
    async fn connect(&mut self) -> Result<()> {
        if !self.reader_started {
            self.spawn_reader()?;
            self.reader_started = true;
            info!("Type a line and press enter to speak");
        }
        let _ = self.events.send(SttEvent::Connected);
        Ok(())
    }

    async fn send_audio(&mut self, _frame: &AudioFrame) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}
