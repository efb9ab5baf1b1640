use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::{AudioDecoder, AudioStream, EncodedAudio, PcmStream, Result, VoiceError, SAMPLE_RATE_HZ};

const READ_CHUNK_BYTES: usize = 1024;
const DECODED_QUEUE_CHUNKS: usize = 16;

/// For engines that already return 16 kHz mono s16le.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmPassthrough;

#[async_trait]
impl AudioDecoder for PcmPassthrough {
    async fn decode(&self, input: EncodedAudio) -> Result<PcmStream> {
        Ok(input)
    }
}

/// Transcodes whatever the engine returns through an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    program: String,
    sample_rate_hz: u32,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            sample_rate_hz: SAMPLE_RATE_HZ,
        }
    }
}

impl FfmpegDecoder {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl AudioDecoder for FfmpegDecoder {
    async fn decode(&self, mut input: EncodedAudio) -> Result<PcmStream> {
        let rate = self.sample_rate_hz.to_string();
        let mut child = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0"])
            .args(["-f", "s16le", "-ar", rate.as_str(), "-ac", "1", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Decode(format!("failed to start {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Decode("decoder stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Decode("decoder stdout unavailable".into()))?;

        let (tx, pcm) = AudioStream::channel(DECODED_QUEUE_CHUNKS);

        let feed_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = input.next_chunk().await {
                match chunk {
                    Ok(bytes) => {
                        if let Err(e) = stdin.write_all(&bytes).await {
                            debug!(error = %e, "decoder stopped accepting input");
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = feed_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            // Dropping stdin closes the pipe so the decoder flushes and exits.
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            // Consumer gone; the child is killed on drop.
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(VoiceError::Decode(e.to_string()))).await;
                        return;
                    }
                }
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(Err(VoiceError::Decode(format!("decoder exited with {status}"))))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(Err(VoiceError::Decode(e.to_string()))).await;
                }
            }
        });

        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_returns_input() {
        let input = AudioStream::from_chunks(vec![Ok(vec![1, 2, 3, 4])]);
        let mut out = PcmPassthrough.decode(input).await.unwrap();
        assert_eq!(out.next_chunk().await.unwrap().unwrap(), vec![1, 2, 3, 4]);
        assert!(out.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_decoder_binary_is_a_decode_error() {
        let decoder = FfmpegDecoder::with_program("definitely-not-an-installed-decoder");
        let err = decoder
            .decode(AudioStream::from_chunks(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
        assert!(!err.is_fatal());
    }
}
