//! Default-output speaker via cpal, fed 16 kHz mono s16le.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::{AudioSink, Result, VoiceError, SAMPLE_RATE_HZ};

/// Half a second of queued audio before `write` blocks.
const MAX_BACKLOG_SAMPLES: usize = SAMPLE_RATE_HZ as usize / 2;
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Shared {
    queue: VecDeque<i16>,
    failure: Option<String>,
}

type SharedState = Arc<(Mutex<Shared>, Condvar)>;

fn lock(state: &SharedState) -> MutexGuard<'_, Shared> {
    state.0.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CpalSpeaker {
    state: SharedState,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSpeaker {
    /// Open the default output device. Fails if it cannot play 16 kHz.
    pub fn open() -> Result<Self> {
        let state: SharedState = Arc::new((Mutex::new(Shared::default()), Condvar::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("speaker".to_string())
                .spawn(move || {
                    let stream = match open_stream(Arc::clone(&state)) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    while !stop.load(Ordering::Acquire) {
                        std::thread::park();
                    }
                    drop(stream);
                })?
        };

        crate::mic::wait_until_open(&ready_rx, "speaker")?;
        Ok(Self {
            state,
            stop,
            thread: Some(thread),
        })
    }

    fn check(shared: &Shared) -> Result<()> {
        match &shared.failure {
            Some(reason) => Err(VoiceError::Playback(reason.clone())),
            None => Ok(()),
        }
    }
}

impl AudioSink for CpalSpeaker {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let (_, ready) = &*self.state;
        let mut shared = lock(&self.state);
        while shared.queue.len() >= MAX_BACKLOG_SAMPLES {
            Self::check(&shared)?;
            shared = ready
                .wait_timeout(shared, DRAIN_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Self::check(&shared)?;
        shared.queue.extend(
            pcm.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let (_, ready) = &*self.state;
        let mut shared = lock(&self.state);
        while !shared.queue.is_empty() {
            Self::check(&shared)?;
            shared = ready
                .wait_timeout(shared, DRAIN_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Self::check(&shared)
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

fn open_stream(state: SharedState) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::DeviceOpen("no default output device".into()))?;
    let supported = device
        .supported_output_configs()
        .map_err(|e| VoiceError::DeviceOpen(format!("output configs: {e}")))?
        .filter(|c| {
            c.min_sample_rate().0 <= SAMPLE_RATE_HZ && c.max_sample_rate().0 >= SAMPLE_RATE_HZ
        })
        .min_by_key(|c| (c.sample_format() != cpal::SampleFormat::I16, c.channels()))
        .ok_or_else(|| {
            VoiceError::DeviceOpen(format!("output device does not support {SAMPLE_RATE_HZ} Hz"))
        })?
        .with_sample_rate(cpal::SampleRate(SAMPLE_RATE_HZ));

    let channels = supported.channels();
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    if let Ok(name) = device.name() {
        info!(device = %name, channels, ?format, "Opening speaker");
    }

    let stream = match format {
        cpal::SampleFormat::I16 => build_stream(&device, &config, channels, state, |s| s)?,
        cpal::SampleFormat::U16 => {
            build_stream(&device, &config, channels, state, |s| (s as i32 + 32768) as u16)?
        }
        cpal::SampleFormat::F32 => {
            build_stream(&device, &config, channels, state, |s| s as f32 / 32768.0)?
        }
        other => {
            return Err(VoiceError::DeviceOpen(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| VoiceError::DeviceOpen(format!("stream play: {e}")))?;
    Ok(stream)
}

/// Build an output stream that copies each queued sample to every channel and
/// plays silence when the queue is empty.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    state: SharedState,
    convert: fn(i16) -> T,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
{
    let channels = channels.max(1) as usize;
    let err_state = Arc::clone(&state);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let mut shared = lock(&state);
                for frame in data.chunks_exact_mut(channels) {
                    let sample = convert(shared.queue.pop_front().unwrap_or(0));
                    frame.fill(sample);
                }
                drop(shared);
                state.1.notify_all();
            },
            move |err| {
                warn!(error = %err, "Output stream error");
                lock(&err_state).failure = Some(format!("output stream: {err}"));
                err_state.1.notify_all();
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceOpen(format!("build output stream: {e}")))
}
