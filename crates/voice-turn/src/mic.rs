//! Default-input microphone via cpal, delivered as 16 kHz mono frames.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tokio::runtime::RuntimeFlavor;
use tracing::{error, info};

use crate::capture::AudioCapture;
use crate::orchestrator::Supervisor;
use crate::{AudioSource, Result, VoiceError, SAMPLE_RATE_HZ};

/// Microphone whose cpal stream lives on a dedicated thread, since streams
/// cannot move between threads on every host.
pub struct CpalMicrophone {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for CpalMicrophone {
    fn start(&mut self, capture: AudioCapture) -> Result<()> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let stop = Arc::clone(&self.stop);
        let thread = std::thread::Builder::new()
            .name("mic".to_string())
            .spawn(move || {
                let stream = match open_stream(capture) {
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
            })?;
        self.thread = Some(thread);

        wait_until_open(&ready_rx, "microphone")
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
            info!("Microphone stopped");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for a device thread to report whether its stream opened. On a
/// multi-threaded runtime the wait is moved off the worker.
pub(crate) fn wait_until_open(ready: &mpsc::Receiver<Result<()>>, device: &str) -> Result<()> {
    let wait = || {
        ready.recv().map_err(|_| {
            VoiceError::DeviceOpen(format!("{device} thread exited during startup"))
        })?
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

fn open_stream(capture: AudioCapture) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceOpen("no default input device".into()))?;
    let supported = device
        .supported_input_configs()
        .map_err(|e| VoiceError::DeviceOpen(format!("input configs: {e}")))?
        .filter(|c| {
            c.min_sample_rate().0 <= SAMPLE_RATE_HZ && c.max_sample_rate().0 >= SAMPLE_RATE_HZ
        })
        .min_by_key(|c| (c.sample_format() != cpal::SampleFormat::I16, c.channels()))
        .ok_or_else(|| {
            VoiceError::DeviceOpen(format!("input device does not support {SAMPLE_RATE_HZ} Hz"))
        })?
        .with_sample_rate(cpal::SampleRate(SAMPLE_RATE_HZ));

    let channels = supported.channels();
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    if let Ok(name) = device.name() {
        info!(device = %name, channels, ?format, "Opening microphone");
    }

    let supervisor = capture.supervisor();
    let err_fn = move |err: cpal::StreamError| report(&supervisor, err);

    let stream = match format {
        cpal::SampleFormat::I16 => build_stream(&device, &config, channels, capture, err_fn, |s: i16| s)?,
        cpal::SampleFormat::U16 => {
            build_stream(&device, &config, channels, capture, err_fn, |s: u16| {
                (s as i32 - 32768) as i16
            })?
        }
        cpal::SampleFormat::F32 => {
            build_stream(&device, &config, channels, capture, err_fn, |s: f32| {
                (s.clamp(-1.0, 1.0) * 32767.0) as i16
            })?
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

/// Build an input stream that keeps the first channel and converts to i16.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    mut capture: AudioCapture,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    convert: fn(T) -> i16,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
{
    let channels = channels.max(1) as usize;
    let mut mono = Vec::<i16>::with_capacity(4096);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                mono.clear();
                mono.extend(data.chunks_exact(channels).map(|frame| convert(frame[0])));
                capture.push_samples(&mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| VoiceError::DeviceOpen(format!("build input stream: {e}")))
}

fn report(supervisor: &Option<Supervisor>, err: cpal::StreamError) {
    let error = VoiceError::Device(format!("input stream: {err}"));
    match supervisor {
        Some(supervisor) => supervisor.fail("capture", error),
        None => error!(error = %error, "Microphone stream error"),
    }
}
