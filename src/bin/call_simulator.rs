//! Call simulator (C9): speaks the same `/streams` wire protocol as a
//! telephony provider, for end-to-end testing without a real carrier.
//!
//! Grounded on the teacher's `adapter.rs` stub `TwilioMediaAdapter`/
//! `TwilioOutputAdapter` pair for the wire shape, and on
//! `gglib-voice`'s `capture.rs`/`playback.rs` for the `cpal`/`rodio` live-mic
//! plumbing (section 4.9).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use voicebridge_core::codec::{self, LinearResampler, FRAME_BYTES, FRAME_MS, SAMPLE_RATE_HZ};
use voicebridge_core::wire::{MediaPayload, StartPayload, StreamEvent};

#[derive(Parser)]
#[command(name = "call-simulator", about = "Headless client for voicebridge-server's /streams WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream an audio file as if it were inbound telephony media.
    File {
        /// Path to a WAV file (any sample rate; downmixed to mono).
        wav_path: PathBuf,
        /// Base WebSocket URL of the server, e.g. ws://127.0.0.1:8080
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Pacing multiplier: 2.0 sends twice as fast as real time.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        /// Optional call_id to place on the upgrade URL.
        #[arg(long)]
        call_id: Option<String>,
        /// Where to save the agent's replies as a WAV file, if any.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Stream live microphone audio and play the agent's replies back.
    #[cfg(feature = "mic")]
    Mic {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        call_id: Option<String>,
        /// How often captured audio is flushed to the socket.
        #[arg(long, default_value_t = 20)]
        chunk_ms: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::File { wav_path, url, speed, call_id, output } => {
            run_file_mode(wav_path, url, speed, call_id, output).await
        }
        #[cfg(feature = "mic")]
        Commands::Mic { url, call_id, chunk_ms, output } => {
            run_mic_mode(url, call_id, chunk_ms, output).await
        }
    }
}

fn stream_url(base: &str, call_id: &Option<String>) -> String {
    let base = base.trim_end_matches('/');
    match call_id {
        Some(id) => format!("{base}/streams?call_id={id}"),
        None => format!("{base}/streams"),
    }
}

/// Reads a WAV file, downmixes to mono, resamples to 8 kHz, and returns the
/// raw linear-PCM samples ready for μ-law encoding.
fn load_wav_as_8khz_mono(path: &PathBuf) -> Result<Vec<i16>, Box<dyn std::error::Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader.samples::<i16>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()?,
    };

    let mono: Vec<i16> = if spec.channels > 1 {
        samples
            .chunks_exact(spec.channels as usize)
            .map(|frame| (frame.iter().map(|&s| s as i64).sum::<i64>() / frame.len() as i64) as i16)
            .collect()
    } else {
        samples
    };

    if spec.sample_rate == SAMPLE_RATE_HZ {
        return Ok(mono);
    }
    let mut resampler = LinearResampler::new(spec.sample_rate, SAMPLE_RATE_HZ);
    Ok(resampler.process(&mono))
}

async fn run_file_mode(
    wav_path: PathBuf,
    url: String,
    speed: f64,
    call_id: Option<String>,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pcm = load_wav_as_8khz_mono(&wav_path)?;
    let mulaw = codec::encode_mulaw(&pcm);

    let stream_sid = format!("SIM{}", Uuid::new_v4().simple());
    let call_sid = call_id.clone().unwrap_or_else(|| format!("sim-{}", Uuid::new_v4()));

    let ws_url = stream_url(&url, &call_id);
    tracing::info!(ws_url, "connecting");
    let (ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (mut write, mut read) = ws.split();

    send_event(&mut write, &StreamEvent::Connected).await?;
    send_event(
        &mut write,
        &StreamEvent::Start {
            start: StartPayload {
                stream_sid: stream_sid.clone(),
                call_sid: Some(call_sid),
                account_sid: None,
            },
        },
    )
    .await?;

    let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
    let received_clone = received.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                if let Ok(StreamEvent::Media { media, .. }) = serde_json::from_str::<StreamEvent>(&text) {
                    if let Ok(bytes) = decode_b64(&media.payload) {
                        received_clone.lock().unwrap().extend_from_slice(&bytes);
                    }
                }
            }
        }
    });

    let pace = Duration::from_millis((FRAME_MS as f64 / speed) as u64);
    for frame in mulaw.chunks(FRAME_BYTES) {
        if frame.len() < FRAME_BYTES {
            break;
        }
        send_event(
            &mut write,
            &StreamEvent::Media {
                stream_sid: Some(stream_sid.clone()),
                media: MediaPayload {
                    payload: encode_b64(frame),
                    track: Some("inbound".to_string()),
                },
            },
        )
        .await?;
        tokio::time::sleep(pace).await;
    }

    send_event(&mut write, &StreamEvent::Stop { stream_sid: Some(stream_sid) }).await?;

    // Give the agent a moment to finish any in-flight reply before we close.
    tokio::time::sleep(Duration::from_secs(2)).await;
    write.close().await.ok();
    reader.abort();

    if let Some(out_path) = output {
        let reply_mulaw = received.lock().unwrap().clone();
        let reply_pcm = codec::decode_mulaw(&reply_mulaw);
        write_wav(&out_path, &reply_pcm, SAMPLE_RATE_HZ)?;
        tracing::info!(path = %out_path.display(), samples = reply_pcm.len(), "saved agent reply");
    }

    Ok(())
}

#[cfg(feature = "mic")]
async fn run_mic_mode(
    url: String,
    call_id: Option<String>,
    chunk_ms: u64,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::{Arc, Mutex};

    let stream_sid = format!("SIM{}", Uuid::new_v4().simple());
    let call_sid = call_id.clone().unwrap_or_else(|| format!("sim-{}", Uuid::new_v4()));

    let ws_url = stream_url(&url, &call_id);
    tracing::info!(ws_url, "connecting");
    let (ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (mut write, mut read) = ws.split();

    send_event(&mut write, &StreamEvent::Connected).await?;
    send_event(
        &mut write,
        &StreamEvent::Start {
            start: StartPayload {
                stream_sid: stream_sid.clone(),
                call_sid: Some(call_sid),
                account_sid: None,
            },
        },
    )
    .await?;

    let host = cpal::default_host();
    let device = host.default_input_device().ok_or("no input device")?;
    let config = device.default_input_config()?;
    let in_rate = config.sample_rate().0;
    let in_channels = config.channels();

    let captured: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_cb = captured.clone();
    let err_fn = |err: cpal::StreamError| tracing::error!(%err, "mic input stream error");

    let stream = device.build_input_stream(
        &config.into(),
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<i16> = if in_channels > 1 {
                data.chunks_exact(in_channels as usize)
                    .map(|frame| {
                        let avg = frame.iter().sum::<f32>() / in_channels as f32;
                        (avg * i16::MAX as f32) as i16
                    })
                    .collect()
            } else {
                data.iter().map(|&s| (s * i16::MAX as f32) as i16).collect()
            };
            captured_cb.lock().unwrap().extend_from_slice(&mono);
        },
        err_fn,
        None,
    )?;
    stream.play()?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let out_device = cpal::default_host()
        .default_output_device()
        .ok_or("no output device")?;
    let (_rodio_stream, rodio_handle) = rodio::OutputStream::try_default()?;
    let _ = out_device; // selection is implicit via rodio's default stream
    let sink = rodio::Sink::try_new(&rodio_handle)?;

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let reader = tokio::spawn(async move {
        let mut resampler = LinearResampler::new(SAMPLE_RATE_HZ, 48_000);
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                if let Ok(StreamEvent::Media { media, .. }) = serde_json::from_str::<StreamEvent>(&text) {
                    if let Ok(bytes) = decode_b64(&media.payload) {
                        received_clone.lock().unwrap().extend_from_slice(&bytes);
                        let pcm = codec::decode_mulaw(&bytes);
                        let resampled = resampler.process(&pcm);
                        let floats: Vec<f32> = resampled.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                        let _ = out_tx.send(floats.iter().flat_map(|f| f.to_le_bytes()).collect());
                    }
                }
            }
        }
    });

    let playback = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            let floats: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            sink.append(rodio::buffer::SamplesBuffer::new(1, 48_000, floats));
        }
    });

    let mut resampler = LinearResampler::new(in_rate, SAMPLE_RATE_HZ);
    let tick = Duration::from_millis(chunk_ms);
    tracing::info!("streaming microphone audio; press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                let drained: Vec<i16> = std::mem::take(&mut *captured.lock().unwrap());
                if drained.is_empty() {
                    continue;
                }
                let pcm_8k = resampler.process(&drained);
                let mulaw = codec::encode_mulaw(&pcm_8k);
                for frame in codec::rechunk_to_frames(&mulaw) {
                    send_event(
                        &mut write,
                        &StreamEvent::Media {
                            stream_sid: Some(stream_sid.clone()),
                            media: MediaPayload {
                                payload: encode_b64(frame),
                                track: Some("inbound".to_string()),
                            },
                        },
                    )
                    .await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(stream);
    reader.abort();
    playback.abort();
    send_event(&mut write, &StreamEvent::Stop { stream_sid: Some(stream_sid) }).await?;

    if let Some(out_path) = output {
        let reply_mulaw = received.lock().unwrap().clone();
        let reply_pcm = codec::decode_mulaw(&reply_mulaw);
        write_wav(&out_path, &reply_pcm, SAMPLE_RATE_HZ)?;
    }

    Ok(())
}

async fn send_event(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &StreamEvent,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string(event)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

fn encode_b64(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_b64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(s)
}

fn write_wav(path: &PathBuf, pcm: &[i16], sample_rate: u32) -> Result<(), Box<dyn std::error::Error>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in pcm {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
