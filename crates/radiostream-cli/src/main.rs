//! Radiostream CLI: terminal internet radio player

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver};
use tracing_subscriber::EnvFilter;

use radiostream::audio::{CodecKind, Mp3Backend, PlayerEvent, RadioPlayer};
use radiostream::config::engine::{MAX_PITCH, MAX_VOLUME, MIN_PITCH, MIN_VOLUME};
use radiostream::config::PlayerConfig;
use radiostream::stream::{AudioFormat, StationDescriptor};

#[derive(Parser)]
#[command(name = "radiostream", about = "Terminal internet radio player", version)]
struct Cli {
    /// Stream URL to play (http://, https:// or icy://)
    url: String,

    /// Station name shown in events
    #[arg(long, default_value = "Radio")]
    name: String,

    /// Container format: mp3 or ogg
    #[arg(long, default_value = "mp3")]
    format: AudioFormat,

    /// Nominal bitrate in kbit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Ingest read size in KB
    #[arg(long)]
    chunk_kb: Option<u32>,

    /// Pre-buffer size in KB
    #[arg(long)]
    buffer_kb: Option<u32>,

    /// Codec backend this station must not use (mp3-symphonia, mp3-minimp3, ogg-vorbis)
    #[arg(long)]
    exclude_codec: Option<CodecKind>,

    /// Preferred MP3 decoder: symphonia or minimp3
    #[arg(long)]
    mp3_backend: Option<Mp3Backend>,

    /// JSON player configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial volume (0.0 to 2.0)
    #[arg(long)]
    volume: Option<f32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if let Some(backend) = cli.mp3_backend {
        config.mp3_backend = backend;
    }
    if let Some(volume) = cli.volume {
        config.volume = volume;
    }
    let config = config.sanitized();
    let mut volume = config.volume;
    let mut pitch = config.pitch;

    let mut station = StationDescriptor::new(cli.name, cli.url, cli.format)
        .with_bitrate(cli.bitrate.unwrap_or(config.default_bitrate_kbps))
        .with_chunk_kb(cli.chunk_kb.unwrap_or(config.default_chunk_kb))
        .with_buffer_kb(cli.buffer_kb.unwrap_or(config.default_buffer_kb));
    if let Some(codec) = cli.exclude_codec {
        station = station.with_excluded_codec(codec);
    }

    tracing::debug!(?station, "Station configured");

    let player = RadioPlayer::new(config)?;
    let events = player.subscribe();
    let input = spawn_input_reader();

    eprintln!("Commands: + / - volume, < / > pitch, i info, s stop, p play. Enter alone quits.");
    player.play(station.clone());

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { break };
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
                if let PlayerEvent::Error { terminal: true, .. } = event {
                    break;
                }
            }
            recv(input) -> line => {
                let Ok(line) = line else { break };
                match line.trim() {
                    "" | "q" => break,
                    "i" => print_stats(&player),
                    "s" => player.stop(),
                    "p" => player.play(station.clone()),
                    "+" | "=" => {
                        volume = (volume + 0.05).min(MAX_VOLUME);
                        player.set_volume(volume);
                        println!("Volume {:.0}%", volume * 100.0);
                    }
                    "-" => {
                        volume = (volume - 0.05).max(MIN_VOLUME);
                        player.set_volume(volume);
                        println!("Volume {:.0}%", volume * 100.0);
                    }
                    ">" => {
                        pitch = (pitch + 0.25).min(MAX_PITCH);
                        player.set_pitch(pitch);
                        println!("Pitch {pitch:.2}x");
                    }
                    "<" => {
                        pitch = (pitch - 0.25).max(MIN_PITCH);
                        player.set_pitch(pitch);
                        println!("Pitch {pitch:.2}x");
                    }
                    other => eprintln!("Unknown command: {other}"),
                }
            }
        }
    }

    let totals = player.totals();
    player.shutdown();
    eprintln!(
        "Played {} over {} session(s), downloaded {} in {} request(s)",
        format_duration(totals.play_time),
        totals.sessions,
        format_bytes(totals.bytes_downloaded),
        totals.requests
    );
    Ok(())
}

/// Forward stdin lines; the channel closes at EOF
fn spawn_input_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// One line per event worth showing. Periodic time updates are skipped.
fn describe(event: &PlayerEvent) -> Option<String> {
    let line = match event {
        PlayerEvent::PlaybackStart { station } => format!("Tuning in to {station}"),
        PlayerEvent::PlaybackEnd { station } => format!("Left {station}"),
        PlayerEvent::BufferingStart => "Buffering...".to_string(),
        PlayerEvent::BufferingEnd => "Buffered".to_string(),
        PlayerEvent::StreamConnected(headers) => match &headers.station_name {
            Some(name) => format!("Connected: {name}"),
            None => "Connected".to_string(),
        },
        PlayerEvent::AudioStart(info) => format!("Playing {info}"),
        PlayerEvent::AudioEnd => "Audio stopped".to_string(),
        PlayerEvent::RecordChange(track) => format!("Now playing: {track}"),
        PlayerEvent::NextRecordChange(track) => {
            format!("Up next in {}: {track}", format_duration(track.delay))
        }
        PlayerEvent::RetryScheduled { attempt, delay } => {
            format!("Retrying (attempt {attempt}) in {}", format_duration(*delay))
        }
        PlayerEvent::Error {
            station,
            failure,
            terminal,
        } => {
            let suffix = if *terminal { "" } else { ", will retry" };
            format!("{station}: {failure}{suffix}")
        }
        PlayerEvent::BufferingProgress(_)
        | PlayerEvent::AudioPlayTime(_)
        | PlayerEvent::RecordPlayTime(_)
        | PlayerEvent::NextRecordDelay(_) => return None,
    };
    Some(line)
}

fn print_stats(player: &RadioPlayer) {
    let stats = player.stats();
    println!(
        "{} | {} | buffer {:.0}% ({} / {}) | received {} | frames {} ({} errors)",
        stats.state,
        format_duration(stats.play_time),
        stats.buffer_progress * 100.0,
        format_bytes(stats.available_bytes),
        format_bytes(stats.ring_capacity as u64),
        format_bytes(stats.bytes_received),
        stats.frames_decoded,
        stats.decode_errors
    );
    if let Some(record) = &stats.current_record {
        println!("  {record} ({})", format_duration(stats.record_play_time));
    }
    if let Some(next) = &stats.next_record {
        println!("  next: {next}");
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
