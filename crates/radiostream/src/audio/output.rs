//! Audio output
//!
//! [`AudioOutput`] is the seam between the engine and the sound device. The
//! engine creates its output on its own thread through an [`OutputFactory`]
//! because device streams may be `!Send`.

use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::debug;

use crate::error::{RadioError, Result};

use super::pcm::PcmSource;

pub trait AudioOutput {
    /// Replace whatever is playing with `source` and start pulling from it
    fn start(&mut self, source: PcmSource) -> Result<()>;

    fn stop(&mut self);

    /// The current source has ended (or nothing was started)
    fn is_finished(&self) -> bool;

    fn set_volume(&mut self, volume: f32);

    /// Playback rate. Also shifts pitch.
    fn set_speed(&mut self, speed: f32);
}

/// Builds the output on the engine thread. Called again after a failure.
pub type OutputFactory = Box<dyn FnMut() -> Result<Box<dyn AudioOutput>> + Send>;

/// Factory for the default sound device
pub fn default_output_factory() -> OutputFactory {
    Box::new(|| Ok(Box::new(RodioOutput::open_default()?) as Box<dyn AudioOutput>))
}

/// Playback through rodio on the default device
pub struct RodioOutput {
    // Declared before `stream` so the sink drops first
    sink: Option<Sink>,
    stream: OutputStream,
    volume: f32,
    speed: f32,
}

impl RodioOutput {
    pub fn open_default() -> Result<Self> {
        let mut stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| RadioError::Audio(format!("Failed to open audio output: {}", e)))?;
        stream.log_on_drop(false);
        debug!("Audio output opened");
        Ok(Self {
            sink: None,
            stream,
            volume: 1.0,
            speed: 1.0,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn start(&mut self, source: PcmSource) -> Result<()> {
        self.stop();
        let sink = Sink::connect_new(self.stream.mixer());
        sink.set_volume(self.volume);
        sink.set_speed(self.speed);
        sink.append(source);
        sink.play();
        self.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn is_finished(&self) -> bool {
        self.sink.as_ref().map_or(true, |s| s.empty())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
        if let Some(sink) = &self.sink {
            sink.set_speed(speed);
        }
    }
}
