use framebus_frame::{AudioFormat, ImageFormat, StreamFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// One shared segment holding the latest frame.
    #[default]
    Slot,
    /// Refcounted arena plus a control socket per consumer.
    Broker,
}

/// What a writer does with a segment file that already exists.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    #[default]
    Truncate,
    Attach,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    #[serde(default = "defaults::image_format")]
    pub image_format: ImageFormat,
    #[serde(default = "defaults::width")]
    pub width: u32,
    #[serde(default = "defaults::height")]
    pub height: u32,
    #[serde(default = "defaults::audio_format")]
    pub audio_format: AudioFormat,
    #[serde(default = "defaults::frequency")]
    pub frequency: u32,
    #[serde(default = "defaults::channels")]
    pub channels: u32,
    #[serde(default = "defaults::samples")]
    pub samples: u32,
    #[serde(default = "defaults::frame_rate_num")]
    pub frame_rate_num: u32,
    #[serde(default = "defaults::frame_rate_den")]
    pub frame_rate_den: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(StreamFormat::default())
    }
}

impl From<StreamFormat> for StreamConfig {
    fn from(f: StreamFormat) -> Self {
        Self {
            image_format: f.image_format,
            width: f.width,
            height: f.height,
            audio_format: f.audio_format,
            frequency: f.frequency,
            channels: f.channels,
            samples: f.samples,
            frame_rate_num: f.frame_rate_num,
            frame_rate_den: f.frame_rate_den,
        }
    }
}

impl StreamConfig {
    pub fn to_format(&self) -> StreamFormat {
        StreamFormat {
            image_format: self.image_format,
            width: self.width,
            height: self.height,
            audio_format: self.audio_format,
            frequency: self.frequency,
            channels: self.channels,
            samples: self.samples,
            frame_rate_num: self.frame_rate_num,
            frame_rate_den: self.frame_rate_den,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate_num == 0 || self.frame_rate_den == 0 {
            return Err(invalid(format!(
                "frame rate {}/{} must be non-zero",
                self.frame_rate_num, self.frame_rate_den
            )));
        }
        if self.image_format != ImageFormat::None && (self.width == 0 || self.height == 0) {
            return Err(invalid(format!(
                "image size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.audio_format != AudioFormat::None && self.channels == 0 {
            return Err(invalid("audio needs at least one channel"));
        }
        let record = self.to_format().record_size();
        if u32::try_from(record).is_err() {
            return Err(invalid(format!("frame record of {record} bytes is too large")));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WriterConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "defaults::slot_path")]
    pub slot_path: PathBuf,
    #[serde(default)]
    pub slot_policy: SlotPolicy,
    #[serde(default = "defaults::socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "defaults::arena_path")]
    pub arena_path: PathBuf,
    #[serde(default = "defaults::block_count")]
    pub block_count: u32,
    #[serde(default = "defaults::max_pending")]
    pub max_pending: usize,
    /// Stop after this many seconds; runs until killed when absent.
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ReaderConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "defaults::slot_path")]
    pub slot_path: PathBuf,
    #[serde(default = "defaults::socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub prime: usize,
    #[serde(default = "defaults::retry_ms")]
    pub retry_ms: u64,
    pub duration_secs: Option<u64>,
    /// Expected stream shape. Any producer format is accepted when absent.
    pub stream: Option<StreamConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

mod defaults {
    use framebus_frame::{AudioFormat, ImageFormat, StreamFormat};
    use std::path::PathBuf;

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn slot_path() -> PathBuf {
        "/dev/shm/framebus.shm".into()
    }

    pub fn socket_path() -> PathBuf {
        "/tmp/framebus.sock".into()
    }

    pub fn arena_path() -> PathBuf {
        "/dev/shm/framebus-arena.shm".into()
    }

    pub fn block_count() -> u32 {
        30
    }

    pub fn max_pending() -> usize {
        8
    }

    pub fn queue_capacity() -> usize {
        25
    }

    pub fn retry_ms() -> u64 {
        500
    }

    pub fn image_format() -> ImageFormat {
        StreamFormat::default().image_format
    }

    pub fn width() -> u32 {
        StreamFormat::default().width
    }

    pub fn height() -> u32 {
        StreamFormat::default().height
    }

    pub fn audio_format() -> AudioFormat {
        StreamFormat::default().audio_format
    }

    pub fn frequency() -> u32 {
        StreamFormat::default().frequency
    }

    pub fn channels() -> u32 {
        StreamFormat::default().channels
    }

    pub fn samples() -> u32 {
        StreamFormat::default().samples
    }

    pub fn frame_rate_num() -> u32 {
        StreamFormat::default().frame_rate_num
    }

    pub fn frame_rate_den() -> u32 {
        StreamFormat::default().frame_rate_den
    }
}

fn read(path: impl AsRef<Path> + ToString) -> Result<String, ConfigError> {
    std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })
}

impl WriterConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: WriterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()?;
        if self.transport == Transport::Broker {
            if self.block_count == 0 {
                return Err(invalid("block_count must be at least 1"));
            }
            if self.max_pending == 0 {
                return Err(invalid("max_pending must be at least 1"));
            }
        }
        Ok(())
    }
}

impl ReaderConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ReaderConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(stream) = &self.stream {
            stream.validate()?;
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }
        if self.prime > self.queue_capacity {
            return Err(invalid(format!(
                "prime {} exceeds queue_capacity {}",
                self.prime, self.queue_capacity
            )));
        }
        if self.retry_ms == 0 {
            return Err(invalid("retry_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn expected_format(&self) -> Option<StreamFormat> {
        self.stream.as_ref().map(StreamConfig::to_format)
    }
}
