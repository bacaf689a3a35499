use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SfuError};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates and recording feeds
    pub announced_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub num_workers: usize,
    pub operation_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingFormat {
    Webm,
    Mp4,
}

impl RecordingFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordingFormat::Webm => "webm",
            RecordingFormat::Mp4 => "mp4",
        }
    }
}

impl FromStr for RecordingFormat {
    type Err = SfuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "webm" => Ok(RecordingFormat::Webm),
            "mp4" => Ok(RecordingFormat::Mp4),
            other => Err(SfuError::InvalidConfiguration(format!(
                "unknown recording format {}",
                other
            ))),
        }
    }
}

/// Which transcoder drives recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingBackend {
    Ffmpeg,
    /// Only available with the `gstreamer` feature.
    Gstreamer,
}

impl FromStr for RecordingBackend {
    type Err = SfuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(RecordingBackend::Ffmpeg),
            "gstreamer" | "gst" => Ok(RecordingBackend::Gstreamer),
            other => Err(SfuError::InvalidConfiguration(format!(
                "unknown recording backend {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub backend: RecordingBackend,
    pub output_dir: PathBuf,
    pub format: RecordingFormat,
    pub ffmpeg_path: String,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            num_workers: 1,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl MediaConfig {
    /// Address peers and the transcoder should send media to
    pub fn public_ip(&self) -> IpAddr {
        match (self.announced_ip, self.listen_ip) {
            (Some(ip), _) => ip,
            (None, ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (None, ip) => ip,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: RecordingBackend::Ffmpeg,
            output_dir: PathBuf::from("./recordings"),
            format: RecordingFormat::Webm,
            ffmpeg_path: "ffmpeg".to_string(),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(15),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SfuError::InvalidConfiguration(format!("{}={}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let media_defaults = MediaConfig::default();
        let recording_defaults = RecordingConfig::default();

        let announced_ip = match env::var("MEDIA_ANNOUNCED_IP") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
                SfuError::InvalidConfiguration(format!("MEDIA_ANNOUNCED_IP={}", raw))
            })?),
            _ => None,
        };

        let config = Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 8080)?,
            },
            media: MediaConfig {
                listen_ip: parse_var("MEDIA_LISTEN_IP", media_defaults.listen_ip)?,
                announced_ip,
                rtc_min_port: parse_var("RTC_MIN_PORT", media_defaults.rtc_min_port)?,
                rtc_max_port: parse_var("RTC_MAX_PORT", media_defaults.rtc_max_port)?,
                num_workers: parse_var("MEDIA_WORKERS", media_defaults.num_workers)?,
                operation_timeout: Duration::from_millis(parse_var(
                    "MEDIA_OPERATION_TIMEOUT_MS",
                    10_000u64,
                )?),
            },
            recording: RecordingConfig {
                enabled: parse_var("RECORDING_ENABLED", true)?,
                backend: parse_var("RECORDING_BACKEND", recording_defaults.backend)?,
                output_dir: env::var("RECORDING_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(recording_defaults.output_dir),
                format: parse_var("RECORDING_FORMAT", recording_defaults.format)?,
                ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or(recording_defaults.ffmpeg_path),
                start_timeout: Duration::from_secs(parse_var("RECORDING_START_TIMEOUT_SECS", 10u64)?),
                stop_timeout: Duration::from_secs(parse_var("RECORDING_STOP_TIMEOUT_SECS", 15u64)?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.media.rtc_min_port > self.media.rtc_max_port {
            return Err(SfuError::InvalidConfiguration(format!(
                "RTC port range {}-{} is inverted",
                self.media.rtc_min_port, self.media.rtc_max_port
            )));
        }
        if self.media.num_workers == 0 {
            return Err(SfuError::InvalidConfiguration(
                "MEDIA_WORKERS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_host(host: &str, port: u16) -> Config {
        Config {
            server: ServerConfig {
                host: host.to_string(),
                port,
            },
            media: MediaConfig::default(),
            recording: RecordingConfig::default(),
        }
    }

    #[test]
    fn test_parse_localhost() {
        let config = config_with_host("localhost", 8080);
        assert_eq!(config.bind_address(), ([127, 0, 0, 1], 8080));
    }

    #[test]
    fn test_parse_ipv4_address() {
        let config = config_with_host("192.168.1.1", 3000);
        assert_eq!(config.bind_address(), ([192, 168, 1, 1], 3000));
    }

    #[test]
    fn test_parse_empty_host() {
        let config = config_with_host("", 8080);
        assert_eq!(config.bind_address(), ([0, 0, 0, 0], 8080));
    }

    #[test]
    fn test_parse_invalid_hostname_defaults_to_all() {
        let config = config_with_host("invalid-hostname", 9000);
        assert_eq!(config.bind_address(), ([0, 0, 0, 0], 9000));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut config = config_with_host("0.0.0.0", 8080);
        config.media.rtc_min_port = 50000;
        config.media.rtc_max_port = 40000;
        assert!(matches!(
            config.validate(),
            Err(SfuError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_public_ip_prefers_announced() {
        let mut media = MediaConfig::default();
        assert_eq!(media.public_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        media.announced_ip = Some("203.0.113.7".parse().unwrap());
        assert_eq!(media.public_ip().to_string(), "203.0.113.7");
    }

    #[test]
    fn test_recording_format_parse() {
        assert_eq!("WEBM".parse::<RecordingFormat>().unwrap(), RecordingFormat::Webm);
        assert_eq!("mp4".parse::<RecordingFormat>().unwrap().extension(), "mp4");
        assert!("avi".parse::<RecordingFormat>().is_err());
    }

    #[test]
    fn test_recording_backend_parse() {
        assert_eq!("FFmpeg".parse::<RecordingBackend>().unwrap(), RecordingBackend::Ffmpeg);
        assert_eq!("gst".parse::<RecordingBackend>().unwrap(), RecordingBackend::Gstreamer);
        assert!("vlc".parse::<RecordingBackend>().is_err());
    }
}
