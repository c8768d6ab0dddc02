use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

const DEFAULT_PORT: u16 = 8080;

/// Bytes per chunk for each KB/s of target speed: one eighth of a second
/// of data at the target rate.
const CHUNK_BYTES_PER_KBPS: u64 = 128;

/// Serve one file over HTTP with paced transfers and a per-client cap on
/// concurrent downloads.
#[derive(Debug, Clone, Parser)]
#[command(name = "throttled-serve", version, about, long_about = None)]
pub struct CliArgs {
    /// IP address to bind on. Omit to bind all interfaces.
    #[arg(long, env = "THROTTLE_BIND_IP", help = "Bind IP address [default: 0.0.0.0]")]
    pub bind_ip: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long, env = "THROTTLE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// File to serve (required).
    #[arg(long, env = "THROTTLE_FILE")]
    pub file: String,

    /// Target transfer speed per download in KB/s (required).
    #[arg(long, env = "THROTTLE_SPEED_KBPS")]
    pub speed_kbps: u32,

    /// Allow two concurrent downloads per client at half the speed each,
    /// instead of one at full speed.
    #[arg(long, env = "THROTTLE_RELAXED", default_value_t = false)]
    pub relaxed: bool,

    /// Path to write a JSONL trace of admissions, chunks and outcomes.
    /// Disabled when omitted.
    #[arg(long, env = "THROTTLE_DEBUG_TRACE")]
    pub debug_trace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub download: DownloadConfig,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let profile = if args.relaxed {
            Profile::Relaxed
        } else {
            Profile::Restricted
        };
        let download = DownloadConfig::new(&args.file, args.speed_kbps, profile)?;
        Ok(Self {
            bind_ip: args.bind_ip.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
            port: args.port,
            download,
        })
    }
}

/// Speed/concurrency trade-off chosen when the config is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// One download per client at the full configured speed.
    Restricted,
    /// Two downloads per client, each at half the configured speed.
    Relaxed,
}

impl Profile {
    pub fn max_sessions(self) -> usize {
        match self {
            Profile::Restricted => 1,
            Profile::Relaxed => 2,
        }
    }

    pub fn effective_speed(self, speed_kbps: u32) -> u32 {
        match self {
            Profile::Restricted => speed_kbps,
            Profile::Relaxed => speed_kbps / 2,
        }
    }
}

/// Everything one download needs to know about what to send and how fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub path: PathBuf,
    pub speed_kbps: u32,
    pub max_sessions: usize,
    pub chunk_size: u64,
}

impl DownloadConfig {
    pub fn new(path: &str, speed_kbps: u32, profile: Profile) -> anyhow::Result<Self> {
        anyhow::ensure!(!path.trim().is_empty(), "file path must not be empty");
        anyhow::ensure!(speed_kbps > 0, "speed-kbps must be > 0");
        let speed = profile.effective_speed(speed_kbps);
        anyhow::ensure!(
            speed > 0,
            "speed-kbps {speed_kbps} is too low for the {profile:?} profile"
        );

        Ok(Self {
            path: PathBuf::from(path.replace('\\', "/")),
            speed_kbps: speed,
            max_sessions: profile.max_sessions(),
            chunk_size: u64::from(speed) * CHUNK_BYTES_PER_KBPS,
        })
    }

    /// Basename of the served file, as sent to clients.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_profile() {
        let cfg = DownloadConfig::new("/srv/big.iso", 512, Profile::Restricted).unwrap();
        assert_eq!(cfg.speed_kbps, 512);
        assert_eq!(cfg.max_sessions, 1);
        assert_eq!(cfg.chunk_size, 65_536);
    }

    #[test]
    fn relaxed_profile_halves_speed() {
        let cfg = DownloadConfig::new("/srv/big.iso", 512, Profile::Relaxed).unwrap();
        assert_eq!(cfg.speed_kbps, 256);
        assert_eq!(cfg.max_sessions, 2);
        assert_eq!(cfg.chunk_size, 32_768);
    }

    #[test]
    fn zero_speed_rejected() {
        assert!(DownloadConfig::new("/srv/a", 0, Profile::Restricted).is_err());
        assert!(DownloadConfig::new("/srv/a", 1, Profile::Relaxed).is_err());
        assert!(DownloadConfig::new("", 100, Profile::Restricted).is_err());
    }

    #[test]
    fn backslashes_normalized() {
        let cfg = DownloadConfig::new(r"data\files\My File.bin", 64, Profile::Restricted).unwrap();
        assert_eq!(cfg.path, PathBuf::from("data/files/My File.bin"));
        assert_eq!(cfg.file_name(), "My File.bin");
    }

    #[test]
    fn cli_selects_profile() {
        let args = CliArgs::parse_from([
            "throttled-serve",
            "--file",
            "/tmp/x.bin",
            "--speed-kbps",
            "100",
            "--relaxed",
        ]);
        let cfg = AppConfig::try_from(args).unwrap();
        assert_eq!(cfg.download.max_sessions, 2);
        assert_eq!(cfg.download.speed_kbps, 50);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.bind_ip, IpAddr::from([0, 0, 0, 0]));
    }

    #[test]
    fn cli_rejects_zero_speed() {
        let args = CliArgs::parse_from([
            "throttled-serve",
            "--file",
            "/tmp/x.bin",
            "--speed-kbps",
            "0",
        ]);
        assert!(AppConfig::try_from(args).is_err());
    }
}
