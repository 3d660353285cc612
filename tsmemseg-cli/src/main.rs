//! tsmemseg - segment an MPEG-TS stream from stdin into in-memory
//! segments exposed over named endpoints (or concatenated onto stdout).

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use tsmemseg_seg::runner::{run, RunnerConfig};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "tsmemseg")]
#[command(version)]
#[command(about = "Cut an MPEG-TS byte stream into independently playable media segments")]
#[command(long_about = "tsmemseg reads 188-byte MPEG-TS packets on stdin and exposes a \n\
    rolling window of segments through named pipes, with slot 00 serving \n\
    the live index. With the name \"-\" it writes one concatenated stream \n\
    to stdout instead.\n\n\
    EXAMPLES:\n    \
    tsmemseg -i 1 -t 2 live < input.ts\n    \
    tsmemseg -4 -t 2 -p 0.5 live < input.ts\n    \
    tsmemseg -4 - < input.ts > out.mp4")]
struct Args {
    /// Emit fragmented MP4 segments instead of TS passthrough
    #[arg(short = '4')]
    mp4: bool,

    /// Initial target segment duration in seconds (0 = first keyframe wins)
    #[arg(short = 'i', value_name = "sec", default_value_t = 0.0)]
    init_duration: f64,

    /// Steady-state target segment duration in seconds
    #[arg(short = 't', value_name = "sec", default_value_t = 2.0)]
    duration: f64,

    /// Target fragment duration inside a segment, in seconds (fMP4 only)
    #[arg(short = 'p', value_name = "sec", default_value_t = 0.0)]
    frag_duration: f64,

    /// Idle access timeout in seconds (0 disables)
    #[arg(short = 'a', value_name = "sec", default_value_t = 10.0)]
    access_timeout: f64,

    /// Shell command to run once when the idle timeout fires
    #[arg(short = 'c', value_name = "cmd")]
    closing_command: Option<String>,

    /// Steady read-rate in percent of real time (0 = unthrottled)
    #[arg(short = 'r', value_name = "pct", default_value_t = 0.0)]
    read_rate: f64,

    /// Read-rate in percent until the ring has filled (default 1.5x steady)
    #[arg(short = 'f', value_name = "pct")]
    fill_read_rate: Option<f64>,

    /// Segment ring size
    #[arg(short = 's', value_name = "num", default_value_t = 8)]
    seg_num: usize,

    /// Maximum kilobytes per segment
    #[arg(short = 'm', value_name = "KB", default_value_t = 4096)]
    seg_max_kbytes: usize,

    /// Log verbosely
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Endpoint base name ([0-9A-Za-z_], at most 64 chars), or "-" for
    /// stream mode on stdout
    #[arg(value_name = "seg_name")]
    name: String,
}

impl Args {
    /// Range and consistency checks beyond what clap enforces.
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=60.0).contains(&self.init_duration) {
            return Err("-i must be within 0..60 seconds".into());
        }
        if !(0.0..=60.0).contains(&self.duration) {
            return Err("-t must be within 0..60 seconds".into());
        }
        if !(0.0..=60.0).contains(&self.frag_duration) {
            return Err("-p must be within 0..60 seconds".into());
        }
        if !(0.0..=600.0).contains(&self.access_timeout) {
            return Err("-a must be within 0..600 seconds".into());
        }
        validate_rate(self.read_rate, "-r")?;
        if let Some(fill) = self.fill_read_rate {
            validate_rate(fill, "-f")?;
        }
        if self.seg_num < 2 || self.seg_num >= 100 {
            return Err("-s must be within 2..99".into());
        }
        if !(32..=32768).contains(&self.seg_max_kbytes) {
            return Err("-m must be within 32..32768 kilobytes".into());
        }
        if self.name != "-" {
            if self.name.is_empty() || self.name.len() > 64 {
                return Err("seg_name must be 1..64 characters".into());
            }
            if !self
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err("seg_name may only contain [0-9A-Za-z_]".into());
            }
        }
        Ok(())
    }

    fn to_config(&self) -> RunnerConfig {
        let read_rate_permille = (self.read_rate * 10.0) as u32;
        let fill_read_rate_permille = match self.fill_read_rate {
            Some(fill) => (fill * 10.0) as u32,
            None => read_rate_permille * 3 / 2,
        };
        RunnerConfig {
            mp4: self.mp4,
            target_duration_msec: (self.init_duration * 1000.0) as u32,
            next_target_duration_msec: (self.duration * 1000.0) as u32,
            target_frag_duration_msec: (self.frag_duration * 1000.0) as u32,
            access_timeout_msec: (self.access_timeout * 1000.0) as u32,
            closing_command: self.closing_command.clone(),
            read_rate_permille,
            fill_read_rate_permille,
            seg_num: self.seg_num,
            seg_max_bytes: self.seg_max_kbytes * 1024,
            name: self.name.clone(),
        }
    }
}

fn validate_rate(pct: f64, flag: &str) -> Result<(), String> {
    if pct == 0.0 || (100.0..=1000.0).contains(&pct) {
        Ok(())
    } else {
        Err(format!("{flag} must be 0 or within 100..1000 percent"))
    }
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments; help gets its own exit code.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 2,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(message) = args.validate() {
        anyhow::bail!("{message}");
    }

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = args.to_config();
    let stdin = std::io::stdin();
    run(config, stdin.lock()).context("segmenting failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["tsmemseg", "live"]);
        assert!(!args.mp4);
        assert_eq!(args.duration, 2.0);
        assert_eq!(args.seg_num, 8);
        assert_eq!(args.seg_max_kbytes, 4096);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_fill_rate_defaults_to_one_and_a_half() {
        let args = parse(&["tsmemseg", "-r", "200", "live"]);
        let config = args.to_config();
        assert_eq!(config.read_rate_permille, 2000);
        assert_eq!(config.fill_read_rate_permille, 3000);
    }

    #[test]
    fn test_stream_mode_name() {
        let args = parse(&["tsmemseg", "-4", "-"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.to_config().name, "-");
    }

    #[test]
    fn test_rejects_bad_name() {
        assert!(parse(&["tsmemseg", "bad name"]).validate().is_err());
        assert!(parse(&["tsmemseg", &"x".repeat(65)]).validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(parse(&["tsmemseg", "-t", "61", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-a", "601", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-s", "1", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-s", "100", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-m", "16", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-r", "50", "live"]).validate().is_err());
        assert!(parse(&["tsmemseg", "-r", "0", "live"]).validate().is_ok());
    }

    #[test]
    fn test_durations_to_millis() {
        let args = parse(&["tsmemseg", "-i", "1.5", "-t", "2", "-p", "0.5", "live"]);
        let config = args.to_config();
        assert_eq!(config.target_duration_msec, 1500);
        assert_eq!(config.next_target_duration_msec, 2000);
        assert_eq!(config.target_frag_duration_msec, 500);
    }
}
