mod audio;
mod protocol;
mod server;
mod session;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use audio::CpalSink;
use server::{Server, ServerConfig};

fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    if let Err(e) = run() {
        error!("Server error: {e:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = parse_args(std::env::args().skip(1))?;
    info!("Starting audio stream server...");

    let server = Server::new(config);
    server.run(|| Ok(CpalSink::new()))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--host" => config.host = take_value(&mut args, &flag)?,
            "--port" => config.port = parse_value(&mut args, &flag)?,
            "--prebuffer-ms" => config.jitter.prebuffer_ms = parse_value(&mut args, &flag)?,
            "--min-buffer-ms" => config.jitter.min_buffer_ms = parse_value(&mut args, &flag)?,
            "--max-buffer-ms" => config.jitter.max_buffer_ms = parse_value(&mut args, &flag)?,
            "--segment-seconds" => config.segment_secs = parse_value(&mut args, &flag)?,
            "--segment-dir" => config.segment_dir = PathBuf::from(take_value(&mut args, &flag)?),
            "--packet-log" => {
                config.packet_log = Some(PathBuf::from(take_value(&mut args, &flag)?))
            }
            "--no-packet-log" => config.packet_log = None,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => bail!("unknown flag: {other} (try --help)"),
        }
    }

    if config.jitter.min_buffer_ms >= config.jitter.max_buffer_ms {
        bail!("--min-buffer-ms must be below --max-buffer-ms");
    }
    Ok(config)
}

fn take_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn parse_value<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = take_value(args, flag)?;
    raw.parse()
        .with_context(|| format!("invalid value for {flag}: {raw}"))
}

fn print_usage() {
    println!(
        "\
audh-server - TCP audio stream receiver with jitter buffering

USAGE:
    audh-server [OPTIONS]

OPTIONS:
    --host <ADDR>            Listen address [default: 0.0.0.0]
    --port <PORT>            Listen port [default: 8888]
    --prebuffer-ms <MS>      Buffered audio required before playback [default: 300]
    --min-buffer-ms <MS>     Low watermark, drain pauses below [default: 40]
    --max-buffer-ms <MS>     High watermark, drain doubles above [default: 160]
    --segment-seconds <S>    WAV segment length [default: 5]
    --segment-dir <DIR>      Directory for WAV segments [default: .]
    --packet-log <PATH>      Per-frame CSV diagnostic log [default: packet_log.csv]
    --no-packet-log          Disable the CSV log
    -h, --help               Show this help"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8888);
        assert_eq!(config.jitter.prebuffer_ms, 300);
        assert!(config.packet_log.is_some());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--prebuffer-ms",
            "120",
            "--no-packet-log",
        ])
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.jitter.prebuffer_ms, 120);
        assert!(config.packet_log.is_none());
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        assert!(parse(&["--min-buffer-ms", "200", "--max-buffer-ms", "100"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_flag() {
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn test_missing_value_is_error() {
        assert!(parse(&["--port"]).is_err());
    }
}
