//! `serve` command: accept firmware uploads over HTTP.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use fota::ota::{DEFAULT_CHUNK_SIZE, DEFAULT_RESTART_DELAY, UploadConfig};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::server::{Server, ServerOptions};
use crate::{Cli, CliError, INTERRUPTED, use_fancy_output, was_interrupted};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_FLASH_DIR: &str = "fota-flash";
const DEFAULT_SLOTS: u8 = 2;
const DEFAULT_SLOT_SIZE: u32 = 0x10_0000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Sleep between accept polls.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Options of the `serve` command.
#[derive(Debug, Default, Args)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "FOTA_BIND")]
    bind: Option<String>,

    /// Directory holding the OTA slot files.
    #[arg(long, env = "FOTA_FLASH_DIR")]
    dir: Option<PathBuf>,

    /// Number of OTA slots.
    #[arg(long, env = "FOTA_SLOTS")]
    slots: Option<u8>,

    /// Size of each slot (decimal or 0x-prefixed hex).
    #[arg(long, env = "FOTA_SLOT_SIZE", value_parser = parse_size)]
    slot_size: Option<u32>,

    /// Bytes per network read and flash write.
    #[arg(long, env = "FOTA_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Reject images whose project name differs from the running image.
    #[arg(long, env = "FOTA_CHECK_PROJECT_NAME")]
    check_project_name: bool,

    /// Keep running the old image after a successful update.
    #[arg(long, env = "FOTA_SKIP_REBOOT")]
    skip_reboot: bool,

    /// Delay between the response and the simulated restart.
    #[arg(long, value_name = "MS")]
    restart_delay_ms: Option<u64>,

    /// Abort an upload after this many seconds without body data.
    #[arg(long, value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// Exit after serving one connection.
    #[arg(long)]
    once: bool,
}

/// Parse a size given in decimal or with a 0x prefix.
fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let hex: String = hex.chars().filter(|c| *c != '_').collect();
        u32::from_str_radix(&hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("Invalid size '{s}': {e}"))
}

/// Effective server settings after merging flags, environment and config.
#[derive(Debug, Clone)]
struct ServeSettings {
    bind: String,
    once: bool,
    options: ServerOptions,
}

impl ServeSettings {
    fn resolve(args: &ServeArgs, config: &Config, show_progress: bool) -> Result<Self> {
        let chunk_size = args
            .chunk_size
            .or(config.update.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(CliError::Usage("chunk size must be non-zero".into()).into());
        }
        let slots = args.slots.or(config.flash.slots).unwrap_or(DEFAULT_SLOTS);
        if slots < 2 {
            return Err(CliError::Usage(format!(
                "at least 2 OTA slots are needed, got {slots}"
            ))
            .into());
        }

        let restart_delay = args
            .restart_delay_ms
            .or(config.update.restart_delay_ms)
            .map_or(DEFAULT_RESTART_DELAY, Duration::from_millis);
        let idle_timeout = args
            .idle_timeout_secs
            .or(config.server.idle_timeout_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

        Ok(Self {
            bind: args
                .bind
                .clone()
                .or_else(|| config.server.bind.clone())
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            once: args.once,
            options: ServerOptions {
                flash_dir: args
                    .dir
                    .clone()
                    .or_else(|| config.flash.dir.clone())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FLASH_DIR)),
                slots,
                slot_size: args
                    .slot_size
                    .or(config.flash.slot_size)
                    .unwrap_or(DEFAULT_SLOT_SIZE),
                upload: UploadConfig {
                    chunk_size,
                    check_project_name: args.check_project_name
                        || config.update.check_project_name,
                    restart_delay,
                },
                skip_reboot: args.skip_reboot || config.update.skip_reboot,
                idle_timeout: Duration::from_secs(idle_timeout),
                show_progress,
            },
        })
    }
}

/// Serve command implementation.
pub(crate) fn cmd_serve(cli: &Cli, config: &Config, args: &ServeArgs) -> Result<()> {
    let settings = ServeSettings::resolve(args, config, !cli.quiet && use_fancy_output())?;
    debug!("Serve settings: {settings:?}");

    let mut server = Server::new(settings.options.clone()).with_context(|| {
        format!(
            "Failed to open flash directory {}",
            settings.options.flash_dir.display()
        )
    })?;

    let listener = TcpListener::bind(&settings.bind)
        .with_context(|| format!("Failed to bind {}", settings.bind))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed))
        .context("Failed to install Ctrl-C handler")?;

    // Always printed: callers parse the address when binding to port 0.
    eprintln!(
        "{} Listening on http://{addr}",
        style("▶").green().bold()
    );
    if !cli.quiet {
        eprintln!(
            "  {} {} slots of {} bytes in {}",
            style("•").dim(),
            settings.options.slots,
            settings.options.slot_size,
            settings.options.flash_dir.display()
        );
    }
    info!("Listening on {addr}");

    while !was_interrupted() {
        let stream = match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Connection from {peer}");
                stream
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            },
            Err(e) => return Err(e).context("Failed to accept connection"),
        };
        stream.set_nonblocking(false)?;

        if let Err(e) = server.handle(stream) {
            warn!("Connection failed: {e}");
        }
        if settings.once {
            break;
        }
    }

    if was_interrupted() {
        return Err(CliError::Cancelled("interrupted, server stopped".into()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x100000"), Ok(0x10_0000));
        assert_eq!(parse_size("0X10_0000"), Ok(0x10_0000));
        assert!(parse_size("1M").is_err());
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = ServeSettings::resolve(&ServeArgs::default(), &Config::default(), false)
            .unwrap();
        assert_eq!(settings.bind, DEFAULT_BIND);
        assert!(!settings.once);
        assert_eq!(settings.options.flash_dir, PathBuf::from(DEFAULT_FLASH_DIR));
        assert_eq!(settings.options.slots, 2);
        assert_eq!(settings.options.slot_size, DEFAULT_SLOT_SIZE);
        assert_eq!(settings.options.upload.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.options.upload.restart_delay, DEFAULT_RESTART_DELAY);
        assert_eq!(settings.options.idle_timeout, Duration::from_secs(30));
        assert!(!settings.options.skip_reboot);
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        config.server.bind = Some("0.0.0.0:80".into());
        config.flash.slots = Some(3);
        config.update.chunk_size = Some(512);
        config.update.skip_reboot = true;

        let args = ServeArgs {
            bind: Some("127.0.0.1:0".into()),
            chunk_size: Some(1024),
            restart_delay_ms: Some(0),
            ..ServeArgs::default()
        };
        let settings = ServeSettings::resolve(&args, &config, false).unwrap();
        assert_eq!(settings.bind, "127.0.0.1:0");
        assert_eq!(settings.options.slots, 3);
        assert_eq!(settings.options.upload.chunk_size, 1024);
        assert_eq!(settings.options.upload.restart_delay, Duration::ZERO);
        assert!(settings.options.skip_reboot);
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        let args = ServeArgs {
            chunk_size: Some(0),
            ..ServeArgs::default()
        };
        let err = ServeSettings::resolve(&args, &Config::default(), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));

        let args = ServeArgs {
            slots: Some(1),
            ..ServeArgs::default()
        };
        assert!(ServeSettings::resolve(&args, &Config::default(), false).is_err());
    }
}
