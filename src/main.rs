//! MirrorCryptFS - Transparent encrypting mirror filesystem
//!
//! Usage:
//!   mirrorcryptfs [--config PATH] [--verbose] <KEY_PHRASE> <MIRROR_DIR> <MOUNT_POINT>
//!                 [-o OPT[,OPT]...] [-f] [-d] [-s]

use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use mirrorcryptfs::{config::MountConfig, Config, Dispatcher, MirrorFs, MountSession};
use nix::sys::stat::{umask, Mode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mirrorcryptfs")]
#[command(version)]
#[command(about = "Mirror a directory through FUSE, encrypting flagged files at rest")]
struct Cli {
    /// Configuration file path (defaults to ~/.config/mirrorcryptfs/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Key phrase the content key is derived from
    key_phrase: String,

    /// Backing directory holding the stored files
    mirror_dir: PathBuf,

    /// Directory to mount the mirror on
    mount_point: PathBuf,

    /// Mount options, comma separated
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Stay in the foreground (always the case)
    #[arg(short = 'f')]
    foreground: bool,

    /// Debug output, same as --verbose
    #[arg(short = 'd')]
    debug: bool,

    /// Single-threaded request loop (always the case)
    #[arg(short = 's')]
    single_thread: bool,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose || cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let result = if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    if let Err(e) = result {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    // Modes passed by the kernel already have the caller's umask applied
    umask(Mode::empty());

    let session = MountSession::open(
        &cli.key_phrase,
        &cli.mirror_dir,
        &cli.mount_point,
        &config.encryption,
    )
    .with_context(|| format!("Failed to open mirror {:?}", cli.mirror_dir))?;

    if cli.foreground || cli.single_thread {
        debug!("-f/-s given; requests are always served in the foreground on one thread");
    }

    let mount_point = session.mount_root().to_path_buf();
    let options = mount_options(&config.mount, &cli.options);
    let ttl = Duration::from_secs(config.mount.attr_ttl_secs);

    let dispatcher = Dispatcher::new(Arc::new(session));
    let fs = MirrorFs::new(dispatcher, ttl);

    info!("Mounting at {:?}", mount_point);
    fuser::mount2(fs, &mount_point, &options)
        .with_context(|| format!("Failed to mount at {:?}", mount_point))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

/// Build the FUSE mount options from configuration plus `-o` flags
fn mount_options(config: &MountConfig, extra: &[String]) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype(config.fs_name.clone()),
    ];

    let mut allow_other = config.allow_other;
    let mut allow_root = config.allow_root;
    let mut auto_unmount = config.auto_unmount;

    for opt in extra.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        match opt {
            "allow_other" => allow_other = true,
            "allow_root" => allow_root = true,
            "auto_unmount" => auto_unmount = true,
            "ro" => options.push(MountOption::RO),
            "rw" => options.push(MountOption::RW),
            "default_permissions" => options.push(MountOption::DefaultPermissions),
            "dev" => options.push(MountOption::Dev),
            "nodev" => options.push(MountOption::NoDev),
            "suid" => options.push(MountOption::Suid),
            "nosuid" => options.push(MountOption::NoSuid),
            "exec" => options.push(MountOption::Exec),
            "noexec" => options.push(MountOption::NoExec),
            "atime" => options.push(MountOption::Atime),
            "noatime" => options.push(MountOption::NoAtime),
            "sync" => options.push(MountOption::Sync),
            "async" => options.push(MountOption::Async),
            other => options.push(MountOption::CUSTOM(other.to_string())),
        }
    }

    if allow_other && allow_root {
        warn!("allow_other and allow_root are exclusive, using allow_other");
        allow_root = false;
    }
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    if allow_root {
        options.push(MountOption::AllowRoot);
    }
    if auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_positionals_and_options() {
        let cli = Cli::try_parse_from([
            "mirrorcryptfs",
            "phrase",
            "/srv/mirror",
            "/mnt/plain",
            "-o",
            "ro,allow_other",
        ])
        .unwrap();

        assert_eq!(cli.key_phrase, "phrase");
        assert_eq!(cli.mirror_dir, PathBuf::from("/srv/mirror"));
        assert_eq!(cli.mount_point, PathBuf::from("/mnt/plain"));
        assert_eq!(cli.options, vec!["ro", "allow_other"]);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_accepts_fuse_flags() {
        let cli = Cli::try_parse_from([
            "mirrorcryptfs",
            "-f",
            "-s",
            "-d",
            "phrase",
            "/srv/mirror",
            "/mnt/plain",
        ])
        .unwrap();

        assert!(cli.foreground);
        assert!(cli.single_thread);
        assert!(cli.debug);
        assert!(cli.options.is_empty());
    }

    #[test]
    fn test_cli_fuse_flags_after_positionals() {
        let cli = Cli::try_parse_from([
            "mirrorcryptfs",
            "phrase",
            "/srv/mirror",
            "/mnt/plain",
            "-f",
            "-o",
            "ro",
        ])
        .unwrap();

        assert!(cli.foreground);
        assert!(!cli.debug);
        assert_eq!(cli.options, vec!["ro"]);
    }

    #[test]
    fn test_cli_requires_three_positionals() {
        assert!(Cli::try_parse_from(["mirrorcryptfs", "phrase", "/srv/mirror"]).is_err());
    }

    #[test]
    fn test_mount_options_defaults() {
        let options = mount_options(&MountConfig::default(), &[]);
        assert!(options.contains(&MountOption::FSName("mirrorcryptfs".to_string())));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(!options.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_mount_options_from_flags() {
        let extra = vec![
            "ro".to_string(),
            "allow_other".to_string(),
            "allow_root".to_string(),
            "max_read=4096".to_string(),
        ];
        let options = mount_options(&MountConfig::default(), &extra);

        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AllowRoot));
        assert!(options.contains(&MountOption::CUSTOM("max_read=4096".to_string())));
    }
}
