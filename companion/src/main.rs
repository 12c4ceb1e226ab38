use std::error::Error;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use shmem::{ControlChannel, Role, Session, SessionConfig, ShmemError};

const QUIT: &str = "quit";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "handoff-companion.toml")]
    config: String,
    /// Create the files instead of joining a host that already did.
    #[clap(long)]
    create: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct CompanionConfig {
    session: SessionConfig,
    request_offset: usize,
    reply_offset: usize,
}

impl Default for CompanionConfig {
    fn default() -> CompanionConfig {
        CompanionConfig {
            session: SessionConfig {
                create: false,
                role: Role::Companion,
                ..Default::default()
            },
            request_offset: 0,
            reply_offset: 2048,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let mut cfg: CompanionConfig = confy::load_path(&opts.config)?;
    if opts.create {
        cfg.session.create = true;
    }
    // Joining can block until the host yields, so watch signals from the start.
    watch_signals(&cfg.session)?;
    let mut session = Session::new(&cfg.session)?;
    if cfg.session.create {
        // Let the host write the first request.
        session.give_control(true)?;
    }
    run(&mut session, &cfg)
}

// A killed companion must not leave the host polling forever.
fn watch_signals(cfg: &SessionConfig) -> Result<(), Box<dyn Error>> {
    let path = cfg.shmem.control_path(&cfg.prefix);
    let mut signals = Signals::new(&[libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::info!(signal, "the process has been killed");
            release_host(&path);
            process::exit(0);
        }
    });
    Ok(())
}

fn release_host(control_path: &Path) {
    let marked = ControlChannel::attach(control_path).and_then(|mut control| control.mark_closed());
    if let Err(e) = marked {
        tracing::warn!(error = %e, "could not mark the session closed");
    }
}

fn run(session: &mut Session, cfg: &CompanionConfig) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut turns = 0u64;
    loop {
        let request = match session.read_string(cfg.request_offset) {
            Ok((v, _)) => v,
            Err(ShmemError::PeerGone) => {
                tracing::info!("host has left");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        turns += 1;
        if request == QUIT {
            tracing::info!("quit requested");
            session.close();
            break;
        }
        tracing::debug!(turn = turns, %request, "serving request");
        session.write_string(cfg.reply_offset, &format!("echo:{}", request))?;
        match session.give_control(true) {
            Ok(()) => {}
            Err(ShmemError::PeerGone) => {
                tracing::info!("host has left");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let duration = start.elapsed();
    println!("{} turns served. Total time: {:#?}", turns, duration);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn release_before_joining_frees_waiting_host() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let cfg = SessionConfig::new("echo", 64, true, Role::Host, 5.0).data_dir(dir.path());
        let mut host = Session::new(&cfg)?;
        host.give_control(false)?;

        release_host(&cfg.shmem.control_path(&cfg.prefix));
        assert!(matches!(host.read_i32(0), Err(ShmemError::PeerGone)));
        Ok(())
    }

    #[test]
    fn release_without_session_is_harmless() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        release_host(&dir.path().join("missing"));
        Ok(())
    }
}
