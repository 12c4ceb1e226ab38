use std::error::Error;
use std::process;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use shmem::{Role, Session, SessionConfig, ShmemConfig, ShmemError};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "handoff-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "rounds", default_value = "100000")]
    rounds: i32,
    /// Grow the data file every N rounds; 0 never resizes.
    #[clap(long = "resize-every", default_value = "0")]
    resize_every: i32,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    shmem: ShmemConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;

    let prefix = format!("handoff_bench{}", process::id());
    shmem::delete_files(&cfg.shmem, &prefix)?;
    let host_cfg = SessionConfig {
        shmem: cfg.shmem.clone(),
        ..SessionConfig::new(&prefix, 64, true, Role::Host, 30.0)
    };
    let companion_cfg = SessionConfig {
        create: false,
        role: Role::Companion,
        ..host_cfg.clone()
    };

    let mut host = Session::new(&host_cfg)?;
    let companion = thread::spawn(move || serve(&companion_cfg));
    let result = run(&mut host, &opts);
    host.delete();
    let served = companion.join().map_err(|_| "companion thread panicked")??;
    println!("[Companion] served {} requests.", served);
    result
}

fn serve(cfg: &SessionConfig) -> Result<u64, ShmemError> {
    let mut sm = Session::new(cfg)?;
    let mut served = 0u64;
    loop {
        let value = match sm.read_i32(0) {
            Ok((v, _)) => v,
            Err(ShmemError::PeerGone) => return Ok(served),
            Err(e) => return Err(e),
        };
        sm.write_i32(4, value.wrapping_add(1))?;
        served += 1;
        match sm.give_control(true) {
            Ok(()) => {}
            Err(ShmemError::PeerGone) => return Ok(served),
            Err(e) => return Err(e),
        }
    }
}

fn run(host: &mut Session, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    for round in 0..opts.rounds {
        if opts.resize_every > 0 && round > 0 && round % opts.resize_every == 0 {
            let grown = host.capacity() + 64;
            host.resize(grown)?;
        }
        host.write_i32(0, round)?;
        host.give_control(true)?;
        let (echo, _) = host.read_i32(4)?;
        if echo != round.wrapping_add(1) {
            return Err(format!("round {}: companion answered {}", round, echo).into());
        }
        if round % 10_000 == 0 {
            eprint!("\rTotal {} round trips (generation {})", round, host.generation());
        }
    }
    let duration = start.elapsed();
    let rate = (opts.rounds as f64) / duration.as_secs_f64();
    println!(
        "\n{:#?}K round trips/s. Total time: {:#?}",
        (rate / 1000f64) as u64,
        duration
    );
    Ok(())
}
