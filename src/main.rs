use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil::{Config, DefaultHandler, Reactor};

/// shared with the SIGINT handler, which may not touch anything else
static RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(flag) = RUNNING.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

fn parse_args() -> Result<PathBuf, lexopt::Error> {
    let mut config_path: Option<PathBuf> = None;
    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            lexopt::Arg::Value(value) if config_path.is_none() => {
                config_path = Some(PathBuf::from(value));
            }
            lexopt::Arg::Short('h') | lexopt::Arg::Long("help") => {
                println!("Usage: vigil <config.toml>");
                std::process::exit(0);
            }
            arg => return Err(arg.unexpected()),
        }
    }
    config_path.ok_or_else(|| lexopt::Error::MissingValue {
        option: Some("config file path".to_string()),
    })
}

fn main() -> eyre::Result<()> {
    setup_tracing();

    let config_path = parse_args().map_err(|e| eyre::eyre!("{e}\nUsage: vigil <config.toml>"))?;
    let config = Config::load(&config_path)?;

    let mut reactor = Reactor::new(config, DefaultHandler)?;

    RUNNING
        .set(reactor.running_flag())
        .expect("running flag set twice");
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    // a poll failure surfaces here and becomes a non-zero exit code
    reactor.run()?;
    info!("clean shutdown");
    Ok(())
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
