mod cgi;
mod config;
mod error;
mod http;
mod server;
mod static_files;

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

use crate::config::Config;
use crate::error::ServerError;
use crate::server::Server;

const DEFAULT_CONFIG: &str = "config.toml";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGQUIT, handler);
        // Broken client sockets must surface as EPIPE write errors, not
        // kill the process.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run() -> Result<(), ServerError> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| String::from(DEFAULT_CONFIG));
    let config = Config::load(&config_path)?;
    info!("loaded configuration from {}", config_path);

    let mut server = Server::bind(config)?;
    server.run(&SHUTDOWN)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_signal_handlers();
    if let Err(e) = run() {
        error!("fatal: {}", e);
        process::exit(1);
    }
}
