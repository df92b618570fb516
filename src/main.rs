//! Scrim - X11 Compositing Manager
//!
//! Redirects every top-level window off-screen and paints the stack onto the
//! Composite overlay with OpenGL.

mod config;
mod error;
mod extensions;
mod overlay;
mod registry;
mod render;
mod server;
mod session;
mod x11_async;

use anyhow::{Result, bail};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session::Options;

const USAGE: &str = "\
Usage: scrim [OPTIONS]

Options:
  -c, --config <PATH>    Read configuration from PATH
  -d, --display <NAME>   X display to composite (defaults to $DISPLAY)
  -h, --help             Print this help";

enum Command {
    Run(Options),
    Help,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-c" | "--config" => match args.next() {
                Some(path) => options.config_path = Some(PathBuf::from(path)),
                None => bail!("{} requires a path", arg),
            },
            "-d" | "--display" => match args.next() {
                Some(name) => options.display = Some(name),
                None => bail!("{} requires a display name", arg),
            },
            other => bail!("unrecognized argument '{}'", other),
        }
    }

    Ok(Command::Run(options))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "scrim=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(options)) => options,
        Ok(Command::Help) => {
            println!("{}", USAGE);
            return;
        }
        Err(e) => {
            eprintln!("scrim: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    info!("Starting Scrim compositing manager");
    let code = session::run(options).await;
    std::process::exit(code);
}
