use std::process::ExitCode;

use scunet::config::{parse_args, render_help, Invocation};
use scunet::dispatch::{dispatch, CandlePipeline};
use scunet::error::find_stop;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<ExitCode> {
    let cli = match parse_args(std::env::args_os()) {
        Ok(Invocation::Run(cli)) => cli,
        Ok(Invocation::Usage) => {
            eprintln!("{}", render_help());
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => err.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cfg!(debug_assertions) {
        eprintln!(
            "Warning: running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }

    match dispatch(cli.mode, &mut CandlePipeline) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => match find_stop(&err) {
            Some(stop) => {
                println!("{stop}");
                Ok(ExitCode::SUCCESS)
            }
            None => Err(err),
        },
    }
}
