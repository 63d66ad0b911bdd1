mod cli;
mod exit_codes;
mod run;
mod run_error;
mod scenario;
mod worker;

use clap::Parser;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match cli::Cli::try_parse() {
        Ok(v) => v,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    exit_codes::ExitCode::Success.as_i32()
                }
                _ => exit_codes::ExitCode::InvalidInput.as_i32(),
            };
            std::process::exit(code);
        }
    };

    init_tracing();

    let code = match cli.command {
        cli::Command::Run(args) => match run::run(args).await {
            Ok(code) => code.as_i32(),
            Err(err) => {
                eprintln!("{err}");
                err.exit_code().as_i32()
            }
        },
        cli::Command::Worker => match worker::serve().await {
            Ok(()) => exit_codes::ExitCode::Success.as_i32(),
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::ExitCode::RuntimeError.as_i32()
            }
        },
    };

    std::process::exit(code);
}
