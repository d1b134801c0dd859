use clap::Parser;

use gatehouse::{CliArgs, cli, telemetry};

#[tokio::main]
async fn main() {
    telemetry::init();
    let args = CliArgs::parse();
    match cli::run(args).await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
