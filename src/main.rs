use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: mailferry <config.toml>");
        return ExitCode::from(2);
    };

    mailferry::init_tracing();

    match mailferry::run(&PathBuf::from(path)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(code = e.code(), "{}", e);
            ExitCode::FAILURE
        }
    }
}
