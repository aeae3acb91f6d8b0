use std::process::ExitCode;

fn main() -> ExitCode {
    marshal::core::logging::init();
    match marshal::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            println!("{}", marshal::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
