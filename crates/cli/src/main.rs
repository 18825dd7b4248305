use std::process::ExitCode;

fn main() -> ExitCode {
    stagewise_cli::run()
}
