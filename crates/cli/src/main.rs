fn main() {
    jobrow_cli::init_tracing();

    if let Err(error) = jobrow_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
