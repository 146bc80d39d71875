fn main() {
    if let Err(err) = browser_relay::cli::run_browser_relay() {
        tracing::error!(error = %err, "browser-relay failed");
        std::process::exit(1);
    }
}
