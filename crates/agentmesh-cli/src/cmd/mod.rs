pub mod demo;
pub mod endpoint;
pub mod server;

use tokio::sync::watch;

/// Build the multi-threaded runtime every async subcommand runs on.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    }
}

/// Flip the returned watch to `true` on the first Ctrl+C.
pub(crate) fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted.");
            let _ = tx.send(true);
        }
    });
    rx
}
