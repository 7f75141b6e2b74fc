//! OS signal and panic wiring into the shutdown request.

use tracing::{error, info, warn};

use super::shutdown::ShutdownSignal;
use crate::models::machine::ShutdownSource;

/// Listen for SIGINT and SIGTERM and turn the first one into an
/// `os-signal` shutdown request.
pub fn install_signal_handlers(signal: ShutdownSignal) {
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        info!(signal = name, "received termination signal");
        signal.request(ShutdownSource::OsSignal, format!("received {name}"));
    });
}

/// Route panics into an `exception` shutdown request, after the default
/// hook has printed the panic.
pub fn install_panic_hook(signal: ShutdownSignal) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        error!(%info, "panic in daemon");
        signal.request(ShutdownSource::Exception, format!("panic: {info}"));
    }));
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler");
            return match tokio::signal::ctrl_c().await {
                Ok(()) => "SIGINT",
                Err(_) => std::future::pending().await,
            };
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => "SIGINT",
            Err(err) => {
                warn!(%err, "failed to listen for SIGINT");
                term.recv().await;
                "SIGTERM"
            }
        },
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(err) => {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending().await
        }
    }
}
