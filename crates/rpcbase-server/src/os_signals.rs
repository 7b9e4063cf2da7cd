//! OS termination signal watcher.
//!
//! SIGINT, SIGTERM and SIGQUIT all map to the same action: request a stop.
//! Each signal stream forwards into a small bounded queue so several
//! near-simultaneous signals are absorbed without blocking delivery; the
//! first one dequeued fires the stop request.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::completion::Completion;

/// Capacity of the signal queue.
pub const STOP_SIGNAL_BUFFER: usize = 3;

/// Install handlers and spawn the watcher.
///
/// Handlers are registered before this returns, so a signal delivered
/// afterwards is never lost to the default disposition. The returned task
/// ends once a stop has been requested from any source.
pub fn spawn_signal_watcher(stop: Completion) -> std::io::Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel::<&'static str>(STOP_SIGNAL_BUFFER);

    install(&tx, &stop)?;
    drop(tx);

    Ok(tokio::spawn(async move {
        tokio::select! {
            Some(name) = rx.recv() => {
                info!(signal = name, "received stop signal");
                stop.fire();
            }
            _ = stop.wait() => {
                debug!("signal watcher exiting, stop already requested");
            }
        }
    }))
}

#[cfg(unix)]
fn install(tx: &mpsc::Sender<&'static str>, stop: &Completion) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::quit(), "SIGQUIT"),
    ];

    for (kind, name) in kinds {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        let stop = stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = stream.recv() => match received {
                        // A full queue already holds a pending stop.
                        Some(()) => { let _ = tx.try_send(name); }
                        None => break,
                    },
                    _ = stop.wait() => break,
                }
            }
        });
    }

    Ok(())
}

#[cfg(not(unix))]
fn install(tx: &mpsc::Sender<&'static str>, stop: &Completion) -> std::io::Result<()> {
    let tx = tx.clone();
    let stop = stop.clone();

    tokio::spawn(async move {
        tokio::select! {
            received = tokio::signal::ctrl_c() => {
                if received.is_ok() {
                    let _ = tx.try_send("ctrl-c");
                }
            }
            _ = stop.wait() => {}
        }
    });

    Ok(())
}
