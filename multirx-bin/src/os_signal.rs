use tokio_util::sync::CancellationToken;
use tracing::warn;

static CANCEL: tokio::sync::OnceCell<CancellationToken> = tokio::sync::OnceCell::const_new();

pub struct Quit(CancellationToken);

impl Quit {
    /// Returns when the program has been asked to quit by the OS.
    pub async fn quit(&self) {
        self.0.cancelled().await
    }
}

pub async fn quit_watch() -> Quit {
    let cancel = CANCEL
        .get_or_init(|| async move {
            let cancel = CancellationToken::new();
            #[cfg(unix)]
            {
                use tokio::signal::unix::SignalKind;

                forward(&cancel, "SIGINT", SignalKind::interrupt());
                forward(&cancel, "SIGHUP", SignalKind::hangup());
                forward(&cancel, "SIGTERM", SignalKind::terminate());
                forward(&cancel, "SIGQUIT", SignalKind::quit());
            }
            #[cfg(windows)]
            {
                use tokio::signal::windows;

                // ctrl-c
                let cancel_tx = cancel.clone();
                match windows::ctrl_c() {
                    Ok(mut sig) => {
                        tokio::spawn(async move {
                            sig.recv().await;
                            cancel_tx.cancel();
                        });
                    }
                    Err(e) => warn!("Couldn't register ctrl-c handler: {}", e),
                }

                // ctrl-break
                let cancel_tx = cancel.clone();
                match windows::ctrl_break() {
                    Ok(mut sig) => {
                        tokio::spawn(async move {
                            sig.recv().await;
                            cancel_tx.cancel();
                        });
                    }
                    Err(e) => warn!("Couldn't register ctrl-break handler: {}", e),
                }
            }
            cancel
        })
        .await;
    let cancel = cancel.clone();

    Quit(cancel)
}

#[cfg(unix)]
fn forward(cancel: &CancellationToken, name: &'static str, kind: tokio::signal::unix::SignalKind) {
    let cancel_tx = cancel.clone();
    match tokio::signal::unix::signal(kind) {
        Ok(mut sig) => {
            tokio::spawn(async move {
                sig.recv().await;
                tracing::info!("Received {}, stopping", name);
                cancel_tx.cancel();
            });
        }
        Err(e) => warn!("Couldn't register {} handler: {}", name, e),
    }
}
