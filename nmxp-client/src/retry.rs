use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Backoff, ClientConfig};
use crate::connection::Connection;
use crate::error::{ClientError, Result};

/// Handle for stopping retry loops, reconnecting clients and DAP pacing.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal every [`StopSignal`] made from this handle.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`StopHandle`].
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stopped. Pends forever if the handle is dropped without
    /// stopping.
    pub async fn stopped(&mut self) {
        let closed = self.rx.wait_for(|stopped| *stopped).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, or fail with `Stopped` as soon as the signal fires.
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.stopped() => Err(ClientError::Stopped),
        }
    }
}

/// Run `op` until it succeeds, sleeping per `backoff` between failures.
///
/// Errors that are not connection-fatal are returned immediately. The stop
/// signal is checked before each attempt and during every sleep.
pub async fn with_backoff<T, F, Fut>(backoff: &Backoff, stop: &mut StopSignal, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if stop.is_stopped() {
            return Err(ClientError::Stopped);
        }

        let result = tokio::select! {
            r = op(attempt) => r,
            _ = stop.stopped() => return Err(ClientError::Stopped),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_connection_fatal() => return Err(e),
            Err(e) => {
                if backoff.exhausted(attempt) {
                    warn!(attempt, error = %e, "giving up");
                    return Err(ClientError::ReconnectFailed { attempts: attempt });
                }
                warn!(attempt, error = %e, backoff_ms = delay.as_millis() as u64, "attempt failed, retrying");
                stop.sleep(delay).await?;
                delay = backoff.next_delay(delay);
            }
        }
    }
}

/// Open a TCP connection, retrying with the configured backoff.
pub async fn connect_with_retry(addr: &str, config: &ClientConfig, stop: &mut StopSignal) -> Result<Connection> {
    let conn = with_backoff(&config.backoff, stop, |attempt| {
        debug!(addr, attempt, "connecting");
        Connection::connect(addr, config.connect_timeout, config.read_timeout)
    })
    .await?;
    info!(addr, "connected");
    Ok(conn)
}
