//! Run interruption (SIGINT / SIGTERM)

use tokio::sync::watch;

use crate::common::Result;

/// Exit status when a second signal cuts teardown short (128 + SIGINT)
pub const EXIT_SECOND_SIGNAL: i32 = 130;

/// Triggers an [`Interrupt`]
#[derive(Debug)]
pub struct InterruptHandle {
    tx: watch::Sender<bool>,
}

impl InterruptHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Signal telling the runner to stop after cleaning up the current test
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    pub fn channel() -> (InterruptHandle, Interrupt) {
        let (tx, rx) = watch::channel(false);
        (InterruptHandle { tx }, Interrupt { rx })
    }

    /// An interrupt that never fires
    pub fn never() -> Self {
        Self::channel().1
    }

    /// Interrupt triggered by SIGINT or SIGTERM (Ctrl-C off unix)
    ///
    /// The first signal triggers the interrupt so the running test can tear
    /// down; a second one exits the process immediately. Handlers are
    /// installed before this returns. Must be called from within a tokio
    /// runtime.
    pub fn from_signals() -> Result<Self> {
        let (handle, interrupt) = Self::channel();
        let signals = Signals::install()?;
        tokio::spawn(async move {
            let mut signals = signals;
            let first = signals.recv().await;
            tracing::warn!("{} received, running teardown before exit", first);
            handle.trigger();

            let second = signals.recv().await;
            tracing::error!("{} received again, exiting without teardown", second);
            std::process::exit(EXIT_SECOND_SIGNAL);
        });
        Ok(interrupt)
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until triggered; pends forever if the handle is gone
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Termination signals the runner reacts to
#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal, returning its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    }
}
