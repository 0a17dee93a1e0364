use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Tracks repeated interrupts: the first asks for a graceful stop, any
/// further one forces an immediate exit.
#[derive(Debug)]
pub struct ShutdownController {
    interrupts: AtomicU8,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            interrupts: AtomicU8::new(0),
        }
    }

    pub fn bump(&self) -> u8 {
        self.interrupts.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownSignal>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if shutdown.bump() == 1 {
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
            } else {
                let _ = shutdown_tx.send(ShutdownSignal::Immediate);
                return;
            }
        }
    });
}
