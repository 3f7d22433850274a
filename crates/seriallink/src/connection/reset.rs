//! Control-signal reset handshake
//!
//! Many boards wire their reset pin to DTR or RTS through a capacitor, so
//! pulsing both lines high, low and high again reboots the device into a
//! clean session. The sequence runs as its own task and can be cancelled at
//! any point; once cancelled no further phase runs and the ready callback
//! never fires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{ConnectionId, ControlSignals, SerialTransport};

/// Delay between control-signal phases
pub const RESET_PULSE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPhase {
    PulseHigh,
    PulseLow,
    PulseHighAgain,
    Done,
}

impl ResetPhase {
    const SEQUENCE: [ResetPhase; 3] = [
        ResetPhase::PulseHigh,
        ResetPhase::PulseLow,
        ResetPhase::PulseHighAgain,
    ];

    /// Line levels driven in this phase
    pub fn signals(self) -> Option<ControlSignals> {
        match self {
            ResetPhase::PulseHigh | ResetPhase::PulseHighAgain => Some(ControlSignals::ASSERTED),
            ResetPhase::PulseLow => Some(ControlSignals::DEASSERTED),
            ResetPhase::Done => None,
        }
    }
}

/// Handle to a running reset sequence
pub struct ResetSequence {
    token: CancellationToken,
    phase: Arc<Mutex<ResetPhase>>,
    task: JoinHandle<()>,
}

impl ResetSequence {
    /// Spawn the sequence for `id`
    ///
    /// `on_signal_failure` is called for a control-signal command that failed
    /// or was not acknowledged; the sequence carries on regardless.
    /// `on_ready` runs once after the last phase unless cancelled first.
    pub fn start<F, R>(
        transport: Arc<dyn SerialTransport>,
        id: ConnectionId,
        on_signal_failure: F,
        on_ready: R,
    ) -> Self
    where
        F: Fn(ResetPhase, String) + Send + Sync + 'static,
        R: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let phase = Arc::new(Mutex::new(ResetPhase::PulseHigh));

        let task = tokio::spawn(run_sequence(
            transport,
            id,
            token.clone(),
            phase.clone(),
            on_signal_failure,
            on_ready,
        ));

        Self { token, phase, task }
    }

    /// Stop the sequence; no phase starts and `on_ready` is not called afterwards
    pub fn cancel(&self) {
        self.token.cancel();
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Last phase that was started
    pub fn phase(&self) -> ResetPhase {
        *self.phase.lock()
    }
}

impl Drop for ResetSequence {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_sequence<F, R>(
    transport: Arc<dyn SerialTransport>,
    id: ConnectionId,
    token: CancellationToken,
    phase: Arc<Mutex<ResetPhase>>,
    on_signal_failure: F,
    on_ready: R,
) where
    F: Fn(ResetPhase, String) + Send + Sync + 'static,
    R: FnOnce() + Send + 'static,
{
    for (step, next) in ResetPhase::SEQUENCE.into_iter().enumerate() {
        if step > 0 {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RESET_PULSE) => {}
            }
        }
        if token.is_cancelled() {
            return;
        }

        *phase.lock() = next;
        let Some(signals) = next.signals() else {
            continue;
        };
        debug!(%id, ?next, dtr = signals.dtr, rts = signals.rts, "Reset sequence phase");

        match transport.set_control_signals(id, signals).await {
            Ok(true) => {}
            Ok(false) => on_signal_failure(next, "control signals not acknowledged".to_string()),
            Err(e) => on_signal_failure(next, e.to_string()),
        }
    }

    if token.is_cancelled() {
        return;
    }
    *phase.lock() = ResetPhase::Done;
    on_ready();
}
