//! Control channels between the supervisor and a session driver.
//!
//! Cancellation propagates through a token every suspension point observes;
//! pause is a watch the driver samples at phase boundaries only (the
//! in-flight phase always runs to completion or timeout); feedback arrives
//! on a small mpsc the driver blocks on while a session waits for HITL.

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const FEEDBACK_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
}

/// One HITL decision for a phase awaiting feedback.
#[derive(Debug, Clone)]
pub struct FeedbackDecision {
    pub phase: u8,
    pub approved: bool,
    pub payload: Value,
}

/// Supervisor-side handle to a running driver.
pub struct SessionControl {
    pub cancel: CancellationToken,
    pub pause: watch::Sender<ControlState>,
    pub feedback: mpsc::Sender<FeedbackDecision>,
}

/// Driver-side ends of the control channels.
pub struct DriverSignals {
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<ControlState>,
    pub feedback: mpsc::Receiver<FeedbackDecision>,
}

impl DriverSignals {
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow() == ControlState::Paused
    }
}

/// Build a linked control/signal pair for one driver run.
pub fn control_pair() -> (SessionControl, DriverSignals) {
    let cancel = CancellationToken::new();
    let (pause_tx, pause_rx) = watch::channel(ControlState::Running);
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CHANNEL_CAPACITY);
    (
        SessionControl {
            cancel: cancel.clone(),
            pause: pause_tx,
            feedback: feedback_tx,
        },
        DriverSignals {
            cancel,
            pause: pause_rx,
            feedback: feedback_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_state_is_observable() {
        let (control, signals) = control_pair();
        assert!(!signals.is_paused());
        control.pause.send(ControlState::Paused).unwrap();
        assert!(signals.is_paused());
        control.pause.send(ControlState::Running).unwrap();
        assert!(!signals.is_paused());
    }

    #[tokio::test]
    async fn feedback_flows_to_the_driver_side() {
        let (control, mut signals) = control_pair();
        control
            .feedback
            .send(FeedbackDecision {
                phase: 4,
                approved: false,
                payload: serde_json::json!({"note": "tighter panels"}),
            })
            .await
            .unwrap();
        let decision = signals.feedback.recv().await.unwrap();
        assert_eq!(decision.phase, 4);
        assert!(!decision.approved);
    }

    #[test]
    fn cancellation_is_shared() {
        let (control, signals) = control_pair();
        control.cancel.cancel();
        assert!(signals.cancel.is_cancelled());
    }
}
