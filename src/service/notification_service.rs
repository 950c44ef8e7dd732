// service/notification_service.rs
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{
    escrowmodel::{EscrowStatus, ObligationKind},
    paymentmodel::PaymentStatus,
    shiftmodel::ApplicationStatus,
};

/// Status changes surrounding collaborators (UI, mail, push) render and
/// forward to users.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SettlementEvent {
    ApplicationChanged {
        application_id: Uuid,
        shift_id: Uuid,
        professional_id: Uuid,
        status: ApplicationStatus,
    },
    PaymentChanged {
        payment_id: Uuid,
        application_id: Uuid,
        payer_id: Uuid,
        status: PaymentStatus,
    },
    EscrowChanged {
        escrow_id: Uuid,
        facility_id: Uuid,
        professional_id: Uuid,
        status: EscrowStatus,
    },
    ObligationFailed {
        obligation_id: Uuid,
        kind: ObligationKind,
        beneficiary_id: Uuid,
        error: String,
    },
    ManualActionRequired {
        obligation_id: Uuid,
        kind: ObligationKind,
        instructions: String,
    },
}

#[derive(Debug, Clone)]
pub struct NotificationService {
    sender: broadcast::Sender<SettlementEvent>,
}

impl NotificationService {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }

    /// Never fails the caller: an event nobody listens to is dropped.
    pub fn publish(&self, event: SettlementEvent) {
        tracing::debug!(?event, "settlement event");
        if self.sender.send(event).is_err() {
            tracing::trace!("no settlement event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let service = NotificationService::new(8);
        let mut rx = service.subscribe();
        let event = SettlementEvent::EscrowChanged {
            escrow_id: Uuid::new_v4(),
            facility_id: Uuid::new_v4(),
            professional_id: Uuid::new_v4(),
            status: EscrowStatus::Released,
        };
        service.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let service = NotificationService::new(1);
        service.publish(SettlementEvent::ObligationFailed {
            obligation_id: Uuid::new_v4(),
            kind: ObligationKind::Payout,
            beneficiary_id: Uuid::new_v4(),
            error: "timeout".into(),
        });
    }
}
