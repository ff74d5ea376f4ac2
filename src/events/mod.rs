use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Events emitted by the payment core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    SubscriptionPaymentRequested {
        order_id: String,
        user_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    SubscriptionActivated {
        order_id: String,
        user_id: Uuid,
        due_at: DateTime<Utc>,
    },
    SubscriptionPaymentFailed {
        order_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Drains the event channel, logging each event. Runs until every sender
/// is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match &event {
            Event::SubscriptionPaymentRequested {
                order_id,
                user_id,
                amount,
                currency,
            } => {
                info!(%order_id, %user_id, %amount, %currency, "subscription payment requested");
            }
            Event::SubscriptionActivated {
                order_id,
                user_id,
                due_at,
            } => {
                info!(%order_id, %user_id, %due_at, "subscription activated");
            }
            Event::SubscriptionPaymentFailed { order_id, reason } => {
                info!(%order_id, %reason, "subscription payment failed");
            }
        }
    }
    info!("Event channel closed; processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        sender
            .send(Event::SubscriptionPaymentRequested {
                order_id: "SUB-1".into(),
                user_id: Uuid::new_v4(),
                amount: dec!(299),
                currency: "TWD".into(),
            })
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Event::SubscriptionPaymentRequested { .. })
        ));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        let result = sender
            .send(Event::SubscriptionPaymentFailed {
                order_id: "SUB-2".into(),
                reason: "declined".into(),
            })
            .await;
        assert!(result.is_err());
    }
}
