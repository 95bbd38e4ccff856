use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Where a payment confirmation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// Client called the verify endpoint after completing payment
    ClientVerification,
    /// Gateway webhook delivery
    Webhook,
    /// Order total was zero after discount
    ZeroAmount,
}

// Domain events published after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartMerged {
        user_id: Uuid,
        lines_merged: usize,
    },
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total_amount: Decimal,
    },
    PaymentConfirmed {
        order_id: Uuid,
        payment_id: String,
        source: ConfirmationSource,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    CouponRedeemed {
        code: String,
        order_id: Uuid,
    },
    WebhookReceived {
        event: String,
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

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentConfirmed {
                order_id,
                payment_id,
                source,
            } => info!(
                %order_id,
                payment_id = %payment_id,
                source = ?source,
                "payment confirmed"
            ),
            Event::PaymentFailed { order_id, reason } => {
                warn!(%order_id, reason = %reason, "payment failed")
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, from = %old_status, to = %new_status, "order status changed"),
            other => info!("Received event: {:?}", other),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender
            .send(Event::PaymentFailed {
                order_id,
                reason: "coupon exhausted".into(),
            })
            .await
            .unwrap();

        match rx.recv().await {
            Some(Event::PaymentFailed { order_id: got, .. }) => assert_eq!(got, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::WebhookReceived {
                event: "payment.captured".into()
            })
            .await
            .is_err());
        // Must not panic
        sender
            .send_or_log(Event::WebhookReceived {
                event: "payment.captured".into(),
            })
            .await;
    }
}
