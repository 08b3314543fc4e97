//! Billing events published once per committed transaction.
//!
//! A cascade (meter advance plus every ledger it touched) is summarized in a single
//! event, so change-audit subscribers see one entry per operator action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;
use wattbill_core::{AccountNumber, Bill, BillAllocation, LedgerKey, Period, TechnologyLedger};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillAcceptedEvent {
    pub bill: Bill,
    pub allocations: Vec<BillAllocation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillReversedEvent {
    pub bill: Bill,
    pub allocations: Vec<BillAllocation>,
    pub removed_ledgers: Vec<LedgerKey>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeRecordedEvent {
    pub ledger: TechnologyLedger,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupNormalizedEvent {
    pub account: AccountNumber,
    pub period: Period,
    pub ledgers: Vec<TechnologyLedger>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BillingEvent {
    BillAccepted(BillAcceptedEvent),
    BillReversed(BillReversedEvent),
    VolumeRecorded(VolumeRecordedEvent),
    GroupNormalized(GroupNormalizedEvent),
}

impl BillingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingEvent::BillAccepted(_) => "bill_accepted",
            BillingEvent::BillReversed(_) => "bill_reversed",
            BillingEvent::VolumeRecorded(_) => "volume_recorded",
            BillingEvent::GroupNormalized(_) => "group_normalized",
        }
    }
}

/// Event stamped with an id and commit time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub committed_at: DateTime<Utc>,
    pub event: BillingEvent,
}

pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event; dropped silently when nobody is subscribed.
    pub fn publish(&self, event: BillingEvent) {
        let _ = self.sender.send(EventEnvelope {
            id: Uuid::new_v4(),
            committed_at: Utc::now(),
            event,
        });
    }
}

pub struct EventStream {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Result<EventEnvelope, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<EventEnvelope, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wattbill_core::{Allocation, StationId, TechnologyId};

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        let period = Period::new(5, 2024).unwrap();
        let mut ledger = TechnologyLedger::empty(
            LedgerKey::new(StationId(1), TechnologyId(2), period),
            Allocation::Unsplit,
        );
        ledger.water_amount = Some(dec!(30));
        bus.publish(BillingEvent::VolumeRecorded(VolumeRecordedEvent { ledger }));

        let envelope = stream.try_recv().unwrap();
        assert_eq!(envelope.event.kind(), "volume_recorded");
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new(1);
        bus.publish(BillingEvent::GroupNormalized(GroupNormalizedEvent {
            account: "ACC".into(),
            period: Period::new(1, 2024).unwrap(),
            ledgers: Vec::new(),
        }));
    }
}
