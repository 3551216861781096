//! Deduplication of battery updates before they reach the sink.
//!
//! Polls and events both funnel through here. The publisher remembers the
//! last reading it forwarded per device identifier and swallows repeats
//! unless forced.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use hidpp::battery::BatteryReading;
use tokio::sync::Mutex;
use tracing::debug;

use crate::telemetry::{BatteryUpdate, TelemetrySink};

/// Where a reading came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateSource {
    Poll,
    Event,
}

impl UpdateSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Event => "event",
        }
    }
}

pub struct Publisher {
    sink: Arc<dyn TelemetrySink>,
    last: Mutex<HashMap<String, BatteryReading>>,
}

impl Publisher {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards a reading to the sink unless it equals the identifier's
    /// previous reading. First-ever readings and `force` always pass; the
    /// `-1` offline percentage is an ordinary publishable value.
    ///
    /// Returns whether an update was emitted.
    pub async fn publish(
        &self,
        identifier: &str,
        device_name: &str,
        reading: BatteryReading,
        when: SystemTime,
        source: UpdateSource,
        force: bool,
    ) -> bool {
        {
            let mut last = self.last.lock().await;
            match last.get(identifier) {
                Some(previous) if *previous == reading && !force => {
                    debug!(
                        identifier,
                        source = source.as_str(),
                        "suppressing duplicate battery update"
                    );
                    return false;
                },
                _ => {
                    last.insert(identifier.to_string(), reading);
                },
            }
        }

        let update_time = when
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        debug!(
            identifier,
            device_name,
            percentage = reading.percentage,
            status = reading.status.as_str(),
            source = source.as_str(),
            force,
            "publishing battery update"
        );

        self.sink
            .battery_update(BatteryUpdate {
                identifier: identifier.to_string(),
                battery_percentage: reading.percentage,
                power_supply_status: reading.status.as_str(),
                battery_millivolts: reading.millivolts,
                update_time,
                mileage: reading.percentage.max(0) as f64,
                is_wired_mode: None,
            })
            .await;

        true
    }

    /// Forgets the identifier's last reading, so the next one always
    /// publishes.
    pub async fn forget(&self, identifier: &str) {
        self.last.lock().await.remove(identifier);
    }
}

#[cfg(test)]
mod tests {
    use hidpp::battery::PowerStatus;

    use super::*;
    use crate::telemetry::RecordingSink;

    fn reading(percentage: i16) -> BatteryReading {
        BatteryReading {
            percentage,
            status: PowerStatus::Discharging,
            millivolts: -1,
        }
    }

    fn publisher() -> (Arc<RecordingSink>, Publisher) {
        let sink = Arc::new(RecordingSink::default());
        let publisher = Publisher::new(Arc::clone(&sink) as Arc<dyn TelemetrySink>);
        (sink, publisher)
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        let (sink, publisher) = publisher();
        let now = SystemTime::now();

        assert!(
            publisher
                .publish("dev", "Mouse", reading(85), now, UpdateSource::Poll, false)
                .await
        );
        assert!(
            !publisher
                .publish("dev", "Mouse", reading(85), now, UpdateSource::Poll, false)
                .await
        );
        assert!(
            publisher
                .publish("dev", "Mouse", reading(86), now, UpdateSource::Poll, false)
                .await
        );

        assert_eq!(sink.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn force_bypasses_deduplication() {
        let (sink, publisher) = publisher();
        let now = SystemTime::now();

        publisher
            .publish("dev", "Mouse", reading(85), now, UpdateSource::Poll, false)
            .await;
        assert!(
            publisher
                .publish("dev", "Mouse", reading(85), now, UpdateSource::Event, true)
                .await
        );

        assert_eq!(sink.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let (sink, publisher) = publisher();
        let now = SystemTime::now();

        assert!(
            publisher
                .publish("a", "Mouse", reading(50), now, UpdateSource::Poll, false)
                .await
        );
        assert!(
            publisher
                .publish("b", "Keys", reading(50), now, UpdateSource::Poll, false)
                .await
        );

        assert_eq!(sink.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn offline_sentinel_is_publishable() {
        let (sink, publisher) = publisher();
        let now = SystemTime::now();

        publisher
            .publish("dev", "Mouse", reading(40), now, UpdateSource::Poll, false)
            .await;
        assert!(
            publisher
                .publish(
                    "dev",
                    "Mouse",
                    BatteryReading::offline(),
                    now,
                    UpdateSource::Poll,
                    false
                )
                .await
        );

        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].battery_percentage, -1);
        assert_eq!(updates[1].mileage, 0.0);
    }
}
