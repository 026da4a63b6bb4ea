use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc::Sender;

use crate::config::ConfigStore;
use crate::metering_modbus::transport::ModbusTcp;
use crate::metering_modbus::{read_all_meters, MeterConnector, PollError};
use crate::mqtt::{PublishData, Transmission};
use crate::now_iso8601;
use crate::templates::TemplateStore;

/// One message per meter and channel: identity, tick timestamp and the
/// decoded parameter values flattened alongside.
#[derive(Serialize)]
struct TelemetryPayload<'a> {
    site: &'a str,
    gw: &'a str,
    ts: &'a str,
    meter: &'a str,
    channel: &'a str,
    #[serde(flatten)]
    values: &'a serde_json::Map<String, serde_json::Value>,
}

/// Drives the fixed 1 second publish cadence.
pub struct TelemetryManager {
    store: Arc<ConfigStore>,
    templates: Arc<TemplateStore>,
    sender: Sender<Transmission>,
}

impl TelemetryManager {
    pub fn new(
        store: Arc<ConfigStore>,
        templates: Arc<TemplateStore>,
        sender: Sender<Transmission>,
    ) -> Self {
        TelemetryManager {
            store,
            templates,
            sender,
        }
    }

    pub async fn start_thread(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;

            /* each cycle runs detached so a slow meter cannot hold the
             * timer, cycles may overlap */
            let store = self.store.clone();
            let templates = self.templates.clone();
            let sender = self.sender.clone();
            tokio::spawn(async move {
                match run_tick(&ModbusTcp, &store, &templates, &sender).await {
                    Ok(count) if count > 0 => debug!("Publish cycle sent {count} messages"),
                    Ok(_) => {}
                    Err(e) => error!("Error in publish cycle: {e}"),
                }
            });
        }
    }
}

/// One complete poll-and-publish cycle. Returns how many messages were
/// handed to the MQTT manager.
pub async fn run_tick<C: MeterConnector>(
    connector: &C,
    store: &ConfigStore,
    templates: &TemplateStore,
    sender: &Sender<Transmission>,
) -> Result<usize, PollError> {
    /* every message of the cycle carries the moment the tick fired,
     * however long the poll below takes */
    let ts = now_iso8601();

    /* one snapshot drives the whole cycle, a config update that lands
     * mid-cycle only shows up in the next one */
    let Some(document) = store.read_current() else {
        debug!("Publish cycle skipped, no meter configuration yet");
        return Ok(0);
    };
    if document.meters.is_empty() {
        debug!("Publish cycle skipped, meter list is empty");
        return Ok(0);
    }

    let readings = read_all_meters(connector, &document, templates).await?;

    let topic = format!("data/{}/{}", document.site, document.gw);

    let mut published = 0;
    for reading in &readings {
        for channel in &reading.channels {
            let payload = TelemetryPayload {
                site: &document.site,
                gw: &document.gw,
                ts: &ts,
                meter: &reading.meter,
                channel: &channel.channel,
                values: &channel.values,
            };
            let message = PublishData {
                topic: topic.clone(),
                payload: serde_json::to_string(&payload).unwrap(),
                qos: 0,
                retain: false,
            };
            let _ = sender.send(Transmission::Publish(message)).await;
            published += 1;
        }
    }

    Ok(published)
}
