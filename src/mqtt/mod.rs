pub mod config_sync;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::mqtt::config_sync::{apply_config_message, config_topic, topic_matches};

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// Everything the rest of the gateway hands to the broker goes through
/// this enum over one mpsc channel.
pub enum Transmission {
    Publish(PublishData),
}

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("MQTT_URL is not set")]
    MissingUrl,
    #[error("MQTT_URL is not usable: {0}")]
    BadUrl(String),
}

/* MQTT_URL looks like mqtt://broker.example:1883, the scheme and port
 * being optional */
fn parse_broker_url(url: &str) -> Result<(String, u16), MqttError> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MqttError::BadUrl(format!("bad port in {url}")))?;
            (host, port)
        }
        None => (rest, 1883),
    };

    if host.is_empty() {
        return Err(MqttError::BadUrl(format!("no host in {url}")));
    }
    Ok((host.to_string(), port))
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

impl MqttManager {
    /// Connects to the broker named by `MQTT_URL` and starts the
    /// eventloop task that keeps the config subscription alive and
    /// feeds inbound config updates into the store.
    pub fn new(store: Arc<ConfigStore>) -> Result<(Self, Sender<Transmission>), MqttError> {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        let url = env::var("MQTT_URL").map_err(|_| MqttError::MissingUrl)?;
        let (host, port) = parse_broker_url(&url)?;

        info!("MQTT connection starting up towards {host}:{port}");
        /* a fixed client id would collide with a crashed predecessor */
        let client_id = format!("meters2mqtt-{}", Uuid::new_v4());
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incoming side
        let subscribe_client = client.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            let mut active_filter = String::new();
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        /* the filter comes from the identity on disk at every
                         * connect, it is never re-derived mid session */
                        let filter = config_topic(&store.current_identity());
                        info!("Connected, subscribing to {filter}");
                        active_filter = filter.clone();

                        /* Move the subscription to it's own thread */
                        let client_clone = subscribe_client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client_clone.subscribe(filter, QoS::AtLeastOnce).await {
                                error!("Error subscribing to config: {e}");
                            }
                        });
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if !topic_matches(&active_filter, &p.topic) {
                            debug!("Ignoring message on unexpected topic {}", p.topic);
                            continue;
                        }
                        match apply_config_message(&store, &p.payload) {
                            Ok(identity) => {
                                info!(
                                    "meters.json updated from {} (site {:?}, gw {:?})",
                                    p.topic, identity.site, identity.gw
                                );
                            }
                            Err(e) => error!("Error applying config from {}: {e}", p.topic),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {e:?}, reconnecting");
                        /* failed polls return immediately, do not spin */
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((
            MqttManager {
                client,
                rx: mrx,
                exit_thread: false,
            },
            mtx,
        ))
    }

    /// Drain the Transmission channel and push everything to the broker.
    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let option = self.rx.recv().await;

            if option.is_none() {
                debug!("Reading returned none, we exit now");
                self.exit_thread = true;
                continue;
            }

            match option.unwrap() {
                Transmission::Publish(publish_data) => {
                    match self
                        .client
                        .publish(
                            publish_data.topic,
                            match publish_data.qos {
                                0 => QoS::AtMostOnce,
                                1 => QoS::AtLeastOnce,
                                2 => QoS::ExactlyOnce,
                                _ => QoS::AtMostOnce,
                            },
                            publish_data.retain,
                            publish_data.payload,
                        )
                        .await
                    {
                        Err(e) => error!("Error publishing: {e}"),
                        Ok(_) => debug!("Published successfully"),
                    }
                }
            }
        }

        info!("Thread exit, waiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_variants() {
        assert_eq!(
            parse_broker_url("mqtt://broker.example:1883").unwrap(),
            ("broker.example".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://10.1.2.3:8883").unwrap(),
            ("10.1.2.3".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("broker.example").unwrap(),
            ("broker.example".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.example").unwrap(),
            ("broker.example".to_string(), 1883)
        );
    }

    #[test]
    fn test_parse_broker_url_rejects_garbage() {
        assert!(matches!(
            parse_broker_url("mqtt://broker.example:notaport"),
            Err(MqttError::BadUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("mqtt://:1883"),
            Err(MqttError::BadUrl(_))
        ));
        assert!(matches!(parse_broker_url(""), Err(MqttError::BadUrl(_))));
    }
}
