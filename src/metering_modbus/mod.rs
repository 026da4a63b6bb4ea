use log::debug;
use thiserror::Error;

use crate::config::{ConfigDocument, MeterConfig};
use crate::registers::{self, DecodeError};
use crate::templates::{TemplateError, TemplateStore};

pub mod transport;

/// Decoded values of one meter channel, keyed by parameter name.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub channel: String,
    pub values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub meter: String,
    pub channels: Vec<ChannelReading>,
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("could not build modbus request for {addr}: {kind:?}")]
    Request { addr: String, kind: rmodbus::ErrorKind },
    #[error("i/o error talking to {addr}: {source}")]
    Io {
        addr: String,
        source: std::io::Error,
    },
    #[error("malformed response from {addr}: {kind:?}")]
    Frame { addr: String, kind: rmodbus::ErrorKind },
    #[error("no usable template for meter {meter}: {source}")]
    Template {
        meter: String,
        source: TemplateError,
    },
    #[error("could not decode {param} from meter {meter}: {source}")]
    Decode {
        meter: String,
        param: String,
        source: DecodeError,
    },
}

/// A live connection that can serve holding register reads. `address`
/// is already 0-based here.
#[allow(async_fn_in_trait)]
pub trait RegisterSource {
    async fn read_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollError>;

    /// Release the connection. Failures are swallowed, the peer may
    /// already be gone.
    async fn close(&mut self);
}

#[allow(async_fn_in_trait)]
pub trait MeterConnector {
    type Source: RegisterSource;

    async fn connect(&self, ip: &str, port: u16) -> Result<Self::Source, PollError>;
}

/// Read every configured meter once, strictly in document order over
/// one fresh connection each. Any failure makes the whole cycle fail:
/// readings collected from earlier meters are thrown away and the
/// error of the failing meter comes back instead.
pub async fn read_all_meters<C: MeterConnector>(
    connector: &C,
    document: &ConfigDocument,
    templates: &TemplateStore,
) -> Result<Vec<MeterReading>, PollError> {
    let mut results = Vec::new();

    for meter in &document.meters {
        let mut source = connector.connect(&meter.ip, meter.port).await?;

        /* whatever happened during the read, the connection is released
         * before the next meter is touched or the error goes up */
        let read = read_meter(&mut source, meter, templates).await;
        source.close().await;
        results.push(read?);
    }

    Ok(results)
}

async fn read_meter<S: RegisterSource>(
    source: &mut S,
    meter: &MeterConfig,
    templates: &TemplateStore,
) -> Result<MeterReading, PollError> {
    let template = templates
        .resolve(&meter.model)
        .map_err(|source| PollError::Template {
            meter: meter.meter.clone(),
            source,
        })?;

    debug!(
        "Reading meter {} (model {}, {} channels)",
        meter.meter,
        meter.model,
        template.channels.len()
    );

    let mut channels = Vec::new();
    for ch in &template.channels {
        let mut values = serde_json::Map::new();
        for param in &ch.params {
            /* template loading rejects address 0, the subtraction cannot wrap */
            let words = source
                .read_registers(meter.unit_id, param.address - 1, param.reg_type.word_count())
                .await?;
            let value = registers::decode(&words, param.reg_type, template.endianness).map_err(
                |source| PollError::Decode {
                    meter: meter.meter.clone(),
                    param: param.name.clone(),
                    source,
                },
            )?;
            values.insert(param.name.clone(), value.into());
        }
        channels.push(ChannelReading {
            channel: ch.channel.clone(),
            values,
        });
    }

    Ok(MeterReading {
        meter: meter.meter.clone(),
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Shared scripted network: queued register words are served in
    /// order, every read and close is recorded.
    #[derive(Default)]
    struct StubNet {
        words: VecDeque<Vec<u16>>,
        reads: Vec<(u8, u16, u16)>,
        closed: usize,
        refuse: HashSet<String>,
    }

    #[derive(Clone)]
    struct StubConnector(Arc<Mutex<StubNet>>);

    struct StubSource(Arc<Mutex<StubNet>>);

    impl StubConnector {
        fn new() -> Self {
            StubConnector(Arc::new(Mutex::new(StubNet::default())))
        }
    }

    impl MeterConnector for StubConnector {
        type Source = StubSource;

        async fn connect(&self, ip: &str, port: u16) -> Result<StubSource, PollError> {
            let addr = format!("{ip}:{port}");
            if self.0.lock().unwrap().refuse.contains(&addr) {
                return Err(PollError::Connect {
                    addr,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(StubSource(self.0.clone()))
        }
    }

    impl RegisterSource for StubSource {
        async fn read_registers(
            &mut self,
            unit_id: u8,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, PollError> {
            let mut net = self.0.lock().unwrap();
            net.reads.push((unit_id, address, count));
            net.words.pop_front().ok_or_else(|| PollError::Io {
                addr: "stub".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            })
        }

        async fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    fn meter(name: &str, ip: &str, unit_id: u8, model: &str) -> MeterConfig {
        MeterConfig {
            meter: name.to_string(),
            ip: ip.to_string(),
            port: 502,
            unit_id,
            model: model.to_string(),
        }
    }

    fn document(meters: Vec<MeterConfig>) -> ConfigDocument {
        ConfigDocument {
            site: "plant-a".to_string(),
            gw: "gw-7".to_string(),
            meters,
        }
    }

    fn templates_with(dir: &tempfile::TempDir, model: &str, body: &str) -> TemplateStore {
        let root = dir.path().join("defs");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(format!("{model}.json")), body).unwrap();
        TemplateStore::with_roots(dir.path().join("user"), root)
    }

    #[tokio::test]
    async fn test_reads_params_in_template_order() {
        let dir = tempdir().unwrap();
        let templates = templates_with(
            &dir,
            "acme-300",
            r#"{ "endianness": "LE", "channels": [
                { "channel": "1", "params": [
                    { "name": "voltage", "address": 1, "type": "Float32" },
                    { "name": "energy_import", "address": 13, "type": "UInt32" }
                ]}
            ]}"#,
        );

        let connector = StubConnector::new();
        {
            let mut net = connector.0.lock().unwrap();
            /* 123.456f32 little endian word order, then 0x0001_0002 */
            net.words.push_back(vec![0xE979, 0x42F6]);
            net.words.push_back(vec![0x0002, 0x0001]);
        }

        let doc = document(vec![meter("m1", "10.0.0.8", 7, "acme-300")]);
        let readings = read_all_meters(&connector, &doc, &templates).await.unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].meter, "m1");
        assert_eq!(readings[0].channels.len(), 1);
        let ch = &readings[0].channels[0];
        assert_eq!(ch.channel, "1");
        assert!((ch.values["voltage"].as_f64().unwrap() - 123.456).abs() < 0.001);
        assert_eq!(ch.values["energy_import"], serde_json::json!(65538));

        let net = connector.0.lock().unwrap();
        /* template addresses are 1-based, the wire is 0-based */
        assert_eq!(net.reads, vec![(7, 0, 2), (7, 12, 2)]);
        assert_eq!(net.closed, 1);
    }

    #[tokio::test]
    async fn test_every_channel_gets_its_own_reading() {
        let dir = tempdir().unwrap();
        let templates = templates_with(
            &dir,
            "triple",
            r#"{ "channels": [
                { "channel": "1", "params": [ { "name": "p", "address": 1, "type": "Int16" } ] },
                { "channel": "2", "params": [ { "name": "p", "address": 101, "type": "Int16" } ] },
                { "channel": "3", "params": [ { "name": "p", "address": 201, "type": "Int16" } ] }
            ]}"#,
        );

        let connector = StubConnector::new();
        {
            let mut net = connector.0.lock().unwrap();
            net.words.push_back(vec![11]);
            net.words.push_back(vec![22]);
            net.words.push_back(vec![33]);
        }

        let doc = document(vec![meter("m1", "10.0.0.8", 1, "triple")]);
        let readings = read_all_meters(&connector, &doc, &templates).await.unwrap();

        let channels = &readings[0].channels;
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].values["p"], serde_json::json!(11));
        assert_eq!(channels[1].values["p"], serde_json::json!(22));
        assert_eq!(channels[2].values["p"], serde_json::json!(33));

        let net = connector.0.lock().unwrap();
        assert_eq!(net.reads, vec![(1, 0, 1), (1, 100, 1), (1, 200, 1)]);
    }

    #[tokio::test]
    async fn test_one_bad_meter_fails_the_whole_cycle() {
        let dir = tempdir().unwrap();
        let templates = templates_with(
            &dir,
            "acme-300",
            r#"{ "channels": [
                { "channel": "1", "params": [ { "name": "v", "address": 1, "type": "Int16" } ] }
            ]}"#,
        );

        let connector = StubConnector::new();
        {
            let mut net = connector.0.lock().unwrap();
            net.words.push_back(vec![42]);
            net.refuse.insert("10.0.0.9:502".to_string());
        }

        let doc = document(vec![
            meter("m1", "10.0.0.8", 1, "acme-300"),
            meter("m2", "10.0.0.9", 2, "acme-300"),
        ]);
        let err = read_all_meters(&connector, &doc, &templates)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Connect { addr, .. } if addr == "10.0.0.9:502"));

        /* the successful first meter was still closed, its reading gone */
        let net = connector.0.lock().unwrap();
        assert_eq!(net.closed, 1);
    }

    #[tokio::test]
    async fn test_read_failure_still_releases_the_connection() {
        let dir = tempdir().unwrap();
        let templates = templates_with(
            &dir,
            "acme-300",
            r#"{ "channels": [
                { "channel": "1", "params": [ { "name": "v", "address": 1, "type": "Int16" } ] }
            ]}"#,
        );

        /* nothing queued, the first register read fails */
        let connector = StubConnector::new();
        let doc = document(vec![meter("m1", "10.0.0.8", 1, "acme-300")]);
        let err = read_all_meters(&connector, &doc, &templates)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Io { .. }));
        assert_eq!(connector.0.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_after_connect() {
        let dir = tempdir().unwrap();
        let templates =
            TemplateStore::with_roots(dir.path().join("user"), dir.path().join("defs"));

        let connector = StubConnector::new();
        let doc = document(vec![meter("m1", "10.0.0.8", 1, "ghost-9000")]);
        let err = read_all_meters(&connector, &doc, &templates)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Template { meter, .. } if meter == "m1"));

        let net = connector.0.lock().unwrap();
        assert!(net.reads.is_empty());
        assert_eq!(net.closed, 1);
    }

    #[tokio::test]
    async fn test_empty_meter_list_reads_nothing() {
        let dir = tempdir().unwrap();
        let templates =
            TemplateStore::with_roots(dir.path().join("user"), dir.path().join("defs"));
        let connector = StubConnector::new();

        let readings = read_all_meters(&connector, &document(Vec::new()), &templates)
            .await
            .unwrap();
        assert!(readings.is_empty());
        assert_eq!(connector.0.lock().unwrap().closed, 0);
    }
}
