use meters2mqtt::mqtt::MqttManager;
use meters2mqtt::telemetry::TelemetryManager;
use meters2mqtt::{ConfigStore, TemplateStore};
use tokio::task::JoinHandle;
use std::path::Path;
use std::sync::Arc;
use std::{env, time::Duration};
use log::{error, info};


#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    env::set_var("RUST_BACKTRACE", "1");

    let store = Arc::new(ConfigStore::new(Path::new("config")));
    let templates = Arc::new(TemplateStore::new());

    let models = templates.scan();
    if models.is_empty() {
        info!("No device templates found under config/templates or defs/templates");
    } else {
        info!("{} device templates available: {}", models.len(), models.join(", "));
    }

    match store.read_current() {
        Some(document) => info!(
            "Configured for site {:?} gw {:?} with {} meters",
            document.site,
            document.gw,
            document.meters.len()
        ),
        None => info!("No meter configuration yet, waiting for one over MQTT"),
    }

    // we need a channel for the subparts to send telemetry to the handler
    let (mut mqtt, tx) = match MqttManager::new(store.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("MQTT setup failed: {e}");
            std::process::exit(1);
        }
    };

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // Start the poll and publish cadence
    let telemetry = TelemetryManager::new(store, templates, tx);
    threads.push(tokio::spawn(async move {
        telemetry.start_thread().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
}
