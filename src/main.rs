mod battery;
mod config;
mod eventloop;
mod modbus;
mod mqtt;

use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::Config::load().context("Failed to load configuration")?;

    info!("Starting battery simulator");
    info!("MQTT broker: {}", config.mqtt.broker);
    info!("MQTT topic: {}", config.mqtt.topic.as_str());
    info!("Modbus port: {}, unit id: {}", config.modbus.port, config.modbus.slave_id);

    let initial = config.battery.initial_state();
    let generator = Arc::new(config.battery.generator());

    info!(
        "Battery initialised: soc={}% voltage={}V current={}A temperature={}C",
        initial.soc, initial.voltage, initial.current, initial.temperature
    );

    let register_map = Arc::new(modbus::RegisterMap::new());

    register_map
        .initialize(config.modbus.slave_id, config.modbus.address, config.modbus.port)
        .await
        .context("Failed to start Modbus server")?;

    let mqtt_client = match mqtt::connect(&config.mqtt).await {
        Ok(client) => client,
        Err(e) => {
            register_map.shutdown().await;
            return Err(e);
        },
    };

    let publisher = Arc::new(mqtt::Publisher::new(
        config.mqtt.device_id.clone(),
        mqtt::MqttSink::new(mqtt_client.clone(), config.mqtt.topic.clone(), config.mqtt.qos),
    ));

    let scheduler = eventloop::Scheduler::new(eventloop::SHUTDOWN_GRACE);

    eventloop::start(
        &scheduler,
        generator,
        Arc::clone(&register_map),
        publisher,
        config.battery.simulation_interval(),
        config.battery.publish_interval(),
    );

    info!("Battery simulator running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }

    info!("Shutting down battery simulator");

    scheduler.shutdown().await;
    mqtt::disconnect(&mqtt_client).await;
    register_map.shutdown().await;

    info!("Battery simulator stopped");
    Ok(())
}
