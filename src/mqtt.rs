use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, warn};
use paho_mqtt::{AsyncClient, ConnectOptionsBuilder, CreateOptionsBuilder, Message, PersistenceType};
use rand::Rng;
use serde::Serialize;
use std::{future::Future, time::Duration};
use uuid::Uuid;

use crate::{
    battery::BatteryState,
    config::{self, DeviceId, Qos, Topic},
};

pub const CELL_COUNT: usize = 16;

const LOW_SOC_THRESHOLD: f64 = 20.0;
const CELL_NOISE: f64 = 0.2;

#[derive(Serialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Normal,
    LowSoc,
}

impl Status {
    pub fn from_soc(soc: f64) -> Self {
        if soc > LOW_SOC_THRESHOLD {
            Status::Normal
        } else {
            Status::LowSoc
        }
    }
}

#[derive(Serialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargingStatus {
    Charging,
    Discharging,
}

impl ChargingStatus {
    /// Positive current means the pack is delivering energy.
    pub fn from_current(current: f64) -> Self {
        if current > 0.0 {
            ChargingStatus::Discharging
        } else {
            ChargingStatus::Charging
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub device_id: String,
    pub timestamp: i64,
    pub soc: f64,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub power: f64,
    pub cell_voltages: [f64; CELL_COUNT],
    pub status: Status,
    pub charging_status: ChargingStatus,
}

impl TelemetryEnvelope {
    pub fn new(device_id: &str, timestamp: i64, state: BatteryState, rng: &mut impl Rng) -> Self {
        let BatteryState {
            soc,
            voltage,
            current,
            temperature,
        } = state;

        let cell_voltages = std::array::from_fn(|_| {
            let noise = (rng.random::<f64>() - 0.5) * CELL_NOISE;
            round_to(voltage / CELL_COUNT as f64 + noise, 3)
        });

        Self {
            device_id: device_id.to_owned(),
            timestamp,
            soc: round_to(soc, 2),
            voltage: round_to(voltage, 2),
            current: round_to(current, 2),
            temperature: round_to(temperature, 2),
            power: round_to(voltage * current, 2),
            cell_voltages,
            status: Status::from_soc(soc),
            charging_status: ChargingStatus::from_current(current),
        }
    }
}

/// Rounds half up to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor + 0.5).floor() / factor
}

/// Destination for serialized telemetry.
pub trait TelemetrySink: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Publishes to a fixed topic, never retained.
pub struct MqttSink {
    client: AsyncClient,
    topic: Topic,
    qos: Qos,
}

impl MqttSink {
    pub fn new(client: AsyncClient, topic: Topic, qos: Qos) -> Self {
        Self { client, topic, qos }
    }
}

impl TelemetrySink for MqttSink {
    fn send(&self, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send {
        let token = self
            .client
            .publish(Message::new(self.topic.as_str(), payload, self.qos.as_i32()));

        async move {
            token.await?;
            Ok(())
        }
    }
}

pub struct Publisher<S> {
    device_id: DeviceId,
    sink: S,
}

impl<S: TelemetrySink> Publisher<S> {
    pub fn new(device_id: DeviceId, sink: S) -> Self {
        Self { device_id, sink }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Builds an envelope from `state` and hands it to the sink.
    ///
    /// Failures are logged; the next call starts fresh.
    pub async fn publish(&self, state: BatteryState) {
        match self.try_publish(state).await {
            Ok(()) => info!(
                "Published battery telemetry: soc={:.2}% voltage={:.2}V current={:.2}A temperature={:.2}C",
                state.soc, state.voltage, state.current, state.temperature
            ),
            Err(e) => error!("Failed to publish battery telemetry: {e:#}"),
        }
    }

    async fn try_publish(&self, state: BatteryState) -> anyhow::Result<()> {
        let envelope = TelemetryEnvelope::new(
            self.device_id.as_str(),
            Utc::now().timestamp_millis(),
            state,
            &mut rand::rng(),
        );

        let payload = serde_json::to_vec(&envelope).context("Failed to serialize telemetry")?;
        debug!("MQTT publish payload: '{}'", String::from_utf8_lossy(&payload));

        self.sink.send(payload).await.context("Failed to deliver telemetry")
    }
}

/// Connects to the broker with a clean session and automatic reconnect.
///
/// The configured client id gets a random suffix so several simulators can share a broker.
pub async fn connect(config: &config::MqttConfig) -> anyhow::Result<AsyncClient> {
    let client_id = format!("{}-{}", config.client_id, Uuid::new_v4());

    let client = AsyncClient::new(
        CreateOptionsBuilder::new()
            .server_uri(&config.broker)
            .client_id(&client_id)
            .persistence(PersistenceType::None)
            .finalize(),
    )
    .context("Failed to create MQTT client")?;

    client
        .connect(
            ConnectOptionsBuilder::new()
                .clean_session(true)
                .keep_alive_interval(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .automatic_reconnect(Duration::from_secs(1), Duration::from_secs(2u64.pow(6)))
                .finalize(),
        )
        .await
        .with_context(|| format!("Failed to connect to MQTT broker {}", config.broker))?;

    info!("Connected to MQTT broker {} as {client_id}", config.broker);
    Ok(client)
}

pub async fn disconnect(client: &AsyncClient) {
    if !client.is_connected() {
        return;
    }

    match client.disconnect(None).await {
        Ok(_) => info!("Disconnected from MQTT broker"),
        Err(e) => warn!("Error while disconnecting from MQTT broker: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::Value;
    use std::{future, sync::Mutex};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl TelemetrySink for RecordingSink {
        fn send(&self, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send {
            self.sent.lock().unwrap().push(payload);
            future::ready(Ok(()))
        }
    }

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn send(&self, _payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send {
            future::ready(Err(anyhow::anyhow!("broker unavailable")))
        }
    }

    fn state(soc: f64, voltage: f64, current: f64, temperature: f64) -> BatteryState {
        BatteryState {
            soc,
            voltage,
            current,
            temperature,
        }
    }

    fn device_id() -> DeviceId {
        DeviceId::new("BMS-001").unwrap()
    }

    #[test]
    fn status_labels() {
        assert_eq!(Status::from_soc(85.0), Status::Normal);
        assert_eq!(Status::from_soc(20.01), Status::Normal);
        assert_eq!(Status::from_soc(20.0), Status::LowSoc);
        assert_eq!(Status::from_soc(10.0), Status::LowSoc);

        assert_eq!(ChargingStatus::from_current(15.0), ChargingStatus::Discharging);
        assert_eq!(ChargingStatus::from_current(0.0), ChargingStatus::Charging);
        assert_eq!(ChargingStatus::from_current(-5.0), ChargingStatus::Charging);
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(round_to(52.5, 2), 52.5);
        assert_eq!(round_to(3.14159, 2), 3.14);
        assert_eq!(round_to(3.14159, 3), 3.142);
        assert_eq!(round_to(-2.5, 0), -2.0);
        assert_eq!(round_to(2.5, 0), 3.0);
    }

    #[test]
    fn envelope_fields() {
        let mut rng = StdRng::seed_from_u64(7);
        let envelope = TelemetryEnvelope::new("BMS-001", 1_700_000_000_000, state(85.0, 52.5, 15.0, 25.0), &mut rng);

        assert_eq!(envelope.device_id, "BMS-001");
        assert_eq!(envelope.timestamp, 1_700_000_000_000);
        assert_eq!(envelope.soc, 85.0);
        assert_eq!(envelope.voltage, 52.5);
        assert_eq!(envelope.current, 15.0);
        assert_eq!(envelope.temperature, 25.0);
        assert_eq!(envelope.power, 787.5);
        assert_eq!(envelope.status, Status::Normal);
        assert_eq!(envelope.charging_status, ChargingStatus::Discharging);
    }

    #[test]
    fn cell_voltages_stay_near_the_pack_average() {
        let mut rng = StdRng::seed_from_u64(11);

        for voltage in [48.0, 52.5, 57.9] {
            for _ in 0..200 {
                let envelope = TelemetryEnvelope::new("BMS-001", 0, state(50.0, voltage, 10.0, 25.0), &mut rng);
                let average = voltage / CELL_COUNT as f64;

                assert_eq!(envelope.cell_voltages.len(), CELL_COUNT);
                for cell in envelope.cell_voltages {
                    // 0.1 of noise plus half a unit of rounding at 3 decimals
                    assert!((cell - average).abs() <= 0.1 + 0.0005 + 1e-12, "{cell} vs {average}");
                }
            }
        }
    }

    #[test]
    fn json_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let envelope = TelemetryEnvelope::new("BMS-001", 1_700_000_000_000, state(85.0, 52.5, 15.0, 25.0), &mut rng);

        let json = serde_json::to_value(&envelope).unwrap();
        let Value::Object(map) = &json else {
            panic!("envelope must serialize to an object");
        };

        let mut keys: Vec<_> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "cellVoltages",
                "chargingStatus",
                "current",
                "deviceId",
                "power",
                "soc",
                "status",
                "temperature",
                "timestamp",
                "voltage"
            ]
        );

        assert_eq!(json["deviceId"], "BMS-001");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["soc"], 85.0);
        assert_eq!(json["power"], 787.5);
        assert_eq!(json["cellVoltages"].as_array().unwrap().len(), CELL_COUNT);
        assert_eq!(json["status"], "NORMAL");
        assert_eq!(json["chargingStatus"], "DISCHARGING");
    }

    #[tokio::test]
    async fn publish_low_soc_while_charging() {
        let publisher = Publisher::new(device_id(), RecordingSink::default());
        publisher.publish(state(20.0, 50.0, -5.0, 25.0)).await;

        let sent = publisher.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);

        let json: Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(json["status"], "LOW_SOC");
        assert_eq!(json["chargingStatus"], "CHARGING");
        assert_eq!(json["power"], -250.0);
        assert_eq!(json["current"], -5.0);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_swallowed() {
        let publisher = Publisher::new(device_id(), FailingSink);

        publisher.publish(state(85.0, 52.5, 15.0, 25.0)).await;
        publisher.publish(state(85.0, 52.5, 15.0, 25.0)).await;

        assert!(publisher.try_publish(state(85.0, 52.5, 15.0, 25.0)).await.is_err());
    }
}
