use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use log::info;
use paho_mqtt::{QOS_0 as QOS_AT_MOST_ONCE, QOS_1 as QOS_AT_LEAST_ONCE, QOS_2 as QOS_EXACTLY_ONCE};
use serde::{de::Error, Deserialize, Deserializer};
use std::{
    env,
    fs::File,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::battery::{BatteryState, Generator, MAX_SOC, MIN_SOC};

lazy_static! {
    static ref DEVICE_ID_REGEX: regex::Regex = regex::Regex::new("^[a-zA-Z0-9_-]+$").unwrap();
    static ref TOPIC_REGEX: regex::Regex = regex::Regex::new("^[^+#]+$").unwrap();
}

pub const CONFIG_PATH_ENV: &str = "BMS_SIM_CONFIG";

const fn default_modbus_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
const fn default_modbus_port() -> u16 {
    1502
}
const fn default_slave_id() -> u8 {
    1
}
fn default_broker() -> String {
    "tcp://mqtt:1883".to_owned()
}
fn default_topic() -> Topic {
    Topic("ems/bms/telemetry".to_owned())
}
fn default_client_id() -> String {
    "modbus-simulator".to_owned()
}
fn default_device_id() -> DeviceId {
    DeviceId("BMS-001".to_owned())
}
const fn default_interval_ms() -> u64 {
    5000
}
const fn default_initial_soc() -> f64 {
    85.0
}
const fn default_initial_voltage() -> f64 {
    52.5
}
const fn default_initial_current() -> f64 {
    15.0
}
const fn default_initial_temperature() -> f64 {
    25.0
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub battery: BatteryConfig,
}

#[derive(Deserialize, Debug)]
pub struct ModbusConfig {
    #[serde(default = "default_modbus_address")]
    pub address: IpAddr,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            address: default_modbus_address(),
            port: default_modbus_port(),
            slave_id: default_slave_id(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct MqttConfig {
    /// Broker URI, e.g. `tcp://host:1883`.
    #[serde(default = "default_broker")]
    pub broker: String,

    #[serde(default = "default_topic")]
    pub topic: Topic,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub qos: Qos,

    #[serde(default = "default_device_id")]
    pub device_id: DeviceId,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: default_topic(),
            client_id: default_client_id(),
            qos: Qos::default(),
            device_id: default_device_id(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BatteryConfig {
    #[serde(default = "default_interval_ms")]
    pub publish_interval_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub simulation_interval_ms: u64,

    #[serde(default = "default_initial_soc")]
    pub initial_soc: f64,

    #[serde(default = "default_initial_voltage")]
    pub initial_voltage: f64,

    #[serde(default = "default_initial_current")]
    pub initial_current: f64,

    #[serde(default = "default_initial_temperature")]
    pub initial_temperature: f64,

    /// Report charge mode current as negative amps.
    #[serde(default)]
    pub negative_charge_current: bool,

    /// Fixed random seed for a reproducible walk.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: default_interval_ms(),
            simulation_interval_ms: default_interval_ms(),
            initial_soc: default_initial_soc(),
            initial_voltage: default_initial_voltage(),
            initial_current: default_initial_current(),
            initial_temperature: default_initial_temperature(),
            negative_charge_current: false,
            seed: None,
        }
    }
}

impl BatteryConfig {
    pub fn initial_state(&self) -> BatteryState {
        BatteryState {
            soc: self.initial_soc,
            voltage: self.initial_voltage,
            current: self.initial_current,
            temperature: self.initial_temperature,
        }
    }

    pub fn generator(&self) -> Generator {
        match self.seed {
            Some(seed) => Generator::with_seed(self.initial_state(), self.negative_charge_current, seed),
            None => Generator::new(self.initial_state(), self.negative_charge_current),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn simulation_interval(&self) -> Duration {
        Duration::from_millis(self.simulation_interval_ms)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Qos(i32);

impl Qos {
    pub fn new(level: i32) -> Option<Self> {
        match level {
            QOS_AT_MOST_ONCE | QOS_AT_LEAST_ONCE | QOS_EXACTLY_ONCE => Some(Qos(level)),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl Default for Qos {
    fn default() -> Self {
        Qos(QOS_AT_LEAST_ONCE)
    }
}

impl<'de> Deserialize<'de> for Qos {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = i32::deserialize(de)?;
        Qos::new(level).ok_or_else(|| Error::custom("qos must be 0, 1 or 2"))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Option<Self> {
        let topic = topic.into();
        TOPIC_REGEX.is_match(&topic).then_some(Topic(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let topic = String::deserialize(de)?;
        Topic::new(topic).ok_or_else(|| Error::custom("topic must be non-empty and must not contain '+' or '#'"))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        DEVICE_ID_REGEX.is_match(&id).then_some(DeviceId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = String::deserialize(de)?;
        DeviceId::new(id).ok_or_else(|| Error::custom("device id must match [a-zA-Z0-9_-]+"))
    }
}

impl Config {
    /// Loads the configuration file and applies environment overrides.
    ///
    /// `BMS_SIM_CONFIG` names a file that must exist. Without it the default
    /// location is tried and plain defaults are used when nothing is there.
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_path(PathBuf::from(path))?,
            None => {
                let path = default_config_path();

                if path.exists() {
                    Self::from_path(path)?
                } else {
                    info!("No config file at {path:?}, using defaults");
                    Config::default()
                }
            },
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open config file {path:?}"))?;

        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse config file {path:?}"))
    }

    /// Applies the `MQTT_BROKER`, `MQTT_TOPIC`, `PUBLISH_INTERVAL`,
    /// `SIMULATION_INTERVAL` and `MODBUS_PORT` overrides found through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(broker) = lookup("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }

        if let Some(topic) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = Topic::new(topic).context("MQTT_TOPIC is not a valid publish topic")?;
        }

        if let Some(interval) = parse_override(&lookup, "PUBLISH_INTERVAL")? {
            self.battery.publish_interval_ms = interval;
        }

        if let Some(interval) = parse_override(&lookup, "SIMULATION_INTERVAL")? {
            self.battery.simulation_interval_ms = interval;
        }

        if let Some(port) = parse_override(&lookup, "MODBUS_PORT")? {
            self.modbus.port = port;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.battery.publish_interval_ms == 0 {
            bail!("publish_interval_ms must be greater than zero");
        }

        if self.battery.simulation_interval_ms == 0 {
            bail!("simulation_interval_ms must be greater than zero");
        }

        if !(MIN_SOC..=MAX_SOC).contains(&self.battery.initial_soc) {
            bail!(
                "initial_soc must lie within {MIN_SOC}..={MAX_SOC}, got {}",
                self.battery.initial_soc
            );
        }

        if self.mqtt.broker.is_empty() {
            bail!("mqtt broker must not be empty");
        }

        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("Failed to parse {key}={value:?}"))
        })
        .transpose()
}

fn default_config_path() -> PathBuf {
    if cfg!(debug_assertions) {
        PathBuf::from("./bms-sim.yaml")
    } else {
        PathBuf::from("/etc/bms-sim.yaml")
    }
}
