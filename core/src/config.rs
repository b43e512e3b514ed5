// Configuration for the Remote ID peripheral
//
// Stored as JSON in:
// - Linux: ~/.config/rid-peripheral/config.json
// - macOS: ~/Library/Application Support/rid-peripheral/config.json
// - Windows: %APPDATA%\rid-peripheral\config.json

use crate::ble::advertiser::RetryPolicy;
use crate::ble::connection::{
    ConnectionPolicy, ConnectionSettings, DEFAULT_ATT_MTU, DEFAULT_MAX_PENDING_CONNECTIONS,
    DEFAULT_SERVER_MTU, MAX_ATT_MTU,
};
use crate::ble::gatt::{AttributeTable, CharacteristicDefinition, Properties, ServiceDefinition};
use crate::ble::payload::{AdvertisingData, AdvertisingPayload};
use crate::ble::uuid::BleUuid;
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote ID service (16-bit SIG form)
pub const DRONE_RID_SERVICE_UUID: BleUuid = BleUuid::from_u16(0xFFFA);

/// Remote ID broadcast characteristic
pub const DRONE_RID_CHARACTERISTIC_UUID: BleUuid = BleUuid::from_u16(0xFFFB);

/// Drone identifier characteristic
pub const DRONE_ID_CHARACTERISTIC_UUID: BleUuid =
    BleUuid::from_u128(0x10318a23_75d6_4868_bbf9_cee1804ed43d);

/// Advertised local name of the built-in profile
pub const DRONE_RID_LOCAL_NAME: &str = "Drone RID";

/// Initial broadcast value of the built-in profile
pub const DRONE_RID_INITIAL_VALUE: &[u8] = b"Drone1";

const CONFIG_DIR_NAME: &str = "rid-peripheral";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Advertising payload contents
    pub advertising: AdvertisingData,

    /// GATT services to serve
    pub services: Vec<ServiceDefinition>,

    /// Keep advertising while a central is connected
    pub advertise_while_connected: bool,

    /// What to do with a second concurrent central
    pub connection_policy: ConnectionPolicy,

    /// Queue bound when `connection_policy` is `queue`
    pub max_pending_connections: usize,

    /// Registration retry policy
    pub retry: RetryPolicy,

    /// Deadline for a single attribute transaction in milliseconds
    pub transaction_timeout_ms: u64,

    /// Wait for the controller's stop acknowledgement in milliseconds
    pub stop_timeout_ms: u64,

    /// ATT MTU offered during MTU exchange
    pub server_mtu: u16,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        let mut advertising = AdvertisingData {
            local_name: Some(DRONE_RID_LOCAL_NAME.to_string()),
            ..AdvertisingData::default()
        };
        advertising.service_uuids.push(DRONE_RID_SERVICE_UUID);

        Self {
            advertising,
            services: vec![drone_rid_service()],
            advertise_while_connected: false,
            connection_policy: ConnectionPolicy::Reject,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            retry: RetryPolicy::default(),
            transaction_timeout_ms: 30_000,
            stop_timeout_ms: 2_000,
            server_mtu: DEFAULT_SERVER_MTU,
        }
    }
}

/// The Remote ID service: a read/notify broadcast characteristic and a
/// read-only drone identifier
pub fn drone_rid_service() -> ServiceDefinition {
    ServiceDefinition {
        uuid: DRONE_RID_SERVICE_UUID,
        primary: true,
        characteristics: vec![
            CharacteristicDefinition {
                uuid: DRONE_RID_CHARACTERISTIC_UUID,
                properties: Properties::READ | Properties::NOTIFY,
                initial_value: DRONE_RID_INITIAL_VALUE.to_vec(),
                descriptors: Vec::new(),
            },
            CharacteristicDefinition {
                uuid: DRONE_ID_CHARACTERISTIC_UUID,
                properties: Properties::READ,
                initial_value: DRONE_ID_CHARACTERISTIC_UUID.to_string().into_bytes(),
                descriptors: Vec::new(),
            },
        ],
    }
}

impl PeripheralConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join(CONFIG_DIR_NAME);

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: PeripheralConfig =
            serde_json::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from `path`, or write and return the default if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_json_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            let config = PeripheralConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Load from the default config file location
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_file()?)
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Check the config can drive a peripheral
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.services.is_empty(), "No GATT services configured");

        let mut seen = BTreeSet::new();
        for service in &self.services {
            if !seen.insert(service.uuid) {
                bail!("Duplicate service UUID {}", service.uuid);
            }
            let mut characteristics = BTreeSet::new();
            for characteristic in &service.characteristics {
                if !characteristics.insert(characteristic.uuid) {
                    bail!(
                        "Duplicate characteristic UUID {} in service {}",
                        characteristic.uuid,
                        service.uuid
                    );
                }
            }
        }

        ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be at least 1");
        ensure!(self.retry.backoff_base_ms > 0, "retry.backoff_base_ms must be positive");
        ensure!(
            self.retry.backoff_max_ms >= self.retry.backoff_base_ms,
            "retry.backoff_max_ms must not be below retry.backoff_base_ms"
        );
        ensure!(self.transaction_timeout_ms > 0, "transaction_timeout_ms must be positive");
        ensure!(self.stop_timeout_ms > 0, "stop_timeout_ms must be positive");
        ensure!(
            (DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&self.server_mtu),
            "server_mtu must be between {} and {}",
            DEFAULT_ATT_MTU,
            MAX_ATT_MTU
        );

        self.attribute_table()?;
        self.advertising_payload()?;
        Ok(())
    }

    /// Build the attribute table described by `services`
    pub fn attribute_table(&self) -> Result<AttributeTable> {
        AttributeTable::build(&self.services).context("Invalid GATT service definition")
    }

    /// Encode the advertising payload
    pub fn advertising_payload(&self) -> Result<AdvertisingPayload> {
        AdvertisingPayload::build(&self.advertising).context("Advertising payload does not fit")
    }

    /// Connection manager settings
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            policy: self.connection_policy,
            max_pending: self.max_pending_connections,
            server_mtu: self.server_mtu,
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Serde adapter: bytes as a hex string
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(de::Error::custom)
    }

    pub(crate) fn decode(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
        let digits = text.strip_prefix("0x").unwrap_or(text);
        hex::decode(digits)
    }
}

/// Serde adapter: map values as hex strings
pub mod hex_map {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, S>(map: &BTreeMap<K, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize + Ord,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(key, value)| (key, hex::encode(value))))
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Vec<u8>>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        BTreeMap::<K, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, text)| {
                super::hex_bytes::decode(&text)
                    .map(|bytes| (key, bytes))
                    .map_err(de::Error::custom)
            })
            .collect()
    }
}
