use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use uploader_core::UploaderConfig;

const CONFIG_NAMESPACE: &str = "fw_uploader";
const CONFIG_KEY: &str = "config";

/// Wi-Fi credentials compiled in from wifi_config.h
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn from_build() -> Self {
        Self {
            ssid: env!("WIFI_SSID").to_string(),
            password: env!("WIFI_PASSWORD").to_string(),
        }
    }
}

/// Defaults, with upload credentials compiled in from wifi_config.h
pub fn build_defaults() -> UploaderConfig {
    UploaderConfig {
        username: env!("OTA_USERNAME").to_string(),
        password: env!("OTA_PASSWORD").to_string(),
        ..Default::default()
    }
}

pub struct ConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl ConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    pub fn load_or_default(&mut self) -> UploaderConfig {
        match self.load() {
            Ok(config) => {
                log::info!("Loaded configuration from NVS");
                config
            }
            Err(e) => {
                log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
                let config = build_defaults();

                // Try to save default config to NVS for next time
                if let Err(save_err) = self.save(&config) {
                    log::warn!("Failed to save default config to NVS: {:?}", save_err);
                }
                config
            }
        }
    }

    pub fn save(&mut self, config: &UploaderConfig) -> Result<()> {
        let json = serde_json::to_vec(config)?;
        self.nvs.set_blob(CONFIG_KEY, &json)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }

    fn load(&self) -> Result<UploaderConfig> {
        let mut buf = vec![0u8; 1024]; // Max config size
        let data = self
            .nvs
            .get_blob(CONFIG_KEY, &mut buf)?
            .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

        Ok(serde_json::from_slice(data)?)
    }
}
