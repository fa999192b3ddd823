use anyhow::{bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};

pub struct WifiManager {
    wifi: BlockingWifi<EspWifi<'static>>,
    pub ssid: String,
}

impl WifiManager {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: String,
        password: String,
    ) -> Result<Self> {
        log::info!("Initializing WiFi manager for SSID: '{}'", ssid);

        if ssid.is_empty() {
            log::error!("WiFi SSID is empty! Check wifi_config.h");
            bail!("WiFi SSID cannot be empty");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;

        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", ssid))?,
            password: password
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        esp_wifi.set_configuration(&cfg)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        Ok(Self { wifi, ssid })
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!("Starting WiFi...");
        self.wifi.start()?;

        log::info!("Connecting to {}...", self.ssid);
        self.wifi.connect()?;

        log::info!("Waiting for DHCP...");
        self.wifi.wait_netif_up()?;

        // Power save drops connections during long uploads
        unsafe {
            use esp_idf_sys::*;
            let result = esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE);
            if result != ESP_OK {
                log::warn!("Failed to set WiFi power save mode: {:?}", result);
            }
        }

        log::info!("WiFi connected!");
        Ok(())
    }

    pub fn get_ip(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|ip_info| format!("{}", ip_info.ip))
    }
}
