pub mod compression;
pub mod upload;

#[cfg(target_os = "espidf")]
pub mod http_config;
#[cfg(target_os = "espidf")]
pub mod web_server;
#[cfg(target_os = "espidf")]
pub mod wifi;

#[cfg(target_os = "espidf")]
pub use self::device::NetworkManager;

#[cfg(target_os = "espidf")]
mod device {
    use anyhow::Result;
    use esp_idf_hal::modem::Modem;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::mdns::EspMdns;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use super::wifi::WifiManager;
    use crate::config::WifiCredentials;

    const HOSTNAME: &str = "esp32-uploader";

    pub struct NetworkManager {
        wifi: WifiManager,
        _mdns: Option<EspMdns>,
    }

    impl NetworkManager {
        pub fn new(
            modem: Modem,
            sys_loop: EspSystemEventLoop,
            nvs: EspDefaultNvsPartition,
            credentials: WifiCredentials,
        ) -> Result<Self> {
            let wifi = WifiManager::new(modem, sys_loop, nvs, credentials.ssid, credentials.password)?;
            Ok(Self { wifi, _mdns: None })
        }

        pub fn connect(&mut self) -> Result<()> {
            self.wifi.connect()?;
            log::info!("WiFi connected to '{}', IP: {:?}", self.wifi.ssid, self.wifi.get_ip());

            // Start mDNS for network discovery
            match self.start_mdns() {
                Ok(_) => log::info!("mDNS service started: {}.local", HOSTNAME),
                Err(e) => log::warn!("Failed to start mDNS: {:?}", e),
            }
            Ok(())
        }

        fn start_mdns(&mut self) -> Result<()> {
            let mut mdns = EspMdns::take()?;
            mdns.set_hostname(HOSTNAME)?;
            mdns.add_service(None, "_http", "_tcp", 80, &[("path", "/update")])?;
            self._mdns = Some(mdns);
            Ok(())
        }

        pub fn get_ip(&self) -> Option<String> {
            self.wifi.get_ip()
        }
    }
}
