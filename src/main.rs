use anyhow::Result;
use log::LevelFilter;

#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
mod config;
mod logging;
mod network;
#[cfg(target_os = "espidf")]
mod ota;
#[cfg(not(target_os = "espidf"))]
mod simulator;
mod templates;
mod version;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use std::sync::{Arc, Mutex, PoisonError};

    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use uploader_core::Uploader;

    use crate::config::{ConfigStore, WifiCredentials};
    use crate::network::web_server::UpdateServer;
    use crate::network::NetworkManager;
    use crate::ota::{EspFlashTarget, EspPlatform};

    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    logging::init_logger(LevelFilter::Info)?;
    log::info!("ESP32 firmware uploader {}", version::full_version());

    // Take peripherals, system event loop and NVS once
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mut config_store = ConfigStore::new(nvs.clone())?;
    let config = config_store.load_or_default();
    log::info!(
        "Configuration: auth {}, auto reboot {}, debug {}",
        if config.auth_enabled() { "on" } else { "off" },
        config.auto_reboot,
        config.debug
    );

    let mut network = NetworkManager::new(peripherals.modem, sys_loop, nvs, WifiCredentials::from_build())?;
    network.connect()?;

    let uploader = Arc::new(Mutex::new(Uploader::new(EspFlashTarget::new(), EspPlatform, &config)));
    if let Some(level) = option_env!("FW_UPLOADER_LOG") {
        logging::set_max_level_from_str(level);
    }

    let _server = UpdateServer::new(uploader.clone())?;
    log::warn!(
        "Update page: http://{}/update",
        network.get_ip().unwrap_or_else(|| "<no ip>".to_string())
    );

    // Deferred restart and settings persistence are driven from here,
    // never from a request handler
    loop {
        let changed = {
            let mut up = uploader.lock().unwrap_or_else(PoisonError::into_inner);
            up.tick(logging::uptime());
            up.take_settings_change()
        };
        if let Some(config) = changed {
            if let Err(e) = config_store.save(&config) {
                log::warn!("Failed to save settings to NVS: {:?}", e);
            }
        }
        FreeRtos::delay_ms(100);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    logging::init_logger(LevelFilter::Info)?;
    simulator::run(std::env::args().skip(1).collect())
}
