use std::fs;
use std::path::Path;

const CONFIG_DEFINES: [&str; 4] = ["WIFI_SSID", "WIFI_PASSWORD", "OTA_USERNAME", "OTA_PASSWORD"];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; the host simulator build skips it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Read WiFi and OTA credentials if they exist
    let wifi_config_path = "wifi_config.h";
    let contents = if Path::new(wifi_config_path).exists() {
        fs::read_to_string(wifi_config_path)?
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
        String::new()
    };

    for define in CONFIG_DEFINES {
        let value = contents
            .lines()
            .find(|l| l.split_whitespace().take(2).eq(["#define", define]))
            .and_then(|l| l.split('"').nth(1))
            .unwrap_or("");
        println!("cargo:rustc-env={}={}", define, value);
    }

    Ok(())
}
