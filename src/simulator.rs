// Host simulator: replays an image file through the upload pipeline against
// the in-memory flash target.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uploader_core::{MemoryFlashTarget, Platform, Uploader, UploaderConfig};

use crate::logging;
use crate::network::compression::gzip_compress;
use crate::network::upload::{stream_upload, UploadRequest};
use crate::templates::render_update_page;
use crate::version;

const BOUNDARY: &str = "----fw-uploader-simulator";

/// Records the restart instead of performing it
#[derive(Debug, Default)]
struct SimPlatform {
    restarted: bool,
}

impl Platform for SimPlatform {
    fn restart(&mut self) {
        self.restarted = true;
    }
}

fn usage() -> String {
    "usage: esp32-fw-uploader <image> [firmware|filesystem]".to_string()
}

/// Wrap an image the way the update page's form does
fn multipart_body(filename: &str, image: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"update\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(image);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn run(args: Vec<String>) -> Result<()> {
    let Some(path) = args.first() else {
        bail!(usage());
    };
    let mode = args.get(1).map(String::as_str).unwrap_or("firmware");

    let image = std::fs::read(path).with_context(|| format!("Failed to read image {}", path))?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image.bin");

    log::info!("Firmware uploader simulator {}", version::full_version());

    let config = UploaderConfig::default();
    let page = render_update_page(config.theme, &version::full_version());
    log::info!(
        "Update page: {} bytes ({} gzipped)",
        page.len(),
        gzip_compress(page.as_bytes())?.len()
    );

    let mut uploader = Uploader::new(MemoryFlashTarget::new(), SimPlatform::default(), &config);
    if let Ok(level) = std::env::var("FW_UPLOADER_LOG") {
        logging::set_max_level_from_str(&level);
    }

    let last_percent = Arc::new(Mutex::new(0usize));
    let progress_percent = last_percent.clone();
    uploader.on_progress(move |current, total| {
        if total == 0 {
            return;
        }
        let percent = current * 100 / total;
        let mut last = progress_percent.lock().unwrap_or_else(PoisonError::into_inner);
        if percent >= *last + 25 || percent == 100 {
            *last = percent;
            println!("  progress {:>3}% ({}/{} bytes)", percent, current, total);
        }
    });
    uploader.on_error(|kind, message| eprintln!("  error [{}]: {}", kind.as_str(), message));
    uploader.on_end(|success| println!("  upload {}", if success { "verified" } else { "failed" }));

    let uploader = Mutex::new(uploader);
    let body = multipart_body(filename, &image);
    let uri = format!("/ota/upload?mode={}&size={}", mode, image.len());
    let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
    let request = UploadRequest {
        uri: &uri,
        content_type: Some(&content_type),
        content_length: Some(body.len()),
    };

    println!("Uploading {} ({} bytes) as {}", filename, image.len(), mode);
    let mut cursor = Cursor::new(body);
    let response = stream_upload(&uploader, &request, |buf: &mut [u8]| cursor.read(buf));
    println!("Response: {} {}", response.status(), response.body());

    let mut uploader = uploader.into_inner().unwrap_or_else(PoisonError::into_inner);
    println!("{}", serde_json::to_string_pretty(&uploader.status())?);

    if !response.is_ok() {
        bail!("{}", uploader.last_error_message());
    }

    let Some(reboot) = uploader.after_response(logging::uptime()) else {
        println!("Auto reboot disabled, done");
        return Ok(());
    };
    println!("Reboot due at {:?} after boot", reboot.due_at);

    while !uploader.tick(logging::uptime()) {
        std::thread::sleep(Duration::from_millis(100));
    }
    if uploader.platform().restarted {
        println!("Simulated restart");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_requires_image() {
        assert!(run(Vec::new()).is_err());
        assert!(run(vec!["/nonexistent/fw.bin".to_string()]).is_err());
    }

    #[test]
    fn test_multipart_body_shape() {
        let body = multipart_body("fw.bin", b"abc");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(text.contains("filename=\"fw.bin\""));
        assert!(text.ends_with(&format!("\r\nabc\r\n--{BOUNDARY}--\r\n")));
    }
}
