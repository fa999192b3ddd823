use anyhow::Result;
use esp_idf_svc::http::server::{EspHttpConnection, EspHttpServer, Request};
use embedded_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use uploader_core::{AccessDecision, AccessScope, WWW_AUTHENTICATE};

use super::compression::write_compressed_response;
use super::http_config::create_http_config;
use super::upload::{respond_then_arm, stream_upload, UploadRequest};
use crate::ota::SharedUploader;

pub struct UpdateServer {
    _server: EspHttpServer<'static>,
}

impl UpdateServer {
    pub fn new(uploader: SharedUploader) -> Result<Self> {
        let mut server = EspHttpServer::new(&create_http_config())?;

        // Update page
        let page_uploader = uploader.clone();
        server.fn_handler("/update", Method::Get, move |req| {
            let theme = {
                let mut up = page_uploader.lock().map_err(|e| anyhow::anyhow!("Uploader lock poisoned: {}", e))?;
                if up.authorize(req.header("Authorization"), AccessScope::Page) == AccessDecision::Challenge {
                    drop(up);
                    return send_challenge(req);
                }
                up.theme()
            };

            let html = crate::templates::render_update_page(theme, &crate::version::full_version());
            write_compressed_response(req, html.as_bytes(), "text/html; charset=utf-8")
        })?;

        // Upload endpoint
        let upload_uploader = uploader.clone();
        server.fn_handler("/ota/upload", Method::Post, move |mut req| {
            {
                let mut up = upload_uploader.lock().map_err(|e| anyhow::anyhow!("Uploader lock poisoned: {}", e))?;
                // Checked before any body byte is read
                if up.authorize(req.header("Authorization"), AccessScope::Upload) == AccessDecision::Challenge {
                    drop(up);
                    return send_challenge(req);
                }
            }

            let uri = req.uri().to_string();
            let content_type = req.header("Content-Type").map(str::to_string);
            let content_length = req.header("Content-Length").and_then(|v| v.parse::<usize>().ok());
            log::info!("Upload request: {} ({:?} bytes)", uri, content_length);

            let request = UploadRequest {
                uri: &uri,
                content_type: content_type.as_deref(),
                content_length,
            };
            let response = stream_upload(&*upload_uploader, &request, |buf: &mut [u8]| req.read(buf));

            respond_then_arm(&*upload_uploader, response, crate::logging::uptime(), |response| {
                let mut http_response = req.into_response(
                    response.status(),
                    None,
                    &[("Content-Type", "text/plain"), ("Connection", "close")],
                )?;
                http_response.write_all(response.body().as_bytes())?;
                http_response.flush()?;
                Ok::<(), anyhow::Error>(())
            })?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Status endpoint
        let status_uploader = uploader;
        server.fn_handler("/ota/status", Method::Get, move |req| {
            let status = {
                let mut up = status_uploader.lock().map_err(|e| anyhow::anyhow!("Uploader lock poisoned: {}", e))?;
                if up.authorize(req.header("Authorization"), AccessScope::Status) == AccessDecision::Challenge {
                    drop(up);
                    return send_challenge(req);
                }
                up.status()
            };

            let json = serde_json::to_string(&status)?;
            let mut response = req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?;
            response.write_all(json.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        log::info!("Update server started: /update, /ota/upload, /ota/status");
        Ok(Self { _server: server })
    }
}

fn send_challenge(req: Request<&mut EspHttpConnection<'_>>) -> Result<()> {
    let mut response = req.into_response(
        401,
        Some("Unauthorized"),
        &[("WWW-Authenticate", WWW_AUTHENTICATE), ("Connection", "close")],
    )?;
    response.write_all(b"Authentication required")?;
    Ok(())
}
