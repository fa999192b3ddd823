use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Pages smaller than this go out uncompressed
const MIN_COMPRESS_SIZE: usize = 1024;

/// Compress data using gzip
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Whether a response with this body should be gzip encoded
pub fn should_compress(accept_encoding: Option<&str>, len: usize) -> bool {
    accept_encoding.unwrap_or("").contains("gzip") && len > MIN_COMPRESS_SIZE
}

#[cfg(target_os = "espidf")]
pub use self::device::write_compressed_response;

#[cfg(target_os = "espidf")]
mod device {
    use esp_idf_svc::http::server::{EspHttpConnection, Request};
    use esp_idf_svc::io::Write as EspWrite;

    use super::{gzip_compress, should_compress};

    /// Write compressed response if client supports gzip
    pub fn write_compressed_response(
        req: Request<&mut EspHttpConnection<'_>>,
        content: &[u8],
        content_type: &str,
    ) -> anyhow::Result<()> {
        if should_compress(req.header("Accept-Encoding"), content.len()) {
            match gzip_compress(content) {
                Ok(compressed) => {
                    log::debug!("Compressed {} bytes to {} bytes", content.len(), compressed.len());
                    let mut response = req.into_response(
                        200,
                        Some("OK"),
                        &[
                            ("Content-Type", content_type),
                            ("Content-Encoding", "gzip"),
                            ("Vary", "Accept-Encoding"),
                        ],
                    )?;
                    response.write_all(&compressed)?;
                    return Ok(());
                }
                Err(e) => log::warn!("Compression failed: {}", e),
            }
        }

        let mut response = req.into_response(200, Some("OK"), &[("Content-Type", content_type)])?;
        response.write_all(content)?;
        Ok(())
    }
}
