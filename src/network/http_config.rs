use esp_idf_svc::http::server::Configuration;

/// HTTP server configuration for the uploader endpoints
pub fn create_http_config() -> Configuration {
    Configuration {
        stack_size: 10240,       // Multipart decoding plus a 4 KiB read buffer
        max_uri_handlers: 8,
        max_open_sockets: 4,     // One upload at a time, plus page and status
        lru_purge_enable: true,
        ..Default::default()
    }
}
