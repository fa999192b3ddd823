// Streams an upload request body through the uploader, one chunk event at a
// time. Shared by the device HTTP handler and the host simulator.

use std::fmt::Display;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uploader_core::multipart::{self, MultipartDecoder, MultipartError, PartEvent};
use uploader_core::request::{parse_size_hint, query_param};
use uploader_core::{
    ChunkEvent, ErrorKind, FlashWriteTarget, Platform, RebootRequest, UploadResponse, Uploader,
};

/// Read buffer size for request bodies
pub const CHUNK_SIZE: usize = 4096;

/// What the handler knows about the request before reading the body
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub uri: &'a str,
    pub content_type: Option<&'a str>,
    pub content_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyFormat {
    Multipart { boundary: String },
    Raw,
}

impl UploadRequest<'_> {
    fn body_format(&self) -> Result<BodyFormat, &'static str> {
        match self.content_type {
            Some(ct) if multipart::is_multipart(ct) => multipart::boundary_from_content_type(ct)
                .map(|boundary| BodyFormat::Multipart { boundary })
                .ok_or("Multipart request without boundary"),
            _ => Ok(BodyFormat::Raw),
        }
    }

    /// `size` parameter, else Content-Length for raw bodies, else unknown
    fn size_hint(&self, format: &BodyFormat) -> usize {
        match query_param(self.uri, "size") {
            Some(size) => parse_size_hint(Some(size.as_str())),
            None if *format == BodyFormat::Raw => self.content_length.unwrap_or(0),
            None => 0,
        }
    }
}

fn lock<T, P>(uploader: &Mutex<Uploader<T, P>>) -> MutexGuard<'_, Uploader<T, P>> {
    uploader.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feed the whole body to the uploader and close the request.
///
/// `read` behaves like `Read::read`: `Ok(0)` is end of body.
pub fn stream_upload<T, P, R, E>(
    uploader: &Mutex<Uploader<T, P>>,
    request: &UploadRequest<'_>,
    read: R,
) -> UploadResponse
where
    T: FlashWriteTarget,
    P: Platform,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: Display,
{
    let mode = query_param(request.uri, "mode");

    match request.body_format() {
        Ok(format) => {
            let total_size = request.size_hint(&format);
            match format {
                BodyFormat::Raw => stream_raw(uploader, request, mode.as_deref(), total_size, read),
                BodyFormat::Multipart { boundary } => {
                    stream_multipart(uploader, &boundary, mode.as_deref(), total_size, read)
                }
            }
        }
        Err(message) => {
            lock(uploader).reject(ErrorKind::InvalidFile, message);
        }
    }

    lock(uploader).finish_request()
}

/// Send the response, then arm the restart.
///
/// The restart is armed even when sending fails: a verified image has
/// already been committed, and a client that hangs up early must not leave
/// the device running the old one.
pub fn respond_then_arm<T, P, S, E>(
    uploader: &Mutex<Uploader<T, P>>,
    response: UploadResponse,
    now: Duration,
    send: S,
) -> Result<Option<RebootRequest>, E>
where
    T: FlashWriteTarget,
    P: Platform,
    S: FnOnce(UploadResponse) -> Result<(), E>,
    E: Display,
{
    let sent = send(response);
    if let Err(e) = &sent {
        log::warn!("Failed to send upload response: {}", e);
    }

    let reboot = lock(uploader).after_response(now);
    if let Some(request) = &reboot {
        log::info!("Reboot scheduled at {:?}", request.due_at);
    }
    sent.map(|()| reboot)
}

fn stream_raw<T, P, R, E>(
    uploader: &Mutex<Uploader<T, P>>,
    request: &UploadRequest<'_>,
    mode: Option<&str>,
    total_size: usize,
    mut read: R,
) where
    T: FlashWriteTarget,
    P: Platform,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: Display,
{
    lock(uploader).handle_chunk(ChunkEvent::Start {
        mode,
        total_size,
        filename: None,
    });

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut received = 0usize;
    loop {
        match read(&mut buffer) {
            Ok(0) => {
                if request.content_length.is_some_and(|len| received < len) {
                    log::error!("Body ended after {} bytes, expected {:?}", received, request.content_length);
                    lock(uploader).handle_chunk(ChunkEvent::Aborted);
                } else {
                    lock(uploader).handle_chunk(ChunkEvent::End);
                }
                return;
            }
            Ok(n) => {
                received += n;
                lock(uploader).handle_chunk(ChunkEvent::Data(&buffer[..n]));
            }
            Err(e) => {
                log::error!("Failed to read request data after {} bytes: {}", received, e);
                lock(uploader).handle_chunk(ChunkEvent::Aborted);
                return;
            }
        }
    }
}

fn stream_multipart<T, P, R, E>(
    uploader: &Mutex<Uploader<T, P>>,
    boundary: &str,
    mode: Option<&str>,
    total_size: usize,
    mut read: R,
) where
    T: FlashWriteTarget,
    P: Platform,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: Display,
{
    let mut decoder = MultipartDecoder::new(boundary);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    // A `mode` form field ahead of the file stands in for a missing query parameter
    let mut form_mode: Option<String> = None;

    let outcome: Result<(), MultipartError> = loop {
        let n = match read(&mut buffer) {
            Ok(0) => break decoder.finish(),
            Ok(n) => n,
            Err(e) => {
                log::error!("Failed to read request data: {}", e);
                break Err(MultipartError::Truncated);
            }
        };

        let fed = decoder.feed(&buffer[..n], |event| {
            match event {
                PartEvent::Field { name, value } => {
                    if name == "mode" {
                        form_mode = Some(value.to_string());
                    }
                }
                PartEvent::FileStart { filename } => lock(uploader).handle_chunk(ChunkEvent::Start {
                    mode: mode.or(form_mode.as_deref()),
                    total_size,
                    filename: Some(filename),
                }),
                PartEvent::Data(data) => lock(uploader).handle_chunk(ChunkEvent::Data(data)),
                PartEvent::FileEnd => lock(uploader).handle_chunk(ChunkEvent::End),
            }
        });
        if let Err(e) = fed {
            break Err(e);
        }
        if decoder.is_done() {
            break decoder.finish();
        }
    };

    let Err(e) = outcome else {
        return;
    };

    let mut uploader = lock(uploader);
    if decoder.file_started() && !decoder.file_finished() {
        // Client went away mid-file
        uploader.handle_chunk(ChunkEvent::Aborted);
    } else if !decoder.file_started() {
        let message = match e {
            MultipartError::NoFile => "No file in upload request".to_string(),
            other => format!("Malformed upload body: {other}"),
        };
        uploader.reject(ErrorKind::InvalidFile, message);
    } else {
        log::warn!("Upload body ended untidily after the file part: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use uploader_core::{MemoryFlashTarget, Region, UploaderConfig};

    struct NoRestart;

    impl Platform for NoRestart {
        fn restart(&mut self) {}
    }

    type TestUploader = Mutex<Uploader<MemoryFlashTarget, NoRestart>>;

    fn uploader() -> TestUploader {
        Mutex::new(Uploader::new(
            MemoryFlashTarget::new(),
            NoRestart,
            &UploaderConfig::default(),
        ))
    }

    /// Reader handing out at most `step` bytes per call
    fn reader(body: &[u8], step: usize) -> impl FnMut(&mut [u8]) -> Result<usize, Infallible> + '_ {
        let mut offset = 0;
        move |buf: &mut [u8]| {
            let n = step.min(buf.len()).min(body.len() - offset);
            buf[..n].copy_from_slice(&body[offset..offset + n]);
            offset += n;
            Ok(n)
        }
    }

    fn multipart_body(filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b0undary\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
        body.extend_from_slice(
            format!(
                "--b0undary\r\nContent-Disposition: form-data; name=\"update\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n--b0undary--\r\n");
        body
    }

    #[test]
    fn test_raw_body_with_content_length() {
        let up = uploader();
        let image = vec![7u8; 10_000];
        let request = UploadRequest {
            uri: "/ota/upload?mode=filesystem",
            content_type: Some("application/octet-stream"),
            content_length: Some(image.len()),
        };

        let response = stream_upload(&up, &request, reader(&image, 1500));
        assert_eq!(response, UploadResponse::Ok);

        let up = up.lock().unwrap();
        let (region, data) = up.target().committed().unwrap();
        assert_eq!(region, Region::Data);
        assert_eq!(data.len(), 10_000);
    }

    #[test]
    fn test_reboot_armed_when_response_cannot_be_sent() {
        let up = uploader();
        let image = [5u8; 64];
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: None,
            content_length: Some(image.len()),
        };
        let response = stream_upload(&up, &request, reader(&image, 64));
        assert_eq!(response, UploadResponse::Ok);

        let sent = respond_then_arm(&up, response, Duration::from_secs(3), |_| Err("socket closed"));
        assert_eq!(sent, Err("socket closed"));
        assert!(up.lock().unwrap().status().reboot_pending.is_some());
        assert!(!up.lock().unwrap().tick(Duration::from_secs(4)));
        assert!(up.lock().unwrap().tick(Duration::from_secs(5)));
    }

    #[test]
    fn test_failed_upload_sends_fail_and_arms_nothing() {
        let up = uploader();
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: None,
            content_length: Some(100),
        };
        let response = stream_upload(&up, &request, reader(&[1u8; 10], 10));

        let mut body = None;
        let sent = respond_then_arm(&up, response, Duration::ZERO, |r| {
            body = Some(r.body());
            Ok::<(), Infallible>(())
        });
        assert_eq!(sent, Ok(None));
        assert_eq!(body, Some("FAIL"));
    }

    #[test]
    fn test_raw_body_cut_short_is_aborted() {
        let up = uploader();
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: None,
            content_length: Some(100),
        };

        let response = stream_upload(&up, &request, reader(&[1u8; 40], 16));
        assert_eq!(response, UploadResponse::Fail);
        assert_eq!(up.lock().unwrap().last_error(), ErrorKind::NetworkError);
    }

    #[test]
    fn test_multipart_body() {
        let up = uploader();
        let body = multipart_body("firmware.bin", &[0x42; 9000]);
        let request = UploadRequest {
            uri: "/ota/upload?mode=firmware&size=9000",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: Some(body.len()),
        };

        let response = stream_upload(&up, &request, reader(&body, 700));
        assert_eq!(response, UploadResponse::Ok);

        let up = up.lock().unwrap();
        assert_eq!(up.target().committed().map(|(_, d)| d.len()), Some(9000));
        assert_eq!(up.last_upload().map(|s| s.bytes), Some(9000));
    }

    fn with_mode_field(mode: &str, file_part: Vec<u8>) -> Vec<u8> {
        let mut body =
            format!("--b0undary\r\nContent-Disposition: form-data; name=\"mode\"\r\n\r\n{mode}\r\n").into_bytes();
        body.extend_from_slice(&file_part);
        body
    }

    #[test]
    fn test_mode_form_field_selects_region() {
        let up = uploader();
        let body = with_mode_field("filesystem", multipart_body("littlefs.bin", &[3u8; 1200]));
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: Some(body.len()),
        };

        let response = stream_upload(&up, &request, reader(&body, 100));
        assert_eq!(response, UploadResponse::Ok);
        let up = up.lock().unwrap();
        assert_eq!(up.target().committed().map(|(region, _)| region), Some(Region::Data));
    }

    #[test]
    fn test_mode_query_param_wins_over_form_field() {
        let up = uploader();
        let body = with_mode_field("filesystem", multipart_body("firmware.bin", &[3u8; 1200]));
        let request = UploadRequest {
            uri: "/ota/upload?mode=firmware",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: Some(body.len()),
        };

        assert_eq!(stream_upload(&up, &request, reader(&body, 4096)), UploadResponse::Ok);
        let up = up.lock().unwrap();
        assert_eq!(up.target().committed().map(|(region, _)| region), Some(Region::Executable));
    }

    #[test]
    fn test_multipart_size_param_too_large() {
        let up = Mutex::new(Uploader::new(
            MemoryFlashTarget::new().with_capacity(Region::Executable, 1024),
            NoRestart,
            &UploaderConfig::default(),
        ));
        let body = multipart_body("firmware.bin", &[0x42; 2048]);
        let request = UploadRequest {
            uri: "/ota/upload?size=2048",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: Some(body.len()),
        };

        let response = stream_upload(&up, &request, reader(&body, 512));
        assert_eq!(response, UploadResponse::Fail);

        let up = up.lock().unwrap();
        assert_eq!(up.last_error(), ErrorKind::FileTooLarge);
        assert_eq!(up.target().calls().begin, 0);
        assert_eq!(up.target().calls().write, 0);
    }

    #[test]
    fn test_multipart_without_file() {
        let up = uploader();
        let body = b"--b0undary\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--b0undary--\r\n";
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: None,
        };

        let response = stream_upload(&up, &request, reader(body, 64));
        assert_eq!(response, UploadResponse::Fail);
        assert_eq!(up.lock().unwrap().last_error(), ErrorKind::InvalidFile);
        assert_eq!(up.lock().unwrap().last_error_message(), "No file in upload request");
    }

    #[test]
    fn test_multipart_disconnect_mid_file() {
        let up = uploader();
        let body = multipart_body("firmware.bin", &[9u8; 5000]);
        let cut = &body[..3000];
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: Some("multipart/form-data; boundary=b0undary"),
            content_length: Some(body.len()),
        };

        let response = stream_upload(&up, &request, reader(cut, 1000));
        assert_eq!(response, UploadResponse::Fail);

        let up = up.lock().unwrap();
        assert_eq!(up.last_error(), ErrorKind::NetworkError);
        assert_eq!(up.target().calls().abort, 1);
    }

    #[test]
    fn test_read_error_aborts() {
        let up = uploader();
        let request = UploadRequest {
            uri: "/ota/upload",
            content_type: None,
            content_length: None,
        };
        let mut calls = 0;
        let read = |buf: &mut [u8]| {
            calls += 1;
            if calls == 1 {
                buf[..4].copy_from_slice(b"abcd");
                Ok(4)
            } else {
                Err("connection reset")
            }
        };

        assert_eq!(stream_upload(&up, &request, read), UploadResponse::Fail);
        assert_eq!(up.lock().unwrap().last_error(), ErrorKind::NetworkError);
    }

    #[test]
    fn test_size_hint_sources() {
        let raw = UploadRequest {
            uri: "/ota/upload",
            content_type: None,
            content_length: Some(321),
        };
        assert_eq!(raw.size_hint(&BodyFormat::Raw), 321);

        let multipart = UploadRequest {
            uri: "/ota/upload?size=77",
            content_type: Some("multipart/form-data; boundary=x"),
            content_length: Some(500),
        };
        let format = multipart.body_format().unwrap();
        assert_eq!(multipart.size_hint(&format), 77);

        let no_param = UploadRequest { uri: "/ota/upload", ..multipart };
        assert_eq!(no_param.size_hint(&format), 0);
    }
}
