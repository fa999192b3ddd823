//! Streaming `multipart/form-data` decoder.
//!
//! The HTTP layer reads the request body in whatever slices the socket
//! hands out and feeds them here. The first part that carries a `filename`
//! is the image: its bytes come out as [`PartEvent::Data`] between a
//! [`PartEvent::FileStart`] and a [`PartEvent::FileEnd`]. Short text
//! fields ahead of the file (such as `mode`) are reported whole as
//! [`PartEvent::Field`]; everything else is skipped.
//!
//! The body looks like:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="update"; filename="fw.bin"\r\n
//! Content-Type: application/octet-stream\r\n
//! \r\n
//! <file data>
//! \r\n--<boundary>--\r\n
//! ```

use core::fmt;

/// Largest part header block we accept.
pub const MAX_PART_HEADERS: usize = 4096;

/// Longest form field value reported; longer fields are skipped.
pub const MAX_FIELD_VALUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartError {
    HeadersTooLarge,
    Malformed,
    /// Body ended before the closing delimiter
    Truncated,
    /// Body was complete but no part carried a filename
    NoFile,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultipartError::HeadersTooLarge => write!(f, "part headers exceed {} bytes", MAX_PART_HEADERS),
            MultipartError::Malformed => f.write_str("malformed multipart delimiter"),
            MultipartError::Truncated => f.write_str("multipart body ended early"),
            MultipartError::NoFile => f.write_str("no file in upload"),
        }
    }
}

impl std::error::Error for MultipartError {}

#[derive(Debug, PartialEq, Eq)]
pub enum PartEvent<'a> {
    /// Non-file part seen before the file
    Field { name: &'a str, value: &'a str },
    FileStart { filename: &'a str },
    Data(&'a [u8]),
    FileEnd,
}

/// Where the bytes of the current part go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Skip,
    Field,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Scanning for the next delimiter
    Delimiter { sink: Sink },
    /// Right after a delimiter: `--` closes the body, CRLF opens a part
    AfterDelimiter,
    Headers,
    Done,
}

#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    pending: Vec<u8>,
    phase: Phase,
    file_started: bool,
    file_finished: bool,
    field_name: String,
    field_value: Vec<u8>,
    field_overflow: bool,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter,
            // The first delimiter has no leading CRLF; pretend it does
            pending: b"\r\n".to_vec(),
            phase: Phase::Delimiter { sink: Sink::Skip },
            file_started: false,
            file_finished: false,
            field_name: String::new(),
            field_value: Vec::new(),
            field_overflow: false,
        }
    }

    pub fn file_started(&self) -> bool {
        self.file_started
    }

    pub fn file_finished(&self) -> bool {
        self.file_finished
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Consume the next slice of the body, reporting events as they complete.
    pub fn feed<F>(&mut self, input: &[u8], mut on_event: F) -> Result<(), MultipartError>
    where
        F: FnMut(PartEvent<'_>),
    {
        if self.phase == Phase::Done {
            return Ok(());
        }
        self.pending.extend_from_slice(input);

        loop {
            match self.phase {
                Phase::Delimiter { sink } => {
                    if let Some(pos) = find_subsequence(&self.pending, &self.delimiter) {
                        match sink {
                            Sink::File => {
                                if pos > 0 {
                                    on_event(PartEvent::Data(&self.pending[..pos]));
                                }
                                self.file_finished = true;
                                on_event(PartEvent::FileEnd);
                            }
                            Sink::Field => {
                                self.collect_field(pos);
                                if !self.field_overflow {
                                    let value = String::from_utf8_lossy(&self.field_value);
                                    on_event(PartEvent::Field {
                                        name: &self.field_name,
                                        value: &value,
                                    });
                                }
                            }
                            Sink::Skip => {}
                        }
                        self.pending.drain(..pos + self.delimiter.len());
                        self.phase = Phase::AfterDelimiter;
                        continue;
                    }

                    // Hold back enough to recognise a delimiter split across reads
                    let holdback = self.delimiter.len() - 1;
                    if self.pending.len() > holdback {
                        let safe = self.pending.len() - holdback;
                        match sink {
                            Sink::File => on_event(PartEvent::Data(&self.pending[..safe])),
                            Sink::Field => self.collect_field(safe),
                            Sink::Skip => {}
                        }
                        self.pending.drain(..safe);
                    }
                    return Ok(());
                }
                Phase::AfterDelimiter => {
                    if self.pending.len() < 2 {
                        return Ok(());
                    }
                    if self.pending.starts_with(b"--") {
                        self.pending.clear();
                        self.phase = Phase::Done;
                        return Ok(());
                    }
                    if !self.pending.starts_with(b"\r\n") {
                        return Err(MultipartError::Malformed);
                    }
                    self.pending.drain(..2);
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let bounds = if self.pending.starts_with(b"\r\n") {
                        Some((0, 2))
                    } else {
                        find_subsequence(&self.pending, b"\r\n\r\n").map(|pos| (pos, pos + 4))
                    };

                    let Some((headers_end, body_start)) = bounds else {
                        if self.pending.len() > MAX_PART_HEADERS {
                            return Err(MultipartError::HeadersTooLarge);
                        }
                        return Ok(());
                    };

                    let headers = &self.pending[..headers_end];
                    let filename = disposition_param(headers, b"filename=");
                    let sink = match filename {
                        Some(name) if !self.file_started => {
                            self.file_started = true;
                            on_event(PartEvent::FileStart { filename: &name });
                            Sink::File
                        }
                        Some(_) => Sink::Skip,
                        None if self.file_started => Sink::Skip,
                        None => {
                            self.field_name = disposition_param(headers, b"name=").unwrap_or_default();
                            self.field_value.clear();
                            self.field_overflow = false;
                            Sink::Field
                        }
                    };

                    self.pending.drain(..body_start);
                    self.phase = Phase::Delimiter { sink };
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    /// Move the first `len` pending bytes into the current field value.
    fn collect_field(&mut self, len: usize) {
        if self.field_overflow {
            return;
        }
        if self.field_value.len() + len > MAX_FIELD_VALUE {
            self.field_overflow = true;
            self.field_value.clear();
            return;
        }
        self.field_value.extend_from_slice(&self.pending[..len]);
    }

    /// Check the body ended cleanly with a file in it.
    pub fn finish(&self) -> Result<(), MultipartError> {
        if self.phase != Phase::Done {
            return Err(MultipartError::Truncated);
        }
        if !self.file_started {
            return Err(MultipartError::NoFile);
        }
        Ok(())
    }
}

pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

/// Extract the boundary from `multipart/form-data; boundary=<value>`.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    if !is_multipart(content_type) {
        return None;
    }

    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("boundary=")? + "boundary=".len();
    let rest = &content_type[start..];

    let value = if let Some(inner) = rest.strip_prefix('"') {
        &inner[..inner.find('"')?]
    } else {
        let end = rest
            .find(|c: char| c == ';' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        &rest[..end]
    };

    (!value.is_empty()).then(|| value.to_string())
}

/// `<param>"<value>"` from a part's header block, e.g. `filename=`.
/// The parameter must start a word, so `name=` never matches inside
/// `filename=`. Empty values count as absent.
fn disposition_param(headers: &[u8], marker: &[u8]) -> Option<String> {
    let pos = headers.windows(marker.len()).enumerate().position(|(i, w)| {
        w.eq_ignore_ascii_case(marker) && (i == 0 || matches!(headers[i - 1], b';' | b' ' | b'\t'))
    })?;
    let rest = &headers[pos + marker.len()..];

    let value = if let Some(inner) = rest.strip_prefix(b"\"") {
        &inner[..inner.iter().position(|&b| b == b'"')?]
    } else {
        let end = rest
            .iter()
            .position(|&b| matches!(b, b';' | b'\r' | b'\n'))
            .unwrap_or(rest.len());
        &rest[..end]
    };

    if value.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(value).into_owned())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Collected {
        fields: Vec<(String, String)>,
        filename: Option<String>,
        data: Vec<u8>,
        ends: usize,
    }

    fn body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, content) in parts {
            out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(f) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        out
    }

    fn decode(boundary: &str, input: &[u8], slice: usize) -> (Collected, MultipartDecoder) {
        let mut decoder = MultipartDecoder::new(boundary);
        let mut collected = Collected::default();

        for piece in input.chunks(slice) {
            decoder
                .feed(piece, |event| match event {
                    PartEvent::Field { name, value } => collected.fields.push((name.to_string(), value.to_string())),
                    PartEvent::FileStart { filename } => collected.filename = Some(filename.to_string()),
                    PartEvent::Data(bytes) => collected.data.extend_from_slice(bytes),
                    PartEvent::FileEnd => collected.ends += 1,
                })
                .unwrap();
        }
        (collected, decoder)
    }

    #[test]
    fn test_extracts_file_part_for_any_slicing() {
        let image: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let input = body("XyZ123", &[("update", Some("fw.bin"), &image)]);

        for slice in [1, 2, 7, 64, 1024, input.len()] {
            let (collected, decoder) = decode("XyZ123", &input, slice);
            assert_eq!(collected.filename.as_deref(), Some("fw.bin"));
            assert_eq!(collected.data, image, "slice size {slice}");
            assert_eq!(collected.ends, 1);
            assert!(decoder.finish().is_ok());
        }
    }

    #[test]
    fn test_skips_fields_before_and_after_file() {
        let input = body(
            "b",
            &[
                ("mode", None, b"filesystem"),
                ("update", Some("fs.bin"), b"\r\nimage\r\n"),
                ("update", Some("second.bin"), b"ignored"),
            ],
        );
        let (collected, decoder) = decode("b", &input, 3);
        assert_eq!(collected.fields, vec![("mode".to_string(), "filesystem".to_string())]);
        assert_eq!(collected.filename.as_deref(), Some("fs.bin"));
        assert_eq!(collected.data, b"\r\nimage\r\n");
        assert_eq!(collected.ends, 1);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_fields_after_file_and_long_fields_are_not_reported() {
        let long = vec![b'x'; MAX_FIELD_VALUE + 1];
        let input = body(
            "b",
            &[
                ("notes", None, long.as_slice()),
                ("mode", None, b"filesystem"),
                ("update", Some("fs.bin"), b"image"),
                ("size", None, b"5"),
            ],
        );
        for slice in [1, 5, input.len()] {
            let (collected, _) = decode("b", &input, slice);
            assert_eq!(
                collected.fields,
                vec![("mode".to_string(), "filesystem".to_string())],
                "slice size {slice}"
            );
            assert_eq!(collected.data, b"image");
        }
    }

    #[test]
    fn test_disposition_param_matches_whole_words() {
        let headers = b"Content-Disposition: form-data; name=\"update\"; filename=\"fw.bin\"";
        assert_eq!(disposition_param(headers, b"name=").as_deref(), Some("update"));
        assert_eq!(disposition_param(headers, b"filename=").as_deref(), Some("fw.bin"));

        let headers = b"Content-Disposition: form-data; filename=\"fw.bin\"";
        assert_eq!(disposition_param(headers, b"name="), None);
    }

    #[test]
    fn test_empty_file_part() {
        let input = body("b", &[("update", Some("empty.bin"), b"")]);
        let (collected, decoder) = decode("b", &input, 16);
        assert!(collected.data.is_empty());
        assert_eq!(collected.ends, 1);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_truncated_body() {
        let input = body("b", &[("update", Some("fw.bin"), b"0123456789")]);
        let cut = &input[..input.len() - 10];
        let (collected, decoder) = decode("b", cut, 8);
        assert!(decoder.file_started());
        assert!(!decoder.file_finished());
        assert_eq!(collected.ends, 0);
        assert_eq!(decoder.finish(), Err(MultipartError::Truncated));
    }

    #[test]
    fn test_no_file_part() {
        let input = body("b", &[("mode", None, b"firmware")]);
        let (collected, decoder) = decode("b", &input, 5);
        assert_eq!(collected.filename, None);
        assert_eq!(decoder.finish(), Err(MultipartError::NoFile));
    }

    #[test]
    fn test_header_limit() {
        let mut input = b"--b\r\nX-Junk: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_PART_HEADERS + 10));
        let mut decoder = MultipartDecoder::new("b");
        assert_eq!(decoder.feed(&input, |_| {}), Err(MultipartError::HeadersTooLarge));
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=----WebKitFormBoundaryabc").as_deref(),
            Some("----WebKitFormBoundaryabc")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Form-Data; boundary=\"a b\"; charset=utf-8").as_deref(),
            Some("a b")
        );
        assert_eq!(boundary_from_content_type("application/octet-stream"), None);
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }
}
