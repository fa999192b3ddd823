// Request/response helpers shared by the HTTP adapters

/// Outcome reported to the uploading client.
///
/// Both variants are sent with status 200; clients inspect the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResponse {
    Ok,
    Fail,
}

impl UploadResponse {
    pub fn body(self) -> &'static str {
        match self {
            UploadResponse::Ok => "OK",
            UploadResponse::Fail => "FAIL",
        }
    }

    pub fn status(self) -> u16 {
        200
    }

    pub fn is_ok(self) -> bool {
        self == UploadResponse::Ok
    }
}

/// Extract and percent-decode a query parameter from a request URI.
pub fn query_param(uri: &str, name: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    let query = query.split('#').next().unwrap_or(query);

    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key) == name).then(|| percent_decode(value))
        })
        .next()
}

/// Decode `+` and `%XX` escapes. Malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Parse a declared size (`size` parameter or `Content-Length`); 0 = unknown.
pub fn parse_size_hint(value: Option<&str>) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0)
}
