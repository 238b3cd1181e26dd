//! Minimal HTTP/1.1 framing: request serialization and response parsing

use crate::IpcError;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed reply from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    /// Header names as received. Duplicate names: last one wins.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as text, when it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| IpcError::InvalidResponse(format!("body is not the expected JSON: {e}")))
    }
}

/// Serialize one request. `Host` is a placeholder; `Connection: close` is
/// always sent because every call uses a fresh socket.
pub fn encode_request(
    method: Method,
    path: &str,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<Vec<u8>, IpcError> {
    if !path.starts_with('/') || path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(IpcError::InvalidRequest(format!("bad request path: {path:?}")));
    }

    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        if name.is_empty()
            || name.bytes().any(|b| b == b':' || b.is_ascii_whitespace() || b.is_ascii_control())
            || value.bytes().any(|b| b == b'\r' || b == b'\n')
        {
            return Err(IpcError::InvalidRequest(format!("bad header: {name:?}")));
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    Ok(out)
}

/// Parse a complete response read up to EOF
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse, IpcError> {
    if raw.is_empty() {
        return Err(invalid("empty response"));
    }

    let (head, body) = match find(raw, HEAD_END) {
        Some(i) => (&raw[..i], &raw[i + HEAD_END.len()..]),
        // Peer closed right after the headers
        None => (raw, &raw[raw.len()..]),
    };
    let head = std::str::from_utf8(head).map_err(|_| invalid("response head is not UTF-8"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().filter(|l| !l.is_empty()).ok_or_else(|| invalid("missing status line"))?;
    let (status_code, reason) = parse_status_line(status_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(": ")
            .filter(|(name, _)| !name.is_empty() && !name.contains(char::is_whitespace))
            .ok_or_else(|| invalid(&format!("malformed header line: {line:?}")))?;
        headers.insert(name.to_string(), value.trim_end().to_string());
    }

    let mut response = HttpResponse {
        status_code,
        reason,
        headers,
        body: body.to_vec(),
    };

    let chunked = response
        .header("Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        response.body = decode_chunked(&response.body)?;
    } else if let Some(len) = response.header("Content-Length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| invalid(&format!("bad Content-Length: {len:?}")))?;
        if response.body.len() < len {
            return Err(invalid(&format!(
                "truncated body: expected {len} bytes, got {}",
                response.body.len()
            )));
        }
        response.body.truncate(len);
    }

    Ok(response)
}

fn parse_status_line(line: &str) -> Result<(u16, String), IpcError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(invalid(&format!("bad status line: {line:?}")));
    }
    let code = parts.next().unwrap_or_default();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(&format!("non-numeric status code: {code:?}")));
    }
    let status = code
        .parse()
        .map_err(|_| invalid(&format!("non-numeric status code: {code:?}")))?;
    Ok((status, parts.next().unwrap_or_default().to_string()))
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, IpcError> {
    let mut out = Vec::new();
    loop {
        let line_end = find(data, b"\r\n").ok_or_else(|| invalid("truncated chunk size"))?;
        let size_line = std::str::from_utf8(&data[..line_end]).map_err(|_| invalid("bad chunk size"))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| invalid(&format!("bad chunk size: {size_hex:?}")))?;
        data = &data[line_end + 2..];

        if size == 0 {
            // Trailers are ignored
            return Ok(out);
        }
        if data.len() < size + 2 || &data[size..size + 2] != b"\r\n" {
            return Err(invalid("truncated chunk"));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn invalid(msg: &str) -> IpcError {
    IpcError::InvalidResponse(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_reply() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Auth-Token: abc\r\n\r\n{\"status\":\"healthy\"}";
        let resp = parse_response(raw).unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(
            resp.headers,
            HashMap::from([("X-Auth-Token".to_string(), "abc".to_string())])
        );
        assert_eq!(resp.text(), Some("{\"status\":\"healthy\"}"));
        assert_eq!(resp.header("x-auth-token"), Some("abc"));
    }

    #[test]
    fn test_duplicate_headers_last_wins() {
        let raw = b"HTTP/1.1 204 No Content\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.header("X-A"), Some("2"));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_head_without_blank_line() {
        let resp = parse_response(b"HTTP/1.1 503 Service Unavailable\r\nServer: x").unwrap();
        assert_eq!(resp.status_code, 503);
        assert!(!resp.is_success());
    }

    #[test]
    fn test_rejects_garbage() {
        let cases: [&[u8]; 6] = [
            b"",
            b"\r\n\r\n",
            b"SSH-2.0-OpenSSH\r\n\r\n",
            b"HTTP/1.1 OK fine\r\n\r\n",
            b"HTTP/1.1 2000 Big\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nno-colon-here\r\n\r\n",
        ];
        for raw in cases {
            let err = parse_response(raw).unwrap_err();
            assert!(matches!(err, IpcError::InvalidResponse(_)), "{raw:?}");
            assert!(!err.is_transport());
        }
    }

    #[test]
    fn test_content_length_truncates_and_detects_short_body() {
        let resp = parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA").unwrap();
        assert_eq!(resp.body, b"ok");

        let err = parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").unwrap_err();
        assert!(matches!(err, IpcError::InvalidResponse(_)));
    }

    #[test]
    fn test_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\"\r\n4\r\n:1}\n\r\n0\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.body, b"{\"a\":1}\n");
    }

    #[test]
    fn test_non_utf8_body_stays_raw() {
        let resp = parse_response(b"HTTP/1.1 200 OK\r\n\r\n\xff\xfe").unwrap();
        assert_eq!(resp.body, vec![0xff, 0xfe]);
        assert_eq!(resp.text(), None);
    }

    #[test]
    fn test_encode_post() {
        let headers = vec![("X-Auth-Token".to_string(), "t0k".to_string())];
        let raw = encode_request(Method::Post, "/search", &headers, Some(b"{}")).unwrap();
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            "POST /search HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             X-Auth-Token: t0k\r\nContent-Length: 2\r\n\r\n{}"
        );
    }

    #[test]
    fn test_encode_get_has_no_content_length() {
        let raw = encode_request(Method::Get, "/health", &[], None).unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("GET /health HTTP/1.1\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_rejects_header_injection() {
        let headers = vec![("X-Auth-Token".to_string(), "a\r\nX-Evil: 1".to_string())];
        assert!(matches!(
            encode_request(Method::Get, "/health", &headers, None),
            Err(IpcError::InvalidRequest(_))
        ));
        assert!(encode_request(Method::Get, "health", &[], None).is_err());
    }
}
