//! # HTTP client
//!
//! Reworked from `original_source/net/http.cpp`'s `HttpClient`: parses an
//! `http://host[:port][/path]` URL, resolves the host (dotted-quad first,
//! [`crate::dns::DnsResolver`] otherwise), issues a `GET ... HTTP/1.1` over
//! a TCP connection opened through [`crate::stack::NetStack`], and follows
//! up to [`MAX_REDIRECTS`] `Location` redirects. Gated behind the
//! `http-client` feature — nothing else in this crate depends on it.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::collab::{Scheduler, TimeSource};
use crate::error::{NetError, Reason};
use crate::ip::Ipv4Address;
use crate::stack::NetStack;

pub const MAX_RESPONSE_SIZE: usize = 32_768;
pub const DEFAULT_PORT: u16 = 80;
pub const RECV_TIMEOUT_MS: u64 = 10_000;
pub const MAX_REDIRECTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 303 | 307 | 308) && self.location().is_some()
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("location"))
            .map(|(_, v)| v.as_str())
    }
}

struct Url {
    host: String,
    port: u16,
    path: String,
}

fn parse_url(url: &str) -> Result<Url, NetError> {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let host_end = rest.find(['/', ':']).unwrap_or(rest.len());
    let host = &rest[..host_end];
    if host.is_empty() {
        return Err(NetError::BadPacket(Reason::BadHeader));
    }
    let mut p = &rest[host_end..];

    let mut port = DEFAULT_PORT;
    if let Some(after_colon) = p.strip_prefix(':') {
        let digits_end = after_colon.find('/').unwrap_or(after_colon.len());
        let port_str = &after_colon[..digits_end];
        port = port_str.parse().map_err(|_| NetError::BadPacket(Reason::BadHeader))?;
        p = &after_colon[digits_end..];
    }

    let path = if p.is_empty() { "/".to_string() } else { p.to_string() };

    Ok(Url {
        host: host.to_string(),
        port,
        path,
    })
}

fn parse_dotted_quad(s: &str) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for slot in &mut octets {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
}

fn resolve_host(stack: &NetStack, host: &str, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<Ipv4Address, NetError> {
    if let Some(ip) = parse_dotted_quad(host) {
        return Ok(ip);
    }
    stack.dns_resolve(host, scheduler, time)
}

fn build_request(method: &str, host: &str, path: &str) -> Vec<u8> {
    format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").into_bytes()
}

/// Reads the response body until EOF, the 32 KiB cap, or the 10 s
/// inactivity timeout, whichever comes first, then splits it into status
/// line + headers + body.
fn recv_response(stack: &NetStack, slot: usize, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<HttpResponse, NetError> {
    let mut total = Vec::with_capacity(4096);
    let mut buf = [0u8; 1024];
    let mut deadline = time.now_ms() + RECV_TIMEOUT_MS;

    while total.len() < MAX_RESPONSE_SIZE {
        match stack.tcp_recv(slot, &mut buf, scheduler) {
            Ok(0) => break,
            Ok(n) => {
                total.extend_from_slice(&buf[..n]);
                deadline = time.now_ms() + RECV_TIMEOUT_MS;
            }
            Err(e) => return Err(e),
        }
        if time.now_ms() > deadline {
            break;
        }
    }

    if total.is_empty() {
        return Err(NetError::Timeout(Reason::RecvTimeout));
    }

    parse_response(&total)
}

fn parse_response(data: &[u8]) -> Result<HttpResponse, NetError> {
    let header_end = find_header_boundary(data).unwrap_or(data.len());
    let head = core::str::from_utf8(&data[..header_end]).map_err(|_| NetError::BadPacket(Reason::BadHeader))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let body = if header_end < data.len() { data[header_end..].to_vec() } else { Vec::new() };

    Ok(HttpResponse { status_code, headers, body })
}

/// Finds the `\r\n\r\n` header/body boundary, returning the offset just
/// past it.
fn find_header_boundary(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn do_get(stack: &NetStack, url: &str, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<HttpResponse, NetError> {
    let parsed = parse_url(url)?;
    let ip = resolve_host(stack, &parsed.host, scheduler, time)?;

    let slot = stack.tcp_connect(ip, parsed.port, scheduler, time)?;
    let request = build_request("GET", &parsed.host, &parsed.path);

    if let Err(e) = stack.tcp_send(slot, &request, scheduler, time) {
        stack.tcp_close(slot, time);
        return Err(e);
    }

    let response = recv_response(stack, slot, scheduler, time);
    stack.tcp_close(slot, time);
    response
}

/// Issues a GET request to `url`, following up to [`MAX_REDIRECTS`]
/// `http://` redirects.
pub fn http_get(stack: &NetStack, url: &str, scheduler: &dyn Scheduler, time: &dyn TimeSource) -> Result<HttpResponse, NetError> {
    let mut current = url.to_string();

    for _ in 0..=MAX_REDIRECTS {
        let resp = do_get(stack, &current, scheduler, time)?;
        if !resp.is_redirect() {
            return Ok(resp);
        }
        let location = resp.location().unwrap_or_default();
        if !location.starts_with("http://") {
            return Ok(resp);
        }
        current = location.to_string();
    }

    Err(NetError::Protocol(Reason::BadHeader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        let url = parse_url("http://example.com:8080/a/b").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/a/b");
    }

    #[test]
    fn defaults_port_and_root_path() {
        let url = parse_url("http://example.com").unwrap();
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.path, "/");
    }

    #[test]
    fn parses_dotted_quad_host() {
        assert_eq!(parse_dotted_quad("10.0.0.1"), Some(Ipv4Address::new(10, 0, 0, 1)));
        assert_eq!(parse_dotted_quad("not-an-ip"), None);
    }

    #[test]
    fn splits_status_headers_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, b"hello");
        assert_eq!(resp.headers.iter().find(|(k, _)| k == "Content-Length").unwrap().1, "5");
    }

    #[test]
    fn redirect_requires_location_header() {
        let raw = b"HTTP/1.1 302 Found\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert!(!resp.is_redirect());
    }

    #[test]
    fn redirect_with_location_is_detected() {
        let raw = b"HTTP/1.1 301 Moved Permanently\r\nLocation: http://example.com/new\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert!(resp.is_redirect());
        assert_eq!(resp.location(), Some("http://example.com/new"));
    }
}
