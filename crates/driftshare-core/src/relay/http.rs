// Copyright (c) 2024-2026 Driftshare Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! A deliberately small HTTP/1.1 subset, spoken directly over tokio
//! sockets: request line + headers + `Content-Length` bodies, one request
//! per connection. Shared by the relay client and server; large download
//! bodies are streamed by the callers around [`write_response_head`] and
//! [`read_response_head`].

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::NodeError;

const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;
const MAX_HEADER_COUNT: usize = 64;
/// Upper bound for buffered bodies (a relay chunk plus overhead);
/// streaming paths are not subject to it.
pub const MAX_BUFFERED_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path plus query string, exactly as on the request line.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_owned(),
            target: target.to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.target.split_once('?')?.1;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == name {
                return Some(decode_query_component(value));
            }
        }
        None
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body).context("parse json request body")
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_owned(), "text/plain".to_owned())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn json(status: u16, value: &impl Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self {
            status,
            headers: vec![(
                "Content-Type".to_owned(),
                "application/json".to_owned(),
            )],
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body).context("parse json response body")
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        410 => "Gone",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

async fn read_header_block<R>(reader: &mut R) -> anyhow::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            anyhow::bail!(NodeError::protocol("connection closed mid-header"));
        }
        if read > MAX_HEADER_LINE_BYTES {
            anyhow::bail!(NodeError::protocol("header line exceeds max size"));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(lines);
        }
        if lines.len() >= MAX_HEADER_COUNT {
            anyhow::bail!(NodeError::protocol("too many headers"));
        }
        lines.push(trimmed.to_owned());
    }
}

fn parse_header_lines(lines: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    lines
        .iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| NodeError::protocol(format!("malformed header: {line}")))?;
            Ok((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn content_length(headers: &[(String, String)]) -> anyhow::Result<Option<usize>> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            let len = value
                .parse::<usize>()
                .map_err(|_| NodeError::protocol("bad Content-Length"))?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}

/// Server side: read one full request including its buffered body.
pub async fn read_request<S>(io: &mut S) -> anyhow::Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(io);
    let mut lines = read_header_block(&mut reader).await?;
    if lines.is_empty() {
        anyhow::bail!(NodeError::protocol("missing request line"));
    }
    let request_line = lines.remove(0);
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| NodeError::protocol("missing method"))?
        .to_owned();
    let target = parts
        .next()
        .ok_or_else(|| NodeError::protocol("missing request target"))?
        .to_owned();

    let headers = parse_header_lines(&lines)?;
    let body = match content_length(&headers)? {
        Some(len) if len > MAX_BUFFERED_BODY_BYTES => {
            anyhow::bail!(NodeError::protocol("request body exceeds max size"));
        }
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            body
        }
        None => Vec::new(),
    };

    Ok(HttpRequest {
        method,
        target,
        headers,
        body,
    })
}

/// Write a complete buffered response. `Content-Length` and
/// `Connection: close` are filled in here.
pub async fn write_response<S>(io: &mut S, response: &HttpResponse) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response_head(io, response.status, &response.headers, Some(response.body.len() as u64))
        .await?;
    io.write_all(&response.body).await?;
    io.flush().await?;
    Ok(())
}

/// Write status line and headers only; the caller streams the body.
pub async fn write_response_head<S>(
    io: &mut S,
    status: u16,
    headers: &[(String, String)],
    content_length: Option<u64>,
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    io.write_all(head.as_bytes()).await?;
    Ok(())
}

/// Client side: send one request. `Content-Length` is always present so
/// the server never has to guess.
pub async fn write_request<S>(io: &mut S, host: &str, request: &HttpRequest) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.target);
    head.push_str(&format!("Host: {host}\r\n"));
    for (name, value) in &request.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    head.push_str("Connection: close\r\n\r\n");
    io.write_all(head.as_bytes()).await?;
    io.write_all(&request.body).await?;
    io.flush().await?;
    Ok(())
}

/// Client side: read status line and headers, leaving the body on the
/// reader for the caller to stream.
pub async fn read_response_head<R>(
    reader: &mut BufReader<R>,
) -> anyhow::Result<(u16, Vec<(String, String)>)>
where
    R: AsyncRead + Unpin,
{
    let mut lines = read_header_block(reader).await?;
    if lines.is_empty() {
        anyhow::bail!(NodeError::protocol("missing status line"));
    }
    let status_line = lines.remove(0);
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| NodeError::protocol("missing http version"))?;
    if !version.starts_with("HTTP/1.") {
        anyhow::bail!(NodeError::protocol(format!("unexpected version {version}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| NodeError::protocol("missing status code"))?;
    Ok((status, parse_header_lines(&lines)?))
}

/// Client side: read one full buffered response.
pub async fn read_response<S>(io: &mut S) -> anyhow::Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(io);
    let (status, headers) = read_response_head(&mut reader).await?;
    let body = match content_length(&headers)? {
        Some(len) if len > MAX_BUFFERED_BODY_BYTES => {
            anyhow::bail!(NodeError::protocol("response body exceeds max size"));
        }
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await?;
            body
        }
    };
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// `bytes=N-` → N. Anything else is ignored, matching the relay's
/// start-offset-only resume contract.
pub fn parse_range_start(value: &str) -> Option<u64> {
    let range = value.strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.parse::<u64>().ok()
}

/// Split an `http://host[:port]/path` URL.
pub fn parse_url(url: &str) -> anyhow::Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| NodeError::protocol(format!("only http:// urls are supported: {url}")))?;
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, "/".to_owned()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_owned(),
            port.parse::<u16>()
                .map_err(|_| NodeError::protocol(format!("bad port in url {url}")))?,
        ),
        None => (authority.to_owned(), 80),
    };
    Ok((host, port, path))
}

pub fn encode_query_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn decode_query_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' if index + 2 < bytes.len() => {
                match u8::from_str_radix(&input[index + 1..index + 3], 16) {
                    Ok(value) => {
                        out.push(value);
                        index += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        index += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                index += 1;
            }
            other => {
                out.push(other);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
