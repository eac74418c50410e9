//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Parser for `multipart/form-data` bodies. Only the first part matters: the
//! upload endpoint accepts a single file per request, whatever the field is
//! named. The parser never copies the payload; it returns a byte range into
//! the request body.
//!
//! Real-world clients are sloppy about the trailing delimiter, so the part
//! terminator is searched in decreasing order of strictness: a proper closing
//! delimiter (CRLF or bare LF before it), then a plain next delimiter, and
//! finally end-of-body with a trailing CRLF trimmed.

use std::fmt;
use crate::util::find_subsequence;

#[derive(Debug, PartialEq, Eq)]
pub enum MultipartError {
    /// The delimiter derived from the Content-Type boundary never occurs.
    NoBoundary,
    /// The first part carries no usable Content-Disposition filename.
    NoContentDisposition,
    /// The part payload is empty.
    EmptyPayload,
    /// The part payload exceeds the configured image size limit.
    TooLarge { size: usize, limit: usize },
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultipartError::NoBoundary => write!(f, "multipart boundary not found in body"),
            MultipartError::NoContentDisposition => write!(f, "missing filename in Content-Disposition"),
            MultipartError::EmptyPayload => write!(f, "empty file payload"),
            MultipartError::TooLarge { size, limit } =>
                write!(f, "file payload of {} bytes exceeds limit of {} bytes", size, limit),
        }
    }
}

#[derive(Debug)]
pub struct Part<'a> {
    pub filename: String,
    /// Advisory only; the image data itself decides whether it is decodable.
    pub content_type: String,
    pub payload: &'a [u8],
}

/// Pulls the boundary token out of a `multipart/form-data; boundary=XYZ`
/// header value. The token ends at `;`, CR, LF, or end of the value.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let start = find_subsequence(content_type.as_bytes(), b"boundary=")? + "boundary=".len();
    let rest = &content_type[start..];
    let end = rest.find(|c| c == ';' || c == '\r' || c == '\n').unwrap_or(rest.len());
    let boundary = &rest[..end];
    if boundary.is_empty() { None } else { Some(boundary.to_string()) }
}

/// Parses the first part of `body`, returning its metadata and payload range.
/// `max_payload` is the configured per-image byte limit.
pub fn parse<'a>(body: &'a [u8], boundary: &str, max_payload: usize)
    -> Result<Part<'a>, MultipartError>
{
    let delimiter = format!("--{}", boundary).into_bytes();

    let delim_pos = find_subsequence(body, &delimiter).ok_or(MultipartError::NoBoundary)?;
    let mut pos = delim_pos + delimiter.len();

    // Step over the line break following the delimiter, tolerating a bare LF.
    if body.get(pos) == Some(&b'\r') { pos += 1; }
    if body.get(pos) == Some(&b'\n') { pos += 1; }

    let (headers_end, terminator_len) = match find_subsequence(&body[pos..], b"\r\n\r\n") {
        Some(end) => (pos + end, 4),
        None => match find_subsequence(&body[pos..], b"\n\n") {
            Some(end) => (pos + end, 2),
            None => return Err(MultipartError::NoContentDisposition),
        }
    };

    let headers = String::from_utf8_lossy(&body[pos..headers_end]);
    let filename = extract_filename(&headers).ok_or(MultipartError::NoContentDisposition)?;
    let content_type = extract_part_content_type(&headers).unwrap_or_default();

    let payload_start = headers_end + terminator_len;
    let payload_end = find_payload_end(body, payload_start, boundary);
    if payload_end <= payload_start {
        return Err(MultipartError::EmptyPayload);
    }

    let payload = &body[payload_start..payload_end];
    if payload.len() > max_payload {
        return Err(MultipartError::TooLarge { size: payload.len(), limit: max_payload });
    }

    Ok(Part { filename, content_type, payload })
}

/// Filename from a Content-Disposition header, quoted or bare.
fn extract_filename(headers: &str) -> Option<String> {
    let (start, quoted) = match find_subsequence(headers.as_bytes(), b"filename=\"") {
        Some(pos) => (pos + "filename=\"".len(), true),
        None => {
            let pos = find_subsequence(headers.as_bytes(), b"filename=")?;
            (pos + "filename=".len(), false)
        }
    };

    let rest = &headers[start..];
    let end = rest.find(|c| {
        c == '\r' || c == '\n' || (quoted && c == '"') || (!quoted && c == ';')
    }).unwrap_or(rest.len());

    let filename = rest[..end].trim();
    if filename.is_empty() { None } else { Some(filename.to_string()) }
}

fn extract_part_content_type(headers: &str) -> Option<String> {
    let pos = find_subsequence(headers.as_bytes(), b"Content-Type:")?;
    let rest = &headers[pos + "Content-Type:".len()..];
    let end = rest.find(|c| c == '\r' || c == '\n').unwrap_or(rest.len());
    let value = rest[..end].trim();
    if value.is_empty() { None } else { Some(value.to_string()) }
}

/// Finds where the payload stops. Candidates are tried in order; when the
/// body carries no further delimiter at all, the payload runs to end-of-body
/// minus one trailing line break.
fn find_payload_end(body: &[u8], payload_start: usize, boundary: &str) -> usize {
    let tail = &body[payload_start..];

    let candidates = [
        format!("\r\n--{}--", boundary),
        format!("\n--{}--", boundary),
        format!("\r\n--{}", boundary),
        format!("\n--{}", boundary),
    ];
    for candidate in &candidates {
        if let Some(pos) = find_subsequence(tail, candidate.as_bytes()) {
            return payload_start + pos;
        }
    }

    let mut end = body.len();
    if end >= 1 && body[end - 1] == b'\n' {
        end -= 1;
        if end >= 1 && body[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}
