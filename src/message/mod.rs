//! Sidecar metadata extraction from the raw RFC-5322 stream.
//!
//! The raw bytes are never rewritten; parsing exists only to fill the
//! `<UID>.json` sidecar and to materialize attachment side-car files.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};
use tracing::warn;

const MAX_MIME_DEPTH: usize = 20;
const MAX_ATTACHMENT_PARTS: usize = 200;

/// One attachment leaf from the MIME tree, already transfer-decoded.
#[derive(Debug)]
pub struct AttachmentPart {
    pub filename: String,
    pub mime_type: String,
    pub transfer_encoding: String,
    pub data: Vec<u8>,
}

/// Everything the sidecar needs, extracted in one pass.
#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub attachments: Vec<AttachmentPart>,
    /// Set when an encoded-word header failed to decode and the raw bytes
    /// were kept instead.
    pub decode_fallback: bool,
}

/// Content digest of the raw stream, hex-encoded. The algorithm lives here
/// and nowhere else; the sidecar only ever sees the hex string.
pub fn digest(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

/// Parses the raw message into sidecar fields. Degrades rather than fails:
/// an unparseable message yields empty metadata and the caller still
/// persists the bytes verbatim.
pub fn parse_message(raw: &[u8], internal_date: Option<DateTime<Utc>>) -> ParsedMessage {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "unparseable message, storing with empty metadata");
            return ParsedMessage {
                date: internal_date,
                ..ParsedMessage::default()
            };
        }
    };

    let mut decode_fallback = false;
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for header in &parsed.headers {
        let raw_value = String::from_utf8_lossy(header.get_value_raw()).trim().to_string();
        headers.entry(header.get_key()).or_default().push(raw_value);
    }

    let subject = decoded_header(&parsed, "Subject", &mut decode_fallback).unwrap_or_default();
    let from = primary_address(&parsed, "From", &mut decode_fallback)
        .or_else(|| return_path_address(&parsed))
        .unwrap_or_default();
    let to = primary_address(&parsed, "To", &mut decode_fallback).unwrap_or_default();
    let date = message_date(&parsed).or(internal_date);

    let mut attachments = Vec::new();
    collect_attachments(&parsed, 0, &mut attachments);

    ParsedMessage {
        subject,
        from,
        to,
        date,
        headers,
        attachments,
        decode_fallback,
    }
}

/// Decoded header value, noting when encoded words survived decoding (an
/// unknown charset degrades to the raw text).
fn decoded_header(parsed: &ParsedMail, name: &str, fallback: &mut bool) -> Option<String> {
    let value = parsed.headers.get_first_value(name)?;
    if value.contains("=?") {
        *fallback = true;
    }
    Some(value)
}

/// `Display Name <addr>` (or bare addr) of the first mailbox in the header.
fn primary_address(parsed: &ParsedMail, name: &str, fallback: &mut bool) -> Option<String> {
    let value = decoded_header(parsed, name, fallback)?;
    match mailparse::addrparse(&value) {
        Ok(list) => list.iter().find_map(|addr| match addr {
            mailparse::MailAddr::Single(info) => Some(match &info.display_name {
                Some(display) if !display.is_empty() => {
                    format!("{} <{}>", display, info.addr)
                }
                _ => info.addr.clone(),
            }),
            mailparse::MailAddr::Group(group) => group
                .addrs
                .first()
                .map(|info| info.addr.clone()),
        }),
        // Keep whatever the sender wrote; the sidecar is descriptive.
        Err(_) => Some(value),
    }
}

fn return_path_address(parsed: &ParsedMail) -> Option<String> {
    let value = parsed.headers.get_first_value("Return-Path")?;
    let trimmed = value.trim().trim_start_matches('<').trim_end_matches('>').to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn message_date(parsed: &ParsedMail) -> Option<DateTime<Utc>> {
    let value = parsed.headers.get_first_value("Date")?;
    let ts = mailparse::dateparse(&value).ok()?;
    DateTime::from_timestamp(ts, 0)
}

/// Walks the MIME tree and emits a part for each attachment leaf: a part
/// with `Content-Disposition: attachment` or a name/filename parameter.
/// Bodies come out transfer-decoded (base64 / quoted-printable / identity).
fn collect_attachments(part: &ParsedMail, depth: usize, out: &mut Vec<AttachmentPart>) {
    if depth > MAX_MIME_DEPTH || out.len() >= MAX_ATTACHMENT_PARTS {
        return;
    }

    let is_container = part.ctype.mimetype.starts_with("multipart/") && !part.subparts.is_empty();
    if !is_container {
        let disposition = part.get_content_disposition();
        let filename = part_filename(part);
        let is_attachment =
            matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

        if is_attachment {
            let data = match part.get_body_raw() {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "undecodable attachment body, skipping part");
                    return;
                }
            };
            let transfer_encoding = part
                .headers
                .get_first_value("Content-Transfer-Encoding")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "7bit".to_string());
            out.push(AttachmentPart {
                filename: filename.unwrap_or_else(|| "unknown".to_string()),
                mime_type: part.ctype.mimetype.clone(),
                transfer_encoding,
                data,
            });
        }
    }

    for child in &part.subparts {
        collect_attachments(child, depth + 1, out);
    }
}

fn part_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    let disp_name = disposition
        .params
        .get("filename")
        .or_else(|| disposition.params.get("name"))
        .cloned();
    let ctype_name = part
        .ctype
        .params
        .get("name")
        .or_else(|| part.ctype.params.get("filename"))
        .cloned();

    disp_name.or(ctype_name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
