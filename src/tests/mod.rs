mod actions;
mod config;
mod handler;
mod request;

use crate::request::PolicyRequest;

/// Build a PRR from `key=value` lines the way the wire would deliver them
pub(crate) fn request_from(lines: &[&str]) -> PolicyRequest {
    let frame = format!("{}\n\n", lines.join("\n"));
    PolicyRequest::parse(frame.as_bytes(), encoding_rs::UTF_8)
        .expect("Failed to parse test frame")
}
