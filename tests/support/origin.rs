//! Mock origins for transfer tests.

use std::sync::Arc;
use std::time::Duration;

use wiremock::{Request, Respond, ResponseTemplate};

/// Serves a fixed body, honouring single `Range: bytes=a-b` requests with 206.
#[allow(dead_code)]
pub struct RangeOrigin {
    body: Arc<Vec<u8>>,
    delay: Duration,
    honour_ranges: bool,
}

#[allow(dead_code)]
impl RangeOrigin {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            delay: Duration::ZERO,
            honour_ranges: true,
        }
    }

    /// Answers every request with the whole body and 200.
    pub fn ignoring_ranges(body: Vec<u8>) -> Self {
        Self {
            honour_ranges: false,
            ..Self::new(body)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Respond for RangeOrigin {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range)
            .filter(|_| self.honour_ranges);

        let template = match range {
            Some((start, last)) if start < total => {
                let end = (last + 1).min(total);
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes {start}-{}/{total}", end - 1))
                    .set_body_bytes(self.body[start..end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
        };
        template.set_delay(self.delay)
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, last) = spec.split_once('-')?;
    Some((start.parse().ok()?, last.parse().ok()?))
}

/// Deterministic, non-repeating-looking test payload.
#[allow(dead_code)]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}
