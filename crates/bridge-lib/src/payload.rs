//! Wire payload encoding
//!
//! One schema is active per deployment:
//! - `form`: `application/x-www-form-urlencoded` key/value body
//! - `json`: structured body, wrapped in a signed envelope when signing is on

use crate::models::{DeviceInfo, Reading};
use crate::signing::{SigningError, SigningService};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Payload schema agreed with the collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Form,
    Json,
}

/// Encoded request body ready for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    pub content_type: &'static str,
    pub body: String,
}

/// Cache occupancy reported alongside a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOccupancy {
    pub occupancy: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
struct JsonBody<'a> {
    device_id: &'a str,
    timestamp: String,
    temperature: f32,
    humidity: f32,
    sequence_id: u64,
    buffer: BufferOccupancy,
}

/// Builds wire payloads from readings
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    format: PayloadFormat,
    device: DeviceInfo,
    /// Collector access token sent as the `secret` form field
    form_secret: Option<String>,
    metadata: Vec<(String, String)>,
    encrypt: bool,
}

impl PayloadEncoder {
    pub fn new(format: PayloadFormat, device: DeviceInfo) -> Self {
        Self {
            format,
            device,
            form_secret: None,
            metadata: Vec::new(),
            encrypt: false,
        }
    }

    pub fn form_secret(mut self, secret: impl Into<String>) -> Self {
        self.form_secret = Some(secret.into());
        self
    }

    /// Extra key/value pairs appended to form payloads
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Encrypt JSON bodies before signing. Ignored for form payloads.
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        if encrypt && self.format == PayloadFormat::Form {
            warn!("Payload encryption is only applied to the json format");
        }
        self.encrypt = encrypt;
        self
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Encode `reading`, signing (and optionally encrypting) through `signer`.
    ///
    /// `received_at_ms` is also the signing time of the envelope.
    pub fn encode(
        &self,
        reading: &Reading,
        buffer: BufferOccupancy,
        received_at_ms: u64,
        signer: &SigningService,
    ) -> Result<WirePayload, SigningError> {
        match self.format {
            PayloadFormat::Form => Ok(self.encode_form(reading, received_at_ms, signer)),
            PayloadFormat::Json => self.encode_json(reading, buffer, received_at_ms, signer),
        }
    }

    fn encode_form(
        &self,
        reading: &Reading,
        received_at_ms: u64,
        signer: &SigningService,
    ) -> WirePayload {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        if let Some(secret) = &self.form_secret {
            form.append_pair("secret", secret);
        }
        form.append_pair("device_id", &self.device.device_id)
            .append_pair("temperature", &format!("{:.2}", reading.temperature))
            .append_pair("humidity", &format!("{:.2}", reading.humidity))
            .append_pair("latitude", &self.device.latitude.to_string())
            .append_pair("longitude", &self.device.longitude.to_string())
            .append_pair("received_at", &received_at_ms.to_string())
            .append_pair("sequence_id", &reading.sequence_id.to_string())
            .append_pair("firmware_version", &self.device.firmware_version);
        if !self.device.location_name.is_empty() {
            form.append_pair("location", &self.device.location_name);
        }
        for (key, value) in &self.metadata {
            form.append_pair(key, value);
        }
        let unsigned = form.finish();

        let body = match signer.envelope(&unsigned, received_at_ms) {
            Some(envelope) => {
                let mut signed = url::form_urlencoded::Serializer::for_suffix(unsigned, 0);
                signed
                    .append_pair("signature", &envelope.signature)
                    .append_pair("signed_at", &envelope.timestamp.to_string());
                signed.finish()
            }
            None => unsigned,
        };

        WirePayload {
            content_type: CONTENT_TYPE_FORM,
            body,
        }
    }

    fn encode_json(
        &self,
        reading: &Reading,
        buffer: BufferOccupancy,
        signed_at_ms: u64,
        signer: &SigningService,
    ) -> Result<WirePayload, SigningError> {
        let body = JsonBody {
            device_id: &self.device.device_id,
            timestamp: rfc3339(reading.captured_at_ms),
            temperature: reading.temperature,
            humidity: reading.humidity,
            sequence_id: reading.sequence_id,
            buffer,
        };
        let json = serde_json::to_string(&body)?;

        let inner = if self.encrypt && signer.is_enabled() {
            hex::encode(signer.encrypt(json.as_bytes())?)
        } else {
            json
        };

        Ok(WirePayload {
            content_type: CONTENT_TYPE_JSON,
            body: signer.sign(&inner, signed_at_ms)?,
        })
    }
}

fn rfc3339(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}
