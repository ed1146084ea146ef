//! Fingerprint derivation and comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use pulse_core::config::{FingerprintConfig, FingerprintField};

use crate::environment::Environment;

/// Sentinel recorded when the canvas signal is blocked. Two contexts with
/// blocked canvas still compare equal on the canvas field.
pub const CANVAS_UNAVAILABLE: &str = "unavailable";

/// Derived, comparable device signature. Persisted alongside the session and
/// re-derived on validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFingerprint {
    /// `{width}x{height}x{depth}`.
    pub resolution: String,
    pub timezone_offset: i32,
    pub language: String,
    pub platform: String,
    pub browser: String,
    pub plugins_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_hash: Option<String>,
    /// Combined 32-bit hash over every captured element, hex-rendered.
    pub hash: String,
}

impl SessionFingerprint {
    /// Fields on which `self` and `other` disagree. The caller decides which
    /// of those are critical.
    pub fn diff(&self, other: &SessionFingerprint) -> Vec<FingerprintField> {
        let mut mismatched = Vec::new();
        if self.platform != other.platform {
            mismatched.push(FingerprintField::Platform);
        }
        if self.browser != other.browser {
            mismatched.push(FingerprintField::Browser);
        }
        if self.resolution != other.resolution {
            mismatched.push(FingerprintField::Resolution);
        }
        if self.timezone_offset != other.timezone_offset {
            mismatched.push(FingerprintField::Timezone);
        }
        if self.language != other.language {
            mismatched.push(FingerprintField::Language);
        }
        if self.plugins_hash != other.plugins_hash {
            mismatched.push(FingerprintField::Plugins);
        }
        // Canvas only participates when both sides captured it; a blocked
        // signal on either side is not drift.
        if let (Some(a), Some(b)) = (&self.canvas_hash, &other.canvas_hash) {
            if a != b {
                mismatched.push(FingerprintField::Canvas);
            }
        }
        mismatched
    }
}

/// Reduce an arbitrary composite string to a stable 32-bit hash, rendered
/// as 8 hex chars.
pub fn stable_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

/// Derives [`SessionFingerprint`]s from an [`Environment`].
pub struct FingerprintGenerator {
    config: FingerprintConfig,
}

impl FingerprintGenerator {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    /// Capture the configured elements and derive the signature. Async to
    /// leave room for hosts whose canvas rendering is slow; the derivation
    /// itself never blocks.
    pub async fn generate(&self, env: &dyn Environment) -> SessionFingerprint {
        let device = env.device();

        let resolution = format!(
            "{}x{}x{}",
            device.screen_width, device.screen_height, device.color_depth
        );
        let mut plugins = device.plugins.clone();
        plugins.sort();
        let plugins_hash = stable_hash(&plugins.join(","));

        let canvas_hash = if self.config.include_canvas {
            Some(match env.canvas_signature() {
                Ok(signature) => stable_hash(&signature),
                Err(e) => {
                    tracing::debug!(error = %e, "canvas signal unavailable");
                    CANVAS_UNAVAILABLE.to_string()
                }
            })
        } else {
            None
        };

        let composite = format!(
            "{resolution}|{}|{}|{}|{}|{}|{plugins_hash}|{}",
            device.timezone_offset_minutes,
            device.language,
            device.platform,
            device.browser,
            device.browser_version,
            canvas_hash.as_deref().unwrap_or(""),
        );

        SessionFingerprint {
            resolution,
            timezone_offset: device.timezone_offset_minutes,
            language: device.language,
            platform: device.platform,
            browser: device.browser,
            plugins_hash,
            canvas_hash,
            hash: stable_hash(&composite),
        }
    }
}
