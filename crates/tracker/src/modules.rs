//! Pluggable instrumentation modules. Each module derives extra events from
//! a page view; behavioral DOM capture stays on the host side of the
//! [`Instrument`] boundary.

use pulse_core::events::TrackedEventType;
use pulse_fingerprint::Environment;

/// An instrumentation module attached to the tracker.
pub trait Instrument: Send + Sync {
    /// Stable module name, recorded on derived events.
    fn name(&self) -> &'static str;

    /// Events derived from the current page view, as
    /// `(event type, payload)` pairs.
    fn on_page_view(&self, env: &dyn Environment) -> Vec<(TrackedEventType, serde_json::Value)>;
}

/// Detects the visitor's browser/OS stack from the device signals and emits
/// one `technology` event per page view.
pub struct TechnologyDetector;

impl TechnologyDetector {
    fn browser_family(user_agent: &str, fallback: &str) -> String {
        let ua = user_agent.to_ascii_lowercase();
        // Order matters: Edge and Opera embed "chrome", Chrome embeds "safari".
        let family = if ua.contains("edg/") {
            "Edge"
        } else if ua.contains("opr/") || ua.contains("opera") {
            "Opera"
        } else if ua.contains("chrome") {
            "Chrome"
        } else if ua.contains("firefox") {
            "Firefox"
        } else if ua.contains("safari") {
            "Safari"
        } else {
            return fallback.to_string();
        };
        family.to_string()
    }

    fn os_family(user_agent: &str, fallback: &str) -> String {
        let ua = user_agent.to_ascii_lowercase();
        let family = if ua.contains("android") {
            "Android"
        } else if ua.contains("iphone") || ua.contains("ipad") {
            "iOS"
        } else if ua.contains("windows") {
            "Windows"
        } else if ua.contains("mac os") || ua.contains("macintosh") {
            "macOS"
        } else if ua.contains("linux") {
            "Linux"
        } else {
            return fallback.to_string();
        };
        family.to_string()
    }
}

impl Instrument for TechnologyDetector {
    fn name(&self) -> &'static str {
        "technology"
    }

    fn on_page_view(&self, env: &dyn Environment) -> Vec<(TrackedEventType, serde_json::Value)> {
        let device = env.device();
        let payload = serde_json::json!({
            "browser": Self::browser_family(&device.user_agent, &device.browser),
            "browser_version": device.browser_version,
            "os": Self::os_family(&device.user_agent, &device.platform),
            "screen_resolution": format!("{}x{}", device.screen_width, device.screen_height),
            "language": device.language,
            "plugins": device.plugins,
        });
        vec![(TrackedEventType::Technology, payload)]
    }
}

/// Emits one `performance` event per page view when the host measured
/// navigation timing; silent otherwise.
pub struct PerformanceTiming;

impl Instrument for PerformanceTiming {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn on_page_view(&self, env: &dyn Environment) -> Vec<(TrackedEventType, serde_json::Value)> {
        let Some(timing) = env.timing() else {
            return Vec::new();
        };
        vec![(
            TrackedEventType::Performance,
            serde_json::json!({
                "load_time_ms": timing.load_time_ms,
                "dom_ready_ms": timing.dom_ready_ms,
                "first_byte_ms": timing.first_byte_ms,
            }),
        )]
    }
}
