//! The signal seam between the tracker and its embedding host.

use pulse_core::events::{PageContext, PageTiming};
use serde::{Deserialize, Serialize};

/// Raw device signals supplied by the host on capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProfile {
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u8,
    /// Offset from UTC in minutes, as reported by the host clock.
    pub timezone_offset_minutes: i32,
    pub language: String,
    pub platform: String,
    pub browser: String,
    pub browser_version: String,
    pub user_agent: String,
    pub plugins: Vec<String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            screen_width: 1920,
            screen_height: 1080,
            color_depth: 24,
            timezone_offset_minutes: 0,
            language: "en-US".into(),
            platform: "unknown".into(),
            browser: "unknown".into(),
            browser_version: "0".into(),
            user_agent: String::new(),
            plugins: Vec::new(),
        }
    }
}

/// Supplies device and page signals to the tracker. Embedding hosts
/// (webview bridges, instrumentation shims) implement this; the tracker
/// never reaches into the host environment directly.
pub trait Environment: Send + Sync {
    fn device(&self) -> DeviceProfile;

    fn page(&self) -> PageContext;

    /// Navigation timing for the current page, when the host measures it.
    fn timing(&self) -> Option<PageTiming> {
        None
    }

    /// Canvas-derived entropy. Hosts where canvas access is blocked (privacy
    /// extensions, sandboxed webviews) return an error; callers treat that
    /// as a soft miss, never a failure.
    fn canvas_signature(&self) -> anyhow::Result<String> {
        anyhow::bail!("canvas signal not supported by this host")
    }
}

/// A fixed-signal environment for embedding hosts without live signal
/// sources, and for tests.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    device: DeviceProfile,
    page: PageContext,
    timing: Option<PageTiming>,
    canvas: Option<String>,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            device: DeviceProfile::default(),
            page: PageContext {
                url: "app://localhost/".into(),
                title: String::new(),
                referrer: None,
            },
            timing: None,
            canvas: None,
        }
    }
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = device;
        self
    }

    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    pub fn with_timing(mut self, timing: PageTiming) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn with_canvas(mut self, signature: impl Into<String>) -> Self {
        self.canvas = Some(signature.into());
        self
    }
}

impl Environment for StaticEnvironment {
    fn device(&self) -> DeviceProfile {
        self.device.clone()
    }

    fn page(&self) -> PageContext {
        self.page.clone()
    }

    fn timing(&self) -> Option<PageTiming> {
        self.timing
    }

    fn canvas_signature(&self) -> anyhow::Result<String> {
        self.canvas
            .clone()
            .ok_or_else(|| anyhow::anyhow!("canvas signal blocked"))
    }
}
