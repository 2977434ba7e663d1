// Module: Browser
// Capability contract the engine drives. The CDP transport lives behind
// this trait; the engine never sees wire-level details.

pub mod fake;

use anyhow::Result;
use async_trait::async_trait;

use crate::evidence::{ConsoleMessage, MockRule, NetworkResponse};
use crate::protocol::DialogAction;
use serde_json::Value;

/// The capability set a run drives.
///
/// Implementations promise:
/// - `evaluate` returns JSON-serialisable values and surfaces CDP errors
///   as `Err`.
/// - `fill` sets the value through the element's native setter and then
///   dispatches bubbling `input` and `change` events, which is what
///   controlled-input frameworks observe.
/// - `press_key` accepts DOM key names (`Enter`, `Tab`, `Escape`,
///   `ArrowDown`, ...).
/// - `reset` clears the evidence buffers and the mock-rule table; the
///   orchestrator calls it once before every run.
#[async_trait]
pub trait BrowserClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn evaluate(&self, js: &str) -> Result<Value>;

    async fn fill(&self, selector: &str, value: &str) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn select(&self, selector: &str, value: &str) -> Result<()>;

    async fn press_key(&self, key: &str, modifiers: &[String]) -> Result<()>;

    async fn hover(&self, selector: &str) -> Result<()>;

    /// `None` switches back to the top frame.
    async fn switch_frame(&self, selector: Option<&str>) -> Result<()>;

    async fn handle_dialog(&self, action: DialogAction, text: Option<&str>) -> Result<()>;

    async fn get_console_messages(&self) -> Result<Vec<ConsoleMessage>>;

    async fn get_network_responses(&self) -> Result<Vec<NetworkResponse>>;

    async fn get_dom_snapshot(&self) -> Result<String>;

    /// Base64-encoded PNG.
    async fn capture_screenshot(&self) -> Result<String>;

    async fn add_mock_rule(&self, rule: MockRule) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Placeholder client used when the host starts without a CDP transport
/// attached. Store, validation, and event surfaces work; page operations
/// fail with a clear message naming the missing transport.
pub struct UnattachedBrowser {
    chrome_port: u16,
}

impl UnattachedBrowser {
    pub fn new(chrome_port: u16) -> Self {
        Self { chrome_port }
    }

    fn unavailable(&self) -> anyhow::Error {
        anyhow::anyhow!(
            "no browser transport attached (expected CDP endpoint on port {})",
            self.chrome_port
        )
    }
}

#[async_trait]
impl BrowserClient for UnattachedBrowser {
    async fn connect(&self) -> Result<()> {
        Err(self.unavailable())
    }

    async fn navigate(&self, _url: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn evaluate(&self, _js: &str) -> Result<Value> {
        Err(self.unavailable())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn select(&self, _selector: &str, _value: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn press_key(&self, _key: &str, _modifiers: &[String]) -> Result<()> {
        Err(self.unavailable())
    }

    async fn hover(&self, _selector: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn switch_frame(&self, _selector: Option<&str>) -> Result<()> {
        Err(self.unavailable())
    }

    async fn handle_dialog(&self, _action: DialogAction, _text: Option<&str>) -> Result<()> {
        Err(self.unavailable())
    }

    async fn get_console_messages(&self) -> Result<Vec<ConsoleMessage>> {
        Ok(Vec::new())
    }

    async fn get_network_responses(&self) -> Result<Vec<NetworkResponse>> {
        Ok(Vec::new())
    }

    async fn get_dom_snapshot(&self) -> Result<String> {
        Err(self.unavailable())
    }

    async fn capture_screenshot(&self) -> Result<String> {
        Err(self.unavailable())
    }

    async fn add_mock_rule(&self, _rule: MockRule) -> Result<()> {
        Err(self.unavailable())
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
