use anyhow::Result;
use evex_core::{EnhancedEvent, Sink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::layout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StdoutConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
}

/// One JSON document per line on standard output.
pub struct StdoutSink {
    cfg: StdoutConfig,
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new(cfg: StdoutConfig) -> Self { Self { cfg, out: Mutex::new(tokio::io::stdout()) } }

    pub(crate) fn line(&self, event: &EnhancedEvent) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(&layout::payload(self.cfg.layout.as_ref(), event))?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait::async_trait]
impl Sink for StdoutSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<()> {
        let line = self.line(event)?;
        // Held across both writes so concurrent sends never interleave.
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.out.lock().await.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_newline_terminated_json() {
        let mut ev = EnhancedEvent::default();
        ev.record.reason = "Pulled".into();
        let sink = StdoutSink::new(StdoutConfig { layout: Some(serde_json::json!({"r": "{{ reason }}"})) });
        assert_eq!(sink.line(&ev).unwrap(), b"{\"r\":\"Pulled\"}\n");
    }
}
