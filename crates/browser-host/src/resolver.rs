//! Surface-to-page resolution.
//!
//! A surface handle only gives us a way to run script in its browsing
//! context. To find which registered page backs it, we plant a one-shot
//! marker in the surface's global scope, then read it back from every open
//! page until one matches. The marker is removed again on both paths.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use autosurf_core_types::{PageId, SurfaceId};

use crate::errors::{BrowserError, BrowserErrorKind};
use crate::session::BrowserSession;

const MARKER_GLOBAL: &str = "__autosurf_surface_marker__";

pub struct PageResolver {
    session: Arc<BrowserSession>,
}

impl PageResolver {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }

    /// Resolve the page currently backing `surface`.
    ///
    /// Best effort: pages that fail to evaluate (mid-navigation, detached)
    /// are treated as non-matches. A `PageNotFound` result is retriable,
    /// the surface may simply not have finished attaching yet.
    pub async fn resolve(&self, surface: SurfaceId) -> Result<PageId, BrowserError> {
        let marker = Uuid::new_v4().to_string();
        self.session
            .evaluate_on_surface(
                surface,
                &format!("window.{MARKER_GLOBAL} = \"{marker}\"; true"),
            )
            .await?;

        let mut found = None;
        for page in self.session.pages() {
            match self
                .session
                .evaluate(page, &format!("window.{MARKER_GLOBAL}"))
                .await
            {
                Ok(Value::String(value)) if value == marker => {
                    found = Some(page);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(target: "browser-host", %page, ?err, "marker probe failed, skipping page");
                }
            }
        }

        if let Err(err) = self
            .session
            .evaluate_on_surface(surface, &format!("delete window.{MARKER_GLOBAL}; true"))
            .await
        {
            debug!(target: "browser-host", %surface, ?err, "marker cleanup failed");
        }

        found.ok_or_else(|| {
            BrowserError::new(BrowserErrorKind::PageNotFound)
                .with_hint(format!("no open page matched surface {surface}"))
                .retriable(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserConfig;
    use crate::testing::MockTransport;
    use serde_json::json;

    use crate::transport::CommandTarget;
    use std::sync::Mutex;

    fn marker_from_expression(expr: &str) -> Option<String> {
        let start = expr.find('"')? + 1;
        let end = expr.rfind('"')?;
        Some(expr[start..end].to_string())
    }

    /// Transport that remembers the injected marker and echoes it only for
    /// probes on the session that owns the surface.
    fn marker_echo_transport(matching_session: &'static str) -> Arc<MockTransport> {
        let marker = Mutex::new(None::<String>);
        Arc::new(MockTransport::with_handler(move |cmd| {
            let expr = cmd.params["expression"].as_str().unwrap_or_default();
            if expr.contains("window.__autosurf_surface_marker__ = ") {
                *marker.lock().unwrap() = marker_from_expression(expr);
                return Ok(json!({ "result": { "value": true } }));
            }
            if expr.contains("delete window.") {
                return Ok(json!({ "result": { "value": true } }));
            }
            let is_match =
                matches!(&cmd.target, CommandTarget::Session(id) if id == matching_session);
            match (&*marker.lock().unwrap(), is_match) {
                (Some(value), true) => Ok(json!({ "result": { "value": value } })),
                _ => Ok(json!({ "result": { "type": "undefined" } })),
            }
        }))
    }

    #[tokio::test]
    async fn finds_the_page_holding_the_marker() {
        let transport = marker_echo_transport("S-surface");
        let session = BrowserSession::new(BrowserConfig::default(), transport.clone());

        let page_other = PageId::new();
        let page_surface = PageId::new();
        session.register_page(page_other, "T-other", Some("S-other"));
        session.register_page(page_surface, "T-surface", Some("S-surface"));

        let surface = SurfaceId::new();
        session.bind_surface(surface, "T-surface");

        let resolved = PageResolver::new(session).resolve(surface).await.unwrap();
        assert_eq!(resolved, page_surface);

        // inject + two probes + cleanup
        let commands = transport.recorded();
        assert_eq!(commands.len(), 4);
        assert!(commands[3].params["expression"]
            .as_str()
            .unwrap()
            .contains("delete window."));
    }

    #[tokio::test]
    async fn reports_not_found_when_no_page_matches() {
        let transport = Arc::new(MockTransport::new());
        let session = BrowserSession::new(BrowserConfig::default(), transport.clone());

        let page = PageId::new();
        session.register_page(page, "T-surface", Some("S-surface"));
        let surface = SurfaceId::new();
        session.bind_surface(surface, "T-surface");

        transport.push_response(Ok(json!({ "result": { "value": true } })));
        transport.push_response(Ok(json!({ "result": { "type": "undefined" } })));
        transport.push_response(Ok(json!({ "result": { "value": true } })));

        let err = PageResolver::new(session)
            .resolve(surface)
            .await
            .unwrap_err();
        assert!(err.is_page_not_found());
        assert!(err.retriable);
    }

    #[tokio::test]
    async fn tolerates_probe_failures_on_other_pages() {
        let transport = Arc::new(MockTransport::new());
        let session = BrowserSession::new(BrowserConfig::default(), transport.clone());

        let broken = PageId::new();
        session.register_page(broken, "T-broken", Some("S-broken"));

        let surface = SurfaceId::new();
        session.bind_surface(surface, "T-broken");

        // Inject succeeds, the probe on the only page errors out, cleanup
        // succeeds. The resolver must not propagate the probe error.
        transport.push_response(Ok(json!({ "result": { "value": true } })));
        transport.push_response(Err(BrowserError::new(BrowserErrorKind::CdpIo)
            .with_hint("mid-navigation")));
        transport.push_response(Ok(json!({ "result": { "value": true } })));

        let err = PageResolver::new(session)
            .resolve(surface)
            .await
            .unwrap_err();
        assert!(err.is_page_not_found());
    }

    #[tokio::test]
    async fn unbound_surface_is_rejected_before_injection() {
        let transport = Arc::new(MockTransport::new());
        let session = BrowserSession::new(BrowserConfig::default(), transport.clone());

        let err = PageResolver::new(session)
            .resolve(SurfaceId::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, BrowserErrorKind::Internal);
        assert!(transport.recorded().is_empty());
    }
}
