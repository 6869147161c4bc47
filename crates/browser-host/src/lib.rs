//! Browser control layer for autosurf.
//!
//! Owns the single live Chromium connection and everything that talks to it:
//! the CDP transport, the page registry, surface-to-page resolution, sandboxed
//! code execution with console capture, and page observation (screenshot +
//! accessibility tree).
//!
//! The execution sandbox here is about output capture and lifecycle, not
//! privilege containment: automation code runs with full page access.

pub mod config;
pub mod detect;
pub mod errors;
pub mod observe;
pub mod resolver;
pub mod sandbox;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

pub use config::BrowserConfig;
pub use detect::detect_chrome_executable;
pub use errors::{BrowserError, BrowserErrorKind};
pub use observe::{format_outline, AccessibilityNode, Observation, ObservationCollector};
pub use resolver::PageResolver;
pub use sandbox::CodeSandbox;
pub use session::{BrowserSession, ConsoleMessage};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, NoopTransport, TransportEvent};
