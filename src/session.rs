//! Seams around the stateful remote search session.

use crate::record::Category;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors surfaced by remote session operations.
#[derive(Debug)]
pub enum SessionError {
    /// Establishing (or re-establishing) the session failed; the session is
    /// unusable and must be recreated.
    Connect(String),
    /// An HTTP exchange failed mid-sequence.
    Http(reqwest::Error),
    /// A selector never became populated within the bounded wait.
    ElementWait {
        /// Selector that was awaited.
        selector: &'static str,
        /// How long the session polled before giving up.
        waited: Duration,
    },
    /// The remote responded in an unexpected shape.
    Protocol(String),
}

impl SessionError {
    /// Whether the session itself is beyond reuse (as opposed to a transient
    /// per-call failure a retry on the same session could clear).
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Connect(_))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "session connect failed: {reason}"),
            Self::Http(err) => write!(f, "session http error: {err}"),
            Self::ElementWait { selector, waited } => write!(
                f,
                "timed out after {:.1}s waiting for `{selector}`",
                waited.as_secs_f32()
            ),
            Self::Protocol(reason) => write!(f, "unexpected remote response: {reason}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }
}

/// One logged-in view of the remote winning-store search page.
///
/// Sessions are stateful and expensive: selections made on them persist
/// across calls, so a session must never be shared between workers. Any
/// error leaves the in-flight selection state unspecified; callers are
/// expected to discard and recreate rather than reason about it.
#[async_trait]
pub trait RemoteSession: Send {
    /// Switches the page to the given product line.
    async fn select_category(&mut self, category: Category) -> Result<(), SessionError>;

    /// Picks a unit in the round dropdown.
    async fn select_unit(&mut self, unit: u32) -> Result<(), SessionError>;

    /// Triggers the listing refresh for the current selection and waits,
    /// bounded, for the store listing to become populated.
    async fn refresh_listing(&mut self) -> Result<(), SessionError>;

    /// Returns the currently rendered document.
    async fn fetch_document(&mut self) -> Result<String, SessionError>;

    /// Releases the session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Creates remote sessions. Construction may fail.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens a fresh session against the remote interface.
    async fn create(&self) -> Result<Box<dyn RemoteSession>, SessionError>;
}
