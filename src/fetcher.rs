//! Per-worker unit fetching with whole-sequence retries.

use crate::extract::{extract_stores, Extraction};
use crate::record::Category;
use crate::retry::RetryPolicy;
use crate::session::{RemoteSession, SessionError, SessionFactory};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Terminal outcome of a unit fetch after retries.
#[derive(Debug)]
pub enum FetchError {
    /// No session could be created or re-created; the worker cannot go on.
    Create(SessionError),
    /// The fetch sequence kept failing on live sessions.
    Session(SessionError),
}

impl FetchError {
    /// Whether this failure means the worker has no session to work with.
    pub fn is_create(&self) -> bool {
        matches!(self, FetchError::Create(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(err) => write!(f, "session unavailable: {err}"),
            Self::Session(err) => write!(f, "unit fetch failed: {err}"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Create(err) | Self::Session(err) => Some(err),
        }
    }
}

/// Fetches single units through one owned session.
///
/// The fetcher owns its session for its whole lifetime inside a sync run;
/// sessions are never shared between fetchers. Any failure discards the
/// session — its in-flight selection state is unknowable — and the next
/// attempt starts on a fresh one.
pub struct UnitFetcher<F> {
    factory: Arc<F>,
    category: Category,
    retry: RetryPolicy,
    session: Option<Box<dyn RemoteSession>>,
}

impl<F: SessionFactory> UnitFetcher<F> {
    /// Fetcher for `category` drawing sessions from `factory`.
    pub fn new(factory: Arc<F>, category: Category, retry: RetryPolicy) -> Self {
        Self {
            factory,
            category,
            retry,
            session: None,
        }
    }

    /// Eagerly opens the session so setup failures surface before work
    /// is scheduled.
    pub async fn connect(&mut self) -> Result<(), FetchError> {
        if self.session.is_none() {
            let session = self.factory.create().await.map_err(FetchError::Create)?;
            self.session = Some(session);
        }
        Ok(())
    }

    /// Runs the full select/refresh/extract sequence for one unit, retrying
    /// the entire sequence on failure.
    ///
    /// Exhausting retries is a soft failure: the caller logs it, marks the
    /// unit failed for this run, and moves on.
    pub async fn fetch(&mut self, unit: u32) -> Result<Extraction, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(unit).await {
                Ok(extraction) => return Ok(extraction),
                Err(err) => {
                    self.discard_session().await;
                    if attempt >= self.retry.attempts() {
                        return Err(err);
                    }
                    warn!(unit, attempt, error = %err, "unit fetch attempt failed");
                    self.retry.pause().await;
                }
            }
        }
    }

    /// Releases the session, if any.
    pub async fn close(&mut self) {
        self.discard_session().await;
    }

    async fn attempt(&mut self, unit: u32) -> Result<Extraction, FetchError> {
        if self.session.is_none() {
            let session = self.factory.create().await.map_err(FetchError::Create)?;
            self.session = Some(session);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(FetchError::Create(SessionError::Connect(
                "session unavailable".into(),
            )));
        };

        session
            .select_category(self.category)
            .await
            .map_err(FetchError::Session)?;
        session
            .select_unit(unit)
            .await
            .map_err(FetchError::Session)?;
        session
            .refresh_listing()
            .await
            .map_err(FetchError::Session)?;
        let document = session
            .fetch_document()
            .await
            .map_err(FetchError::Session)?;

        Ok(extract_stores(&document, unit, self.category))
    }

    async fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.close().await;
        }
    }
}
