//! Remote probe: what is the newest unit the site has published?

use crate::record::Category;
use crate::retry::RetryPolicy;
use crate::session::{RemoteSession, SessionError, SessionFactory};
use scraper::{Html, Selector};
use std::error::Error;
use std::fmt;
use tracing::debug;

/// All probe attempts failed; the remote maximum is unknown.
///
/// This is deliberately distinct from `Ok(0)`: zero means the site answered
/// and lists no units, an error means we never got an answer.
#[derive(Debug)]
pub struct ProbeError {
    attempts: u32,
    source: SessionError,
}

impl ProbeError {
    /// How many attempts were made before giving up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probe failed after {} attempts: {}",
            self.attempts, self.source
        )
    }
}

impl Error for ProbeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Determines the newest published unit for `category`.
///
/// Each attempt opens a fresh session, selects the category, and reads the
/// top entry of the round dropdown (newest first by site convention). The
/// session is released on every exit path. Transient failures (navigation,
/// missing dropdown, non-numeric value) are retried under `policy`.
pub async fn latest_remote_unit<F: SessionFactory>(
    factory: &F,
    category: Category,
    policy: &RetryPolicy,
) -> Result<u32, ProbeError> {
    policy
        .run(|attempt| {
            if attempt > 1 {
                debug!(%category, attempt, "retrying remote probe");
            }
            probe_once(factory, category)
        })
        .await
        .map_err(|source| ProbeError {
            attempts: policy.attempts(),
            source,
        })
}

async fn probe_once<F: SessionFactory>(
    factory: &F,
    category: Category,
) -> Result<u32, SessionError> {
    let mut session = factory.create().await?;
    let outcome = inspect_dropdown(session.as_mut(), category).await;
    let _ = session.close().await;
    outcome
}

async fn inspect_dropdown(
    session: &mut (dyn RemoteSession + '_),
    category: Category,
) -> Result<u32, SessionError> {
    session.select_category(category).await?;
    let document = session.fetch_document().await?;
    parse_latest_unit(&document)
}

fn parse_latest_unit(document: &str) -> Result<u32, SessionError> {
    let html = Html::parse_document(document);
    let dropdown = Selector::parse("select#srchLtEpsd").expect("round dropdown selector");
    let option = Selector::parse("option").expect("option selector");

    let Some(select) = html.select(&dropdown).next() else {
        return Err(SessionError::Protocol("round dropdown not present".into()));
    };

    let first_value = select
        .select(&option)
        .filter_map(|opt| opt.value().attr("value").map(str::trim))
        .find(|value| !value.is_empty());

    match first_value {
        // The dropdown rendered but lists nothing: the site reports no units.
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| {
            SessionError::Protocol(format!("non-numeric round value: {value:?}"))
        }),
    }
}
