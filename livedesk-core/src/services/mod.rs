// File: livedesk-core/src/services/mod.rs

pub mod dispatcher;
pub mod message_service;
pub mod session_service;
pub mod stats;

pub use dispatcher::{DispatchHandle, Dispatcher};
pub use message_service::MessageService;
pub use session_service::{Placement, SessionService, StartChatOutcome};

use std::future::Future;
use std::time::Duration;

use livedesk_common::Error;

/// Bound a store operation on the hot path. The `Elapsed` error converts
/// into `Error::Timeout` and surfaces as `SERVER_ERROR`.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(elapsed) => Err(Error::Timeout(elapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_passes_through_results() {
        let ok: Result<u32, Error> =
            with_deadline(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn deadline_cuts_off_slow_futures() {
        let res: Result<u32, Error> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(7)
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }
}
