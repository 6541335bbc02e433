//! Flattening paged or batched responses into one collection.

use crate::context::AccessContext;
use crate::rest::Error;
use futures_util::{Stream, TryStreamExt};
use tracing::{error, info, warn};

/// Drains `pages`, applying `extract` to each element and concatenating the
/// results in order.
///
/// `operation` names the call in log records; nothing sensitive from
/// `context` is logged.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if the stream reports that it stopped before
/// exhaustion; partial results are discarded. A stream that runs to its end is
/// a success even if cancellation was requested meanwhile. Any other error from
/// the stream or from `extract` is logged and returned unchanged.
pub async fn collect<S, P, E, F>(
    pages: S,
    mut extract: F,
    operation: &str,
    context: &AccessContext,
) -> Result<Vec<E>, Error>
where
    S: Stream<Item = Result<P, Error>>,
    F: FnMut(P) -> Result<Vec<E>, Error>,
{
    futures_util::pin_mut!(pages);

    let mut items = Vec::new();
    let outcome: Result<usize, Error> = async {
        let mut count = 0;
        while let Some(page) = pages.try_next().await? {
            items.extend(extract(page)?);
            count += 1;
        }
        Ok(count)
    }
    .await;

    match outcome {
        Ok(pages) => {
            info!(
                operation,
                subdomain = context.subdomain(),
                pages,
                items = items.len(),
                "Operation completed"
            );
            Ok(items)
        }
        Err(Error::Cancelled) => {
            warn!(
                operation,
                subdomain = context.subdomain(),
                collected = items.len(),
                "Operation cancelled"
            );
            Err(Error::Cancelled)
        }
        Err(e) => {
            error!(
                operation,
                subdomain = context.subdomain(),
                error = %e,
                "Operation failed"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;
    use futures_util::stream;
    use tokio_util::sync::CancellationToken;

    fn context() -> AccessContext {
        AccessContext::new("example.amocrm.ru", "token").unwrap()
    }

    fn identity(page: Vec<i64>) -> Result<Vec<i64>, Error> {
        Ok(page)
    }

    #[tokio::test]
    async fn test_concatenates_in_order() {
        let pages = stream::iter(vec![Ok(vec![1, 2]), Ok(vec![]), Ok(vec![3])]);

        let items = collect(pages, identity, "test", &context())
            .await
            .unwrap();

        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let pages = stream::iter(Vec::<Result<Vec<i64>, Error>>::new());

        let items = collect(pages, identity, "test", &context())
            .await
            .unwrap();

        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_is_returned_unchanged() {
        let pages = stream::iter(vec![
            Ok(vec![1]),
            Err(Error::Transport {
                source: transport::Error::Authentication {
                    status: 401,
                    message: "Unauthorized".to_string(),
                },
            }),
            Ok(vec![2]),
        ]);

        let error = collect(pages, identity, "test", &context())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Transport {
                source: transport::Error::Authentication { status: 401, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_extractor_error_is_returned() {
        let pages = stream::iter(vec![Ok(vec![1]), Ok(vec![2])]);
        let extract = |page: Vec<i64>| {
            if page == vec![2] {
                Err(Error::EmptyResponse {
                    url: "https://example.amocrm.ru/api/v4/leads".to_string(),
                })
            } else {
                Ok(page)
            }
        };

        let error = collect(pages, extract, "test", &context())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_exhaustion_discards_partial_results() {
        let pages = stream::iter(vec![Ok(vec![1]), Err(Error::Cancelled), Ok(vec![2])]);

        let error = collect(pages, identity, "test", &context()).await.unwrap_err();

        assert!(matches!(error, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_exhausted_stream_completes_even_if_cancel_was_requested() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let pages =
            stream::iter(vec![Ok(vec![1]), Ok(vec![2])]).inspect_ok(move |_| trigger.cancel());

        let items = collect(pages, identity, "test", &context()).await.unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(items, vec![1, 2]);
    }
}
