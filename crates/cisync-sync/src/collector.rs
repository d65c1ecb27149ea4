use std::future::Future;

use cisync_adapters::{AdapterError, Page};
use cisync_http::Url;
use tracing::debug;

use crate::SyncError;

/// Drains a linked listing into one collection, following `Page::next` until it is absent.
///
/// Any page failure aborts the whole collection. More than `max_pages` pages fails with
/// [`SyncError::PaginationOverrun`], which also stops cyclic `next` chains.
pub async fn collect_pages<T, F, Fut>(
    initial: Url,
    max_pages: usize,
    mut fetch: F,
) -> Result<Vec<T>, SyncError>
where
    F: FnMut(Url) -> Fut,
    Fut: Future<Output = Result<Page<T>, AdapterError>>,
{
    let mut items = Vec::new();
    let mut next = Some(initial);
    let mut pages = 0usize;

    while let Some(url) = next {
        if pages >= max_pages {
            return Err(SyncError::PaginationOverrun {
                max_pages,
                url: url.to_string(),
            });
        }
        let page = fetch(url).await?;
        pages += 1;
        debug!(
            page = pages,
            items = page.items.len(),
            has_next = page.next.is_some(),
            "collected page"
        );
        items.extend(page.items);
        next = page.next;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn follows_links_until_exhausted() {
        let items = collect_pages(url("https://p/list?page=1"), 10, |current| async move {
            let page: u32 = current
                .query_pairs()
                .find(|(k, _)| k == "page")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            let next = (page < 3).then(|| url(&format!("https://p/list?page={}", page + 1)));
            Ok(Page {
                items: vec![page * 10, page * 10 + 1],
                next,
            })
        })
        .await
        .unwrap();
        assert_eq!(items, vec![10, 11, 20, 21, 30, 31]);
    }

    #[tokio::test]
    async fn cyclic_links_overrun_the_page_bound() {
        let mut calls = 0usize;
        let err = collect_pages(url("https://p/a"), 25, |current| {
            calls += 1;
            let next = if current.path() == "/a" {
                url("https://p/b")
            } else {
                url("https://p/a")
            };
            async move {
                Ok(Page {
                    items: vec![()],
                    next: Some(next),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 25);
        match err {
            SyncError::PaginationOverrun { max_pages, url } => {
                assert_eq!(max_pages, 25);
                assert_eq!(url, "https://p/b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn a_failing_page_aborts_collection() {
        let result: Result<Vec<u8>, _> =
            collect_pages(url("https://p/list?page=1"), 10, |current| async move {
                if current.as_str().ends_with("page=2") {
                    Err(AdapterError::Message("boom".into()))
                } else {
                    Ok(Page {
                        items: vec![1],
                        next: Some(url("https://p/list?page=2")),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}
