use std::collections::HashSet;

use async_trait::async_trait;
use mulerank_core::RawRecord;
use mulerank_storage::{HttpFetcher, SnapshotStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::scroll::{collect_until_idle, ListingPager, ScrollPolicy};
use crate::{listing, non_empty, ExtractionContext, ExtractionError, ListingSource};

pub const MULERUN_SOURCE_ID: &str = "mulerun";

#[derive(Debug, Clone)]
pub struct MulerunSourceConfig {
    pub base_url: String,
    pub sort_mode: String,
    pub scroll: ScrollPolicy,
}

impl Default for MulerunSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mulerun.com/".to_string(),
            sort_mode: "most_used".to_string(),
            scroll: ScrollPolicy::default(),
        }
    }
}

pub fn listing_url(base_url: &str, sort_mode: &str, page: usize) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    if page <= 1 {
        format!("{base_url}{sep}sort={sort_mode}")
    } else {
        format!("{base_url}{sep}sort={sort_mode}&page={page}")
    }
}

/// The live MuleRun listing, loaded page by page until no new cards appear.
#[derive(Debug, Clone)]
pub struct MulerunListingSource {
    fetcher: HttpFetcher,
    snapshots: Option<SnapshotStore>,
    config: MulerunSourceConfig,
}

impl MulerunListingSource {
    pub fn new(fetcher: HttpFetcher, config: MulerunSourceConfig) -> Self {
        Self {
            fetcher,
            snapshots: None,
            config,
        }
    }

    /// Keeps every fetched page under the run's snapshot directory.
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
}

struct HttpPager<'a> {
    source: &'a MulerunListingSource,
    run_id: Uuid,
    visible: Vec<RawRecord>,
    seen: HashSet<String>,
    /// Set once the listing has run out of pages; later advances are idle.
    exhausted: bool,
}

impl<'a> HttpPager<'a> {
    async fn keep_snapshot(&self, page: usize, body: &[u8]) {
        let Some(store) = &self.source.snapshots else {
            return;
        };
        match store.store_page(self.run_id, page, body).await {
            Ok(stored) => debug!(
                page,
                path = %stored.path.display(),
                reused = stored.reused,
                "stored listing snapshot"
            ),
            Err(err) => warn!(page, error = %err, "could not store listing snapshot"),
        }
    }
}

#[async_trait]
impl<'a> ListingPager for HttpPager<'a> {
    async fn advance(&mut self, attempt: usize) -> Result<Vec<RawRecord>, ExtractionError> {
        if self.exhausted {
            return Ok(self.visible.clone());
        }
        let page_no = attempt + 1;
        let config = &self.source.config;
        let url = listing_url(&config.base_url, &config.sort_mode, page_no);

        let page = match self.source.fetcher.fetch_page(self.run_id, &url).await {
            Ok(page) => page,
            Err(err) if page_no > 1 && err.is_missing_page() => {
                info!(page = page_no, "listing has no further pages");
                self.exhausted = true;
                return Ok(self.visible.clone());
            }
            Err(err) => {
                return Err(ExtractionError::NavigationFailed(format!("page {page_no}: {err}")))
            }
        };
        self.keep_snapshot(page_no, &page.body).await;

        let records = listing::parse_listing_html(&page.text())?;
        if records.is_empty() {
            info!(page = page_no, "listing page has no cards");
            self.exhausted = true;
        }
        let fresh = records
            .into_iter()
            .filter(|r| !self.seen.contains(&r.link))
            .collect::<Vec<_>>();
        self.seen.extend(fresh.iter().map(|r| r.link.clone()));
        self.visible.extend(fresh);
        Ok(self.visible.clone())
    }
}

#[async_trait]
impl ListingSource for MulerunListingSource {
    fn source_id(&self) -> &str {
        MULERUN_SOURCE_ID
    }

    async fn extract(&self, ctx: &ExtractionContext) -> Result<Vec<RawRecord>, ExtractionError> {
        let span = info_span!("extract", run_id = %ctx.run_id, source = MULERUN_SOURCE_ID);
        async {
            info!(base_url = %self.config.base_url, sort = %self.config.sort_mode, "loading listing");
            let mut pager = HttpPager {
                source: self,
                run_id: ctx.run_id,
                visible: Vec::new(),
                seen: HashSet::new(),
                exhausted: false,
            };
            let records = collect_until_idle(&mut pager, self.config.scroll).await?;
            info!(records = records.len(), "listing extracted");
            non_empty(records)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    #[test]
    fn listing_urls_carry_sort_and_page() {
        assert_eq!(
            listing_url("https://mulerun.com/", "most_used", 1),
            "https://mulerun.com/?sort=most_used"
        );
        assert_eq!(
            listing_url("https://mulerun.com/", "most_used", 3),
            "https://mulerun.com/?sort=most_used&page=3"
        );
        assert_eq!(
            listing_url("https://mulerun.com/?lang=en", "newest", 2),
            "https://mulerun.com/?lang=en&sort=newest&page=2"
        );
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(mulerank_storage::HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
            retry: mulerank_storage::RetryPolicy {
                max_retries: 0,
                ..Default::default()
            },
        })
        .expect("client")
    }

    fn source(base_url: String) -> MulerunListingSource {
        MulerunListingSource::new(
            fetcher(),
            MulerunSourceConfig {
                base_url,
                sort_mode: "most_used".to_string(),
                scroll: ScrollPolicy {
                    delay: Duration::ZERO,
                    max_attempts: 10,
                    idle_threshold: 3,
                    hard_timeout: Duration::from_secs(10),
                },
            },
        )
    }

    fn cards(slugs: &[&str]) -> String {
        let cards = slugs
            .iter()
            .map(|s| format!(r#"<a href="/@t/{s}"><h3>{s}</h3></a>"#))
            .collect::<String>();
        format!("<html><body>{cards}</body></html>")
    }

    /// Serves `pages[n - 1]` for `?page=n` on a loopback port and 404 past
    /// the end.
    async fn serve_listing(pages: Vec<(StatusCode, String)>) -> String {
        let pages = Arc::new(pages);
        let app = Router::new().route(
            "/",
            get(move |Query(query): Query<HashMap<String, String>>| {
                let pages = pages.clone();
                async move {
                    let n = query
                        .get("page")
                        .and_then(|p| p.parse::<usize>().ok())
                        .unwrap_or(1);
                    pages
                        .get(n - 1)
                        .cloned()
                        .unwrap_or((StatusCode::NOT_FOUND, String::new()))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve listing");
        });
        format!("http://{addr}/")
    }

    fn links(records: &[RawRecord]) -> Vec<&str> {
        records.iter().map(|r| r.link.as_str()).collect()
    }

    #[tokio::test]
    async fn unreachable_listing_is_a_navigation_failure() {
        let err = source("http://127.0.0.1:9/".to_string())
            .extract(&ExtractionContext::new(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NavigationFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn a_failing_later_page_fails_the_whole_extraction() {
        let base = serve_listing(vec![
            (StatusCode::OK, cards(&["a", "b"])),
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            (StatusCode::OK, cards(&["e", "f"])),
        ])
        .await;

        let err = source(base)
            .extract(&ExtractionContext::new(Uuid::new_v4()))
            .await
            .unwrap_err();
        match err {
            ExtractionError::NavigationFailed(msg) => assert!(msg.starts_with("page 2:"), "{msg}"),
            other => panic!("expected navigation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_page_ends_the_listing_and_pages_are_kept() {
        let base = serve_listing(vec![
            (StatusCode::OK, cards(&["a", "b"])),
            (StatusCode::OK, cards(&["b", "c"])),
        ])
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ExtractionContext::new(Uuid::new_v4());

        let records = source(base)
            .with_snapshots(snapshots.clone())
            .extract(&ctx)
            .await
            .expect("extract");
        assert_eq!(links(&records), vec!["/@t/a", "/@t/b", "/@t/c"]);

        let kept = snapshots.pages_for_run(ctx.run_id).await.expect("snapshots");
        assert_eq!(kept.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn an_empty_page_ends_the_listing() {
        let base = serve_listing(vec![
            (StatusCode::OK, cards(&["a"])),
            (StatusCode::OK, cards(&[])),
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
        ])
        .await;

        let records = source(base)
            .extract(&ExtractionContext::new(Uuid::new_v4()))
            .await
            .expect("extract");
        assert_eq!(links(&records), vec!["/@t/a"]);
    }
}
