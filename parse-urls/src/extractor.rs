use crate::matcher::LinkMatcher;
use crate::types::{AggregatedItem, FetchError, LinkItem, Page, ParsedLink, RejectReason};
use futures::stream::{self, StreamExt};
use interfaces::defs::{LinkExtractor, PageFetcher};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub items: usize,
    pub pages: usize,
    pub failed_pages: usize,
    pub links: usize,
    pub filtered_links: usize,
}

/// Fetches index pages, keeps the links the acceptance patterns allow and
/// flattens them into output items.
pub struct LinkHarvester {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn LinkExtractor>,
    matcher: LinkMatcher,
    concurrency: usize,
}

impl LinkHarvester {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn LinkExtractor>,
        matcher: LinkMatcher,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            matcher,
            concurrency: 1,
        }
    }

    /// Upper bound on fetches in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Populates `parsed_links` on every pending item.
    ///
    /// Pages are fetched concurrently, but results are applied in item order
    /// and index-URL order, so the outcome does not depend on which fetch
    /// finishes first. A failed page, including one answered with a non-2xx
    /// status, is logged and skipped; the item's other pages still count.
    pub async fn extract(&self, items: &mut [AggregatedItem]) -> ExtractStats {
        let jobs: Vec<(usize, usize, String)> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.outcome.is_pending())
            .flat_map(|(item_idx, item)| {
                item.index_urls
                    .iter()
                    .enumerate()
                    .map(move |(url_idx, url)| (item_idx, url_idx, url.clone()))
            })
            .collect();

        let mut stats = ExtractStats {
            items: items.iter().filter(|item| item.outcome.is_pending()).count(),
            pages: jobs.len(),
            ..Default::default()
        };

        let mut fetched: Vec<(usize, usize, String, Result<Page, FetchError>)> = stream::iter(jobs)
            .map(|(item_idx, url_idx, url)| {
                let fetcher = Arc::clone(&self.fetcher);
                async move {
                    let result = fetcher.fetch(&url).await;
                    (item_idx, url_idx, url, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        fetched.sort_by_key(|(item_idx, url_idx, _, _)| (*item_idx, *url_idx));

        let mut per_item: Vec<Option<ItemPages>> = (0..items.len()).map(|_| None).collect();
        for (item_idx, _, url, result) in fetched {
            let pages = per_item[item_idx].get_or_insert_with(ItemPages::default);
            match result {
                Ok(page) if page.is_success() => pages.pages.push((url, page)),
                Ok(page) => {
                    error!(
                        "Error parsing {} from {}: HTTP status {}",
                        items[item_idx].title, url, page.status
                    );
                    stats.failed_pages += 1;
                    pages.failed += 1;
                }
                Err(e) => {
                    error!("Error parsing {} from {}: {}", items[item_idx].title, url, e);
                    stats.failed_pages += 1;
                    pages.failed += 1;
                }
            }
        }

        let total = stats.items;
        let mut position = 0;
        for (item, pages) in items.iter_mut().zip(per_item) {
            let Some(pages) = pages else {
                continue;
            };
            position += 1;
            info!("Parsing `{}` ({} of {})", item.title, position, total);

            let mut seen = HashSet::new();
            let mut links = Vec::new();
            for (index_url, page) in &pages.pages {
                for link in self.extractor.extract(page) {
                    stats.links += 1;
                    if !self.matcher.matches(&link.url) {
                        stats.filtered_links += 1;
                        continue;
                    }
                    if !seen.insert(link.url.clone()) {
                        continue;
                    }
                    links.push(ParsedLink {
                        url: link.url,
                        text: link.text,
                        rank: link.rank,
                        index_url: index_url.clone(),
                    });
                }
            }

            if links.is_empty() {
                if pages.pages.is_empty() && pages.failed > 0 {
                    item.reject(RejectReason::FetchFailed);
                } else {
                    debug!("No results from {}", item.title);
                    item.reject(RejectReason::NoLinks);
                }
            } else {
                debug!("Parsed {} links from {}", links.len(), item.title);
            }
            item.parsed_links = links;
        }

        stats
    }

    /// One output item per accepted link of every still-pending item.
    ///
    /// With a `limit`, links are ordered by rank (highest first, unranked
    /// last) and cut to `limit`; items that lose every link are rejected.
    pub fn flatten(items: &mut [AggregatedItem], limit: Option<usize>) -> Vec<LinkItem> {
        let mut links: Vec<LinkItem> = items
            .iter()
            .filter(|item| item.outcome.is_pending())
            .flat_map(|item| {
                item.parsed_links.iter().map(move |link| LinkItem {
                    title: link.text.clone().unwrap_or_else(|| link.url.clone()),
                    url: link.url.clone(),
                    parent_title: item.title.clone(),
                    index_url: link.index_url.clone(),
                    rank: link.rank,
                })
            })
            .collect();

        let Some(limit) = limit else {
            return links;
        };

        links.sort_by_key(|link| Reverse(link.rank));
        links.truncate(limit);

        let kept: HashSet<&str> = links.iter().map(|link| link.parent_title.as_str()).collect();
        for item in items.iter_mut().filter(|item| item.outcome.is_pending()) {
            if !kept.contains(item.title.as_str()) {
                item.reject(RejectReason::OverLimit);
            }
        }
        links
    }
}

#[derive(Default)]
struct ItemPages {
    pages: Vec<(String, Page)>,
    failed: usize,
}
