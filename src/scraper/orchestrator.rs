//! Per-company scrape orchestration
//!
//! The canonical sequence: probe, analyze, select strategies, fetch the
//! main page (reusing the prober's HTML when possible, one fresh-proxy
//! retry per strategy), rescue a thin main page from its own subpages,
//! then fetch the selected subpages in mini-batches and aggregate.
//!
//! Every network attempt goes through the same guard chain: circuit
//! breaker, concurrency gate, rate limiter, proxy, fetch. Failures are
//! classified exactly once, where they happen; this module only
//! aggregates them. A failed subpage never fails the company.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FailReason;
use crate::models::{FetchOutcome, FetchedPage, ScrapeResult, ScrapedPage, Strategy, SubpageStats};
use crate::parser::html::{looks_like_soft_404, try_extract_text};
use crate::parser::links::{select_subpages, LinkSelection};
use crate::scraper::proxy::Proxy;
use crate::scraper::url::host_key;
use crate::scraper::{analyzer, prober, strategy, ScrapeContext};

/// Minimum extracted text for a page to count as content.
const MIN_PAGE_CHARS: usize = 100;

/// Rescue attempts drawn from the top of the priority list.
const RESCUE_CANDIDATES: usize = 3;

/// How the guard chain obtains its proxy for one attempt.
enum ProxyChoice {
    /// Borrow a fresh proxy from the pool (main page, rescue)
    Fresh,
    /// Reuse the mini-batch's shared proxy (subpages)
    Shared(Option<Arc<Proxy>>),
}

/// Scrape one company end to end within the configured deadline.
pub async fn scrape_company(ctx: &Arc<ScrapeContext>, raw_url: &str) -> ScrapeResult {
    let started = Instant::now();
    let deadline = started + ctx.config.company_deadline();

    // An open circuit rejects the company before any network I/O,
    // probe included.
    if ctx.breaker.reject_fast(&host_key(raw_url)) {
        debug!(url = raw_url, "Rejected by open circuit");
        return ScrapeResult::failed(FailReason::CircuitOpen, elapsed_ms(started));
    }

    // Probe: find the canonical variant. Probe failures carry their own
    // taxonomy and never touch proxy weighting or the breaker.
    let probe_deadline = deadline.min(Instant::now() + ctx.config.probe_timeout());
    let capture = match prober::probe(&ctx.proxies, raw_url, probe_deadline).await {
        Ok(capture) => capture,
        Err(reason) => {
            debug!(url = raw_url, %reason, "Probe failed");
            return ScrapeResult::failed(reason, elapsed_ms(started));
        }
    };

    // Analyze: pure classification over what the probe already fetched.
    let profile = analyzer::analyze(&capture);
    let canonical = profile.canonical_url.clone();
    let host = host_key(&canonical);

    if strategy::enforce_slow(&profile) {
        ctx.gate.mark_slow(&host);
        ctx.limiter.mark_slow(&host);
    }

    let mut strategies = strategy::select(&profile);
    if let Some(remembered) = ctx.remembered_strategy(&host) {
        strategies.retain(|s| *s != remembered);
        strategies.insert(0, remembered);
    }
    debug!(url = %canonical, ?strategies, "Strategies selected");

    // Main page, possibly straight from the probe capture.
    let mut retries = 0u32;
    let mut main_html: Option<String> = None;
    let mut main_page: Option<ScrapedPage> = None;
    let mut main_strategy: Option<Strategy> = None;
    let mut main_fail: Option<FailReason> = None;

    if (200..=399).contains(&capture.http_status) {
        if let Some(html) = profile.cached_html.as_ref().filter(|h| !looks_like_soft_404(h)) {
            let text = try_extract_text(html).unwrap_or_default();
            if text.len() >= MIN_PAGE_CHARS {
                debug!(url = %canonical, "Reusing prober HTML for main page");
                main_page = Some(ScrapedPage {
                    url: canonical.clone(),
                    text,
                    bytes: html.len(),
                });
                main_html = Some(html.clone());
            }
        }
    }

    if main_page.is_none() {
        'strategies: for s in strategies {
            for attempt in 0..=ctx.config.fetch.max_retries {
                if attempt > 0 {
                    retries += 1;
                    if ctx.config.fetch.retry_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(ctx.config.fetch.retry_delay_ms))
                            .await;
                    }
                }

                match guarded_fetch(ctx, &host, &canonical, s, deadline, ProxyChoice::Fresh).await {
                    Ok(page) => {
                        let Some(text) = try_extract_text(&page.body) else {
                            main_fail = Some(FailReason::ScrapeError);
                            continue;
                        };
                        if text.len() < MIN_PAGE_CHARS {
                            main_fail = Some(FailReason::ProxyEmptyResponse);
                            continue;
                        }
                        ctx.remember_strategy(&host, s);
                        main_page = Some(ScrapedPage {
                            url: page.final_url.clone(),
                            text,
                            bytes: page.bytes,
                        });
                        main_html = Some(page.body);
                        main_strategy = Some(s);
                        break 'strategies;
                    }
                    Err(reason) => {
                        main_fail = Some(reason);
                        if matches!(reason, FailReason::CircuitOpen | FailReason::Cancelled) {
                            break 'strategies;
                        }
                    }
                }
            }
            if strategy::likely_terminal(&profile) {
                break;
            }
        }
    }

    let Some(main_page) = main_page else {
        let reason = if Instant::now() >= deadline {
            FailReason::Deadline
        } else {
            main_fail.unwrap_or(FailReason::ProxyOther)
        };
        warn!(url = %canonical, %reason, "Main page failed");
        let mut result = ScrapeResult::failed(reason, elapsed_ms(started));
        result.retries = retries;
        return result;
    };

    // Link selection over the main-page HTML.
    let selection = match Url::parse(&canonical) {
        Ok(base) => select_subpages(
            main_html.as_deref().unwrap_or(""),
            &base,
            ctx.config.scrape.max_subpages,
        ),
        Err(_) => LinkSelection::default(),
    };
    let mut stats = SubpageStats::default();
    let mut subpage_urls = selection.selected.clone();
    let effective_strategy = main_strategy
        .or_else(|| ctx.remembered_strategy(&host))
        .unwrap_or(Strategy::Standard);

    // Rescue: a thin main page with at least one internal link gets up
    // to three top-priority subpages tried as effective main content.
    // Every candidate tried here is spent: the batch stage must not
    // fetch it again, whether it was promoted or failed.
    let mut pages = vec![main_page];
    if pages[0].text.len() < ctx.config.scrape.rescue_min_chars && !subpage_urls.is_empty() {
        info!(url = %canonical, chars = pages[0].text.len(), "Main page thin, attempting rescue");
        let mut tried: Vec<String> = Vec::with_capacity(RESCUE_CANDIDATES);
        for candidate in subpage_urls.iter().take(RESCUE_CANDIDATES) {
            if Instant::now() >= deadline {
                break;
            }
            tried.push(candidate.clone());
            stats.attempted += 1;
            match guarded_fetch(ctx, &host, candidate, effective_strategy, deadline, ProxyChoice::Fresh)
                .await
            {
                Ok(page) => {
                    let text = try_extract_text(&page.body).unwrap_or_default();
                    if text.len() >= ctx.config.scrape.rescue_min_chars {
                        stats.ok += 1;
                        info!(rescue = %candidate, "Rescue page promoted to effective main");
                        // The thin original rides along after the rescue page.
                        pages.insert(
                            0,
                            ScrapedPage {
                                url: candidate.clone(),
                                text,
                                bytes: page.bytes,
                            },
                        );
                        break;
                    }
                    stats.record_failure(FailReason::ProxyEmptyResponse);
                }
                Err(reason) => stats.record_failure(reason),
            }
        }
        subpage_urls.retain(|u| !tried.contains(u));
    }

    let subpages =
        fetch_subpage_batches(ctx, &host, &subpage_urls, effective_strategy, deadline, &mut stats)
            .await;
    pages.extend(subpages);

    ScrapeResult {
        pages,
        main_page_fail_reason: None,
        subpage_stats: stats,
        links_seen: selection.seen,
        links_filtered: selection.filtered.len() as u64,
        links_selected: selection.selected.len() as u64,
        retries,
        elapsed_ms: elapsed_ms(started),
    }
}

/// One guarded fetch attempt: breaker, gate, limiter, proxy, fetch,
/// then outcome reporting on every component that needs it.
///
/// Infrastructure rejections (gate or limiter timeouts) never reached
/// the network: they do not count against the proxy pool or as breaker
/// failures. A fetch cut short by the company deadline reports
/// `infra:cancelled`, which the pool ignores for weighting.
async fn guarded_fetch(
    ctx: &Arc<ScrapeContext>,
    host: &str,
    url: &str,
    strategy: Strategy,
    company_deadline: Instant,
    choice: ProxyChoice,
) -> Result<FetchedPage, FailReason> {
    ctx.breaker.check(host)?;

    let acquire_deadline = company_deadline
        .min(Instant::now() + Duration::from_millis(ctx.config.gate.acquire_timeout_ms));

    let lease = match ctx.gate.acquire(host, acquire_deadline).await {
        Ok(lease) => lease,
        Err(reason) => {
            ctx.breaker.record_cancelled(host);
            return Err(reason);
        }
    };

    if let Err(reason) = ctx.limiter.acquire(host, acquire_deadline).await {
        ctx.breaker.record_cancelled(host);
        return Err(reason);
    }

    let proxy = match choice {
        ProxyChoice::Fresh => match ctx.proxies.borrow_checked() {
            Ok(proxy) => proxy,
            Err(reason) => {
                ctx.breaker.record_cancelled(host);
                return Err(reason);
            }
        },
        ProxyChoice::Shared(proxy) => {
            if let Some(ref proxy) = proxy {
                ctx.proxies.note_allocation(proxy);
            }
            proxy
        }
    };

    let slow = strategy::is_slow_tier(strategy) || ctx.gate.is_slow(host);
    let fetch_deadline = company_deadline.min(Instant::now() + ctx.config.request_timeout(slow));

    let outcome = ctx
        .fetcher
        .fetch(url, proxy.as_deref(), strategy, fetch_deadline)
        .await;
    drop(lease);

    match outcome {
        FetchOutcome::Ok(page) => {
            ctx.gate.record_latency(host, page.elapsed_ms);
            if let Some(proxy) = proxy.as_deref() {
                ctx.proxies.report(proxy, true, None);
            }
            ctx.breaker.record_success(host);
            Ok(page)
        }
        FetchOutcome::Fail(failure) => {
            ctx.gate.record_latency(host, failure.elapsed_ms);
            let reason = if Instant::now() >= company_deadline {
                FailReason::Cancelled
            } else {
                failure.reason
            };
            if let Some(proxy) = proxy.as_deref() {
                ctx.proxies.report(proxy, false, Some(reason));
            }
            if reason == FailReason::Cancelled {
                ctx.breaker.record_cancelled(host);
            } else {
                ctx.breaker.record_failure(host);
            }
            Err(reason)
        }
    }
}

/// Fetch subpages in mini-batches: one shared proxy per batch, the
/// batch fanned out concurrently, optional intra/inter-batch delays.
/// Per-subpage failures land in the histogram and nowhere else.
async fn fetch_subpage_batches(
    ctx: &Arc<ScrapeContext>,
    host: &str,
    urls: &[String],
    strategy: Strategy,
    deadline: Instant,
    stats: &mut SubpageStats,
) -> Vec<ScrapedPage> {
    let mut pages = Vec::new();
    if urls.is_empty() {
        return pages;
    }

    let batch_size = ctx.config.scrape.batch_size.max(1);
    let intra_delay = ctx.config.scrape.intra_batch_delay_ms;
    let inter_delay = ctx.config.scrape.inter_batch_delay_ms;

    for (batch_idx, batch) in urls.chunks(batch_size).enumerate() {
        if Instant::now() >= deadline {
            break;
        }

        let shared_proxy = match ctx.proxies.borrow_checked() {
            Ok(proxy) => proxy,
            Err(reason) => {
                for _ in batch {
                    stats.attempted += 1;
                    stats.record_failure(reason);
                }
                continue;
            }
        };

        let futures = batch.iter().enumerate().map(|(i, url)| {
            let ctx = ctx.clone();
            let host = host.to_string();
            let url = url.clone();
            let proxy = shared_proxy.clone();
            async move {
                if intra_delay > 0 && i > 0 {
                    tokio::time::sleep(Duration::from_millis(intra_delay * i as u64)).await;
                }
                let result =
                    guarded_fetch(&ctx, &host, &url, strategy, deadline, ProxyChoice::Shared(proxy))
                        .await
                        .and_then(|page| {
                            let Some(text) = try_extract_text(&page.body) else {
                                return Err(FailReason::ScrapeError);
                            };
                            if text.len() < MIN_PAGE_CHARS {
                                Err(FailReason::ProxyEmptyResponse)
                            } else {
                                Ok((page.bytes, text))
                            }
                        });
                (url, result)
            }
        });

        for (url, result) in join_all(futures).await {
            stats.attempted += 1;
            match result {
                Ok((bytes, text)) => {
                    stats.ok += 1;
                    pages.push(ScrapedPage { url, text, bytes });
                }
                Err(reason) => stats.record_failure(reason),
            }
        }

        if inter_delay > 0 && (batch_idx + 1) * batch_size < urls.len() {
            tokio::time::sleep(Duration::from_millis(inter_delay)).await;
        }
    }

    pages
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
