//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use garimpo::config::FabricConfig;
use garimpo::models::{ScrapedPage, SubpageStats};
use garimpo::scraper::batch::{PageSink, StatusSnapshot};
use garimpo::scraper::ScrapeContext;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Config tuned for tests: short timeouts, no proxies, small deadline.
pub fn test_config() -> FabricConfig {
    let mut config = FabricConfig::default();
    config.fetch.probe_timeout_ms = 5_000;
    config.fetch.fetch_timeout_ms_fast = 5_000;
    config.fetch.fetch_timeout_ms_slow = 5_000;
    config.gate.acquire_timeout_ms = 5_000;
    config.scrape.company_deadline_ms = 20_000;
    config
}

pub fn test_context() -> Arc<ScrapeContext> {
    ScrapeContext::new(test_config())
}

pub fn context_with(config: FabricConfig) -> Arc<ScrapeContext> {
    ScrapeContext::new(config)
}

/// A page body comfortably past the soft-404 size floor.
pub fn page_body(title: &str) -> String {
    format!(
        "<html><body><h1>{title}</h1><p>{}</p></body></html>",
        "Fabricamos soluções industriais sob medida para o mercado brasileiro. ".repeat(20)
    )
}

/// Landing page with the five classic profile links.
pub fn landing_page() -> String {
    format!(
        r#"<html><body>
        <h1>Acme Industrial</h1>
        <p>{}</p>
        <nav>
            <a href="/sobre">Quem somos</a>
            <a href="/produtos">Produtos</a>
            <a href="/servicos">Serviços</a>
            <a href="/clientes">Clientes</a>
            <a href="/contato">Contato</a>
        </nav>
        </body></html>"#,
        "Há 30 anos entregando soluções em automação industrial. ".repeat(15)
    )
}

/// Mount a static site: landing page plus five subpages.
pub async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(landing_page()))
        .mount(server)
        .await;

    for sub in ["sobre", "produtos", "servicos", "clientes", "contato"] {
        Mock::given(method("GET"))
            .and(path(format!("/{sub}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body(sub)))
            .mount(server)
            .await;
    }
}

/// Sink that remembers every save for assertions.
#[derive(Default)]
pub struct MemorySink {
    pub saved_pages: Mutex<Vec<(String, Vec<ScrapedPage>)>>,
    pub saved_statuses: Mutex<Vec<StatusSnapshot>>,
}

impl PageSink for MemorySink {
    fn save_pages<'a>(
        &'a self,
        _batch_id: &'a str,
        company_id: &'a str,
        pages: &'a [ScrapedPage],
        _stats: &'a SubpageStats,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.saved_pages
                .lock()
                .unwrap()
                .push((company_id.to_string(), pages.to_vec()));
        })
    }

    fn save_status<'a>(
        &'a self,
        _batch_id: &'a str,
        snapshot: &'a StatusSnapshot,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.saved_statuses.lock().unwrap().push(snapshot.clone());
        })
    }
}
