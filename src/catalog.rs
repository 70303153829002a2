//! The external catalog service: stock lookups before a proposal, the debit after quorum.

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::rpc::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    InStock { available: u64 },
    Insufficient { available: u64 },
    /// Any non-200 answer, passed through verbatim.
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Accepted,
    Declined { status: u16, body: String },
}

/// `Err` from either call means the catalog could not be reached or answered garbage.
pub trait Catalog: Send + Sync + 'static {
    fn check<'a>(
        &'a self,
        product: &'a str,
        quantity: u32,
    ) -> BoxFuture<'a, anyhow::Result<Availability>>;

    fn debit<'a>(
        &'a self,
        product: &'a str,
        quantity: u32,
    ) -> BoxFuture<'a, anyhow::Result<DebitOutcome>>;
}

#[derive(Debug, Deserialize)]
struct ProductInfo {
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct DebitRequest<'a> {
    name: &'a str,
    quantity: u32,
}

#[derive(Clone)]
pub struct HttpCatalog {
    base: Url,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(base_url: &str, client: reqwest::Client) -> anyhow::Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid catalog url: {base_url}"))?;
        anyhow::ensure!(
            !base.cannot_be_a_base(),
            "catalog url cannot be a base: {base_url}"
        );
        Ok(Self { base, client })
    }

    fn url(&self, segment: &str) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("catalog url cannot be a base"))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    async fn lookup(&self, product: &str, quantity: u32) -> anyhow::Result<Availability> {
        let url = self.url(product)?;
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Ok(Availability::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let info: ProductInfo = resp
            .json()
            .await
            .with_context(|| format!("decode catalog answer from {url}"))?;
        if info.quantity >= u64::from(quantity) {
            Ok(Availability::InStock {
                available: info.quantity,
            })
        } else {
            Ok(Availability::Insufficient {
                available: info.quantity,
            })
        }
    }

    async fn post_debit(&self, product: &str, quantity: u32) -> anyhow::Result<DebitOutcome> {
        let url = self.url("orders")?;
        let resp = self
            .client
            .post(url)
            .json(&DebitRequest {
                name: product,
                quantity,
            })
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(DebitOutcome::Accepted);
        }
        let body = resp.text().await.unwrap_or_default();
        Ok(DebitOutcome::Declined {
            status: status.as_u16(),
            body,
        })
    }
}

impl Catalog for HttpCatalog {
    fn check<'a>(
        &'a self,
        product: &'a str,
        quantity: u32,
    ) -> BoxFuture<'a, anyhow::Result<Availability>> {
        Box::pin(self.lookup(product, quantity))
    }

    fn debit<'a>(
        &'a self,
        product: &'a str,
        quantity: u32,
    ) -> BoxFuture<'a, anyhow::Result<DebitOutcome>> {
        Box::pin(self.post_debit(product, quantity))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;
    use crate::peer::build_client;

    fn catalog(server: &MockServer) -> HttpCatalog {
        HttpCatalog::new(&server.uri(), build_client(Duration::from_secs(2)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn check_compares_requested_quantity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Tux"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "Tux",
                "price": 15.99,
                "quantity": 100
            })))
            .mount(&server)
            .await;

        let catalog = catalog(&server);
        assert_eq!(
            catalog.check("Tux", 100).await.unwrap(),
            Availability::InStock { available: 100 }
        );
        assert_eq!(
            catalog.check("Tux", 101).await.unwrap(),
            Availability::Insufficient { available: 100 }
        );
    }

    #[tokio::test]
    async fn check_passes_through_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Unicorn"))
            .respond_with(ResponseTemplate::new(404).set_body_string("product not found"))
            .mount(&server)
            .await;

        assert_eq!(
            catalog(&server).check("Unicorn", 1).await.unwrap(),
            Availability::Rejected {
                status: 404,
                body: "product not found".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn product_names_are_path_escaped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Board%20Game"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "quantity": 3 })))
            .mount(&server)
            .await;

        assert_eq!(
            catalog(&server).check("Board Game", 1).await.unwrap(),
            Availability::InStock { available: 3 }
        );
    }

    #[tokio::test]
    async fn debit_posts_name_and_quantity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(body_json(json!({ "name": "Tux", "quantity": 2 })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(body_json(json!({ "name": "Fox", "quantity": 9 })))
            .respond_with(ResponseTemplate::new(400).set_body_string("not enough"))
            .mount(&server)
            .await;

        let catalog = catalog(&server);
        assert_eq!(
            catalog.debit("Tux", 2).await.unwrap(),
            DebitOutcome::Accepted
        );
        assert_eq!(
            catalog.debit("Fox", 9).await.unwrap(),
            DebitOutcome::Declined {
                status: 400,
                body: "not enough".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unreachable_catalog_is_an_error() {
        let catalog = HttpCatalog::new(
            "http://127.0.0.1:9",
            build_client(Duration::from_millis(500)).unwrap(),
        )
        .unwrap();
        assert!(catalog.check("Tux", 1).await.is_err());
        assert!(catalog.debit("Tux", 1).await.is_err());
    }
}
