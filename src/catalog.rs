//! Product catalog integration
//!
//! Searches the supplier catalog for in-stock products and ranks them with a
//! deterministic additive score, so purchase requests can record a concrete
//! best match.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 1 USD in COP, approximate fixed rate
const COP_PER_USD: f64 = 4300.0;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog request failed: {0}")]
    Network(String),
    #[error("Catalog returned HTTP {0}")]
    Status(u16),
}

/// A catalog product. Only the fields the scorer and the request payload
/// consume are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub regular_price: f64,
    #[serde(default)]
    pub stock_quantity: i64,
    #[serde(default)]
    pub is_in_stock: bool,
    #[serde(default)]
    pub discount_percentage: Option<f64>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Product page, filled in by the catalog client when absent
    #[serde(default)]
    pub url: Option<String>,
}

/// A product with its ranking score and the reasons behind it
#[derive(Debug, Clone, Serialize)]
pub struct ScoredProduct {
    pub product: Product,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Catalog search seam
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// In-stock products matching the query, capped at `limit`
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Product>, CatalogError>;
}

#[async_trait]
impl<T: ProductCatalog + ?Sized> ProductCatalog for Arc<T> {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Product>, CatalogError> {
        (**self).search(query, limit).await
    }
}

/// HTTP client for the supplier's quick-search endpoint
pub struct HttpCatalog {
    client: Client,
    base_url: String,
    auth_token: String,
}

impl HttpCatalog {
    pub fn new(base_url: String, auth_token: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }
}

#[derive(Serialize)]
struct QuickSearchBody<'a> {
    search: &'a str,
}

#[async_trait]
impl ProductCatalog for HttpCatalog {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Product>, CatalogError> {
        tracing::info!(query = %query, "Searching product catalog");

        let response = self
            .client
            .post(format!("{}/products/quick-search", self.base_url))
            .header("Authorization", &self.auth_token)
            .json(&QuickSearchBody { search: query })
            .send()
            .await
            .map_err(|e| CatalogError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }

        let mut products: Vec<Product> = response
            .json()
            .await
            .map_err(|e| CatalogError::Network(format!("Invalid catalog response: {e}")))?;

        products.retain(|p| p.is_in_stock);
        products.truncate(limit);
        for product in &mut products {
            if product.url.is_none() && !product.slug.is_empty() {
                product.url = Some(format!("{}/producto/{}", self.base_url, product.slug));
            }
        }

        tracing::info!(found = products.len(), "Catalog search finished");
        Ok(products)
    }
}

pub fn cop_to_usd(amount_cop: f64) -> f64 {
    amount_cop / COP_PER_USD
}

/// Rank products by stock, price position, discount and listing quality.
/// Returns the products sorted by descending score.
pub fn score_products(products: &[Product]) -> Vec<ScoredProduct> {
    if products.is_empty() {
        return Vec::new();
    }

    let prices: Vec<f64> = products
        .iter()
        .map(|p| p.regular_price)
        .filter(|p| *p > 0.0)
        .collect();
    let avg_price = if prices.is_empty() {
        0.0
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    };
    let max_stock = products
        .iter()
        .map(|p| p.stock_quantity)
        .filter(|s| *s > 0)
        .max()
        .unwrap_or(1)
        .max(1);

    let mut scored: Vec<ScoredProduct> = products
        .iter()
        .map(|product| {
            let mut score = 0.0;
            let mut reasons = Vec::new();

            if product.stock_quantity > 0 {
                let stock_score =
                    (product.stock_quantity as f64 / max_stock as f64 * 30.0).min(30.0);
                score += stock_score;
                reasons.push(format!(
                    "Stock: {} units (+{stock_score:.1} pts)",
                    product.stock_quantity
                ));
            }

            if product.regular_price > 0.0 && avg_price > 0.0 {
                let ratio = product.regular_price / avg_price;
                let price_score = if (0.7..=1.3).contains(&ratio) {
                    reasons.push("Competitive price (+25 pts)".to_string());
                    25.0
                } else if ratio < 0.7 {
                    reasons.push("Budget price (+15 pts)".to_string());
                    15.0
                } else {
                    reasons.push("Premium price (+10 pts)".to_string());
                    10.0
                };
                score += price_score;
            }

            if let Some(discount) = product.discount_percentage.filter(|d| *d > 0.0) {
                let discount_score = discount.min(15.0);
                score += discount_score;
                reasons.push(format!("{discount}% discount (+{discount_score:.1} pts)"));
            }

            if product.thumbnail_url.is_some() {
                score += 10.0;
                reasons.push("Has image (+10 pts)".to_string());
            }

            if product
                .short_description
                .as_ref()
                .is_some_and(|d| !d.is_empty())
            {
                score += 10.0;
                reasons.push("Has description (+10 pts)".to_string());
            }

            if !product.categories.is_empty() {
                score += 5.0;
                reasons.push("Categorized (+5 pts)".to_string());
            }

            if product.sku.as_ref().is_some_and(|s| !s.is_empty()) {
                score += 5.0;
                reasons.push("Has SKU (+5 pts)".to_string());
            }

            ScoredProduct {
                product: product.clone(),
                score,
                reasons,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Search and rank, keeping the top `n`
pub async fn top_products<C: ProductCatalog>(
    catalog: &C,
    query: &str,
    n: usize,
) -> Result<Vec<ScoredProduct>, CatalogError> {
    let products = catalog.search(query, 50).await?;
    if products.is_empty() {
        tracing::warn!(query = %query, "No catalog products found");
        return Ok(Vec::new());
    }
    let mut scored = score_products(&products);
    scored.truncate(n);
    Ok(scored)
}
