//! OPTIMADE filter-dialect provider implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

use crate::models::{Material, QueryFields, SearchQuery};
use crate::sources::{check_status, Provider, ProviderCapabilities, ProviderError};
use crate::translate::{to_filter, FILTER_FIELDS};
use crate::utils::{HttpClient, DEFAULT_REQUEST_TIMEOUT};

const STRUCTURES_PATH: &str = "/v1/structures";
const INFO_PATH: &str = "/v1/info";

/// Upper bound on `links.next` pages followed for one search
const MAX_PAGES: usize = 10;

/// Provider for any server implementing the OPTIMADE structures endpoint
#[derive(Debug, Clone)]
pub struct OptimadeProvider {
    id: String,
    name: String,
    base_url: String,
    endpoint: String,
    client: HttpClient,
    capabilities: ProviderCapabilities,
    timeout: Option<Duration>,
    api_key: Option<String>,
    requires_key: bool,
}

impl OptimadeProvider {
    /// Create a provider rooted at `base_url` (the part before `/v1`)
    pub fn new(id: &str, name: &str, base_url: &str) -> Result<Self, ProviderError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ProviderError::InvalidRequest(format!("base URL {}: {}", base_url, e)))?;
        let base_url = parsed.as_str().trim_end_matches('/').to_string();

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: format!("{}{}", base_url, STRUCTURES_PATH),
            base_url,
            client: HttpClient::new()?,
            capabilities: Self::default_capabilities(),
            timeout: None,
            api_key: None,
            requires_key: false,
        })
    }

    /// Fields every OPTIMADE server can filter on
    pub fn default_capabilities() -> ProviderCapabilities {
        ProviderCapabilities::new(FILTER_FIELDS)
        .with_properties([
            "chemical_formula_reduced",
            "elements",
            "nelements",
            "space_group_symbol",
            "lattice_vectors",
        ])
        .with_pagination(true)
    }

    /// Restrict the filterable fields. Fields the filter dialect has no
    /// clause for are dropped.
    pub fn with_filterable(mut self, fields: QueryFields) -> Self {
        let dropped = fields.difference(FILTER_FIELDS);
        if !dropped.is_empty() {
            tracing::debug!(
                "{}: ignoring untranslatable filterable fields {:?}",
                self.id,
                dropped.field_names()
            );
        }
        self.capabilities.filterable = fields & FILTER_FIELDS;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.capabilities = self.capabilities.with_max_results(max_results);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require a bearer token; `None` means it was configured but not found,
    /// and every search fails with [`ProviderError::Auth`]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self.requires_key = true;
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .client()
            .get(url)
            .timeout(self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn first_page_url(&self, query: &SearchQuery, page_limit: usize) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ProviderError::InvalidRequest(format!("endpoint {}: {}", self.endpoint, e)))?;
        {
            let filter = to_filter(query);
            let mut pairs = url.query_pairs_mut();
            if !filter.is_empty() {
                pairs.append_pair("filter", &filter.as_filter_string());
            }
            pairs.append_pair("page_limit", &page_limit.to_string());
        }
        Ok(url)
    }

    /// Turn one `data[]` entry into a single-source record
    fn parse_entry(&self, entry: StructureEntry) -> Material {
        let attributes = entry.attributes;
        let text = |key: &str| attributes.get(key).and_then(Value::as_str);

        let formula = text("chemical_formula_reduced")
            .or_else(|| text("chemical_formula_descriptive"))
            .unwrap_or_default()
            .to_string();
        let id = match entry.id {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut builder = Material::builder(id, formula, &self.id);

        if let Some(elements) = attributes.get("elements").and_then(Value::as_array) {
            builder = builder.elements(elements.iter().filter_map(Value::as_str));
        }
        if let Some(symbol) =
            text("space_group_symbol").or_else(|| text("space_group_symbol_hermann_mauguin"))
        {
            builder = builder.space_group(symbol);
        }
        if let Some(vectors) = attributes
            .get("lattice_vectors")
            .and_then(|v| serde_json::from_value::<Vec<[f64; 3]>>(v.clone()).ok())
        {
            builder = builder.lattice_vectors(vectors);
        }

        for (key, value) in &attributes {
            if let Some(name) = key.strip_prefix('_') {
                if !value.is_null() {
                    builder = builder.extra(name, value.clone());
                }
            }
        }

        builder.raw(Value::Object(attributes)).build()
    }
}

#[async_trait]
impl Provider for OptimadeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Material>, ProviderError> {
        if self.requires_key && self.api_key.is_none() {
            return Err(ProviderError::Auth {
                status: None,
                message: format!("{} requires an API key but none is configured", self.id),
            });
        }

        let page_limit = query.limit().min(self.capabilities.max_results);
        let mut next = Some(self.first_page_url(query, page_limit)?.to_string());
        let mut materials = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            let response = check_status(self.request(&url).send().await?, &self.id).await?;
            let body: StructuresResponse = serde_json::from_str(&response.text().await?)?;
            pages += 1;

            materials.extend(body.data.into_iter().map(|entry| self.parse_entry(entry)));

            if materials.len() >= page_limit || pages >= MAX_PAGES {
                break;
            }
            next = body.links.and_then(|links| links.next).map(Link::into_href);
        }

        tracing::debug!(
            "{}: {} records from {} page(s)",
            self.id,
            materials.len(),
            pages
        );
        materials.truncate(page_limit);
        Ok(materials)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}{}", self.base_url, INFO_PATH);
        match self.request(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("{}: health check failed: {}", self.id, e);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuresResponse {
    #[serde(default)]
    data: Vec<StructureEntry>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct StructureEntry {
    id: Value,
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<Link>,
}

/// `links.next` is either a bare URL or a link object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Link {
    Href(String),
    Object { href: String },
}

impl Link {
    fn into_href(self) -> String {
        match self {
            Link::Href(href) | Link::Object { href } => href,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PropertySlot;
    use mockito::Matcher;

    const PAGE: &str = r#"{
        "data": [
            {
                "id": "oqmd-1",
                "type": "structures",
                "attributes": {
                    "chemical_formula_reduced": "Fe2O3",
                    "elements": ["Fe", "O"],
                    "nelements": 2,
                    "space_group_symbol": "R-3c",
                    "lattice_vectors": [[5.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 13.7]],
                    "_oqmd_band_gap": 2.0,
                    "_oqmd_stability": null
                }
            },
            {
                "id": 42,
                "type": "structures",
                "attributes": {
                    "chemical_formula_reduced": "FeO",
                    "elements": ["Fe", "O"]
                }
            }
        ],
        "links": {"next": null}
    }"#;

    #[test]
    fn test_endpoint_and_capabilities() {
        let provider = OptimadeProvider::new("oqmd", "OQMD", "https://oqmd.org/optimade/").unwrap();
        assert_eq!(provider.endpoint(), "https://oqmd.org/optimade/v1/structures");
        assert!(provider.capabilities().filterable.contains(QueryFields::SPACE_GROUP));
        assert!(!provider.capabilities().filterable.contains(QueryFields::BAND_GAP));
        assert!(OptimadeProvider::new("bad", "Bad", "not a url").is_err());
    }

    #[test]
    fn test_filterable_override_cannot_add_band_gap() {
        let provider = OptimadeProvider::new("oqmd", "OQMD", "https://oqmd.org/optimade")
            .unwrap()
            .with_filterable(QueryFields::ELEMENTS | QueryFields::BAND_GAP);
        assert_eq!(provider.capabilities().filterable, QueryFields::ELEMENTS);

        let query = SearchQuery::builder()
            .elements(["Fe"])
            .band_gap(crate::models::PropertyRange::at_least(3.0).unwrap())
            .build()
            .unwrap();
        assert!(!provider.can_handle(&query));
    }

    #[tokio::test]
    async fn test_search_parses_structures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/structures")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filter".into(), r#"elements HAS ALL "Fe","O""#.into()),
                Matcher::UrlEncoded("page_limit".into(), "10".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(PAGE)
            .create_async()
            .await;

        let provider = OptimadeProvider::new("oqmd", "OQMD", &server.url()).unwrap();
        let query = SearchQuery::builder()
            .elements(["Fe", "O"])
            .limit(10)
            .build()
            .unwrap();

        let records = provider.search(&query).await.unwrap();
        mock.assert_async().await;

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.id, "oqmd-1");
        assert_eq!(first.formula, "Fe2O3");
        assert_eq!(first.sources, vec!["oqmd"]);
        assert_eq!(first.space_group_symbol(), Some("R-3c"));
        assert!(first.slot(PropertySlot::LatticeVectors).is_some());
        assert_eq!(
            first.extra_properties["oqmd_band_gap:oqmd"].as_f64(),
            Some(2.0)
        );
        assert!(!first.extra_properties.contains_key("oqmd_stability:oqmd"));
        assert_eq!(records[1].id, "42");
    }

    #[tokio::test]
    async fn test_follows_next_link() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/v1/structures?page_offset=1", server.url());
        let first_page = format!(
            r#"{{"data":[{{"id":"a","attributes":{{"chemical_formula_reduced":"Si"}}}}],
                "links":{{"next":{{"href":"{}"}}}}}}"#,
            next
        );

        server
            .mock("GET", "/v1/structures")
            .match_query(Matcher::UrlEncoded("page_limit".into(), "5".into()))
            .with_status(200)
            .with_body(first_page)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/structures")
            .match_query(Matcher::UrlEncoded("page_offset".into(), "1".into()))
            .with_status(200)
            .with_body(r#"{"data":[{"id":"b","attributes":{"chemical_formula_reduced":"C"}}]}"#)
            .create_async()
            .await;

        let provider = OptimadeProvider::new("p", "P", &server.url()).unwrap();
        let query = SearchQuery::builder().limit(5).build().unwrap();

        let ids: Vec<String> = provider
            .search(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/structures")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let provider = OptimadeProvider::new("p", "P", &server.url()).unwrap();
        let err = provider.search(&SearchQuery::default()).await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/structures")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let provider = OptimadeProvider::new("p", "P", &server.url()).unwrap();
        let err = provider.search(&SearchQuery::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let provider = OptimadeProvider::new("p", "P", "https://example.org")
            .unwrap()
            .with_api_key(None);
        let err = provider.search(&SearchQuery::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { status: None, .. }));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/info")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let provider = OptimadeProvider::new("p", "P", &server.url()).unwrap();
        assert!(provider.health_check().await);
    }
}
