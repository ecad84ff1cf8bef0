//! Materials Project native-API provider implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::models::{CrystalSystem, Material, QueryFields, SearchQuery};
use crate::sources::{check_status, Provider, ProviderCapabilities, ProviderError};
use crate::translate::{to_native_params, NATIVE_FIELDS};
use crate::utils::{HttpClient, DEFAULT_REQUEST_TIMEOUT};

const SUMMARY_PATH: &str = "/materials/summary/";
const HEARTBEAT_PATH: &str = "/heartbeat";

/// Method label for DFT-computed values
const DFT_METHOD: &str = "GGA/GGA+U";

/// Fields requested from the summary endpoint
const SUMMARY_FIELDS: &str = "material_id,formula_pretty,elements,nelements,symmetry,band_gap,\
formation_energy_per_atom,energy_above_hull,bulk_modulus,debye_temperature,is_stable,theoretical";

/// Materials Project summary search
///
/// Uses the keyword-parameter dialect and an `X-API-KEY` header.
#[derive(Debug, Clone)]
pub struct MaterialsProjectProvider {
    id: String,
    name: String,
    base_url: String,
    endpoint: String,
    client: HttpClient,
    capabilities: ProviderCapabilities,
    timeout: Option<Duration>,
    api_key: Option<String>,
}

impl MaterialsProjectProvider {
    /// Create a provider; a `None` key makes every search fail with
    /// [`ProviderError::Auth`]
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ProviderError::InvalidRequest(format!("base URL {}: {}", base_url, e)))?;
        let base_url = parsed.as_str().trim_end_matches('/').to_string();

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: format!("{}{}", base_url, SUMMARY_PATH),
            base_url,
            client: HttpClient::new()?,
            capabilities: Self::default_capabilities(),
            timeout: None,
            api_key,
        })
    }

    pub fn default_capabilities() -> ProviderCapabilities {
        ProviderCapabilities::new(NATIVE_FIELDS)
        .with_properties([
            "material_id",
            "formula_pretty",
            "symmetry",
            "band_gap",
            "formation_energy_per_atom",
            "energy_above_hull",
            "bulk_modulus",
            "debye_temperature",
        ])
        .with_extra_fields(["is_stable", "theoretical"])
        .with_max_results(1000)
    }

    /// Restrict the filterable fields; fields without a native parameter
    /// are dropped
    pub fn with_filterable(mut self, fields: QueryFields) -> Self {
        let dropped = fields.difference(NATIVE_FIELDS);
        if !dropped.is_empty() {
            tracing::debug!(
                "{}: ignoring untranslatable filterable fields {:?}",
                self.id,
                dropped.field_names()
            );
        }
        self.capabilities.filterable = fields & NATIVE_FIELDS;
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

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| ProviderError::Auth {
            status: None,
            message: format!("{} requires an API key but none is configured", self.id),
        })
    }

    fn parse_document(&self, raw: Value) -> Result<Material, ProviderError> {
        let doc: SummaryDoc = serde_json::from_value(raw.clone())?;

        let mut builder = Material::builder(
            doc.material_id,
            doc.formula_pretty.unwrap_or_default(),
            &self.id,
        );
        if !doc.elements.is_empty() {
            builder = builder.elements(doc.elements);
        }

        if let Some(symmetry) = doc.symmetry {
            if let Some(symbol) = symmetry.symbol {
                builder = builder.space_group(symbol);
            }
            match symmetry.crystal_system.as_deref().map(str::parse::<CrystalSystem>) {
                Some(Ok(system)) => builder = builder.crystal_system(system),
                Some(Err(e)) => tracing::debug!("{}: {}", self.id, e),
                None => {}
            }
        }

        builder = builder.method(DFT_METHOD);
        if let Some(gap) = doc.band_gap {
            builder = builder.band_gap(gap);
        }
        if let Some(energy) = doc.formation_energy_per_atom {
            builder = builder.formation_energy(energy);
        }
        if let Some(energy) = doc.energy_above_hull {
            builder = builder.energy_above_hull(energy);
        }
        if let Some(modulus) = doc.bulk_modulus.as_ref().and_then(vrh) {
            builder = builder.bulk_modulus(modulus);
        }
        if let Some(temperature) = doc.debye_temperature {
            builder = builder.debye_temperature(temperature);
        }
        if let Some(stable) = doc.is_stable {
            builder = builder.extra("is_stable", stable);
        }
        if let Some(theoretical) = doc.theoretical {
            builder = builder.extra("theoretical", theoretical);
        }

        Ok(builder.raw(raw).build())
    }
}

/// Voigt-Reuss-Hill average, or a bare number
fn vrh(value: &Value) -> Option<f64> {
    value
        .get("vrh")
        .and_then(Value::as_f64)
        .or_else(|| value.as_f64())
}

#[async_trait]
impl Provider for MaterialsProjectProvider {
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

    /// URL-encoded query string, including paging and field selection
    fn wire_query(&self, query: &SearchQuery) -> String {
        let limit = query.limit().min(self.capabilities.max_results);
        let mut pairs = to_native_params(query).to_query_pairs();
        pairs.push(("_limit".to_string(), limit.to_string()));
        pairs.push(("_fields".to_string(), SUMMARY_FIELDS.to_string()));

        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Material>, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}?{}", self.endpoint, self.wire_query(query));

        let response = self
            .client
            .client()
            .get(&url)
            .header("X-API-KEY", api_key)
            .timeout(self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .send()
            .await?;

        let response = match check_status(response, &self.id).await {
            Err(ProviderError::Http { status, message }) if status == 401 || status == 403 => {
                return Err(ProviderError::Auth {
                    status: Some(status),
                    message,
                });
            }
            other => other?,
        };

        let body: SummaryResponse = serde_json::from_str(&response.text().await?)?;
        let materials = body
            .data
            .into_iter()
            .map(|doc| self.parse_document(doc))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("{}: {} records", self.id, materials.len());
        Ok(materials)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}{}", self.base_url, HEARTBEAT_PATH);
        let request = self
            .client
            .client()
            .get(&url)
            .timeout(self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT));

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("{}: health check failed: {}", self.id, e);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SummaryDoc {
    material_id: String,
    formula_pretty: Option<String>,
    #[serde(default)]
    elements: Vec<String>,
    symmetry: Option<Symmetry>,
    band_gap: Option<f64>,
    formation_energy_per_atom: Option<f64>,
    energy_above_hull: Option<f64>,
    bulk_modulus: Option<Value>,
    debye_temperature: Option<f64>,
    is_stable: Option<bool>,
    theoretical: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Symmetry {
    symbol: Option<String>,
    crystal_system: Option<String>,
}
