use anyhow::{bail, Context, Result};
use common::{
    BindingQuery, ErrorResponse, Instance, JoinRequest, ObservedPortsRequest, Port, PortBinding,
    PortQuery, ReleaseRequest, ReserveRequest,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

/// Thin wrapper over the gatekeeper HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn join(&self, req: &JoinRequest) -> Result<Instance> {
        let resp = self.client.post(self.url("/api/instances")).json(req).send().await?;
        decode(resp).await
    }

    pub async fn instance(&self, id: &str) -> Result<Instance> {
        let resp = self.client.get(self.url(&format!("/api/instances/{}", id))).send().await?;
        decode(resp).await
    }

    pub async fn instances(&self) -> Result<Vec<Instance>> {
        let resp = self.client.get(self.url("/api/instances")).send().await?;
        decode(resp).await
    }

    pub async fn reserve(&self, req: &ReserveRequest) -> Result<PortBinding> {
        let resp = self.client.post(self.url("/api/ports/reserve")).json(req).send().await?;
        decode(resp).await
    }

    pub async fn release(&self, req: &ReleaseRequest) -> Result<PortBinding> {
        let resp = self.client.post(self.url("/api/ports/release")).json(req).send().await?;
        decode(resp).await
    }

    pub async fn ports(&self, query: &PortQuery) -> Result<Vec<Port>> {
        let resp = self.client.get(self.url("/api/ports")).query(query).send().await?;
        decode(resp).await
    }

    pub async fn bindings(&self, query: &BindingQuery) -> Result<Vec<PortBinding>> {
        let resp = self.client.get(self.url("/api/bindings")).query(query).send().await?;
        decode(resp).await
    }

    pub async fn report_observed(&self, ports: Vec<u16>) -> Result<Vec<Port>> {
        let req = ObservedPortsRequest { ports };
        let resp = self.client.post(self.url("/api/ports/observed")).json(&req).send().await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("Failed to decode response");
    }

    match resp.json::<ErrorResponse>().await {
        Ok(err) => bail!("{} ({})", err.message, status),
        Err(_) => bail!("Request failed: {}", status),
    }
}
