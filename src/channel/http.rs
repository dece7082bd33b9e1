use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::model::{DateRange, Ms};

use super::ConnectorError;
use super::ota::{AvailabilityUpdate, ChannelApi, ChannelReservation, RateUpdate};

#[derive(Serialize)]
struct AvailabilityRequest<'a> {
    updates: &'a [AvailabilityUpdate],
}

#[derive(Serialize)]
struct RatesRequest<'a> {
    rates: &'a [RateUpdate],
}

#[derive(Deserialize)]
struct Accepted {
    accepted: u32,
}

/// JSON partner API at a configured base URL.
///
/// Listing resources live under `{base}/listings/{id}`, reservations
/// under `{base}/reservations/{id}`.
pub struct HttpChannelApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChannelApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::Api(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ConnectorError> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ConnectorError::Api(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Api(format!("HTTP {status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ConnectorError::Api(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ChannelApi for HttpChannelApi {
    async fn get_availability(
        &self,
        listing_id: &str,
        range: DateRange,
    ) -> Result<Vec<AvailabilityUpdate>, ConnectorError> {
        let req = self
            .client
            .get(self.url(&format!("/listings/{listing_id}/availability")))
            .query(&[("from", range.from.to_string()), ("to", range.to.to_string())]);
        self.send(req).await
    }

    async fn update_availability(
        &self,
        listing_id: &str,
        updates: &[AvailabilityUpdate],
    ) -> Result<u32, ConnectorError> {
        let req = self
            .client
            .put(self.url(&format!("/listings/{listing_id}/availability")))
            .json(&AvailabilityRequest { updates });
        Ok(self.send::<Accepted>(req).await?.accepted)
    }

    async fn update_rates(&self, listing_id: &str, rates: &[RateUpdate]) -> Result<u32, ConnectorError> {
        let req = self
            .client
            .put(self.url(&format!("/listings/{listing_id}/rates")))
            .json(&RatesRequest { rates });
        Ok(self.send::<Accepted>(req).await?.accepted)
    }

    async fn get_reservations(
        &self,
        listing_id: &str,
        since: Ms,
    ) -> Result<Vec<ChannelReservation>, ConnectorError> {
        let req = self
            .client
            .get(self.url(&format!("/listings/{listing_id}/reservations")))
            .query(&[("since", since)]);
        self.send(req).await
    }

    async fn acknowledge_reservation(&self, reservation_id: &str) -> Result<(), ConnectorError> {
        let req = self
            .client
            .post(self.url(&format!("/reservations/{reservation_id}/acknowledge")));
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ConnectorError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectorError::Api(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
