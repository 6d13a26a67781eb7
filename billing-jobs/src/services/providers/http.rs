//! Gateway client speaking the generic provider HTTP contract.

use super::{
    AccountingProvider, ConnectionStatus, CreatedInvoice, CustomerRecord, GatewayClient,
    GatewayError, GatewayTransaction, InvoiceRequest,
};
use crate::models::TransactionWindow;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct TransactionPage {
    transactions: Vec<GatewayTransaction>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Clone)]
pub struct HttpGateway {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl HttpGateway {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<Secret<String>>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            name: name.to_string(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, GatewayError> {
        let key = self.api_key.as_ref().ok_or_else(|| {
            GatewayError::Configuration(format!("gateway '{}' has no api key", self.name))
        })?;
        Ok(request.bearer_auth(key.expose_secret()).with_trace_context())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GatewayError::Configuration(format!(
                "gateway '{}' rejected credentials: {}",
                self.name, status
            )));
        }
        Err(GatewayError::Rejected(format!("{}: {}", status, body)))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self), fields(gateway = %self.name))]
    async fn test_connection(&self) -> Result<ConnectionStatus, GatewayError> {
        let response = self.send(self.client.get(self.url("/connection"))).await?;
        Self::json(response).await
    }

    #[tracing::instrument(skip(self, window), fields(gateway = %self.name, company_id = %company_id))]
    async fn list_transactions(
        &self,
        company_id: Uuid,
        window: &TransactionWindow,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        let request = self.client.get(self.url("/transactions")).query(&[
            ("account", company_id.to_string()),
            ("from", window.from.to_rfc3339()),
            ("to", window.to.to_rfc3339()),
        ]);
        let page: TransactionPage = Self::json(self.send(request).await?).await?;
        Ok(page.transactions)
    }

    #[tracing::instrument(skip(self, invoice), fields(gateway = %self.name, reference = %invoice.reference))]
    async fn create_invoice(
        &self,
        invoice: &InvoiceRequest,
    ) -> Result<CreatedInvoice, GatewayError> {
        let request = self.client.post(self.url("/invoices")).json(invoice);
        let created: IdResponse = Self::json(self.send(request).await?).await?;
        Ok(CreatedInvoice {
            external_id: created.id,
        })
    }
}

#[async_trait]
impl AccountingProvider for HttpGateway {
    #[tracing::instrument(skip(self, customer), fields(gateway = %self.name, company_id = %customer.company_id))]
    async fn sync_customer(&self, customer: &CustomerRecord) -> Result<String, GatewayError> {
        let request = self
            .client
            .put(self.url(&format!("/customers/{}", customer.company_id)))
            .json(customer);
        let synced: IdResponse = Self::json(self.send(request).await?).await?;
        Ok(synced.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(uri: &str, key: Option<&str>) -> HttpGateway {
        HttpGateway::new(
            "sepa",
            uri,
            key.map(|k| Secret::new(k.to_string())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn lists_transactions_for_the_company_account() {
        let server = MockServer::start().await;
        let company_id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/transactions"))
            .and(query_param("account", company_id.to_string()))
            .and(header("authorization", "Bearer bank-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transactions": [{
                    "external_id": "tx-1",
                    "amount": "120.00",
                    "currency": "EUR",
                    "booked_on": "2025-01-10",
                    "reference": "OVG-1B4E28BA"
                }]
            })))
            .mount(&server)
            .await;

        let window = TransactionWindow {
            from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap(),
        };
        let transactions = gateway(&server.uri(), Some("bank-key"))
            .list_transactions(company_id, &window)
            .await
            .unwrap();

        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, Decimal::new(12000, 2));
        assert_eq!(
            transactions[0].booked_on,
            NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let err = gateway("http://127.0.0.1:9", None)
            .test_connection()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn rejected_credentials_are_configuration_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connection"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = gateway(&server.uri(), Some("stale"))
            .test_connection()
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn server_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoices"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let invoice = InvoiceRequest {
            customer_id: Some("cus_1".to_string()),
            reference: "OVG-00000001".to_string(),
            currency: "EUR".to_string(),
            total_amount: Decimal::new(5000, 2),
            period_start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            lines: Vec::new(),
        };
        let err = gateway(&server.uri(), Some("key"))
            .create_invoice(&invoice)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
