//! HTTP access to the POS API.
//!
//! Every endpoint answers with a `{ "body": { ... } }` envelope. [`ApiClient`]
//! strips the envelope and hands back the body; the per-endpoint response
//! types below validate the fields the engine relies on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use tillsync_core::UniqueId;

use crate::error::SyncError;

/// Endpoints used by the sync engine, relative to the API base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    CountAllStock,
    ResetAllStock,
    FetchAllStock,
    FetchUpdatedStock,
    SyncOfflineBalance,
    SyncOfflineInvoices,
    LoadUsers,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::CountAllStock => "stock/countAllStock",
            Endpoint::ResetAllStock => "stock/resetAllStock",
            Endpoint::FetchAllStock => "stock/fetchAllStock",
            Endpoint::FetchUpdatedStock => "stock/fetchUpdatedStock",
            Endpoint::SyncOfflineBalance => "till/syncOfflineBalance",
            Endpoint::SyncOfflineInvoices => "invoices/syncOfflineInvoices",
            Endpoint::LoadUsers => "external/load-users",
        }
    }
}

/// Query parameters of a GET request.
pub type Params = Vec<(&'static str, String)>;

/// Capability to call the API.
///
/// Implementations return the unwrapped `body` of the response, or fail
/// with [`SyncError::Network`] (transport), [`SyncError::Api`] (non-2xx) or
/// [`SyncError::Parse`] (no envelope).
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get(&self, endpoint: Endpoint, params: &Params) -> Result<Value, SyncError>;

    async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<Value, SyncError>;
}

#[derive(Deserialize)]
struct Envelope {
    body: Value,
}

/// `reqwest`-backed API client.
#[derive(Debug, Clone)]
pub struct HttpApi {
    base: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base, token, client })
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url, SyncError> {
        self.base
            .join(endpoint.path())
            .map_err(|e| SyncError::Network(format!("invalid URL for {}: {e}", endpoint.path())))
    }

    async fn send(&self, endpoint: Endpoint, mut req: reqwest::RequestBuilder) -> Result<Value, SyncError> {
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| SyncError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Api(status.as_u16(), resp.text().await.unwrap_or_default()));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| SyncError::Parse(format!("{}: {e}", endpoint.path())))?;

        tracing::debug!(endpoint = endpoint.path(), "API call succeeded");
        Ok(envelope.body)
    }
}

#[async_trait]
impl ApiClient for HttpApi {
    async fn get(&self, endpoint: Endpoint, params: &Params) -> Result<Value, SyncError> {
        let req = self.client.get(self.url(endpoint)?).query(params);
        self.send(endpoint, req).await
    }

    async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<Value, SyncError> {
        let req = self.client.post(self.url(endpoint)?).json(body);
        self.send(endpoint, req).await
    }
}

/// Decode an endpoint body into its typed response.
pub fn decode<T: DeserializeOwned>(endpoint: Endpoint, body: Value) -> Result<T, SyncError> {
    serde_json::from_value(body).map_err(|e| SyncError::Parse(format!("{}: {e}", endpoint.path())))
}

/// `stock/countAllStock`.
#[derive(Debug, Clone, Deserialize)]
pub struct StockCount {
    pub diff: Value,
}

impl StockCount {
    /// The server signals a big difference with any truthy `diff`.
    pub fn has_big_difference(&self) -> bool {
        match &self.diff {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

/// A `data` list, as returned by the stock pages and `external/load-users`.
///
/// Rows stay untyped so one malformed row can be dropped on its own.
#[derive(Debug, Clone, Deserialize)]
pub struct DataPage {
    pub data: Vec<Value>,
}

/// Reply to an outbox delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryAck {
    pub status: String,
    #[serde(default)]
    pub message: Option<Value>,
    /// Acknowledged id for invoices.
    #[serde(rename = "uniqueID", default)]
    pub unique_id: Option<Value>,
    /// Carries the acknowledged id for balances.
    #[serde(default)]
    pub data: Option<Value>,
}

impl DeliveryAck {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn message(&self) -> String {
        match &self.message {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "no message".to_string(),
        }
    }

    /// `uniqueID` at the top level of the body.
    pub fn top_level_id(&self) -> Option<UniqueId> {
        ack_id(self.unique_id.as_ref())
    }

    /// `data.uniqueID` of the body.
    pub fn data_id(&self) -> Option<UniqueId> {
        ack_id(self.data.as_ref().and_then(|d| d.get("uniqueID")))
    }
}

fn ack_id(value: Option<&Value>) -> Option<UniqueId> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// One recorded API call.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Call {
        pub endpoint: Endpoint,
        pub params: Params,
        pub body: Option<Value>,
        pub at: tokio::time::Instant,
    }

    /// Scripted API: each endpoint replies from a queue, falling back to a
    /// fixed default once the queue is empty.
    #[derive(Debug, Default)]
    pub(crate) struct FakeApi {
        scripted: Mutex<HashMap<Endpoint, VecDeque<Result<Value, SyncError>>>>,
        defaults: Mutex<HashMap<Endpoint, Value>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeApi {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(&self, endpoint: Endpoint, result: Result<Value, SyncError>) -> &Self {
            self.scripted
                .lock()
                .unwrap()
                .entry(endpoint)
                .or_default()
                .push_back(result);
            self
        }

        pub(crate) fn always(&self, endpoint: Endpoint, body: Value) -> &Self {
            self.defaults.lock().unwrap().insert(endpoint, body);
            self
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn calls_to(&self, endpoint: Endpoint) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| c.endpoint == endpoint)
                .collect()
        }

        fn answer(&self, endpoint: Endpoint, params: Params, body: Option<Value>) -> Result<Value, SyncError> {
            self.calls.lock().unwrap().push(Call {
                endpoint,
                params,
                body,
                at: tokio::time::Instant::now(),
            });
            if let Some(result) = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
            {
                return result;
            }
            self.defaults
                .lock()
                .unwrap()
                .get(&endpoint)
                .cloned()
                .ok_or_else(|| SyncError::Network(format!("no reply scripted for {}", endpoint.path())))
        }
    }

    #[async_trait]
    impl ApiClient for FakeApi {
        async fn get(&self, endpoint: Endpoint, params: &Params) -> Result<Value, SyncError> {
            self.answer(endpoint, params.clone(), None)
        }

        async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<Value, SyncError> {
            self.answer(endpoint, Vec::new(), Some(body.clone()))
        }
    }

    pub(crate) fn param<'a>(call: &'a Call, name: &str) -> Option<&'a str> {
        call.params
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn diff_follows_truthiness() {
        let count = |diff: Value| StockCount { diff }.has_big_difference();
        assert!(count(json!(true)));
        assert!(count(json!(12)));
        assert!(count(json!("yes")));
        assert!(!count(json!(false)));
        assert!(!count(json!(0)));
        assert!(!count(json!("")));
        assert!(!count(Value::Null));
    }

    #[test]
    fn count_without_diff_is_a_parse_error() {
        let err = decode::<StockCount>(Endpoint::CountAllStock, json!({ "count": 4 })).unwrap_err();
        assert!(matches!(err, SyncError::Parse(msg) if msg.contains("stock/countAllStock")));
    }

    #[test]
    fn ack_ids_are_read_from_both_locations() {
        let invoice: DeliveryAck =
            decode(Endpoint::SyncOfflineInvoices, json!({ "status": "success", "uniqueID": "inv-1" })).unwrap();
        assert!(invoice.is_success());
        assert_eq!(invoice.top_level_id().unwrap().as_str(), "inv-1");
        assert_eq!(invoice.data_id(), None);

        let balance: DeliveryAck = decode(
            Endpoint::SyncOfflineBalance,
            json!({ "status": "success", "data": { "uniqueID": 77 } }),
        )
        .unwrap();
        assert_eq!(balance.data_id().unwrap().as_str(), "77");
        assert_eq!(balance.top_level_id(), None);

        let rejected: DeliveryAck =
            decode(Endpoint::SyncOfflineInvoices, json!({ "status": "error", "message": "duplicate" })).unwrap();
        assert!(!rejected.is_success());
        assert_eq!(rejected.message(), "duplicate");
    }

    #[test]
    fn base_url_joins_endpoint_paths() {
        let api = HttpApi::new(
            Url::parse("https://pos.example.com/apix/").unwrap(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            api.url(Endpoint::LoadUsers).unwrap().as_str(),
            "https://pos.example.com/apix/external/load-users"
        );
    }
}
