//! Typed calls against the `/appdata` REST surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{appdata_path, AuthProvider, Gateway, Request, Response};
use crate::error::{Error, Result};
use crate::models::Entity;
use crate::query::Query;

/// Entities returned by a find, plus the server's receipt time
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntities {
    pub entities: Vec<Entity>,
    pub request_start: Option<String>,
}

/// Remote collection operations for one app
pub struct Remote<G> {
    gateway: G,
    auth: Arc<dyn AuthProvider>,
    app_key: String,
}

impl<G: Gateway> Remote<G> {
    pub fn new(gateway: G, auth: Arc<dyn AuthProvider>, app_key: impl Into<String>) -> Self {
        Self {
            gateway,
            auth,
            app_key: app_key.into(),
        }
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    fn path(&self, collection: &str, id: Option<&str>) -> String {
        appdata_path(&self.app_key, collection, id)
    }

    /// Authenticate and execute, giving up as soon as `cancel` fires.
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let request = request.with_auth(self.auth.as_ref())?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            response = self.gateway.execute(request) => response,
        }
    }

    /// Entities matching a query
    pub async fn find(
        &self,
        collection: &str,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<FetchedEntities> {
        let request = Request::get(self.path(collection, None)).with_query_string(query);
        let response = self.send(request, cancel).await?;
        let request_start = response.request_start().map(str::to_string);
        Ok(FetchedEntities {
            entities: entities_from(response.data)?,
            request_start,
        })
    }

    /// Id to last-modified map of every entity matching the query's filter
    pub async fn find_modified(
        &self,
        collection: &str,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<String, Option<String>>, Option<String>)> {
        let request = Request::get(self.path(collection, None))
            .with_query_string(&Query::from_filter(query.filter.clone()))
            .with_delta_projection();
        let response = self.send(request, cancel).await?;
        let request_start = response.request_start().map(str::to_string);

        let mut stamps = BTreeMap::new();
        for entity in entities_from(response.data)? {
            if let Some(id) = entity.id() {
                stamps.insert(id.to_string(), entity.last_modified_at().map(str::to_string));
            }
        }
        Ok((stamps, request_start))
    }

    /// Full documents for a batch of ids
    pub async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request =
            Request::get(self.path(collection, None)).with_id_filter(ids.iter().cloned());
        let response = self.send(request, cancel).await?;
        entities_from(response.data)
    }

    /// One entity; `None` when the remote has no such id
    pub async fn get(
        &self,
        collection: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Entity>> {
        match self
            .send(Request::get(self.path(collection, Some(id))), cancel)
            .await
        {
            Ok(response) => Ok(Some(Entity::from_value(response.data)?)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Create an entity; the remote assigns the id when absent
    pub async fn create(
        &self,
        collection: &str,
        entity: Entity,
        cancel: &CancellationToken,
    ) -> Result<Entity> {
        let request = Request::post(self.path(collection, None)).with_body(entity);
        let response = self.send(request, cancel).await?;
        Entity::from_value(response.data)
    }

    /// Create or overwrite the entity under its id
    pub async fn update(
        &self,
        collection: &str,
        entity: Entity,
        cancel: &CancellationToken,
    ) -> Result<Entity> {
        let id = entity
            .id()
            .ok_or_else(|| Error::InvalidInput("entity has no _id".into()))?
            .to_string();
        let request = Request::put(self.path(collection, Some(&id))).with_body(entity);
        let response = self.send(request, cancel).await?;
        Entity::from_value(response.data)
    }

    /// Delete one entity
    pub async fn delete(&self, collection: &str, id: &str, cancel: &CancellationToken) -> Result<u64> {
        let response = self
            .send(Request::delete(self.path(collection, Some(id))), cancel)
            .await?;
        Ok(count_from(&response.data))
    }

    /// Delete a batch of ids in one call
    pub async fn delete_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let request =
            Request::delete(self.path(collection, None)).with_id_filter(ids.iter().cloned());
        let response = self.send(request, cancel).await?;
        Ok(count_from(&response.data))
    }

    /// Delete everything matching a query's filter
    pub async fn delete_by_query(
        &self,
        collection: &str,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let request = Request::delete(self.path(collection, None)).with_param(
            "query",
            Value::Object(query.filter.clone()).to_string(),
        );
        let response = self.send(request, cancel).await?;
        Ok(count_from(&response.data))
    }

    /// Number of entities matching a query's filter
    pub async fn count(
        &self,
        collection: &str,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let request = Request::get(self.path(collection, Some("_count")))
            .with_query_string(&Query::from_filter(query.filter.clone()));
        let response = self.send(request, cancel).await?;
        Ok(count_from(&response.data))
    }
}

fn entities_from(data: Value) -> Result<Vec<Entity>> {
    match data {
        Value::Array(items) => items.into_iter().map(Entity::from_value).collect(),
        other => Err(Error::InvalidInput(format!(
            "expected a JSON array of entities, got {other}"
        ))),
    }
}

fn count_from(data: &Value) -> u64 {
    data.get("count").and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{AppCredentials, FailureKind, MemoryGateway, Method};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn remote() -> Remote<Arc<MemoryGateway>> {
        Remote::new(
            Arc::new(MemoryGateway::new("kid")),
            Arc::new(AppCredentials::new("kid", "secret")),
            "kid",
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_maps_not_found_to_none() {
        let remote = remote();
        let cancel = CancellationToken::new();
        assert_eq!(remote.get("books", "missing", &cancel).await.unwrap(), None);

        remote.gateway().seed("books", Entity::new().with_id("a"));
        assert!(remote.get("books", "a", &cancel).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_modified_returns_timestamps() {
        let remote = remote();
        let cancel = CancellationToken::new();
        let a = remote.gateway().seed("books", Entity::new().with_id("a").with("n", 1));
        remote.gateway().seed("books", Entity::new().with_id("b").with("n", 2));

        let query = Query::new().equal_to("n", 1).limit(5);
        let (stamps, request_start) = remote.find_modified("books", &query, &cancel).await.unwrap();
        assert_eq!(stamps.len(), 1);
        assert_eq!(stamps["a"].as_deref(), a.last_modified_at());
        assert!(request_start.is_some());

        let recorded = remote.gateway().requests();
        assert_eq!(recorded[0].method, Method::Get);
        assert!(!recorded[0].query.contains_key("limit"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_call_returns_cancelled() {
        let remote = remote();
        remote
            .gateway()
            .set_latency(Some(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = remote.find("books", &Query::new(), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_typed_errors_pass_through() {
        let remote = remote();
        remote
            .gateway()
            .fail_collection("books", FailureKind::Validation);
        let error = remote
            .create("books", Entity::new().with("title", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        assert!(!error.is_retryable());
    }
}
