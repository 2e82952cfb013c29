//! In-process backend speaking the same REST surface as the HTTP service.
//!
//! Used for offline demos and tests. Writes are stamped with a monotonic
//! clock so every change gets a distinct `_kmd.lmt`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{AuthRequirement, Gateway, Method, Request, Response, REQUEST_START_HEADER};
use crate::error::{Error, Result};
use crate::models::{
    generate_entity_id, Entity, ACL_FIELD, CREATED_FIELD, LAST_MODIFIED_FIELD, LOCAL_FIELD,
    METADATA_FIELD,
};
use crate::query::{self, Query};
use crate::util::format_timestamp;

const COUNT_SEGMENT: &str = "_count";

/// Failure a rule injects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Timeout,
    Server,
    Validation,
    InvalidCredentials,
}

impl FailureKind {
    fn to_error(self, target: &str) -> Error {
        match self {
            Self::Network => Error::Network(format!("connection reset while calling {target}")),
            Self::Timeout => Error::Timeout,
            Self::Server => Error::Server {
                status: 500,
                message: format!("internal error handling {target}"),
            },
            Self::Validation => Error::Validation(format!("rejected payload for {target}")),
            Self::InvalidCredentials => {
                Error::InvalidCredentials(format!("credentials rejected for {target}"))
            }
        }
    }
}

/// A request as the backend saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    collection: Option<String>,
    id: Option<String>,
    method: Option<Method>,
    kind: FailureKind,
    remaining: Option<usize>,
}

impl FailureRule {
    fn applies(&self, method: Method, target: &Target) -> bool {
        if self.method.is_some_and(|wanted| wanted != method) {
            return false;
        }
        if let Some(collection) = &self.collection {
            if collection != target.collection() {
                return false;
            }
        }
        match (&self.id, target) {
            (None, _) => true,
            (Some(id), Target::Entity { id: target_id, .. }) => id == target_id,
            (Some(_), _) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Collection(String),
    Count(String),
    Entity { collection: String, id: String },
}

impl Target {
    fn collection(&self) -> &str {
        match self {
            Self::Collection(collection)
            | Self::Count(collection)
            | Self::Entity { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Default)]
struct Backend {
    collections: BTreeMap<String, BTreeMap<String, Entity>>,
    requests: Vec<RecordedRequest>,
    failures: Vec<FailureRule>,
    latency: Option<Duration>,
    last_tick: Option<DateTime<Utc>>,
}

impl Backend {
    fn tick(&mut self) -> String {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        format_timestamp(next)
    }

    fn take_failure(&mut self, method: Method, target: &Target) -> Option<FailureKind> {
        let index = self
            .failures
            .iter()
            .position(|rule| rule.applies(method, target))?;
        let rule = &mut self.failures[index];
        let kind = rule.kind;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.failures.remove(index);
            }
        }
        Some(kind)
    }

    fn stamp(&mut self, entity: &mut Entity, created_at: Option<String>) {
        let now = self.tick();
        let mut metadata = entity.metadata().cloned().unwrap_or_default();
        metadata.remove(LOCAL_FIELD);
        metadata.insert(LAST_MODIFIED_FIELD.to_string(), Value::String(now.clone()));
        metadata.insert(
            CREATED_FIELD.to_string(),
            Value::String(created_at.unwrap_or(now)),
        );
        entity.insert(METADATA_FIELD, Value::Object(metadata));
        if entity.acl().is_none() {
            entity.insert(ACL_FIELD, json!({ "creator": "memory" }));
        }
    }

    fn collection_mut(&mut self, collection: &str) -> &mut BTreeMap<String, Entity> {
        self.collections.entry(collection.to_string()).or_default()
    }

    fn all(&self, collection: &str) -> Vec<Entity> {
        self.collections
            .get(collection)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// In-memory implementation of [`Gateway`]
#[derive(Debug)]
pub struct MemoryGateway {
    app_key: String,
    backend: Mutex<Backend>,
}

impl MemoryGateway {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            backend: Mutex::new(Backend::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entity as another client would; it is stamped unless it
    /// already carries a last-modified timestamp.
    pub fn seed(&self, collection: &str, mut entity: Entity) -> Entity {
        let mut backend = self.lock();
        if entity.id().is_none() {
            entity.set_id(generate_entity_id());
        }
        if entity.last_modified_at().is_none() {
            let created = entity.created_at().map(str::to_string);
            backend.stamp(&mut entity, created);
        }
        let id = entity.id().unwrap_or_default().to_string();
        backend
            .collection_mut(collection)
            .insert(id, entity.clone());
        entity
    }

    /// Change an entity remotely, bumping its last-modified timestamp
    pub fn modify(
        &self,
        collection: &str,
        id: &str,
        change: impl FnOnce(&mut Entity),
    ) -> Option<Entity> {
        let mut backend = self.lock();
        let mut entity = backend.collections.get(collection)?.get(id)?.clone();
        change(&mut entity);
        let created = entity.created_at().map(str::to_string);
        backend.stamp(&mut entity, created);
        backend
            .collection_mut(collection)
            .insert(id.to_string(), entity.clone());
        Some(entity)
    }

    /// Delete an entity remotely
    pub fn remove(&self, collection: &str, id: &str) -> Option<Entity> {
        self.lock().collections.get_mut(collection)?.remove(id)
    }

    pub fn entity(&self, collection: &str, id: &str) -> Option<Entity> {
        self.lock().collections.get(collection)?.get(id).cloned()
    }

    pub fn entities(&self, collection: &str) -> Vec<Entity> {
        self.lock().all(collection)
    }

    /// Fail every request to a collection until cleared
    pub fn fail_collection(&self, collection: &str, kind: FailureKind) {
        self.lock().failures.push(FailureRule {
            collection: Some(collection.to_string()),
            id: None,
            method: None,
            kind,
            remaining: None,
        });
    }

    /// Fail every request addressed to one entity until cleared
    pub fn fail_entity(&self, collection: &str, id: &str, kind: FailureKind) {
        self.lock().failures.push(FailureRule {
            collection: Some(collection.to_string()),
            id: Some(id.to_string()),
            method: None,
            kind,
            remaining: None,
        });
    }

    /// Fail every request with the given method until cleared
    pub fn fail_method(&self, method: Method, kind: FailureKind) {
        self.lock().failures.push(FailureRule {
            collection: None,
            id: None,
            method: Some(method),
            kind,
            remaining: None,
        });
    }

    /// Fail only the next request
    pub fn fail_next(&self, kind: FailureKind) {
        self.lock().failures.push(FailureRule {
            collection: None,
            id: None,
            method: None,
            kind,
            remaining: Some(1),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Delay every response
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    fn parse_target(&self, path: &str) -> Result<Target> {
        let segments = path
            .trim_matches('/')
            .split('/')
            .map(|segment| {
                urlencoding::decode(segment)
                    .map(std::borrow::Cow::into_owned)
                    .map_err(|error| Error::InvalidInput(format!("bad path segment: {error}")))
            })
            .collect::<Result<Vec<_>>>()?;

        match segments.as_slice() {
            [root, app_key, rest @ ..] if root == "appdata" => {
                if *app_key != self.app_key {
                    return Err(Error::NotFound(format!("app {app_key}")));
                }
                match rest {
                    [collection] => Ok(Target::Collection(collection.clone())),
                    [collection, id] if id == COUNT_SEGMENT => {
                        Ok(Target::Count(collection.clone()))
                    }
                    [collection, id] => Ok(Target::Entity {
                        collection: collection.clone(),
                        id: id.clone(),
                    }),
                    _ => Err(Error::NotFound(path.to_string())),
                }
            }
            _ => Err(Error::NotFound(path.to_string())),
        }
    }

    fn respond(&self, request: Request) -> Result<Response> {
        let target = self.parse_target(&request.path)?;
        let mut backend = self.lock();
        backend.requests.push(RecordedRequest {
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
        });

        if let Some(kind) = backend.take_failure(request.method, &target) {
            return Err(kind.to_error(&request.path));
        }
        if request.credentials.is_none() && request.auth != AuthRequirement::None {
            return Err(Error::InvalidCredentials("missing credentials".into()));
        }

        let params = || {
            Query::from_params(
                request
                    .query
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            )
        };

        let data = match (request.method, &target) {
            (Method::Get, Target::Collection(collection)) => {
                let matched = query::apply(backend.all(collection), &params()?);
                Value::Array(matched.into_iter().map(Entity::into_value).collect())
            }
            (Method::Get, Target::Count(collection)) => {
                let filter = params()?.filter;
                let count = backend
                    .all(collection)
                    .iter()
                    .filter(|entity| query::matches(entity, &filter))
                    .count();
                json!({ "count": count })
            }
            (Method::Get, Target::Entity { collection, id }) => backend
                .collections
                .get(collection)
                .and_then(|entities| entities.get(id))
                .cloned()
                .map(Entity::into_value)
                .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?,
            (Method::Post, Target::Collection(collection)) => {
                let mut entity = body_entity(&request)?;
                let id = match entity.id() {
                    Some(id) => id.to_string(),
                    None => generate_entity_id(),
                };
                if backend
                    .collections
                    .get(collection)
                    .is_some_and(|entities| entities.contains_key(&id))
                {
                    return Err(Error::Validation(format!("{collection}/{id} already exists")));
                }
                entity.set_id(id.clone());
                backend.stamp(&mut entity, None);
                backend
                    .collection_mut(collection)
                    .insert(id, entity.clone());
                entity.into_value()
            }
            (Method::Put, Target::Entity { collection, id }) => {
                let mut entity = body_entity(&request)?;
                entity.set_id(id.clone());
                let created = backend
                    .collections
                    .get(collection)
                    .and_then(|entities| entities.get(id))
                    .and_then(|existing| existing.created_at().map(str::to_string));
                backend.stamp(&mut entity, created);
                backend
                    .collection_mut(collection)
                    .insert(id.clone(), entity.clone());
                entity.into_value()
            }
            (Method::Delete, Target::Entity { collection, id }) => {
                backend
                    .collections
                    .get_mut(collection)
                    .and_then(|entities| entities.remove(id))
                    .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
                json!({ "count": 1 })
            }
            (Method::Delete, Target::Collection(collection)) => {
                if !request.query.contains_key("query") {
                    return Err(Error::Validation(
                        "deleting from a collection requires a query".into(),
                    ));
                }
                let filter = params()?.filter;
                let entities = backend.collection_mut(collection);
                let before = entities.len();
                entities.retain(|_, entity| !query::matches(entity, &filter));
                json!({ "count": before - entities.len() })
            }
            (method, _) => {
                return Err(Error::Validation(format!(
                    "{method} is not supported on {}",
                    request.path
                )))
            }
        };

        let request_start = backend.tick();
        let status = if request.method == Method::Post { 201 } else { 200 };
        Ok(Response {
            status,
            headers: BTreeMap::new(),
            data,
        }
        .with_header(REQUEST_START_HEADER, request_start))
    }
}

fn body_entity(request: &Request) -> Result<Entity> {
    match &request.body {
        Some(body @ Value::Object(_)) => Entity::from_value(body.clone()),
        _ => Err(Error::Validation(format!(
            "{} requires a JSON object body",
            request.path
        ))),
    }
}

impl Gateway for MemoryGateway {
    fn execute(
        &self,
        request: Request,
    ) -> impl std::future::Future<Output = Result<Response>> + Send {
        async move {
            let latency = self.lock().latency;
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.respond(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{appdata_path, AppCredentials};
    use pretty_assertions::assert_eq;

    fn authed(request: Request) -> Request {
        request
            .with_auth(&AppCredentials::new("kid", "secret"))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_stamps_metadata() {
        let gateway = MemoryGateway::new("kid");
        let response = gateway
            .execute(authed(
                Request::post(appdata_path("kid", "books", None)).with_body(json!({"title": "Dune"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 201);

        let created = Entity::from_value(response.data).unwrap();
        let id = created.id().unwrap();
        assert!(created.last_modified_at().is_some());
        assert_eq!(gateway.entity("books", id), Some(created.clone()));
        assert!(response.headers.contains_key(REQUEST_START_HEADER));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_bumps_last_modified() {
        let gateway = MemoryGateway::new("kid");
        let seeded = gateway.seed("books", Entity::new().with_id("a").with("title", "Dune"));
        let response = gateway
            .execute(authed(
                Request::put(appdata_path("kid", "books", Some("a")))
                    .with_body(json!({"title": "Dune Messiah"})),
            ))
            .await
            .unwrap();
        let updated = Entity::from_value(response.data).unwrap();
        assert!(updated.last_modified_at() > seeded.last_modified_at());
        assert_eq!(updated.created_at(), seeded.created_at());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_with_query_and_projection() {
        let gateway = MemoryGateway::new("kid");
        for (id, genre) in [("a", "sf"), ("b", "fantasy"), ("c", "sf")] {
            gateway.seed("books", Entity::new().with_id(id).with("genre", genre));
        }

        let request = authed(
            Request::get(appdata_path("kid", "books", None))
                .with_query_string(&Query::new().equal_to("genre", "sf"))
                .with_delta_projection(),
        );
        let response = gateway.execute(request).await.unwrap();
        let items = response.data.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.get("genre").is_none()));
        assert!(items.iter().all(|item| item["_kmd"]["lmt"].is_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_by_id_filter_and_count() {
        let gateway = MemoryGateway::new("kid");
        for id in ["a", "b", "c"] {
            gateway.seed("books", Entity::new().with_id(id));
        }

        let response = gateway
            .execute(authed(
                Request::delete(appdata_path("kid", "books", None)).with_id_filter(["a", "c"]),
            ))
            .await
            .unwrap();
        assert_eq!(response.data, json!({"count": 2}));

        let response = gateway
            .execute(authed(Request::get(appdata_path("kid", "books", Some("_count")))))
            .await
            .unwrap();
        assert_eq!(response.data, json!({"count": 1}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_injection() {
        let gateway = MemoryGateway::new("kid");
        gateway.seed("books", Entity::new().with_id("a"));
        gateway.fail_next(FailureKind::Timeout);

        let get = || authed(Request::get(appdata_path("kid", "books", Some("a"))));
        assert!(matches!(gateway.execute(get()).await, Err(Error::Timeout)));
        assert!(gateway.execute(get()).await.is_ok());

        gateway.fail_entity("books", "a", FailureKind::Network);
        assert!(matches!(gateway.execute(get()).await, Err(Error::Network(_))));
        gateway.clear_failures();
        assert!(gateway.execute(get()).await.is_ok());
        assert_eq!(gateway.request_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_missing_credentials_and_unknown_app() {
        let gateway = MemoryGateway::new("kid");
        let error = gateway
            .execute(Request::get(appdata_path("kid", "books", None)))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidCredentials(_)));

        let error = gateway
            .execute(authed(Request::get(appdata_path("other", "books", None))))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }
}
