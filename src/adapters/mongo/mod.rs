//! MongoDB adapter over the official driver.

mod convert;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, Credential, FindOptions};
use mongodb::{Client, Collection, Database};

use crate::config::redact_uri;
use crate::config::types::{AppUser, DatabaseConfig};
use crate::domain::filter::Filter;
use crate::domain::geo::GeoPoint;
use crate::domain::index::IndexSpec;
use crate::domain::listing::{ListingId, ensure_object_id};
use crate::domain::pipeline::Pipeline;
use crate::domain::query::FindQuery;
use crate::domain::value::compare;
use crate::error::{ListingsError, Result};
use crate::ports::listing_store::{
    CollectionStats, DocumentStream, IndexReport, ListingStore, UpdateOutcome,
};

use convert::{
    NAMESPACE_EXISTS, NAMESPACE_NOT_FOUND, command_code, index_model, is_optional_index,
    near_filter, pipeline_documents, sort_with_tiebreak, stats_from_reply,
};

const APP_NAME: &str = "airbnb-madrid";

pub struct MongoStore {
    client: Client,
    database: Database,
    collection: Collection<Document>,
    namespace: String,
    closed: AtomicBool,
}

impl MongoStore {
    /// Opens the connection pool and checks the server answers a ping.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let redacted = redact_uri(&config.uri);
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| match ListingsError::from(e) {
                err @ ListingsError::Connectivity { .. } => err,
                other => ListingsError::Config(format!("invalid MongoDB URI {redacted}: {other}")),
            })?;
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout =
            Some(Duration::from_secs(config.server_selection_timeout_secs));
        options.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
        if let Some(username) = &config.username {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(config.password.clone())
                    .source(config.auth_source.clone())
                    .build(),
            );
        }

        let client = Client::with_options(options)?;
        let database = client.database(&config.name);
        let collection = database.collection::<Document>(&config.collection);
        let store = Self {
            client,
            database,
            collection,
            namespace: format!("{}.{}", config.name, config.collection),
            closed: AtomicBool::new(false),
        };
        store.ping().await?;
        tracing::info!("Connected to MongoDB at {redacted} ({})", store.namespace);
        Ok(store)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ListingsError::Connectivity {
                reason: "connection has been closed".into(),
            });
        }
        Ok(())
    }

    fn collection_name(&self) -> &str {
        self.collection.name()
    }

    async fn update(&self, filter: &Filter, update: Document, many: bool) -> Result<UpdateOutcome> {
        self.ensure_open()?;
        let filter = filter.to_document();
        tracing::debug!("update on {}: {filter} -> {update}", self.namespace);
        let result = if many {
            self.collection.update_many(filter, update).await?
        } else {
            self.collection.update_one(filter, update).await?
        };
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }
}

fn into_stream(cursor: mongodb::Cursor<Document>) -> DocumentStream {
    cursor.map_err(ListingsError::from).boxed()
}

#[async_trait]
impl ListingStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.database.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn insert_one(&self, mut doc: Document) -> Result<ListingId> {
        self.ensure_open()?;
        let id = ensure_object_id(&mut doc)?;
        self.collection.insert_one(doc).await?;
        Ok(id)
    }

    async fn insert_many(&self, mut docs: Vec<Document>) -> Result<Vec<ListingId>> {
        self.ensure_open()?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let ids = docs
            .iter_mut()
            .map(ensure_object_id)
            .collect::<Result<Vec<_>>>()?;
        self.collection.insert_many(docs).ordered(true).await?;
        Ok(ids)
    }

    async fn find(&self, query: &FindQuery) -> Result<DocumentStream> {
        self.ensure_open()?;
        query.validate()?;
        let mut options = FindOptions::default();
        options.projection = query.projection.as_ref().map(|p| p.to_document());
        options.sort = sort_with_tiebreak(&query.sort);
        options.skip = (query.skip > 0).then_some(query.skip);
        options.limit = query
            .limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let filter = query.filter.to_document();
        tracing::debug!("find on {}: {filter}", self.namespace);
        let cursor = self.collection.find(filter).with_options(options).await?;
        Ok(into_stream(cursor))
    }

    async fn find_near(
        &self,
        point: GeoPoint,
        max_distance_m: Option<f64>,
        limit: Option<u64>,
    ) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let mut options = FindOptions::default();
        options.limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let cursor = self
            .collection
            .find(near_filter(point, max_distance_m))
            .with_options(options)
            .await?;
        into_stream(cursor).try_collect().await
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.collection.count_documents(filter.to_document()).await?)
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Bson>> {
        self.ensure_open()?;
        let mut values = self
            .collection
            .distinct(field, filter.to_document())
            .await?;
        values.sort_by(compare);
        Ok(values)
    }

    async fn update_one(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome> {
        self.update(filter, doc! { "$set": changes.clone() }, false).await
    }

    async fn update_many(&self, filter: &Filter, changes: &Document) -> Result<UpdateOutcome> {
        self.update(filter, doc! { "$set": changes.clone() }, true).await
    }

    async fn increment(&self, filter: &Filter, field: &str, by: Bson) -> Result<UpdateOutcome> {
        let mut inc = Document::new();
        inc.insert(field, by);
        self.update(filter, doc! { "$inc": inc }, false).await
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.ensure_open()?;
        let result = self.collection.delete_many(filter.to_document()).await?;
        Ok(result.deleted_count)
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<DocumentStream> {
        self.ensure_open()?;
        pipeline.validate()?;
        tracing::debug!("aggregate on {}: {pipeline}", self.namespace);
        let cursor = self.collection.aggregate(pipeline_documents(pipeline)).await?;
        Ok(into_stream(cursor))
    }

    async fn ensure_collection(&self, validator: Document) -> Result<bool> {
        self.ensure_open()?;
        let name = self.collection_name().to_string();
        let create = doc! {
            "create": name.as_str(),
            "validator": validator.clone(),
            "validationLevel": "strict",
            "validationAction": "error",
        };
        match self.database.run_command(create).await {
            Ok(_) => {
                tracing::info!("Created collection {} with validator", self.namespace);
                Ok(true)
            }
            Err(e) if command_code(&e) == Some(NAMESPACE_EXISTS) => {
                self.database
                    .run_command(doc! {
                        "collMod": name.as_str(),
                        "validator": validator,
                        "validationLevel": "strict",
                        "validationAction": "error",
                    })
                    .await?;
                tracing::info!("Updated validator on existing collection {}", self.namespace);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<IndexReport> {
        let present = self.index_names().await?;
        let mut report = IndexReport::default();
        for spec in indexes {
            if present.contains(&spec.name) {
                report.existing.push(spec.name.clone());
                continue;
            }
            match self.collection.create_index(index_model(spec)).await {
                Ok(_) => {
                    tracing::debug!("Created index {spec} on {}", self.namespace);
                    report.created.push(spec.name.clone());
                }
                Err(e) if is_optional_index(spec) => {
                    tracing::warn!("Could not create index {}: {e}", spec.name);
                    report.failed.push(spec.name.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    async fn index_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        match self.collection.list_index_names().await {
            Ok(names) => Ok(names),
            Err(e) if command_code(&e) == Some(NAMESPACE_NOT_FOUND) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_user(&self, user: &AppUser) -> Result<bool> {
        self.ensure_open()?;
        let reply = self
            .database
            .run_command(doc! { "usersInfo": user.username.as_str() })
            .await?;
        let exists = reply
            .get_array("users")
            .is_ok_and(|users| !users.is_empty());
        if exists {
            tracing::info!("User {} already exists", user.username);
            return Ok(false);
        }
        let db_name = self.database.name();
        let roles: Vec<Bson> = user
            .roles
            .iter()
            .map(|role| Bson::Document(doc! { "role": role.as_str(), "db": db_name }))
            .collect();
        self.database
            .run_command(doc! {
                "createUser": user.username.as_str(),
                "pwd": user.password.as_str(),
                "roles": roles,
            })
            .await?;
        tracing::info!("Created user {} on {db_name}", user.username);
        Ok(true)
    }

    async fn stats(&self) -> Result<CollectionStats> {
        self.ensure_open()?;
        match self
            .database
            .run_command(doc! { "collStats": self.collection_name() })
            .await
        {
            Ok(reply) => Ok(stats_from_reply(&self.namespace, &reply)),
            Err(e) if command_code(&e) == Some(NAMESPACE_NOT_FOUND) => Ok(CollectionStats {
                namespace: self.namespace.clone(),
                ..CollectionStats::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.client.clone().shutdown().await;
        tracing::info!("Closed MongoDB connection ({})", self.namespace);
    }
}
