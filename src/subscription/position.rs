//! Durable subscription positions
//!
//! A position store maps a subscription id to the opaque resume token of the
//! last successfully handled event. Saving is an atomic overwrite; each
//! subscription only ever writes its own key.

use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{Collection, Database};
use tokio::sync::Mutex;

use crate::errors::{EventStoreError, EventStoreResult};
use crate::feed::SubscriptionPosition;

/// Durable mapping of subscription id to feed position
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The stored position for a subscription, if any
    async fn read(&self, subscription_id: &str) -> EventStoreResult<Option<SubscriptionPosition>>;

    /// Store the position, overwriting any previous value atomically
    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
    ) -> EventStoreResult<()>;

    /// Forget the stored position
    async fn delete(&self, subscription_id: &str) -> EventStoreResult<()>;
}

/// Position store backed by a MongoDB collection
///
/// One document per subscription: `{ _id: subscription_id, position: … }`.
pub struct MongoPositionStore {
    collection: Collection<Document>,
}

impl MongoPositionStore {
    /// Create a store over the given collection
    pub fn new(database: &Database, collection: impl AsRef<str>) -> Self {
        Self {
            collection: database.collection(collection.as_ref()),
        }
    }
}

#[async_trait]
impl PositionStore for MongoPositionStore {
    async fn read(&self, subscription_id: &str) -> EventStoreResult<Option<SubscriptionPosition>> {
        let Some(document) = self
            .collection
            .find_one(doc! { "_id": subscription_id })
            .await?
        else {
            return Ok(None);
        };

        let position = document
            .get_document("position")
            .map_err(|e| EventStoreError::MalformedDocument(e.to_string()))?
            .clone();

        Ok(Some(SubscriptionPosition::from_document(position)))
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
    ) -> EventStoreResult<()> {
        self.collection
            .replace_one(
                doc! { "_id": subscription_id },
                doc! { "_id": subscription_id, "position": position.as_document().clone() },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> EventStoreResult<()> {
        self.collection
            .delete_one(doc! { "_id": subscription_id })
            .await?;
        Ok(())
    }
}

/// In-memory position store, for tests and embedded use
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    positions: Mutex<HashMap<String, SubscriptionPosition>>,
}

impl InMemoryPositionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn read(&self, subscription_id: &str) -> EventStoreResult<Option<SubscriptionPosition>> {
        Ok(self.positions.lock().await.get(subscription_id).cloned())
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
    ) -> EventStoreResult<()> {
        self.positions
            .lock()
            .await
            .insert(subscription_id.to_string(), position.clone());
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> EventStoreResult<()> {
        self.positions.lock().await.remove(subscription_id);
        Ok(())
    }
}
