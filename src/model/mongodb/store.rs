use std::sync::{Arc, Mutex};

use log::{debug, warn};
use mongodb::{
    bson::{doc, to_bson, Document},
    options::{
        FindOneAndUpdateOptions, FindOptions, ReplaceOptions, ReturnDocument, UpdateOptions,
    },
    Database,
};
use rocket::{futures::TryStreamExt, tokio::sync::watch};
use serde::{Deserialize, Serialize};

use super::Coll;
use crate::error::{Result, StoreError};
use crate::model::store::{
    Adjustment, CounterStore, Snapshot, StorePath, StoreValue, Subscriber, Subscription,
};

/// One store path and its value, as a database document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "_id")]
    pub path: StorePath,
    pub value: StoreValue,
}

/// A [`CounterStore`] backed by a MongoDB collection.
///
/// Counter adjustments are single `findOneAndUpdate` pipelines, so each is
/// atomic on the server. Subscribers are notified after every write made
/// through this handle; writes by other processes are only seen on the
/// next local write.
pub struct MongoStore {
    entries: Coll<Entry>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            entries: Coll::from_db(db),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current contents of the subtree at `prefix`, ordered by path.
    async fn snapshot(&self, prefix: &StorePath) -> Result<Snapshot> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let entries = self
            .entries
            .find(subtree_filter(prefix), options)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.path, entry.value))
            .collect())
    }

    /// Refresh every subscriber whose subtree overlaps `changed`.
    async fn publish(&self, changed: &StorePath) -> Result<()> {
        let targets = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| !s.sender.is_closed());
            subscribers
                .iter()
                .filter(|s| s.prefix.overlaps(changed))
                .map(|s| (s.prefix.clone(), Arc::clone(&s.sender)))
                .collect::<Vec<(StorePath, Arc<watch::Sender<Snapshot>>)>>()
        };
        for (prefix, sender) in targets {
            let snapshot = self.snapshot(&prefix).await?;
            sender.send_replace(snapshot);
        }
        Ok(())
    }

    /// Publish, logging instead of failing: the write itself already succeeded.
    async fn publish_after_write(&self, changed: &StorePath) {
        if let Err(e) = self.publish(changed).await {
            warn!("Failed to refresh subscribers after writing {changed}: {e}");
        }
    }
}

/// Match `prefix` itself and every path underneath it.
///
/// Path segments never contain regex metacharacters, so no escaping is needed.
fn subtree_filter(prefix: &StorePath) -> Document {
    doc! {
        "_id": { "$regex": format!("^{}(/|$)", prefix.as_str()) }
    }
}

/// Aggregation pipeline performing `adjustment` on the `value` field.
fn adjustment_pipeline(adjustment: Adjustment) -> Vec<Document> {
    // Counts are whole and non-negative before adjusting.
    let current = doc! { "$toLong": { "$max": ["$value", 0] } };
    let adjusted = match adjustment {
        Adjustment::Increment => doc! {
            "$cond": [{ "$isNumber": "$value" }, { "$add": [current, 1] }, 1]
        },
        Adjustment::Decrement => doc! {
            "$cond": [
                { "$isNumber": "$value" },
                { "$max": [{ "$subtract": [current, 1] }, 0] },
                0
            ]
        },
    };
    vec![doc! { "$set": { "value": adjusted } }]
}

#[rocket::async_trait]
impl CounterStore for MongoStore {
    async fn adjust(&self, path: &StorePath, adjustment: Adjustment) -> Result<u64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let entry = self
            .entries
            .find_one_and_update(
                doc! { "_id": path.as_str() },
                adjustment_pipeline(adjustment),
                options,
            )
            .await?;
        let count = entry
            .and_then(|entry| entry.value.as_count())
            .ok_or_else(|| StoreError::Other(format!("counter at {path} is not numeric")))?;
        debug!("{adjustment:?} {path} -> {count}");
        self.publish_after_write(path).await;
        Ok(count)
    }

    async fn write(&self, path: &StorePath, value: StoreValue) -> Result<()> {
        let entry = Entry {
            path: path.clone(),
            value,
        };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.entries
            .replace_one(doc! { "_id": path.as_str() }, &entry, options)
            .await?;
        self.publish_after_write(path).await;
        Ok(())
    }

    async fn create(&self, path: &StorePath, value: StoreValue) -> Result<bool> {
        let value = to_bson(&value).map_err(|e| StoreError::Other(e.to_string()))?;
        let options = UpdateOptions::builder().upsert(true).build();
        let created = self
            .entries
            .update_one(
                doc! { "_id": path.as_str() },
                doc! { "$setOnInsert": { "value": value } },
                options,
            )
            .await?
            .upserted_id
            .is_some();
        if created {
            self.publish_after_write(path).await;
        }
        Ok(created)
    }

    async fn read(&self, path: &StorePath) -> Result<Option<StoreValue>> {
        let entry = self
            .entries
            .find_one(doc! { "_id": path.as_str() }, None)
            .await?;
        Ok(entry.map(|entry| entry.value))
    }

    async fn subscribe(&self, prefix: &StorePath) -> Result<Subscription> {
        let initial = self.snapshot(prefix).await?;
        let (subscriber, receiver) = Subscriber::new(prefix.clone(), initial);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
        Ok(receiver)
    }

    async fn remove_tree(&self, prefix: &StorePath) -> Result<()> {
        let deleted = self
            .entries
            .delete_many(subtree_filter(prefix), None)
            .await?
            .deleted_count;
        debug!("Removed {deleted} entries under {prefix}");
        self.publish_after_write(prefix).await;
        Ok(())
    }
}
