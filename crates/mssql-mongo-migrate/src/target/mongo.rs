//! MongoDB target: migrated collections, remap collections and the audit collection.

use crate::config::TargetConfig;
use crate::core::{
    Identifier, KeyRemapEntry, MigratedRecord, OldKey, RemapIndex, RemapStore, StoredRecord,
    TargetStore, ID_FIELD,
};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection, Database};
use tracing::{debug, info, warn};

/// MongoDB database holding the migrated data.
///
/// Implements [`TargetStore`] for the migrated collections and [`RemapStore`]
/// for the `<table><suffix>` remap collections of the same database.
#[derive(Clone)]
pub struct MongoTarget {
    db: Database,
    remap_suffix: String,
}

impl MongoTarget {
    /// Connect to MongoDB and verify connectivity.
    pub async fn connect(config: &TargetConfig, remap_suffix: &str) -> Result<Self> {
        let client = Client::with_uri_str(&config.uri).await?;
        let target = Self::from_client(&client, &config.database, remap_suffix);
        TargetStore::ping(&target).await?;

        info!(
            "Connected to MongoDB: {} (database={})",
            config.redacted_uri(),
            config.database
        );
        Ok(target)
    }

    /// Wrap an existing client.
    pub fn from_client(client: &Client, database: &str, remap_suffix: &str) -> Self {
        Self {
            db: client.database(database),
            remap_suffix: remap_suffix.to_string(),
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    fn remap_collection(&self, table: &str) -> Collection<Document> {
        self.db.collection(&format!("{}{}", table, self.remap_suffix))
    }
}

#[async_trait]
impl TargetStore for MongoTarget {
    async fn bulk_insert(&self, collection: &str, records: &[MigratedRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let documents: Vec<Document> = records.iter().map(MigratedRecord::to_document).collect();
        let result = self.collection(collection).insert_many(documents).await?;

        let inserted = result.inserted_ids.len() as u64;
        debug!("{}: inserted {} documents", collection, inserted);
        Ok(inserted)
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let cursor = self.collection(collection).find(doc! {}).await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            match StoredRecord::from_document(document) {
                Some(record) => records.push(record),
                None => warn!("{}: skipping document without an identifier _id", collection),
            }
        }
        Ok(records)
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &Identifier,
        fields: Document,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut filter = Document::new();
        filter.insert(ID_FIELD, id.to_bson());

        let result = self
            .collection(collection)
            .update_one(filter, doc! { "$set": fields })
            .await?;

        if result.matched_count == 0 {
            return Err(MigrateError::replication(
                collection,
                format!("record {} disappeared during remap", id),
            ));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collection(collection).drop().await?;
        debug!("Dropped collection {}", collection);
        Ok(())
    }

    async fn replace_audit(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        let coll = self.collection(collection);
        coll.drop().await?;
        if !documents.is_empty() {
            coll.insert_many(documents).await?;
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        Ok(self.collection(collection).count_documents(doc! {}).await?)
    }

    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mongodb"
    }
}

#[async_trait]
impl RemapStore for MongoTarget {
    async fn append(&self, table: &str, entries: &[KeyRemapEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let documents: Vec<Document> = entries.iter().map(KeyRemapEntry::to_document).collect();
        // Old keys are the remap collection's _id, so a repeated key is rejected here.
        self.remap_collection(table).insert_many(documents).await?;
        Ok(())
    }

    async fn find_by_old_key(&self, table: &str, key: &OldKey) -> Result<Option<Identifier>> {
        let mut filter = Document::new();
        filter.insert(ID_FIELD, key.to_bson());

        let found = self.remap_collection(table).find_one(filter).await?;
        Ok(found
            .as_ref()
            .and_then(KeyRemapEntry::from_document)
            .map(|entry| entry.new_id))
    }

    async fn load(&self, table: &str) -> Result<RemapIndex> {
        let cursor = self.remap_collection(table).find(doc! {}).await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        let mut index = RemapIndex::with_capacity(documents.len());
        for document in &documents {
            match KeyRemapEntry::from_document(document) {
                Some(entry) => {
                    index.insert(entry.old_key, entry.new_id);
                }
                None => warn!("{}: ignoring malformed remap entry {:?}", table, document.get(ID_FIELD)),
            }
        }

        debug!("Loaded {} remap entries for {}", index.len(), table);
        Ok(index)
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.remap_collection(table).drop().await?;
        Ok(())
    }

    async fn entry_count(&self, table: &str) -> Result<u64> {
        Ok(self.remap_collection(table).count_documents(doc! {}).await?)
    }
}
