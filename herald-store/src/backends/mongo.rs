//! MongoDB-backed job store.
//!
//! Each job is one document in the `emails_queue` collection. The claim is a
//! single `findOneAndUpdate`, so exclusivity comes from the server's
//! document-level atomicity rather than from anything held in-process.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    Collection, Database, IndexModel,
    bson::{self, Bson, Document, doc},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
};
use herald_common::internal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Job, JobId, JobStatus, NewJob, Priority, QueueStats, Result, StoreError, job::cutoff,
    r#trait::JobStore,
};

/// Collection holding one document per job.
pub const COLLECTION: &str = "emails_queue";

/// On-disk shape of a job.
///
/// Timestamps are stored as BSON dates so the claim and retention filters
/// can compare them server-side; the priority is stored as its rank so the
/// claim can sort on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    #[serde(rename = "_id")]
    id: String,
    to: String,
    from: String,
    subject: String,
    html: String,
    status: JobStatus,
    priority: i32,
    attempts: i64,
    failures: i64,
    max_attempts: i64,
    created_at: bson::DateTime,
    scheduled_at: bson::DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processed_at: Option<bson::DateTime>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    provider_message_id: Option<String>,
}

impl From<&Job> for JobDocument {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            to: job.to.clone(),
            from: job.from.clone(),
            subject: job.subject.clone(),
            html: job.html.clone(),
            status: job.status,
            priority: i32::from(job.priority.rank()),
            attempts: i64::from(job.attempts),
            failures: i64::from(job.failures),
            max_attempts: i64::from(job.max_attempts),
            created_at: bson::DateTime::from_chrono(job.created_at),
            scheduled_at: bson::DateTime::from_chrono(job.scheduled_at),
            processed_at: job.processed_at.map(bson::DateTime::from_chrono),
            error_message: job.error_message.clone(),
            provider: job.provider.clone(),
            provider_message_id: job.provider_message_id.clone(),
        }
    }
}

fn counter(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{field} out of range: {value}")))
}

impl TryFrom<JobDocument> for Job {
    type Error = StoreError;

    fn try_from(doc: JobDocument) -> Result<Self> {
        Ok(Self {
            id: doc
                .id
                .parse()
                .map_err(|e| StoreError::Serialization(format!("invalid job id {}: {e}", doc.id)))?,
            priority: Priority::from_rank(i64::from(doc.priority)).ok_or_else(|| {
                StoreError::Serialization(format!("invalid priority {}", doc.priority))
            })?,
            attempts: counter(doc.attempts, "attempts")?,
            failures: counter(doc.failures, "failures")?,
            max_attempts: counter(doc.max_attempts, "max_attempts")?,
            to: doc.to,
            from: doc.from,
            subject: doc.subject,
            html: doc.html,
            status: doc.status,
            created_at: doc.created_at.to_chrono(),
            scheduled_at: doc.scheduled_at.to_chrono(),
            processed_at: doc.processed_at.map(bson::DateTime::to_chrono),
            error_message: doc.error_message,
            provider: doc.provider,
            provider_message_id: doc.provider_message_id,
        })
    }
}

/// MongoDB job store
///
/// Takes an already-connected [`Database`] handle; establishing the
/// connection is the caller's concern and a failure there is a startup
/// error, not something this store recovers from.
#[derive(Debug, Clone)]
pub struct MongoJobStore {
    collection: Collection<JobDocument>,
}

impl MongoJobStore {
    #[must_use]
    pub fn new(database: &Database) -> Self {
        Self {
            collection: database.collection(COLLECTION),
        }
    }

    fn index(keys: Document, name: &str) -> IndexModel {
        IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().name(name.to_string()).build())
            .build()
    }

    /// Classify a transition whose filter matched nothing.
    async fn transition_error(&self, id: &JobId, to: JobStatus) -> StoreError {
        match self.collection.find_one(doc! { "_id": id.to_string() }, None).await {
            Ok(Some(doc)) => StoreError::InvalidTransition {
                id: *id,
                from: doc.status,
                to,
            },
            Ok(None) => StoreError::NotFound(*id),
            Err(err) => err.into(),
        }
    }

    /// Apply `update` to the job if it is still Processing.
    async fn transition(&self, id: &JobId, to: JobStatus, update: Document) -> Result<()> {
        let filter = doc! {
            "_id": id.to_string(),
            "status": JobStatus::Processing.as_str(),
        };

        let result = self.collection.update_one(filter, update, None).await?;
        if result.matched_count == 0 {
            return Err(self.transition_error(id, to).await);
        }

        debug!(job_id = %id, status = %to, "Job transitioned");
        Ok(())
    }
}

fn count(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
        _ => 0,
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn init(&self) -> Result<()> {
        let indexes = vec![
            Self::index(
                doc! { "status": 1, "priority": 1, "scheduled_at": 1 },
                "status_priority_scheduled",
            ),
            Self::index(doc! { "status": 1 }, "status_index"),
            Self::index(doc! { "processed_at": 1 }, "processed_at_index"),
        ];

        self.collection.create_indexes(indexes, None).await?;
        internal!(level = DEBUG, collection = COLLECTION, "Job store indexes ensured");
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let job = Job::from_new(job, Utc::now());
        self.collection
            .insert_one(JobDocument::from(&job), None)
            .await?;
        Ok(job.id)
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        let filter = doc! {
            "status": { "$in": [JobStatus::Pending.as_str(), JobStatus::Failed.as_str()] },
            "scheduled_at": { "$lte": bson::DateTime::now() },
            "$expr": { "$lt": ["$failures", "$max_attempts"] },
        };
        let update = doc! {
            "$set": { "status": JobStatus::Processing.as_str() },
            "$inc": { "attempts": 1 },
        };
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "priority": 1, "created_at": 1, "_id": 1 })
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .collection
            .find_one_and_update(filter, update, options)
            .await?;

        claimed.map(Job::try_from).transpose()
    }

    async fn mark_complete(
        &self,
        id: &JobId,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<()> {
        let update = doc! {
            "$set": {
                "status": JobStatus::Sent.as_str(),
                "processed_at": bson::DateTime::now(),
                "provider": provider,
                "provider_message_id": provider_message_id,
                "error_message": Bson::Null,
            },
        };
        self.transition(id, JobStatus::Sent, update).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut set = doc! {
            "status": JobStatus::Failed.as_str(),
            "processed_at": bson::DateTime::now(),
            "error_message": message,
        };
        if let Some(at) = retry_at {
            set.insert("scheduled_at", bson::DateTime::from_chrono(at));
        }

        let update = doc! { "$set": set, "$inc": { "failures": 1 } };
        self.transition(id, JobStatus::Failed, update).await
    }

    async fn retry_later(&self, id: &JobId, message: &str, at: DateTime<Utc>) -> Result<()> {
        let update = doc! {
            "$set": {
                "status": JobStatus::Pending.as_str(),
                "scheduled_at": bson::DateTime::from_chrono(at),
                "error_message": message,
            },
            "$inc": { "failures": 1 },
        };
        self.transition(id, JobStatus::Pending, update).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.collection
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let pipeline = vec![doc! {
            "$group": { "_id": "$status", "count": { "$sum": 1 } },
        }];

        let mut cursor = self.collection.aggregate(pipeline, None).await?;
        let mut stats = QueueStats::default();

        while let Some(group) = cursor.try_next().await? {
            let status: JobStatus = match group.get("_id") {
                Some(value) => bson::from_bson(value.clone())?,
                None => continue,
            };
            stats.record(status, count(group.get("count")));
        }

        Ok(stats)
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self
            .collection
            .count_documents(doc! { "status": JobStatus::Pending.as_str() }, None)
            .await?)
    }

    async fn cleanup_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = cutoff(Utc::now(), age);
        let filter = doc! {
            "status": { "$in": [JobStatus::Sent.as_str(), JobStatus::Failed.as_str()] },
            "processed_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
        };

        let result = self.collection.delete_many(filter, None).await?;
        Ok(result.deleted_count)
    }
}
