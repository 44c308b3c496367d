//! End-to-end pipeline tests: ingress producer, in-memory broker, storage
//! worker on an in-memory SQLite store, reader and notifier.

use async_trait::async_trait;
use photo_ingest::config::PublishConfig;
use photo_ingest::IngressProducer;
use photo_pipeline::{
    DeadLetter, InMemoryBroker, InMemorySubscriber, IngestCompleted, MessageHandler,
    NotificationHandler, OutgoingMessage, Publisher, Subscriber, TopicConfig,
};
use photo_storage::{
    ImageCache, ImageReader, ImageRecord, ImageStore, InsertOutcome, MemoryImageCache, NewImage,
    NoopImageCache, ReadError, SqliteImageStore, StorageWorker, StoreBackend, StoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WORKER_GROUP: &str = "storage-workers";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\x00\x10JFIF\x00";

struct Pipeline {
    broker: InMemoryBroker,
    topics: TopicConfig,
    store: Arc<SqliteImageStore>,
    cache: Arc<dyn ImageCache>,
    producer: IngressProducer,
    requests: InMemorySubscriber,
    worker: StorageWorker,
}

impl Pipeline {
    async fn new(cache: Arc<dyn ImageCache>) -> Self {
        let broker = InMemoryBroker::new();
        let topics = TopicConfig::default();
        let store = Arc::new(SqliteImageStore::in_memory().await.unwrap());

        // Groups only see messages published after they are bound
        let requests = broker.subscriber(&topics.ingest_requests, WORKER_GROUP);

        let producer = IngressProducer::new(Arc::new(broker.clone()), &topics.ingest_requests)
            .with_publish_policy(PublishConfig::with_budget(Duration::from_millis(200)));
        let worker = StorageWorker::new(
            store.clone(),
            cache.clone(),
            Arc::new(broker.clone()),
            &topics,
        );

        Self {
            broker,
            topics,
            store,
            cache,
            producer,
            requests,
            worker,
        }
    }

    fn reader(&self) -> ImageReader {
        ImageReader::new(self.store.clone(), self.cache.clone())
    }

    async fn process(&self) -> usize {
        self.requests.drain(&self.worker).await
    }

    fn completed(&self) -> Vec<IngestCompleted> {
        self.broker
            .published(&self.topics.ingest_completed)
            .iter()
            .map(|m| IngestCompleted::decode(&m.payload).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn test_upload_is_stored_announced_and_readable() {
    let pipeline = Pipeline::new(Arc::new(MemoryImageCache::new())).await;

    let request_id = pipeline
        .producer
        .submit("  alice ", None, PNG.to_vec())
        .await
        .unwrap();
    assert_eq!(pipeline.process().await, 1);

    assert_eq!(pipeline.store.count_by_request(request_id).await.unwrap(), 1);

    let completed = pipeline.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request_id, Some(request_id));
    assert_eq!(completed[0].nickname.as_deref(), Some("alice"));

    let images = pipeline.reader().fetch_by_nickname("alice").await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].payload, PNG);
    assert_eq!(images[0].mime_type, "image/png");
}

#[tokio::test]
async fn test_redelivered_request_is_stored_once() {
    let pipeline = Pipeline::new(Arc::new(NoopImageCache)).await;

    let request_id = pipeline
        .producer
        .submit("bob", Some("image/jpeg"), JPEG.to_vec())
        .await
        .unwrap();
    pipeline.process().await;

    // Same message again, as after a crash between commit and ack
    let original = pipeline.broker.published(&pipeline.topics.ingest_requests)[0].clone();
    pipeline.broker.publish(original).await.unwrap();
    assert_eq!(pipeline.process().await, 1);

    assert_eq!(pipeline.store.count_by_request(request_id).await.unwrap(), 1);
    assert_eq!(pipeline.store.find_by_nickname("bob").await.unwrap().len(), 1);

    let completed = pipeline.completed();
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].image_id, completed[1].image_id);
}

#[tokio::test]
async fn test_poison_message_does_not_block_valid_requests() {
    let pipeline = Pipeline::new(Arc::new(NoopImageCache)).await;

    pipeline
        .broker
        .publish(OutgoingMessage::new(
            &pipeline.topics.ingest_requests,
            b"{not an ingest request".to_vec(),
        ))
        .await
        .unwrap();
    let request_id = pipeline
        .producer
        .submit("carol", None, PNG.to_vec())
        .await
        .unwrap();

    assert_eq!(pipeline.process().await, 2);

    let dead_letters = pipeline.broker.published(&pipeline.topics.dead_letter_queue);
    assert_eq!(dead_letters.len(), 1);
    let dead_letter: DeadLetter = serde_json::from_slice(&dead_letters[0].payload).unwrap();
    assert_eq!(dead_letter.original_topic, pipeline.topics.ingest_requests);
    assert_eq!(dead_letter.original_message, b"{not an ingest request");

    assert_eq!(pipeline.store.count_by_request(request_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_competing_workers_store_each_request_once() {
    let pipeline = Pipeline::new(Arc::new(NoopImageCache)).await;

    let mut request_ids = Vec::new();
    for i in 0..10u8 {
        let id = pipeline
            .producer
            .submit("dave", None, vec![i + 1; 32])
            .await
            .unwrap();
        request_ids.push(id);
    }
    // Every request delivered twice
    for message in pipeline.broker.published(&pipeline.topics.ingest_requests) {
        pipeline.broker.publish(message).await.unwrap();
    }

    let mut running = Vec::new();
    for _ in 0..2 {
        let subscriber = Arc::new(
            pipeline
                .broker
                .subscriber(&pipeline.topics.ingest_requests, WORKER_GROUP),
        );
        let worker: Arc<dyn MessageHandler> = Arc::new(StorageWorker::new(
            pipeline.store.clone(),
            pipeline.cache.clone(),
            Arc::new(pipeline.broker.clone()),
            &pipeline.topics,
        ));
        let runner = subscriber.clone();
        running.push((subscriber, tokio::spawn(async move { runner.run(worker).await })));
    }

    let broker = pipeline.broker.clone();
    let topic = pipeline.topics.ingest_completed.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while broker.published(&topic).len() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    for (subscriber, handle) in running {
        subscriber.shutdown();
        handle.await.unwrap().unwrap();
    }

    for request_id in &request_ids {
        assert_eq!(pipeline.store.count_by_request(*request_id).await.unwrap(), 1);
    }
    assert_eq!(pipeline.store.find_by_nickname("dave").await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_unknown_nickname_is_not_found() {
    let pipeline = Pipeline::new(Arc::new(MemoryImageCache::new())).await;

    let err = pipeline.reader().fetch_by_nickname("nobody").await.unwrap_err();
    assert!(matches!(err, ReadError::NotFound(_)));
}

#[tokio::test]
async fn test_reads_match_with_and_without_cache() {
    let mut results = Vec::new();

    let caches: [Arc<dyn ImageCache>; 2] =
        [Arc::new(MemoryImageCache::new()), Arc::new(NoopImageCache)];
    for cache in caches {
        let pipeline = Pipeline::new(cache).await;
        pipeline
            .producer
            .submit("erin", Some("image/png"), PNG.to_vec())
            .await
            .unwrap();
        pipeline.process().await;

        let reader = pipeline.reader();
        let first = reader.fetch_by_nickname("erin").await.unwrap();
        let second = reader.fetch_by_nickname("erin").await.unwrap();
        assert_eq!(first, second);
        results.push(second);
    }

    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_new_upload_invalidates_cached_entry() {
    let cache = Arc::new(MemoryImageCache::new());
    let pipeline = Pipeline::new(cache.clone()).await;

    pipeline.producer.submit("frank", None, PNG.to_vec()).await.unwrap();
    pipeline.process().await;
    pipeline.reader().fetch_by_nickname("frank").await.unwrap();
    assert_eq!(cache.len().await, 1);

    pipeline.producer.submit("frank", None, JPEG.to_vec()).await.unwrap();
    pipeline.process().await;
    assert!(cache.is_empty().await);

    let all = pipeline.reader().fetch_all_by_nickname("frank").await.unwrap();
    assert_eq!(all.len(), 2);
}

/// Store whose inserts always fail
#[derive(Default)]
struct UnavailableStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl ImageStore for UnavailableStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }

    async fn insert(&self, _image: NewImage) -> Result<InsertOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Corrupt("connection reset".to_string()))
    }

    async fn find_by_nickname(&self, _nickname: &str) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        Ok(None)
    }

    async fn count_by_request(&self, _request_id: Uuid) -> Result<i64, StoreError> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_store_is_retried_then_dead_lettered() {
    let broker = InMemoryBroker::new();
    let topics = TopicConfig::default();
    let requests = broker
        .subscriber(&topics.ingest_requests, WORKER_GROUP)
        .with_max_delivery_attempts(3);

    let store = Arc::new(UnavailableStore::default());
    let worker = StorageWorker::new(
        store.clone(),
        Arc::new(NoopImageCache),
        Arc::new(broker.clone()),
        &topics,
    );
    let producer = IngressProducer::new(Arc::new(broker.clone()), &topics.ingest_requests);

    producer.submit("grace", None, PNG.to_vec()).await.unwrap();

    assert_eq!(requests.drain(&worker).await, 3);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.published(&topics.dead_letter_queue).len(), 1);
    assert!(broker.published(&topics.ingest_completed).is_empty());
}

#[tokio::test]
async fn test_notifier_receives_upload_event() {
    let pipeline = Pipeline::new(Arc::new(NoopImageCache)).await;
    let notifications = pipeline.broker.subscriber(
        &pipeline.topics.ingest_completed,
        &format!("photo-notifier-{}", Uuid::new_v4()),
    );
    let notifier = NotificationHandler::new(&pipeline.topics.uploaded_routing_key);

    pipeline.producer.submit("heidi", None, PNG.to_vec()).await.unwrap();
    pipeline.process().await;

    assert_eq!(notifications.drain(&notifier).await, 1);
    assert_eq!(notifier.received(), 1);
}
