use std::io;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tempfile::TempDir;

use super::controller::{CacheController, FileStatus, WaitOutcome, DATA_FILE, INFO_FILE, METADATA_FILE};
use super::error::CacheError;
use super::registry::RemoteFileCache;
use crate::config::CacheConfig;
use crate::metadata::{MetadataFactory, ObjectMetadata, RemoteFileMetadata};

type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const MIB: usize = 1024 * 1024;

fn object(remote_path: &str, version: &str, size: u64) -> Arc<dyn RemoteFileMetadata> {
    Arc::new(ObjectMetadata::new(remote_path, version, size))
}

/// A source producing `total` bytes of `byte` in `chunk`-sized pieces.
fn constant_source(byte: u8, total: usize, chunk: usize) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = (0..total)
        .step_by(chunk)
        .map(|offset| Ok(Bytes::from(vec![byte; chunk.min(total - offset)])))
        .collect();
    stream::iter(chunks).boxed()
}

/// A source whose byte at offset `o` is `o % 251`.
fn patterned_source(total: usize, chunk: usize) -> ByteStream {
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

/// A source sleeping `delay` before every chunk after the first.
fn delayed_source(chunks: Vec<Bytes>, delay: Duration) -> ByteStream {
    stream::iter(chunks.into_iter().enumerate())
        .then(move |(index, chunk)| async move {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }
            Ok::<Bytes, io::Error>(chunk)
        })
        .boxed()
}

/// A source yielding one good chunk, then failing after `delay`.
fn failing_source(good: Bytes, delay: Duration) -> ByteStream {
    let items: Vec<io::Result<Bytes>> = vec![
        Ok(good),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
    ];
    stream::iter(items)
        .then(move |item| async move {
            if item.is_err() {
                tokio::time::sleep(delay).await;
            }
            item
        })
        .boxed()
}

/// Creates an entry under `root` and downloads it to completion.
async fn downloaded_entry(
    root: &Path,
    remote_path: &str,
    size: usize,
    byte: u8,
) -> Arc<CacheController> {
    let controller = CacheController::create(
        object(remote_path, "v1", size as u64),
        root.join("entry"),
        4096,
    )
    .await
    .unwrap();
    controller
        .start_background_download(constant_source(byte, size, 1024))
        .await
        .unwrap();
    controller.wait_more_data(0, u64::MAX).await;
    controller.deactivate().await;
    controller
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_download_end_to_end() {
    let temp = TempDir::new().unwrap();
    let controller = CacheController::create(
        object("s3://bucket/a", "v1", 10240),
        temp.path().join("entry"),
        4096,
    )
    .await
    .unwrap();
    controller
        .start_background_download(constant_source(0xAA, 10240, 1024))
        .await
        .unwrap();

    let mut reader = controller.open_reader().await.unwrap();
    let data = reader.read_to_end().await.unwrap();
    assert_eq!(data.len(), 10240);
    assert!(data.iter().all(|&b| b == 0xAA));

    controller.deactivate().await;
    assert_eq!(controller.status(), FileStatus::Downloaded);
    assert_eq!(controller.frontier(), 10240);

    let on_disk = std::fs::metadata(controller.local_path().join(DATA_FILE)).unwrap();
    assert_eq!(on_disk.len(), 10240);
    let info = std::fs::read_to_string(controller.local_path().join(INFO_FILE)).unwrap();
    assert!(info.contains("\"file_status\":2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_identical_content() {
    let temp = TempDir::new().unwrap();
    let controller = CacheController::create(
        object("s3://bucket/b", "v1", 10240),
        temp.path().join("entry"),
        4096,
    )
    .await
    .unwrap();
    controller
        .start_background_download(constant_source(0x5C, 10240, 1024))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let controller = Arc::clone(&controller);
        tasks.push(tokio::spawn(async move {
            // Small reads interleave with frontier publications.
            let mut reader = controller.open_reader().await.unwrap();
            let mut data = Vec::new();
            loop {
                let chunk = reader.read(1024).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                data.extend_from_slice(&chunk);
            }
            data
        }));
    }
    for task in tasks {
        let data = task.await.unwrap();
        assert_eq!(data.len(), 10240);
        assert!(data.iter().all(|&b| b == 0x5C));
    }
    controller.deactivate().await;
    assert_eq!(controller.reader_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_past_frontier_blocks_until_publication() {
    let temp = TempDir::new().unwrap();
    let controller = CacheController::create(
        object("s3://bucket/c", "v1", 2 * MIB as u64),
        temp.path().join("entry"),
        MIB as u64,
    )
    .await
    .unwrap();
    let chunks = vec![
        Bytes::from(vec![1u8; MIB]),
        Bytes::from(vec![2u8; MIB]),
    ];
    let started = Instant::now();
    controller
        .start_background_download(delayed_source(chunks, Duration::from_millis(100)))
        .await
        .unwrap();

    let mut reader = controller.open_reader().await.unwrap();
    let data = reader.read(MIB + MIB / 2).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(data.len(), MIB + MIB / 2);
    assert!(data[..MIB].iter().all(|&b| b == 1));
    assert!(data[MIB..].iter().all(|&b| b == 2));

    controller.deactivate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_boundaries_on_downloaded_entry() {
    let temp = TempDir::new().unwrap();
    let controller = downloaded_entry(temp.path(), "s3://bucket/d", 10240, 0x11).await;

    assert_eq!(
        controller.wait_more_data(10240, 10241).await,
        WaitOutcome::EndOfFile
    );
    assert_eq!(
        controller.wait_more_data(20000, 20001).await,
        WaitOutcome::EndOfFile
    );
    assert_eq!(controller.wait_more_data(0, 1).await, WaitOutcome::Ready);
    assert_eq!(controller.wait_more_data(0, 10240).await, WaitOutcome::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_seeks_within_entry() {
    let temp = TempDir::new().unwrap();
    let controller = CacheController::create(
        object("s3://bucket/e", "v1", 10240),
        temp.path().join("entry"),
        4096,
    )
    .await
    .unwrap();
    controller
        .start_background_download(patterned_source(10240, 1024))
        .await
        .unwrap();

    let mut reader = controller.open_reader().await.unwrap();
    reader.seek(SeekFrom::Start(5000));
    let data = reader.read(100).await.unwrap();
    assert_eq!(data.len(), 100);
    for (i, &b) in data.iter().enumerate() {
        assert_eq!(b, ((5000 + i) % 251) as u8);
    }

    reader.seek(SeekFrom::End(-100));
    assert_eq!(reader.position(), 10140);
    let tail = reader.read(200).await.unwrap();
    assert_eq!(tail.len(), 100);

    controller.deactivate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_source_failure_invalidates_entry() {
    let temp = TempDir::new().unwrap();
    let controller = CacheController::create(
        object("s3://bucket/f", "v1", 8192),
        temp.path().join("entry"),
        1024,
    )
    .await
    .unwrap();
    controller
        .start_background_download(failing_source(
            Bytes::from(vec![9u8; 4096]),
            Duration::from_millis(50),
        ))
        .await
        .unwrap();

    let mut reader = controller.open_reader().await.unwrap();
    let data = reader.read(8192).await.unwrap();
    assert!(data.is_empty());

    controller.deactivate().await;
    assert!(!controller.is_valid());
    assert_ne!(controller.status(), FileStatus::Downloaded);
    assert!(matches!(
        controller.open_reader().await,
        Err(CacheError::Invalidated)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_of_unknown_reader_is_an_error() {
    let temp = TempDir::new().unwrap();
    let controller = downloaded_entry(temp.path(), "s3://bucket/g", 1024, 0x22).await;

    let reader = controller.open_reader().await.unwrap();
    let err = controller.release_reader(99).unwrap_err();
    assert!(matches!(err, CacheError::InvalidReaderHandle(99)));
    reader.close().unwrap();
    assert_eq!(controller.reader_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_returns_existing_entry_for_unmodified_descriptor() {
    let temp = TempDir::new().unwrap();
    let config = CacheConfig::new(temp.path()).with_flush_threshold(4096);
    let cache = RemoteFileCache::new(config, MetadataFactory::with_builtin());

    let first = cache
        .get_or_create(object("s3://bucket/h", "v1", 2048), || {
            constant_source(0x33, 2048, 512)
        })
        .await
        .unwrap();
    let second = cache
        .get_or_create::<ByteStream, _>(object("s3://bucket/h", "v1", 2048), || unreachable!())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.entry_count().await, 1);

    first.wait_more_data(0, u64::MAX).await;
    first.deactivate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_restores_completed_entry() {
    let temp = TempDir::new().unwrap();
    let config = CacheConfig::new(temp.path())
        .with_total_bytes_limit(MIB as u64)
        .with_flush_threshold(4096);
    let descriptor = ObjectMetadata::new("s3://bucket/i", "v1", 10240);

    {
        let cache = RemoteFileCache::new(config.clone(), MetadataFactory::with_builtin());
        let controller = cache
            .get_or_create(Arc::new(descriptor.clone()), || {
                constant_source(0xAB, 10240, 1024)
            })
            .await
            .unwrap();
        controller.wait_more_data(0, u64::MAX).await;
        controller.deactivate().await;
    }

    let cache = RemoteFileCache::new(config, MetadataFactory::with_builtin());
    assert_eq!(cache.recover().await.unwrap(), 1);
    assert_eq!(cache.total_bytes(), 10240);

    let controller = cache
        .get_or_create::<ByteStream, _>(Arc::new(descriptor.clone()), || unreachable!())
        .await
        .unwrap();
    assert_eq!(controller.status(), FileStatus::Downloaded);
    assert_eq!(controller.frontier(), 10240);
    assert!(!controller.is_modified(&descriptor));
    assert!(controller.is_idle());

    let mut reader = controller.open_reader().await.unwrap();
    let data = reader.read_to_end().await.unwrap();
    assert_eq!(data.len(), 10240);
    assert!(data.iter().all(|&b| b == 0xAB));
}

#[tokio::test]
async fn test_recovery_discards_interrupted_entry() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("0badc0de");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(DATA_FILE), vec![0u8; 512]).unwrap();
    std::fs::write(
        dir.join(INFO_FILE),
        r#"{"file_status":1,"metadata_class":"object"}"#,
    )
    .unwrap();

    let cache = RemoteFileCache::new(
        CacheConfig::new(temp.path()),
        MetadataFactory::with_builtin(),
    );
    assert_eq!(cache.recover().await.unwrap(), 0);
    assert_eq!(cache.total_bytes(), 0);
    assert_eq!(cache.entry_count().await, 0);
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_recovery_discards_unknown_metadata_class() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("00ff00ff");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(DATA_FILE), vec![0u8; 128]).unwrap();
    std::fs::write(
        dir.join(INFO_FILE),
        r#"{"file_status":2,"metadata_class":"mystery"}"#,
    )
    .unwrap();
    std::fs::write(dir.join(METADATA_FILE), "{}").unwrap();

    let cache = RemoteFileCache::new(
        CacheConfig::new(temp.path()),
        MetadataFactory::with_builtin(),
    );
    assert_eq!(cache.recover().await.unwrap(), 0);
    assert_eq!(cache.total_bytes(), 0);
    assert!(!dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eviction_under_pressure_removes_lru_entry() {
    let temp = TempDir::new().unwrap();
    let config = CacheConfig::new(temp.path())
        .with_total_bytes_limit(10 * MIB as u64)
        .with_flush_threshold(MIB as u64);
    let cache = RemoteFileCache::new(config, MetadataFactory::with_builtin());

    let mut dirs = Vec::new();
    for (name, byte) in [("a", 1u8), ("b", 2u8)] {
        let controller = cache
            .get_or_create(
                object(&format!("s3://bucket/{name}"), "v1", 4 * MIB as u64),
                move || constant_source(byte, 4 * MIB, 256 * 1024),
            )
            .await
            .unwrap();
        controller.wait_more_data(0, u64::MAX).await;
        controller.deactivate().await;
        dirs.push(controller.local_path().to_path_buf());
    }
    assert_eq!(cache.total_bytes(), 8 * MIB as u64);

    let third = cache
        .get_or_create(object("s3://bucket/c", "v1", 4 * MIB as u64), || {
            constant_source(3, 4 * MIB, 256 * 1024)
        })
        .await
        .unwrap();
    assert_eq!(cache.total_bytes(), 8 * MIB as u64);
    assert_eq!(cache.entry_count().await, 2);
    assert!(!dirs[0].exists(), "least recently used entry must be gone");
    assert!(dirs[1].exists());

    third.wait_more_data(0, u64::MAX).await;
    third.deactivate().await;
}

#[tokio::test]
async fn test_oversized_entry_is_refused() {
    let temp = TempDir::new().unwrap();
    let config = CacheConfig::new(temp.path()).with_total_bytes_limit(1024);
    let cache = RemoteFileCache::new(config, MetadataFactory::with_builtin());

    let err = cache
        .get_or_create(object("s3://bucket/j", "v1", 4096), || {
            constant_source(0, 4096, 1024)
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::ExceedsBudget { size: 4096, limit: 1024 }
    ));
    assert_eq!(cache.entry_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_modified_descriptor_replaces_entry() {
    let temp = TempDir::new().unwrap();
    let config = CacheConfig::new(temp.path()).with_flush_threshold(1024);
    let cache = RemoteFileCache::new(config, MetadataFactory::with_builtin());

    let old = cache
        .get_or_create(object("s3://bucket/k", "v1", 2048), || {
            constant_source(0x11, 2048, 512)
        })
        .await
        .unwrap();
    old.wait_more_data(0, u64::MAX).await;
    old.deactivate().await;
    let old_dir = old.local_path().to_path_buf();
    drop(old);

    let new = cache
        .get_or_create(object("s3://bucket/k", "v2", 2048), || {
            constant_source(0x22, 2048, 512)
        })
        .await
        .unwrap();
    assert_ne!(new.local_path(), old_dir.as_path());
    assert!(!old_dir.exists(), "stale entry directory must be deleted");
    assert_eq!(cache.entry_count().await, 1);
    assert_eq!(cache.total_bytes(), 2048);

    let mut reader = new.open_reader().await.unwrap();
    let data = reader.read_to_end().await.unwrap();
    assert!(data.iter().all(|&b| b == 0x22));
    new.deactivate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_removal_deletes_idle_entry() {
    let temp = TempDir::new().unwrap();
    let cache = RemoteFileCache::new(
        CacheConfig::new(temp.path()).with_flush_threshold(1024),
        MetadataFactory::with_builtin(),
    );

    let controller = cache
        .get_or_create(object("s3://bucket/l", "v1", 1024), || {
            constant_source(0x44, 1024, 256)
        })
        .await
        .unwrap();
    controller.wait_more_data(0, u64::MAX).await;
    let dir = controller.local_path().to_path_buf();

    assert!(cache.remove("s3://bucket/l").await);
    assert!(!cache.remove("s3://bucket/l").await);
    assert_eq!(cache.total_bytes(), 0);
    assert!(!dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removal_with_open_reader_defers_directory_deletion() {
    let temp = TempDir::new().unwrap();
    let cache = RemoteFileCache::new(
        CacheConfig::new(temp.path()).with_flush_threshold(1024),
        MetadataFactory::with_builtin(),
    );

    let controller = cache
        .get_or_create(object("s3://bucket/n", "v1", 2048), || {
            constant_source(0x55, 2048, 512)
        })
        .await
        .unwrap();
    let mut reader = controller.open_reader().await.unwrap();
    let data = reader.read_to_end().await.unwrap();
    assert_eq!(data.len(), 2048);
    let dir = controller.local_path().to_path_buf();

    assert!(cache.remove("s3://bucket/n").await);
    assert_eq!(cache.total_bytes(), 0);
    assert!(dir.exists(), "directory must survive while a reader is open");
    assert!(!controller.is_valid());

    reader.close().unwrap();
    assert!(!dir.exists(), "last reader release must delete the directory");
}
