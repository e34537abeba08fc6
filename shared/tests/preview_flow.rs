mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{files_in, png_bytes, write_png, CountingTransform, FakeApi, FakeFetcher};
use shared::model::PhotoId;
use shared::{
    CacheConfig, ImageCache, ImageRef, ImageTransform, PreviewConfig, PreviewController,
    PreviewState, ResolveOptions, SharpenParams, SharpenTransform,
};

const FULL: &str = "https://vault.test/photos/12/full.jpg";
const THUMB: &str = "https://vault.test/photos/12/thumb.jpg";

async fn cache(dir: &std::path::Path, fetcher: Arc<FakeFetcher>) -> ImageCache {
    ImageCache::new(
        CacheConfig {
            cache_dir: dir.join("cache"),
            max_attempts: 3,
            base_backoff_ms: 5,
            attempt_timeout_ms: 2_000,
        },
        fetcher,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn second_resolve_is_served_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(png_bytes(20, 20)));
    let cache = cache(dir.path(), fetcher.clone()).await;
    let image = ImageRef::new(FULL);

    let first = cache.resolve(&image, ResolveOptions::default()).await.unwrap();
    let second = cache.resolve(&image, ResolveOptions::default()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fetcher.calls_for(FULL), 1);
    assert_eq!(cache.metrics().hits, 1);
}

#[tokio::test]
async fn thumbnail_failures_fall_back_to_full_image() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(png_bytes(20, 20)));
    fetcher.fail_times(THUMB, 3);
    let cache = cache(dir.path(), fetcher.clone()).await;
    let image = ImageRef::new(FULL).with_thumbnail(THUMB);

    let path = cache
        .resolve(
            &image,
            ResolveOptions {
                prefer_thumbnail: true,
                ..ResolveOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(path, cache.path_for(FULL).unwrap());
    assert_eq!(fetcher.calls_for(THUMB), 3);
    assert_eq!(fetcher.calls_for(FULL), 1);
    let leftovers: Vec<_> = files_in(cache.cache_dir())
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sharpen_leaves_only_the_output_behind() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    write_png(&input, 64, 48);
    let before = std::fs::read(&input).unwrap();

    let output = SharpenTransform::with_defaults()
        .apply(&input, SharpenParams::new(2.5, 3.0))
        .await
        .unwrap();

    assert_eq!(files_in(dir.path()), {
        let mut expected = vec![input.clone(), output.clone()];
        expected.sort();
        expected
    });
    assert_eq!(std::fs::read(&input).unwrap(), before);
    let decoded = image::open(&output).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preview_session_debounces_and_commits() {
    shared::logging::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(png_bytes(40, 30)));
    let transform = Arc::new(CountingTransform::new());
    let preview = PreviewController::new(
        ImageRef::new(FULL),
        Arc::new(cache(dir.path(), fetcher.clone()).await),
        transform.clone(),
        PreviewConfig {
            debounce_ms: 60,
            scratch_dir: dir.path().join("preview"),
        },
    );

    // 1. First render
    let first = preview.start().await.unwrap();
    assert_eq!(preview.snapshot().state, PreviewState::Ready);
    assert_eq!(fetcher.total_calls(), 1);

    // 2. Slider drag: five quick adjustments, one render
    for intensity in [1.2, 1.6, 2.0, 2.4, 2.8] {
        preview.adjust(SharpenParams::new(intensity, 4.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut updates = preview.subscribe();
    let regenerated = tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.regenerations == 1 && s.state == PreviewState::Ready),
    )
    .await
    .expect("preview never regenerated")
    .unwrap()
    .clone();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let calls = transform.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1], SharpenParams::new(2.8, 4.0));
    assert!(!first.exists());
    assert!(regenerated.preview_path.unwrap().exists());
    assert_eq!(fetcher.total_calls(), 1);

    // 3. Commit sends the final parameters and tears the session down
    let api = FakeApi::new();
    let response = preview.commit(&api, PhotoId(12), 5).await.unwrap();
    assert!(response.success);
    let sent = api.sharpened();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, PhotoId(12));
    assert!((sent[0].1 - 2.8).abs() < 1e-5);
    assert_eq!(sent[0].3, 5);
    assert_eq!(preview.snapshot().state, PreviewState::Closed);
    assert!(files_in(&dir.path().join("preview")).is_empty());
}
