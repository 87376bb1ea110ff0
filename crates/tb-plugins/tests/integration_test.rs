//! Integration tests driving the reference plugins through the host-side drivers

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Mutex};

    use tb_core::{is_unknown_height, ImageMapInformation, ImageType, LatLong};
    use tb_plugins::{
        AcquisitionOutcome, AcquisitionState, CompletedCallback, HeightPlugin, HeightQuery,
        ImageAcquisition, Plugin, ProgressCallback,
    };
    use tb_rainbow_image::{partial_path, RainbowImage};
    use tb_wave_height::WaveHeight;

    fn request(width: i32, height: i32) -> ImageMapInformation {
        ImageMapInformation {
            filename: "venue/rainbow.png".into(),
            filename_intermediate: "venue/rainbow_preview.png".into(),
            width,
            height,
            ..Default::default()
        }
    }

    fn completion() -> (Arc<Mutex<Vec<bool>>>, CompletedCallback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&calls);
        (
            calls,
            Box::new(move |outcome: &AcquisitionOutcome| {
                c.lock().unwrap().push(outcome.success());
            }),
        )
    }

    #[test]
    fn test_batch_fetch_preserves_order() {
        let mut query = HeightQuery::new(Box::new(WaveHeight::default()));
        let pairs = [
            LatLong::new(0.0, 0.0),
            LatLong::new(100.0, 0.0),
            LatLong::new(0.0, 100.0),
        ];

        let heights = query.fetch_batch(&pairs);
        assert_eq!(heights.len(), 3);
        assert_eq!(heights[0], 0.0);
        assert!((heights[1] - 1f64.sin() * 100.0).abs() < 1e-9);
        assert!((heights[2] - 1f64.sin() * 100.0).abs() < 1e-9);

        for (pair, height) in pairs.iter().zip(&heights) {
            assert_eq!(query.fetch_one(pair.latitude_or_z, pair.longitude_or_x), *height);
        }
        assert!(heights.iter().all(|h| !is_unknown_height(*h)));
    }

    #[test]
    fn test_height_settings_round_trip_on_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Plugins/Height/wave.bin");

        let mut wave = WaveHeight::default();
        wave.set_multiplier(250.0).unwrap();
        let query = HeightQuery::new(Box::new(wave));
        query.plugin().save(&path).unwrap();

        let mut fresh = WaveHeight::default();
        fresh.load(&path).unwrap();
        assert_eq!(fresh.multiplier(), 250.0);
        assert_eq!(fresh.fetch(100.0, 0.0), 1f64.sin() * 250.0);
    }

    #[tokio::test]
    async fn test_rainbow_acquisition_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut acq = ImageAcquisition::new(Box::new(RainbowImage::default()));

        let mut map = request(32, 130);
        acq.set_coverage(&mut map, 900.0, 400.0).await.unwrap();
        assert_eq!((map.coverage_x, map.coverage_z), (900.0, 900.0));

        let last = Arc::new(Mutex::new(0.0f32));
        let l = Arc::clone(&last);
        let progress: ProgressCallback = Arc::new(move |kind: ImageType, pct: f32| {
            assert_eq!(kind, ImageType::Main);
            *l.lock().unwrap() = pct;
        });
        let (calls, done) = completion();

        let handle = acq.create(dir.path(), &map, Some(progress), done).unwrap();
        let outcome = handle.outcome().await;

        assert!(outcome.success(), "{:?}", outcome.message);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(*last.lock().unwrap(), 100.0);
        assert!(dir.path().join("venue/rainbow.png").is_file());
        assert!(dir.path().join("venue/rainbow_preview.png").is_file());
    }

    #[tokio::test]
    async fn test_interrupted_acquisition_resumes_in_next_session() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("project/Plugins/Image/rainbow.bin");

        // Session 1: stop after the first row has been rendered.
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let paused = AtomicBool::new(false);
        let progress: ProgressCallback = Arc::new(move |_: ImageType, _: f32| {
            if !paused.swap(true, Ordering::SeqCst) {
                let _ = started_tx.send(());
                let _ = release_rx.lock().unwrap().recv();
            }
        });

        let mut acq = ImageAcquisition::new(Box::new(RainbowImage::default()));
        let (calls, done) = completion();
        let handle = acq
            .create(dir.path(), &request(16, 64), Some(progress), done)
            .unwrap();

        started_rx.recv().await.unwrap();
        handle.request_cancel();
        release_tx.send(()).unwrap();
        let outcome = acq.stop().await.unwrap();

        assert_eq!(outcome.state, AcquisitionState::Cancelled);
        assert_eq!(*calls.lock().unwrap(), vec![false]);
        assert!(!dir.path().join("venue/rainbow.png").exists());

        acq.save(&settings, true).await.unwrap();
        assert!(partial_path(&settings).is_file());
        drop(acq);

        // Session 2: a fresh instance picks up where the first one stopped.
        let mut acq = ImageAcquisition::new(Box::new(RainbowImage::default()));
        acq.load(&settings).await.unwrap();
        let (calls, done) = completion();
        let handle = acq.resume(dir.path(), None, done).unwrap().unwrap();

        assert!(handle.outcome().await.success());
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert!(dir.path().join("venue/rainbow.png").is_file());

        acq.wait().await;
        let (calls, done) = completion();
        assert!(acq.resume(dir.path(), None, done).unwrap().is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("rainbow.bin");
        std::fs::write(&settings, b"garbage").unwrap();

        let mut acq = ImageAcquisition::new(Box::new(RainbowImage::default()));
        acq.load(&settings).await.unwrap();

        let (calls, done) = completion();
        assert!(acq.resume(dir.path(), None, done).unwrap().is_none());
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(acq.state(), AcquisitionState::Idle);
    }

    #[tokio::test]
    async fn test_save_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let progress: ProgressCallback = Arc::new(move |_: ImageType, _: f32| {
            let _ = release_rx.lock().unwrap().recv();
        });

        let mut acq = ImageAcquisition::new(Box::new(RainbowImage::default()));
        let (_, done) = completion();
        acq.create(dir.path(), &request(4, 4), Some(progress), done)
            .unwrap();

        let err = acq.save(Path::new("ignored.bin"), true).await.unwrap_err();
        assert!(matches!(err, tb_plugins::LifecycleError::AlreadyRunning(_)));

        drop(release_tx);
        acq.wait().await;
    }
}
