// tests/global_tests.rs
//! The process-wide context is shared by every test in a binary, so the whole
//! lifecycle is exercised in one test.
use std::sync::Arc;

use warp_pool::backend::{MemoryBackend, MemoryRaster};
use warp_pool::{global, Attempts, DatasetSelector, PoolConfig, WarpError};

#[test]
fn test_global_lifecycle() {
    assert!(!global::is_initialized());
    assert_eq!(global::context().err(), Some(WarpError::NotInitialized));
    assert_eq!(
        global::get_token("mem://g", Vec::<String>::new()),
        Err(WarpError::NotInitialized)
    );
    assert_eq!(global::set_option("X", Some("1")), Err(WarpError::NotInitialized));

    let backend = MemoryBackend::new();
    backend.insert("mem://g", MemoryRaster::gradient(5, 3, 1));
    let first = global::initialize_with(PoolConfig::with_capacity(2), Arc::new(backend.clone()))
        .unwrap();

    // a second initialization keeps the live context
    let second = global::initialize_with(PoolConfig::with_capacity(9), Arc::new(MemoryBackend::new()))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(global::context().unwrap().capacity(), 2);

    let token = global::get_token("mem://g", Vec::<String>::new()).unwrap();
    let size = global::context()
        .unwrap()
        .raster_size(token, DatasetSelector::Source, Attempts::bounded(2))
        .unwrap();
    assert_eq!(size.value, (5, 3));
    global::set_option("GDAL_NUM_THREADS", Some("2")).unwrap();
    assert_eq!(backend.option("GDAL_NUM_THREADS").as_deref(), Some("2"));
    global::surrender_token(token).unwrap();
    assert_eq!(
        global::surrender_token(token),
        Err(WarpError::InvalidToken(token.as_raw()))
    );

    assert!(global::shutdown());
    assert_eq!(backend.live_handles(), 0);
    assert!(!global::shutdown());
    assert_eq!(global::context().err(), Some(WarpError::NotInitialized));
    // a context handle kept across shutdown refuses work
    assert_eq!(
        first.band_count(token, DatasetSelector::Source, Attempts::bounded(1)),
        Err(WarpError::NotInitialized)
    );
}
