// tests/context_tests.rs
use std::io::Write;
use std::sync::Arc;

use warp_pool::backend::{MemoryBackend, MemoryRaster};
use warp_pool::{
    return_code, Attempts, DatasetKey, DatasetSelector, PixelType, PoolConfig, ReadRequest,
    Token, WarpContext, WarpError, Window,
};

const SRC: DatasetSelector = DatasetSelector::Source;

/// Context over a memory backend holding `mem://a`, `mem://b` and `mem://c`,
/// each a gradient whose band values encode their pixel index.
fn setup(capacity: usize) -> (WarpContext, MemoryBackend) {
    let backend = MemoryBackend::new();
    backend.insert("mem://a", MemoryRaster::gradient(32, 16, 1));
    backend.insert("mem://b", MemoryRaster::gradient(16, 16, 2));
    backend.insert("mem://c", MemoryRaster::gradient(8, 8, 3));
    let ctx = WarpContext::new(PoolConfig::with_capacity(capacity), Arc::new(backend.clone()))
        .unwrap();
    (ctx, backend)
}

fn key(uri: &str) -> DatasetKey {
    DatasetKey::new(uri, Vec::<String>::new())
}

fn token(ctx: &WarpContext, uri: &str) -> Token {
    ctx.get_token(uri, Vec::<String>::new()).unwrap()
}

/// First pixel of band 1 in the window at (x, y).
fn pixel_at(ctx: &WarpContext, t: Token, x: isize, y: isize) -> i32 {
    let request = ReadRequest::new(1, Window::new(x, y, 1, 1), PixelType::Int32);
    let bytes = ctx
        .read_window(t, SRC, &request, Attempts::bounded(4))
        .unwrap()
        .value;
    i32::from_ne_bytes(bytes[..4].try_into().unwrap())
}

#[test]
fn test_open_count_never_exceeds_capacity() {
    let (ctx, backend) = setup(2);
    let tokens: Vec<Token> = ["mem://a", "mem://b", "mem://c"]
        .iter()
        .map(|uri| token(&ctx, uri))
        .collect();
    for round in 0..5 {
        for t in &tokens {
            ctx.band_count(*t, SRC, Attempts::bounded(3)).unwrap();
            assert!(ctx.open_entries() <= 2, "round {round}");
        }
    }
    assert!(backend.max_live_handles() <= 2);
    assert_eq!(ctx.capacity(), 2);
}

#[test]
fn test_eviction_and_reopen_scenario() {
    let (ctx, backend) = setup(2);
    let (a, b, c) = (token(&ctx, "mem://a"), token(&ctx, "mem://b"), token(&ctx, "mem://c"));
    let attempts = Attempts::bounded(3);

    ctx.band_count(a, SRC, attempts).unwrap();
    ctx.band_count(b, SRC, attempts).unwrap();
    let b_generation = ctx.generation(&key("mem://b")).unwrap();

    // c pushes out a, the least recently used
    ctx.band_count(c, SRC, attempts).unwrap();
    assert!(!ctx.is_open(&key("mem://a")));
    assert!(ctx.is_open(&key("mem://b")));

    // touch b so that c is the oldest when a comes back
    ctx.band_count(b, SRC, attempts).unwrap();
    assert_eq!(pixel_at(&ctx, a, 3, 2), 1_000_000 + 2 * 32 + 3);

    assert_eq!(backend.opens("mem://a"), 2);
    assert!(ctx.is_open(&key("mem://a")));
    assert!(ctx.is_open(&key("mem://b")));
    assert!(!ctx.is_open(&key("mem://c")));
    assert_eq!(ctx.generation(&key("mem://b")), Some(b_generation));
    assert_eq!(backend.opens("mem://b"), 1);
}

#[test]
fn test_generation_increases_across_reopen() {
    let (ctx, backend) = setup(1);
    let (a, b) = (token(&ctx, "mem://a"), token(&ctx, "mem://b"));
    ctx.band_count(a, SRC, Attempts::bounded(2)).unwrap();
    let first = ctx.generation(&key("mem://a")).unwrap();
    ctx.band_count(b, SRC, Attempts::bounded(2)).unwrap();
    assert_eq!(ctx.generation(&key("mem://a")), None);
    ctx.band_count(a, SRC, Attempts::bounded(2)).unwrap();
    assert!(ctx.generation(&key("mem://a")).unwrap() > first);
    assert_eq!(backend.opens("mem://a"), 2);
}

#[test]
fn test_tokens_for_one_key_share_an_entry() {
    let (ctx, backend) = setup(4);
    let t1 = token(&ctx, "mem://b");
    let t2 = token(&ctx, "mem://b");
    assert_ne!(t1, t2);
    ctx.band_count(t1, SRC, Attempts::bounded(2)).unwrap();
    ctx.band_count(t2, SRC, Attempts::bounded(2)).unwrap();
    assert_eq!(backend.opens("mem://b"), 1);

    ctx.surrender_token(t1).unwrap();
    assert_eq!(ctx.band_count(t2, SRC, Attempts::bounded(2)).unwrap().value, 2);
    assert_eq!(
        ctx.band_count(t1, SRC, Attempts::bounded(2)),
        Err(WarpError::InvalidToken(t1.as_raw()))
    );
}

#[test]
fn test_options_make_a_different_dataset() {
    let (ctx, backend) = setup(4);
    let plain = token(&ctx, "mem://a");
    let warped = ctx.get_token("mem://a", ["-ts", "16", "8"]).unwrap();
    let sel = DatasetSelector::Processed;
    assert_eq!(ctx.raster_size(plain, sel, Attempts::bounded(2)).unwrap().value, (32, 16));
    assert_eq!(ctx.raster_size(warped, sel, Attempts::bounded(2)).unwrap().value, (16, 8));
    assert_eq!(backend.opens("mem://a"), 2);
    assert_eq!(ctx.open_entries(), 2);
}

#[test]
fn test_reopen_is_invisible_to_the_caller() {
    let (ctx, backend) = setup(2);
    let a = token(&ctx, "mem://a");
    let before = pixel_at(&ctx, a, 5, 5);
    backend.expire_handles("mem://a");
    let request = ReadRequest::new(1, Window::new(5, 5, 1, 1), PixelType::Int32);
    let done = ctx
        .read_window(a, SRC, &request, Attempts::bounded(3))
        .unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(i32::from_ne_bytes(done.value[..4].try_into().unwrap()), before);
    assert_eq!(backend.live_handles(), 1);
}

#[test]
fn test_invalid_token_makes_no_native_call() {
    let (ctx, backend) = setup(2);
    let result = ctx.band_count(Token::from_raw(12345), SRC, Attempts::UNBOUNDED);
    assert_eq!(result, Err(WarpError::InvalidToken(12345)));
    assert_eq!(return_code(&result), -1);
    assert_eq!(backend.native_calls(), 0);
    assert_eq!(ctx.open_entries(), 0);
}

#[test]
fn test_permanent_failure_returns_at_once() {
    let (ctx, backend) = setup(2);
    let a = token(&ctx, "mem://a");
    backend.fail_next_opens("mem://a", 1, false);
    let result = ctx.band_count(a, SRC, Attempts::bounded(10));
    assert_eq!(return_code(&result), -6);
    assert_eq!(backend.opens("mem://a"), 1);
    // the next call opens normally
    assert_eq!(ctx.band_count(a, SRC, Attempts::bounded(10)).unwrap().value, 1);
}

#[test]
fn test_retries_exhausted_reports_attempts() {
    let (ctx, backend) = setup(2);
    let a = token(&ctx, "mem://a");
    backend.fail_next_calls("mem://a", 100, true);
    match ctx.band_count(a, SRC, Attempts::bounded(5)) {
        Err(WarpError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 5),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(backend.live_handles(), 1);
}

#[test]
fn test_string_outputs_grow_past_the_scratch_size() {
    let backend = MemoryBackend::new();
    let mut raster = MemoryRaster::gradient(4, 4, 1);
    for i in 0..50 {
        raster = raster.with_metadata_entry("LONG", &format!("ITEM_{i}={}", "v".repeat(40)));
    }
    backend.insert("mem://long", raster);
    let config = PoolConfig {
        scratch_capacity: 16,
        ..PoolConfig::with_capacity(1)
    };
    let ctx = WarpContext::new(config, Arc::new(backend)).unwrap();
    let t = token(&ctx, "mem://long");

    let entries = ctx.metadata(t, SRC, 0, "LONG", Attempts::bounded(2)).unwrap().value;
    assert_eq!(entries.len(), 50);
    assert_eq!(entries[49], format!("ITEM_49={}", "v".repeat(40)));

    // the two-call pattern: ask with a small buffer, then fill an exact one
    let mut small = [0u8; 64];
    let required = match ctx.metadata_into(t, SRC, 0, "LONG", Attempts::bounded(2), &mut small) {
        Err(WarpError::BufferTooSmall { required }) => required,
        other => panic!("unexpected {other:?}"),
    };
    let mut exact = vec![0u8; required];
    let used = ctx
        .metadata_into(t, SRC, 0, "LONG", Attempts::bounded(2), &mut exact)
        .unwrap()
        .value;
    assert_eq!(used, required);
    assert_eq!(warp_pool::buffer::decode_list(&exact[..used]), entries);

    let wkt = ctx.crs_wkt(t, SRC, Attempts::bounded(2)).unwrap().value;
    assert!(wkt.contains("UTM zone 32N"));

    let mut exact = vec![0u8; wkt.len() + 1];
    let done = ctx.crs_wkt_into(t, SRC, Attempts::bounded(2), &mut exact).unwrap();
    assert_eq!(done.value, wkt.len() + 1);
    assert_eq!(exact.last(), Some(&0));
}

#[test]
fn test_context_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"capacity": 1, "default_attempts": 3, "options": {{"CPL_DEBUG": "ON"}}}}"#
    )
    .unwrap();
    let config = PoolConfig::from_json_file(file.path()).unwrap();
    let backend = MemoryBackend::new();
    backend.insert("mem://a", MemoryRaster::gradient(2, 2, 1));
    let ctx = WarpContext::new(config, Arc::new(backend.clone())).unwrap();
    assert_eq!(ctx.capacity(), 1);
    assert_eq!(ctx.default_attempts(), Attempts::bounded(3));
    assert_eq!(backend.option("CPL_DEBUG").as_deref(), Some("ON"));

    ctx.set_option("CPL_DEBUG", None).unwrap();
    assert_eq!(backend.option("CPL_DEBUG"), None);
}
