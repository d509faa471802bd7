use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use hls_readahead::{HlsError, HlsSettings, StreamEvent, StreamSession};
use rstest::rstest;

mod hls_fixture;
mod setup;

use hls_fixture::{HlsFixture, SEGMENT_COUNT, SEGMENT_LEN, segment_payload, variant_bytes};
use setup::SERVER_RT;

fn read_to_end(session: &mut StreamSession) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1500];
    loop {
        let n = session.read(&mut buf).expect("read failed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Variant index of every segment-sized chunk, read from its tag.
fn chunk_variants(data: &[u8]) -> Vec<u8> {
    data.chunks(SEGMENT_LEN).map(|c| c[1] - b'0').collect()
}

#[test]
fn vod_stream_reads_every_byte_then_eof() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}master.m3u8"),
        HlsSettings::default().auto_quality(false),
    )
    .expect("open failed");

    assert!(!session.is_live());
    assert_eq!(session.variant_count(), 2);
    assert_eq!(session.total_time(), Duration::from_secs(SEGMENT_COUNT as u64));

    let data = read_to_end(&mut session);
    assert_eq!(data, variant_bytes(0));
    assert!(session.is_eof());
    assert_eq!(session.length(), Some((SEGMENT_COUNT * SEGMENT_LEN) as u64));
    tracing::info!(bytes = data.len(), "vod stream drained");
}

#[rstest]
#[case(0)]
#[case(1)]
fn quality_parameter_selects_the_variant(#[case] quality: usize) {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}master.m3u8?quality={quality}"),
        HlsSettings::default(),
    )
    .expect("open failed");

    assert_eq!(session.current_variant(), quality);
    assert!(!session.auto_quality());
    assert_eq!(read_to_end(&mut session), variant_bytes(quality));
    assert_eq!(fixture.request_count_for(&format!("v{quality}.m3u8")), 1);
}

#[test]
fn time_seek_restarts_at_the_containing_segment() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());
    let mut session = StreamSession::open(
        &format!("{base}v0.m3u8"),
        HlsSettings::default().auto_quality(false),
    )
    .expect("open failed");

    let mut head = vec![0u8; 100];
    session.read_exact(&mut head).unwrap();

    session.seek_to_time(Duration::from_millis(7_500)).unwrap();
    assert_eq!(session.current_time(), Duration::from_secs(7));

    let rest = read_to_end(&mut session);
    let expected: Vec<u8> = (7..SEGMENT_COUNT)
        .flat_map(|i| segment_payload(0, i).to_vec())
        .collect();
    assert_eq!(rest, expected);

    session.seek_to_time(Duration::from_secs(2)).unwrap();
    let mut again = vec![0u8; SEGMENT_LEN];
    session.read_exact(&mut again).unwrap();
    assert_eq!(&again[..], &segment_payload(0, 2)[..]);

    assert!(matches!(
        session.seek_to_time(Duration::from_secs(60)),
        Err(HlsError::SeekOutOfRange)
    ));
}

#[test]
fn byte_seek_after_sizes_are_known() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());
    let mut session = StreamSession::open(
        &format!("{base}v1.m3u8"),
        HlsSettings::default().auto_quality(false),
    )
    .expect("open failed");

    assert!(session.seek(SeekFrom::Start(1)).is_err());
    read_to_end(&mut session);

    let target = (3 * SEGMENT_LEN + 10) as u64;
    assert_eq!(Seek::seek(&mut session, SeekFrom::Start(target)).unwrap(), target);
    let mut buf = [0u8; 32];
    session.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &segment_payload(1, 3)[10..42]);
    assert_eq!(session.position(), target + 32);

    let end = session.seek(SeekFrom::End(-5)).unwrap();
    assert_eq!(end, (SEGMENT_COUNT * SEGMENT_LEN - 5) as u64);
    let tail = read_to_end(&mut session);
    assert_eq!(&tail[..], &segment_payload(1, SEGMENT_COUNT - 1)[SEGMENT_LEN - 5..]);
}

#[test]
fn encrypted_stream_uses_key_params_and_fingerprint() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}enc.m3u8?fingerprint=device-7&key_params=token%3Dabc"),
        HlsSettings::default().auto_quality(false),
    )
    .expect("open failed");

    assert_eq!(read_to_end(&mut session), variant_bytes(0));

    // One key for the whole playlist, fetched once.
    let requests = fixture.key_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query.as_deref(), Some("token=abc"));
    assert_eq!(requests[0].fingerprint.as_deref(), Some("device-7"));
}

#[test]
fn live_playlist_grows_until_endlist() {
    let fixture = HlsFixture::new();
    fixture.set_live_segments(4, false);
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}live.m3u8"),
        HlsSettings::default()
            .auto_quality(false)
            .live_start_offset_segments(4)
            .live_refresh_interval(Some(Duration::from_millis(100))),
    )
    .expect("open failed");
    let mut events = session.subscribe();

    assert!(session.is_live());
    assert_eq!(session.length(), None);

    let mut first = vec![0u8; 4 * SEGMENT_LEN];
    session.read_exact(&mut first).unwrap();
    assert!(!session.is_eof());

    fixture.set_live_segments(8, true);
    let rest = read_to_end(&mut session);

    let expected: Vec<u8> = (4..8).flat_map(|i| segment_payload(0, i).to_vec()).collect();
    assert_eq!(rest, expected);
    assert!(session.is_eof());

    let refreshed = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, StreamEvent::PlaylistRefreshed { segments: 8, .. }));
    assert!(refreshed);
    assert!(fixture.request_count_for("live.m3u8") >= 2);
}

#[test]
fn transient_segment_errors_are_retried() {
    let fixture = HlsFixture::new();
    fixture.fail_next("seg/v0_2.bin", 2);
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}master.m3u8?quality=0"),
        HlsSettings::default(),
    )
    .expect("open failed");

    assert_eq!(read_to_end(&mut session), variant_bytes(0));
    assert_eq!(fixture.request_count_for("seg/v0_2.bin"), 3);
}

#[test]
fn stat_and_exists_probe_without_a_session() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());

    let info = StreamSession::stat(&format!("{base}master.m3u8"), HlsSettings::default())
        .expect("stat failed");
    assert!(!info.is_live);
    assert_eq!(info.variant_count, 2);
    assert_eq!(info.total_time, Duration::from_secs(SEGMENT_COUNT as u64));
    assert_eq!(info.length, None);

    assert!(StreamSession::exists(&format!("{base}v1.m3u8"), HlsSettings::default()));
    assert!(!StreamSession::exists(&format!("{base}missing.m3u8"), HlsSettings::default()));
    assert_eq!(fixture.request_count_for("seg/v0_0.bin"), 0);
}

#[test]
fn open_fails_for_a_missing_playlist() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());

    let err = StreamSession::open(&format!("{base}missing.m3u8"), HlsSettings::default())
        .expect_err("open should fail");
    assert!(matches!(err, HlsError::OpenFailed(_)));
}

#[test]
fn close_stops_the_worker_and_is_idempotent() {
    let fixture = HlsFixture::new();
    let base = SERVER_RT.block_on(fixture.start());
    let mut session =
        StreamSession::open(&format!("{base}master.m3u8"), HlsSettings::default())
            .expect("open failed");

    let mut buf = [0u8; 64];
    session.read_exact(&mut buf).unwrap();

    session.close().unwrap();
    session.close().unwrap();
    assert!(session.read(&mut buf).is_err());
    assert!(!session.is_eof());
}

#[test]
fn slow_variant_is_abandoned_for_a_lower_one() {
    let fixture = HlsFixture::new().with_slow_prefix("seg/v1_", Duration::from_millis(300));
    let base = SERVER_RT.block_on(fixture.start());

    let mut session = StreamSession::open(
        &format!("{base}master.m3u8?quality=1&auto_quality=1"),
        HlsSettings::default().abr_min_switch_interval(Duration::from_secs(60)),
    )
    .expect("open failed");
    let mut events = session.subscribe();
    assert_eq!(session.current_variant(), 1);
    assert!(session.auto_quality());

    let data = read_to_end(&mut session);
    assert_eq!(data.len(), SEGMENT_COUNT * SEGMENT_LEN);
    assert_eq!(session.current_variant(), 0);

    let variants = chunk_variants(&data);
    assert_eq!(variants[0], 1);
    assert_eq!(*variants.last().unwrap(), 0);
    // A single step down, no oscillation.
    assert_eq!(variants.windows(2).filter(|w| w[0] != w[1]).count(), 1);

    let switched = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, StreamEvent::VariantChanged { from: 1, to: 0, .. }));
    assert!(switched);
}
