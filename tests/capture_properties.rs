use packet_vcr::capture::{CaptureWriter, SourceEvent};
use packet_vcr::error::CaptureError;
use packet_vcr::{Codec, InboundPacket, InitOptions, PacketStore, RecordFrame, StoreError, StreamDescriptor};
use proptest::prelude::*;
use std::time::{Duration, Instant};

fn descriptor() -> StreamDescriptor {
    StreamDescriptor { codec: Codec::Description(b"m=video 0 RTP/AVP 96".to_vec()), width: 640, height: 480 }
}

fn packet(payload: Vec<u8>) -> InboundPacket {
    InboundPacket { payload, ..Default::default() }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn capture_of_n_packets_reads_back_n_plus_one_ordered_records(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = PacketStore::new(dir.path().join("p.vcr"));
        let mut writer = CaptureWriter::start(store.clone(), descriptor(), InitOptions::default()).unwrap();
        for p in &payloads {
            writer.ingest(packet(p.clone())).unwrap();
        }
        let summary = writer.finish().unwrap();
        prop_assert_eq!(summary.packets, payloads.len() as u64);

        let records: Vec<RecordFrame> = store.scan(0).unwrap().map(|r| r.unwrap()).collect();
        prop_assert_eq!(records.len(), payloads.len() + 1);
        let is_descriptor = matches!(records[0], RecordFrame::Descriptor { .. });
        prop_assert!(is_descriptor);
        for (i, record) in records.iter().enumerate() {
            prop_assert_eq!(record.sequence_id(), i as u64);
        }
        for (record, want) in records.into_iter().skip(1).zip(&payloads) {
            let stored = record.into_packet().unwrap();
            prop_assert_eq!(&stored.payload, want);
        }
    }

    #[test]
    fn offsets_follow_receipt_times(gaps_us in prop::collection::vec(0u64..50_000, 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let store = PacketStore::new(dir.path().join("t.vcr"));
        let mut writer = CaptureWriter::start(store.clone(), descriptor(), InitOptions::default()).unwrap();

        let anchor = Instant::now();
        let mut at = Duration::ZERO;
        let mut expected = Vec::new();
        for (i, gap) in gaps_us.iter().enumerate() {
            if i > 0 {
                at += Duration::from_micros(*gap);
            }
            writer.ingest_at(packet(vec![i as u8]), anchor + at).unwrap();
            expected.push(at.as_micros() as u64);
        }
        writer.finish().unwrap();

        let offsets: Vec<u64> = store.packets(1).unwrap().map(|p| p.unwrap().offset_us).collect();
        prop_assert_eq!(&offsets, &expected);
        prop_assert_eq!(offsets[0], 0);
        prop_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn scans_from_any_position_see_a_suffix(n in 1u64..30, from in 0u64..35) {
        let dir = tempfile::tempdir().unwrap();
        let store = PacketStore::new(dir.path().join("s.vcr"));
        store.initialize(descriptor(), InitOptions::default()).unwrap();
        for i in 0..n {
            store.append(Duration::from_millis(i), packet(vec![i as u8])).unwrap();
        }
        let ids: Vec<u64> = store.scan(from).unwrap().map(|r| r.unwrap().sequence_id()).collect();
        let want: Vec<u64> = (from..=n).collect();
        prop_assert_eq!(ids, want);
    }
}

#[test]
fn late_receipt_terminates_the_capture() {
    let dir = tempfile::tempdir().unwrap();
    let store = PacketStore::new(dir.path().join("late.vcr"));
    let mut writer = CaptureWriter::start(store.clone(), descriptor(), InitOptions::default()).unwrap();
    let anchor = Instant::now() + Duration::from_secs(1);
    writer.ingest_at(packet(vec![1]), anchor).unwrap();
    writer.ingest_at(packet(vec![2]), anchor + Duration::from_millis(10)).unwrap();

    let err = writer.ingest_at(packet(vec![3]), anchor + Duration::from_millis(5)).unwrap_err();
    assert!(matches!(
        err,
        CaptureError::Store(StoreError::OutOfOrder { previous_us: 10_000, offered_us: 5_000 })
    ));
    // nothing more is accepted once a capture has failed
    let err = writer.ingest_at(packet(vec![4]), anchor + Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, CaptureError::Store(StoreError::ReadOnly)));

    writer.finish().unwrap();
    assert_eq!(store.packets(1).unwrap().count(), 2);
}

#[test]
fn receipt_before_the_first_packet_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = PacketStore::new(dir.path().join("early.vcr"));
    let mut writer = CaptureWriter::start(store.clone(), descriptor(), InitOptions::default()).unwrap();
    let anchor = Instant::now() + Duration::from_secs(1);
    writer.ingest_at(packet(vec![1]), anchor).unwrap();
    let err = writer.ingest_at(packet(vec![2]), anchor - Duration::from_millis(7)).unwrap_err();
    assert!(matches!(err, CaptureError::BeforeAnchor { early_us: 7_000 }));
    assert!(err.to_string().contains("7000us"));
    writer.finish().unwrap();
    assert_eq!(store.packets(1).unwrap().count(), 1);
}

#[test]
fn queued_events_are_paced_by_receipt_not_by_draining() {
    let dir = tempfile::tempdir().unwrap();
    let store = PacketStore::new(dir.path().join("queued.vcr"));
    let writer = CaptureWriter::start(store.clone(), descriptor(), InitOptions::default()).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..4u8 {
        if i > 0 {
            std::thread::sleep(Duration::from_millis(25));
        }
        tx.send(SourceEvent::received(packet(vec![i]))).unwrap();
    }
    tx.send(SourceEvent::EndOfStream).unwrap();
    let summary = writer.run(rx).unwrap();
    assert_eq!(summary.packets, 4);

    let offsets: Vec<u64> = store.packets(1).unwrap().map(|p| p.unwrap().offset_us).collect();
    assert_eq!(offsets[0], 0);
    for pair in offsets.windows(2) {
        assert!(pair[1] - pair[0] >= 25_000, "gaps collapsed: {offsets:?}");
    }
}

#[test]
fn scan_ignores_rows_appended_after_it_started() {
    let dir = tempfile::tempdir().unwrap();
    let store = PacketStore::new(dir.path().join("live.vcr"));
    store.initialize(descriptor(), InitOptions::default()).unwrap();
    store.append(Duration::ZERO, packet(vec![0])).unwrap();

    let mut scan = store.scan(0).unwrap();
    store.append(Duration::from_millis(5), packet(vec![1])).unwrap();
    assert_eq!(scan.next().unwrap().unwrap().sequence_id(), 0);
    assert_eq!(scan.next().unwrap().unwrap().sequence_id(), 1);
    assert!(scan.next().is_none());

    assert_eq!(store.scan(0).unwrap().count(), 3);
}
