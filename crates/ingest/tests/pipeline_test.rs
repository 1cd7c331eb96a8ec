//! End-to-end runs of the acquisition pipeline over in-memory queues and
//! storage: notification in, stored entries and work items out.

mod common;

use cobalt_core::WorkItem;
use cobalt_ingest::keys::StemKey;
use cobalt_ingest::{ArchiveFormat, ArchiveSource, OutputLayout, SourceRegistry};
use cobalt_storage::compress::gunzip;

use common::{tar_gz_bytes, zip_bytes, Pipeline, PROCESSED_BUCKET};

const BATCH_KEY: &str = "files/acme/batch1.tar.gz";

fn acme_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(ArchiveSource::new(
        "acme",
        Some(ArchiveFormat::TarGz),
        StemKey::base_name(),
        OutputLayout::BaseName,
    ));
    registry
}

fn doc1_item() -> WorkItem {
    WorkItem {
        source: "acme".into(),
        bucket: PROCESSED_BUCKET.into(),
        key: "acme/doc1.pdf".into(),
        meta_key: Some("acme/doc1.xml.gz".into()),
    }
}

#[tokio::test]
async fn matched_pair_becomes_one_work_item() {
    let pipeline = Pipeline::new();
    let id = pipeline
        .drop_archive(
            BATCH_KEY,
            tar_gz_bytes(&[("doc1.xml", b"<article/>"), ("doc1.pdf", b"%PDF-1.4")]),
        )
        .await;

    let (dispatched, stats) = pipeline.drain(acme_registry()).await;

    assert_eq!(pipeline.work_items(), vec![doc1_item()]);
    assert_eq!(pipeline.outbound.sent_batches().len(), 1);
    assert_eq!(pipeline.inbound.acked(), vec![id]);
    assert_eq!(dispatched.acknowledged, 1);

    assert_eq!(stats.archives, 1);
    assert_eq!(stats.meta, 1);
    assert_eq!(stats.content, 1);
    assert_eq!(stats.pairs, 1);
    assert_eq!(stats.sent_by_source["acme"], 1);

    let xml = gunzip(&pipeline.processed("acme/doc1.xml.gz").await).unwrap();
    assert_eq!(xml, b"<article/>");
    assert_eq!(pipeline.processed("acme/doc1.pdf").await, b"%PDF-1.4");

    // Outbound wire shape.
    let body: serde_json::Value =
        serde_json::from_str(&pipeline.outbound.sent_bodies()[0]).unwrap();
    assert_eq!(body["metakey"], "acme/doc1.xml.gz");
}

#[tokio::test]
async fn metadata_without_content_is_reported() {
    let pipeline = Pipeline::new();
    pipeline
        .drop_archive(BATCH_KEY, tar_gz_bytes(&[("doc1.xml", b"<article/>")]))
        .await;

    let (dispatched, stats) = pipeline.drain(acme_registry()).await;

    assert!(pipeline.work_items().is_empty());
    assert_eq!(dispatched.acknowledged, 1);
    assert_eq!(stats.pairs, 0);
    assert_eq!(stats.missing_content, 1);
    assert_eq!(stats.problem_files, 1);
    assert_eq!(stats.sent_by_source["acme"], 0);

    let report = pipeline.report();
    assert_eq!(report.lines().next(), Some("batch1.tar.gz/acme/doc1.xml.gz"));
    assert!(report.contains("Missing content : 1"));
    assert!(report.contains("acme: 0"));
}

#[tokio::test]
async fn reprocessing_an_archive_gives_the_same_result() {
    let pipeline = Pipeline::new();
    let archive = tar_gz_bytes(&[
        ("doc1.xml", b"<article/>"),
        ("doc1.pdf", b"%PDF-1.4"),
        ("doc2.pdf", b"%PDF-1.4"),
    ]);

    pipeline.drop_archive(BATCH_KEY, archive.clone()).await;
    let (_, first) = pipeline.drain(acme_registry()).await;
    let stored = pipeline.processed("acme/doc1.xml.gz").await;

    pipeline.drop_archive(BATCH_KEY, archive).await;
    let (_, second) = pipeline.drain(acme_registry()).await;

    assert_eq!(first, second);
    assert_eq!(pipeline.work_items(), vec![doc1_item(), doc1_item()]);
    assert_eq!(pipeline.processed("acme/doc1.xml.gz").await, stored);
    assert_eq!(pipeline.report().matches("batch1.tar.gz/acme/doc2.pdf").count(), 2);
}

#[tokio::test]
async fn refused_work_item_keeps_notification_on_queue() {
    let pipeline = Pipeline::new();
    pipeline
        .drop_archive(
            BATCH_KEY,
            tar_gz_bytes(&[
                ("doc1.xml", b"<a/>"),
                ("doc1.pdf", b"%PDF"),
                ("doc2.xml", b"<b/>"),
                ("doc2.pdf", b"%PDF"),
            ]),
        )
        .await;
    pipeline.outbound.reject_next_entries(1);

    let (dispatched, stats) = pipeline.drain(acme_registry()).await;

    assert_eq!(dispatched.failed, 1);
    assert!(pipeline.inbound.acked().is_empty());
    assert_eq!(pipeline.inbound.in_flight_len(), 1);
    // The other item still went out; the retry will send both again.
    assert_eq!(pipeline.work_items().len(), 1);
    assert_eq!(stats.pairs, 2);
}

#[tokio::test]
async fn unroutable_notifications_are_left_alone() {
    let pipeline = Pipeline::new();
    pipeline.inbound.push("{\"Records\": []}");
    pipeline.inbound.push(common::s3_event("files/unknown/a.zip", 3));

    let (dispatched, stats) = pipeline.drain(acme_registry()).await;

    assert_eq!(dispatched.malformed, 1);
    assert_eq!(dispatched.unknown_source, 1);
    assert!(pipeline.inbound.acked().is_empty());
    assert_eq!(stats.archives, 0);
}

#[tokio::test]
async fn missing_archive_fails_without_ack() {
    let pipeline = Pipeline::new();
    pipeline.inbound.push(common::s3_event(BATCH_KEY, 10));

    let (dispatched, stats) = pipeline.drain(acme_registry()).await;

    assert_eq!(dispatched.failed, 1);
    assert!(pipeline.inbound.acked().is_empty());
    assert_eq!(stats.archives, 1);
}

#[tokio::test]
async fn paired_zips_are_processed_from_the_metadata_notification() {
    let pipeline = Pipeline::new();
    pipeline
        .drop_archive(
            "files/pnas/pnas_117_23.xml.zip",
            zip_bytes(&[("xml/pnas.201912345.xml", b"<article/>")]),
        )
        .await;
    pipeline
        .drop_archive(
            "files/pnas/pnas_117_23.pdf.zip",
            zip_bytes(&[("pdf/pnas.201912345.pdf", b"%PDF")]),
        )
        .await;

    let (dispatched, stats) = pipeline.drain(SourceRegistry::builtin()).await;

    assert_eq!(dispatched.acknowledged, 1);
    assert_eq!(dispatched.skipped, 1);
    assert_eq!(pipeline.inbound.acked().len(), 2);
    assert_eq!(stats.archives, 1);
    assert_eq!(
        pipeline.work_items(),
        vec![WorkItem {
            source: "pnas".into(),
            bucket: PROCESSED_BUCKET.into(),
            key: "pnas/pnas_v117_i23_p12345.pdf".into(),
            meta_key: Some("pnas/pnas_v117_i23_p12345.xml.gz".into()),
        }]
    );
}

#[tokio::test]
async fn cup_entries_are_grouped_by_archive() {
    let pipeline = Pipeline::new();
    pipeline
        .drop_archive(
            "files/cup/JNL_2020_04.zip",
            zip_bytes(&[
                ("S0022112020000012.xml", b"<a/>"),
                ("S0022112020000012a.pdf", b"%PDF"),
                ("S0022112020000012_fig1.jpg", b"jpg"),
            ]),
        )
        .await;

    let (_, stats) = pipeline.drain(SourceRegistry::builtin()).await;

    assert_eq!(stats.other, 1);
    let items = pipeline.work_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, "cup/JNL_2020_04/S0022112020000012a.pdf");
    assert_eq!(
        items[0].meta_key.as_deref(),
        Some("cup/JNL_2020_04/S0022112020000012.xml.gz")
    );
    assert_eq!(
        pipeline.processed("cup/JNL_2020_04/S0022112020000012_fig1.jpg").await,
        b"jpg"
    );
}

#[tokio::test]
async fn cup_entries_without_a_key_are_stored_but_not_paired() {
    let pipeline = Pipeline::new();
    let id = pipeline
        .drop_archive(
            "files/cup/J.zip",
            zip_bytes(&[("short.xml", b"<a/>"), ("short.pdf", b"%PDF")]),
        )
        .await;

    let (dispatched, stats) = pipeline.drain(SourceRegistry::builtin()).await;

    assert_eq!(pipeline.inbound.acked(), vec![id]);
    assert_eq!(dispatched.acknowledged, 1);
    assert_eq!(stats.meta, 0);
    assert_eq!(stats.content, 0);
    assert_eq!(stats.pairs, 0);
    assert_eq!(stats.problem_files, 0);
    assert!(pipeline.work_items().is_empty());
    assert_eq!(pipeline.processed("cup/J/short.pdf").await, b"%PDF");
}
