//! Cross-component scenarios: writer, reader, register, and checkpoint
//! working against a shared in-memory repo.

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::helpers::{enable_logging, fill, mem_log, reader};
use crate::repo::Repo as _;
use crate::{Error, Options};

#[test]
fn delete_requires_the_whole_segment_acknowledged() {
    enable_logging();
    for reads in 1..=20usize {
        let (repo, mut writer) = mem_log(Options::with_capacity(10));
        fill(&mut writer, 25);

        let mut consumer = reader(&repo, "test");
        for _ in 0..reads {
            let record = consumer.next_record().unwrap().unwrap();
            consumer.ack(&record).unwrap();
        }
        consumer.save().unwrap();

        let result = writer.delete(1);
        if reads >= 10 {
            result.unwrap();
        } else {
            assert!(
                matches!(result, Err(Error::InvalidArgument(_))),
                "delete(1) after {reads} reads: {result:?}"
            );
        }
    }
}

#[test]
fn status_and_delete_agree() {
    for reads in 1..=22usize {
        let (repo, mut writer) = mem_log(Options::with_capacity(10));
        fill(&mut writer, 25);

        let mut consumer = reader(&repo, "test");
        for _ in 0..reads {
            let record = consumer.next_record().unwrap().unwrap();
            consumer.ack(&record).unwrap();
        }
        consumer.save().unwrap();

        let status = consumer.status().unwrap();
        let last = *status.keys().last().unwrap();
        for (id, can_delete) in status {
            if id == last {
                // The active segment is never deletable.
                assert!(!can_delete);
                assert!(matches!(
                    writer.delete(id),
                    Err(Error::InvalidArgument(_))
                ));
            } else if can_delete {
                writer.delete(id).unwrap();
            }
        }
    }
}

#[test]
fn status_works_after_deletion() {
    let (repo, mut writer) = mem_log(Options::with_capacity(10));
    fill(&mut writer, 25);

    let mut consumer = reader(&repo, "test");
    for _ in 0..11 {
        let record = consumer.next_record().unwrap().unwrap();
        consumer.ack(&record).unwrap();
    }
    consumer.save().unwrap();

    consumer.status().unwrap();
    writer.delete(1).unwrap();
    let status = consumer.status().unwrap();
    assert_eq!(
        status.into_iter().collect::<Vec<_>>(),
        vec![(2, false), (3, false)]
    );
}

#[test]
fn a_second_reader_does_not_block_reclamation() {
    let (repo, mut writer) = mem_log(Options::with_capacity(10));
    fill(&mut writer, 25);

    // A straggler that saved without reaching segment 1's end.
    let mut straggler = reader(&repo, "straggler");
    let record = straggler.next_record().unwrap().unwrap();
    straggler.ack(&record).unwrap();
    straggler.save().unwrap();

    let mut consumer = reader(&repo, "up-to-date");
    for _ in 0..11 {
        let record = consumer.next_record().unwrap().unwrap();
        consumer.ack(&record).unwrap();
    }
    consumer.save().unwrap();

    // One covering checkpoint suffices; intersecting the two status maps
    // before deleting is the deployment's job.
    writer.delete(1).unwrap();
    assert!(matches!(
        straggler.next_record().unwrap_err(),
        Error::Gone { segment: 1 }
    ));
}

#[test]
fn appends_after_reclamation_continue_the_id_sequence() {
    let (repo, mut writer) = mem_log(Options::with_capacity(2));
    fill(&mut writer, 4);

    let mut consumer = reader(&repo, "test");
    for _ in 0..3 {
        let record = consumer.next_record().unwrap().unwrap();
        consumer.ack(&record).unwrap();
    }
    consumer.save().unwrap();
    writer.delete(1).unwrap();

    fill(&mut writer, 2);
    let catalog = repo.catalog().unwrap();
    assert_eq!(catalog.ids().collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(catalog.min(), Some(2));
}

proptest! {
    // Interleaved appends, reads, acks, saves, and reopens deliver every
    // record exactly once.
    #[test]
    fn every_record_is_delivered_exactly_once(
        records in 1usize..120,
        capacity in 1u64..=16,
        save_every in 1usize..10,
        reopen_every in 2usize..12,
    ) {
        let (repo, mut writer) = mem_log(Options::with_capacity(capacity));
        fill(&mut writer, records);

        let mut consumer = reader(&repo, "prop");
        let mut delivered = Vec::new();
        let mut step = 0usize;
        loop {
            let Some(record) = consumer.next_record().unwrap() else {
                break;
            };
            consumer.ack(&record).unwrap();
            delivered.push(String::from_utf8(record.payload).unwrap());
            step += 1;
            if step % save_every == 0 {
                consumer.save().unwrap();
            }
            if step % reopen_every == 0 {
                consumer.save().unwrap();
                consumer = reader(&repo, "prop");
            }
        }
        let expected: Vec<String> = (0..records).map(|i| i.to_string()).collect();
        prop_assert_eq!(delivered, expected);
    }
}
