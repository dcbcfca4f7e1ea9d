mod common;

use common::*;
use inbox_pipeline::{
    Content, DependencyKey, EarlyReceipt, EnvelopeSource, ReceiptKind, StorageAdapter, WriteScope,
};
use std::sync::Arc;

#[test]
fn early_receipt_round_trip_replays_once_and_clears() {
    let p = pipeline();
    let key = DependencyKey::new(1000, account(LOCAL_TAG));
    let receipt = EarlyReceipt::OutgoingMessageRead {
        sender: address(2),
        at: 1234,
    };

    let storage: Arc<dyn StorageAdapter> = p.storage.clone();
    let tx = WriteScope::new(storage.clone());
    p.processor
        .early_buffer()
        .record_early_receipt(receipt.clone(), key, &tx)
        .unwrap();
    tx.commit().unwrap();

    // Target message materializes; replay everything parked for it.
    p.interactions.insert_message(1000, account(LOCAL_TAG));
    let tx = WriteScope::new(storage.clone());
    let mut replayed = Vec::new();
    let count = p
        .processor
        .apply_pending_messages(key, &tx, &mut |receipt| replayed.push(receipt))
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(count, 1);
    assert_eq!(replayed, vec![receipt]);
    assert!(p.storage.list("early/").unwrap().is_empty());

    // A second application replays nothing.
    let tx = WriteScope::new(storage);
    let count = p
        .processor
        .apply_pending_messages(key, &tx, &mut |_| panic!("nothing should replay"))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn reaction_before_target_is_buffered_then_replayed() {
    let p = pipeline();

    let reaction = Content::Reaction {
        emoji: "+1".to_string(),
        target_sent_timestamp: 5000,
        target_author: account(1),
        remove: false,
        group: None,
    };
    let completion = p.processor.process_encrypted_envelope(
        envelope_for(Some("react"), 5001, 2, &reaction),
        10,
        EnvelopeSource::Websocket,
    );
    assert!(completion.wait().is_none());

    // Reaction handled nowhere yet; it is parked under its target key.
    assert!(p.handler.handled_descriptions().is_empty());
    assert_eq!(p.storage.list("early/").unwrap().len(), 1);

    // The target message arrives and materializes.
    let completion = p.processor.process_encrypted_envelope(
        envelope_for(Some("target"), 5000, 1, &message_content("original")),
        11,
        EnvelopeSource::Websocket,
    );
    assert!(completion.wait().is_none());

    let storage: Arc<dyn StorageAdapter> = p.storage.clone();
    let tx = WriteScope::new(storage);
    let key = DependencyKey::new(5000, account(1));
    p.processor
        .apply_pending_messages(key, &tx, &mut |_| {})
        .unwrap();
    tx.commit().unwrap();

    p.processor.wait_until_drained();
    let descriptions = p.handler.handled_descriptions();
    assert_eq!(descriptions, vec!["message", "reaction"]);
    assert!(p.storage.list("early/").unwrap().is_empty());
}

#[test]
fn delivery_receipt_for_unsent_message_is_parked() {
    let p = pipeline();

    // A delivery receipt for timestamp 42 arrives, but no sent message
    // with that timestamp exists yet (linked-device race).
    let completion = p.processor.process_encrypted_envelope(
        envelope_for(
            Some("early-delivery"),
            600,
            3,
            &Content::Receipt {
                kind: ReceiptKind::Delivery,
                timestamps: vec![42],
            },
        ),
        10,
        EnvelopeSource::Websocket,
    );
    assert!(completion.wait().is_none());
    assert!(p.interactions.recorded_deliveries().is_empty());

    // The sent message materializes; the parked receipt replays.
    p.interactions.insert_message(42, account(LOCAL_TAG));
    let storage: Arc<dyn StorageAdapter> = p.storage.clone();
    let tx = WriteScope::new(storage);
    let mut replayed = Vec::new();
    p.processor
        .apply_pending_messages(
            DependencyKey::new(42, account(LOCAL_TAG)),
            &tx,
            &mut |receipt| replayed.push(receipt),
        )
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(replayed.len(), 1);
    assert!(matches!(
        replayed[0],
        EarlyReceipt::OutgoingMessageDelivered { sender, .. } if sender == address(3)
    ));
}
