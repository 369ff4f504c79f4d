//! End-to-end tests for the Cachet protocol core.
//!
//! Everything here drives the public [`Service`] facade the way an embedder
//! would: chunked message delivery and pagination, confidential transfers
//! with conservation checks, the two-phase withdrawal settlement loop,
//! red-packet lifecycles, and snapshot persistence through sled.

use cachet::cipher::{CtHandle, EncryptionContext, PlainEngine, Principal};
use cachet::codec::{self, CodecError};
use cachet::config::CachetConfig;
use cachet::constants;
use cachet::ledger::LedgerError;
use cachet::oracle::{LocalOracle, OracleCallback, OracleKeypair};
use cachet::redpacket::PacketError;
use cachet::service::{QueryKind, Service, ServiceError};
use cachet::storage::{self, SledStorage};
use cachet::Address;

fn addr(label: &[u8]) -> Address {
    Address::from_seed(label)
}

fn in_process() -> Service<PlainEngine, LocalOracle> {
    Service::in_process(&CachetConfig::default(), addr(b"contract"))
}

/// Encrypt an amount the way an external client would: raw little-endian
/// blob plus a binding proof, imported through the service.
fn import_amount(
    svc: &mut Service<PlainEngine, LocalOracle>,
    sender: Address,
    amount: u64,
) -> CtHandle {
    let blob = amount.to_le_bytes();
    let context = EncryptionContext {
        contract: svc.contract(),
        sender,
    };
    let proof = PlainEngine::prove(&blob, &context);
    svc.import_amount(sender, &blob, &proof).unwrap()
}

fn balance_of(svc: &Service<PlainEngine, LocalOracle>, who: Address) -> u64 {
    match svc.get_balance_handle(who) {
        Some(h) => svc.cipher().decrypt(h, Principal::Account(who)).unwrap(),
        None => 0,
    }
}

fn read_message(svc: &Service<PlainEngine, LocalOracle>, id: u32, reader: Address) -> String {
    let chunks: Vec<u64> = svc
        .get_message_handles(id, reader)
        .unwrap()
        .iter()
        .map(|&h| svc.cipher().decrypt(h, Principal::Account(reader)).unwrap())
        .collect();
    codec::decode(&chunks)
}

// ── Messaging ───────────────────────────────────────────────────────────

#[test]
fn message_delivery_and_read_flow() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));

    let text = "hello bob, this message spans several eight-byte chunks";
    let id = svc.send_text(alice, bob, text, 100).unwrap();
    assert_eq!(read_message(&svc, id, bob), text);
    assert_eq!(read_message(&svc, id, alice), text);

    // Only the recipient can flip the read flag.
    assert!(svc.mark_read(id, alice).is_err());
    svc.mark_read(id, bob).unwrap();
    let inbox = svc.query_messages(bob, QueryKind::All).unwrap();
    assert!(inbox[0].is_read);

    // The sender's copy of the flag is the same message.
    let outbox = svc.query_messages(alice, QueryKind::All).unwrap();
    assert!(outbox[0].is_read);
}

#[test]
fn pagination_across_page_boundary() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));

    for i in 0..(constants::PAGE_CAPACITY as u64 + 1) {
        svc.send_text(alice, bob, "ping", i).unwrap();
    }

    let all = svc.query_messages(alice, QueryKind::All).unwrap();
    assert_eq!(all.len(), 51);
    assert_eq!(all[0].id, 50, "newest id first");
    assert_eq!(all[50].id, 0);

    let latest = svc.query_messages(alice, QueryKind::LatestCustom(7)).unwrap();
    let ids: Vec<u32> = latest.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![50, 49, 48, 47, 46, 45, 44]);
}

#[test]
fn latest_on_small_inbox_returns_everything() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    for i in 0..3 {
        svc.send_text(bob, alice, "msg", i).unwrap();
    }
    let latest = svc.query_messages(alice, QueryKind::Latest).unwrap();
    let ids: Vec<u32> = latest.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![2, 1, 0]);
}

#[test]
fn oversized_message_rejected_loudly() {
    let mut svc = in_process();
    let text = "x".repeat(constants::MAX_TEXT_BYTES + 1);
    match svc.send_text(addr(b"alice"), addr(b"bob"), &text, 0) {
        Err(ServiceError::Codec(CodecError::TooLong { len, max })) => {
            assert_eq!(len, constants::MAX_TEXT_BYTES + 1);
            assert_eq!(max, constants::MAX_TEXT_BYTES);
        }
        other => panic!("expected TooLong, got {:?}", other),
    }
    // Nothing was stored.
    assert!(svc.query_messages(addr(b"bob"), QueryKind::All).unwrap().is_empty());
}

#[test]
fn message_content_stays_private_from_third_parties() {
    let mut svc = in_process();
    let (alice, bob, carol) = (addr(b"alice"), addr(b"bob"), addr(b"carol"));
    let id = svc.send_text(alice, bob, "for bob only", 0).unwrap();

    // Carol gets neither the handles nor a decryption.
    assert!(svc.get_message_handles(id, carol).is_err());
    let handle = svc.get_message_chunk(id, 0, bob).unwrap();
    assert!(svc
        .cipher()
        .decrypt(handle, Principal::Account(carol))
        .is_err());
}

// ── Ledger ──────────────────────────────────────────────────────────────

#[test]
fn transfer_conserves_value_in_both_outcomes() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    svc.deposit(alice, 100).unwrap();

    // Covered transfer moves the full amount.
    let amt = import_amount(&mut svc, alice, 60);
    svc.transfer(alice, bob, amt).unwrap();
    assert_eq!(balance_of(&svc, alice), 40);
    assert_eq!(balance_of(&svc, bob), 60);

    // Underfunded transfer succeeds and moves zero.
    let amt = import_amount(&mut svc, alice, 500);
    svc.transfer(alice, bob, amt).unwrap();
    assert_eq!(balance_of(&svc, alice), 40);
    assert_eq!(balance_of(&svc, bob), 60);
    assert_eq!(balance_of(&svc, alice) + balance_of(&svc, bob), 100);
}

#[test]
fn withdrawal_settles_once_and_only_once() {
    let mut svc = in_process();
    let alice = addr(b"alice");
    svc.deposit(alice, 300).unwrap();

    let amt = import_amount(&mut svc, alice, 120);
    let rid = svc.withdraw(alice, amt, 999).unwrap();
    assert_eq!(balance_of(&svc, alice), 180, "debited at request time");
    assert!(!svc.get_withdraw_request(rid).unwrap().processed);

    let cids = svc.oracle_pending_ids();
    assert_eq!(cids.len(), 1);
    let cb = svc.fulfill_decryption(cids[0]).unwrap();
    assert_eq!(cb.plaintext, 120);
    svc.withdraw_callback(&cb).unwrap();
    assert!(svc.get_withdraw_request(rid).unwrap().processed);
    assert_eq!(svc.external_balance(alice), 120);

    // Replaying the identical callback must not pay twice.
    match svc.withdraw_callback(&cb) {
        Err(ServiceError::Ledger(LedgerError::AlreadyProcessed(_))) => {}
        other => panic!("expected AlreadyProcessed, got {:?}", other),
    }
    assert_eq!(svc.external_balance(alice), 120);
}

#[test]
fn forged_callback_rejected() {
    let mut svc = in_process();
    let alice = addr(b"alice");
    svc.deposit(alice, 100).unwrap();
    let amt = import_amount(&mut svc, alice, 50);
    svc.withdraw(alice, amt, 0).unwrap();

    // A rogue signer producing an otherwise well-formed callback.
    let rogue = OracleKeypair::generate();
    let cid = svc.oracle_pending_ids()[0];
    let digest = OracleCallback::digest(cid, 50);
    let forged = OracleCallback {
        correlation_id: cid,
        plaintext: 50,
        signatures: vec![rogue.sign(&digest)],
    };
    match svc.withdraw_callback(&forged) {
        Err(ServiceError::Ledger(LedgerError::SignatureInvalid)) => {}
        other => panic!("expected SignatureInvalid, got {:?}", other),
    }
    assert_eq!(svc.external_balance(alice), 0);

    // The genuine callback still settles afterwards.
    let cb = svc.fulfill_decryption(cid).unwrap();
    svc.withdraw_callback(&cb).unwrap();
    assert_eq!(svc.external_balance(alice), 50);
}

#[test]
fn tampered_plaintext_fails_signature_check() {
    let mut svc = in_process();
    let alice = addr(b"alice");
    svc.deposit(alice, 100).unwrap();
    let amt = import_amount(&mut svc, alice, 30);
    svc.withdraw(alice, amt, 0).unwrap();

    let cid = svc.oracle_pending_ids()[0];
    let mut cb = svc.fulfill_decryption(cid).unwrap();
    cb.plaintext = 999;
    match svc.withdraw_callback(&cb) {
        Err(ServiceError::Ledger(LedgerError::SignatureInvalid)) => {}
        other => panic!("expected SignatureInvalid, got {:?}", other),
    }
}

#[test]
fn withdrawal_request_listing_per_user() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    svc.deposit(alice, 100).unwrap();
    svc.deposit(bob, 100).unwrap();

    let a1 = import_amount(&mut svc, alice, 10);
    svc.withdraw(alice, a1, 1).unwrap();
    let b1 = import_amount(&mut svc, bob, 20);
    svc.withdraw(bob, b1, 2).unwrap();
    let a2 = import_amount(&mut svc, alice, 30);
    svc.withdraw(alice, a2, 3).unwrap();

    assert_eq!(svc.get_user_withdraw_requests(alice), vec![0, 2]);
    assert_eq!(svc.get_user_withdraw_requests(bob), vec![1]);
    let info = svc.get_withdraw_request(1).unwrap();
    assert_eq!(info.owner, bob);
    assert_eq!(info.timestamp, 2);
}

// ── Red packets ─────────────────────────────────────────────────────────

#[test]
fn red_packet_claim_before_expiry() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    svc.deposit(alice, 100).unwrap();

    let amt = import_amount(&mut svc, alice, 25);
    let id = svc.create_red_packet(alice, bob, amt, 1_000).unwrap();
    assert_eq!(balance_of(&svc, alice), 75, "escrowed at creation");

    // Only the recipient may claim, and only before expiry.
    assert!(matches!(
        svc.claim_red_packet(addr(b"carol"), id, 1_001),
        Err(ServiceError::Packet(PacketError::AccessDenied))
    ));
    svc.claim_red_packet(bob, id, 1_001).unwrap();
    assert_eq!(balance_of(&svc, bob), 25);
    assert!(svc.get_red_packet(id).unwrap().claimed);

    // The claimed flag flips exactly once.
    assert!(matches!(
        svc.claim_red_packet(bob, id, 1_002),
        Err(ServiceError::Packet(PacketError::AlreadyProcessed(_)))
    ));
    assert_eq!(balance_of(&svc, alice) + balance_of(&svc, bob), 100);
}

#[test]
fn red_packet_reclaim_after_expiry() {
    let mut svc = in_process();
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    svc.deposit(alice, 100).unwrap();

    let amt = import_amount(&mut svc, alice, 25);
    let id = svc.create_red_packet(alice, bob, amt, 1_000).unwrap();
    let expire = svc.get_red_packet(id).unwrap().expire_time;
    assert_eq!(expire, 1_000 + constants::RED_PACKET_LIFETIME_SECS);

    // Reclaim is only available after expiry, claim only before it.
    assert!(matches!(
        svc.reclaim_red_packet(alice, id, expire),
        Err(ServiceError::Packet(PacketError::NotYetExpired { .. }))
    ));
    assert!(matches!(
        svc.claim_red_packet(bob, id, expire + 1),
        Err(ServiceError::Packet(PacketError::Expired { .. }))
    ));

    svc.reclaim_red_packet(alice, id, expire + 1).unwrap();
    assert_eq!(balance_of(&svc, alice), 100);
    assert_eq!(balance_of(&svc, bob), 0);

    // A reclaimed packet can no longer be claimed.
    assert!(matches!(
        svc.claim_red_packet(bob, id, expire),
        Err(ServiceError::Packet(PacketError::AlreadyProcessed(_)))
    ));
}

#[test]
fn red_packet_amount_visible_to_parties_only() {
    let mut svc = in_process();
    let (alice, bob, carol) = (addr(b"alice"), addr(b"bob"), addr(b"carol"));
    svc.deposit(alice, 100).unwrap();
    let amt = import_amount(&mut svc, alice, 10);
    let id = svc.create_red_packet(alice, bob, amt, 0).unwrap();

    let h = svc.get_red_packet_amount_handle(id, bob).unwrap();
    assert_eq!(svc.cipher().decrypt(h, Principal::Account(bob)).unwrap(), 10);
    assert!(svc.get_red_packet_amount_handle(id, carol).is_err());
}

// ── Persistence ─────────────────────────────────────────────────────────

#[test]
fn sled_round_trip_restores_full_state() {
    let dir = tempfile::tempdir().unwrap();
    let contract = addr(b"contract");
    let (alice, bob) = (addr(b"alice"), addr(b"bob"));
    let config = CachetConfig::default();

    let msg_id;
    {
        let mut svc = Service::in_process(&config, contract);
        svc.deposit(alice, 200).unwrap();
        let amt = import_amount(&mut svc, alice, 80);
        svc.transfer(alice, bob, amt).unwrap();
        msg_id = svc.send_text(alice, bob, "survives a restart", 7).unwrap();

        let db = SledStorage::open(dir.path()).unwrap();
        storage::save_snapshot(&db, &svc.snapshot()).unwrap();
        storage::save_cipher(&db, svc.cipher()).unwrap();
    }

    let db = SledStorage::open(dir.path()).unwrap();
    let snapshot = storage::load_snapshot(&db).unwrap().expect("snapshot saved");
    let cipher = storage::load_cipher(&db).unwrap().expect("cipher saved");

    // Restart with fresh oracle keys; protocol state carries over.
    let oracle = LocalOracle::single();
    let signers = oracle.signer_set(config.oracle.signer_threshold);
    let mut svc = Service::from_snapshot(snapshot, contract, cipher, oracle, signers);

    assert_eq!(balance_of(&svc, alice), 120);
    assert_eq!(balance_of(&svc, bob), 80);
    assert_eq!(read_message(&svc, msg_id, bob), "survives a restart");

    // The restored service is fully live, including new withdrawals signed
    // by the new oracle.
    let amt = import_amount(&mut svc, bob, 80);
    svc.withdraw(bob, amt, 8).unwrap();
    let cid = svc.oracle_pending_ids()[0];
    let cb = svc.fulfill_decryption(cid).unwrap();
    svc.withdraw_callback(&cb).unwrap();
    assert_eq!(svc.external_balance(bob), 80);
    assert_eq!(balance_of(&svc, bob), 0);
}
