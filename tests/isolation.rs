//! Index namespaces, access grants and concurrent use of one vault.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use lmkvault::codec::Padding;
use lmkvault::engine::symm::SymmParams;
use lmkvault::types::{EccKeyRef, RsaKeyRef, SymmKeyRef};
use lmkvault::{
    EccCurve, HashAlg, HsmConfig, HsmError, KeyType, RsaPadding, StoreAt, SymmAlg, SymmOp,
};
use test_log::test;

#[test]
fn namespaces_do_not_collide() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    s.generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(5).label("same")))
        .unwrap();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(5).label("same").password(b"pw"))
        .unwrap();
    s.generate_rsa_key(1024, 65537, StoreAt::index(5).label("same").password(b"pw"))
        .unwrap();

    for key_type in KeyType::ALL {
        assert_eq!(s.occupied(key_type), vec![5]);
    }
    s.destroy_key(KeyType::Rsa, 5).unwrap();
    assert!(s.occupied(KeyType::Rsa).is_empty());
    assert_eq!(s.occupied(KeyType::Ecc), vec![5]);
    assert_eq!(s.occupied(KeyType::Symmetric), vec![5]);
    assert_eq!(s.index_by_label(KeyType::Ecc, "same").unwrap(), 5);
    assert_eq!(
        s.index_by_label(KeyType::Rsa, "same"),
        Err(HsmError::KeyNotFound)
    );
}

#[test]
fn occupied_slot_needs_cover() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    let first = s
        .generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(1)))
        .unwrap();
    assert_eq!(
        s.generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(1))),
        Err(HsmError::KeyExists)
    );
    assert_eq!(s.symm_kcv(SymmKeyRef::Index(1)).unwrap(), first.kcv);

    let second = s
        .generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(1).cover()))
        .unwrap();
    assert_eq!(s.symm_kcv(SymmKeyRef::Index(1)).unwrap(), second.kcv);
}

#[test]
fn private_operations_need_a_live_grant() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    s.generate_rsa_key(1024, 65537, StoreAt::index(2).password(b"open sesame"))
        .unwrap();
    let sign = || s.rsa_sign(RsaKeyRef::Index(2), &RsaPadding::Pkcs1v15, HashAlg::Sha256, b"m");

    assert_eq!(sign(), Err(HsmError::AccessDenied));
    assert_eq!(
        s.acquire_access(KeyType::Rsa, 2, b"wrong"),
        Err(HsmError::WrongPassword)
    );
    assert_eq!(sign(), Err(HsmError::AccessDenied));

    s.acquire_access(KeyType::Rsa, 2, b"open sesame").unwrap();
    assert!(sign().is_ok());

    s.release_access(KeyType::Rsa, 2);
    assert_eq!(sign(), Err(HsmError::AccessDenied));
    // Releasing twice is harmless.
    s.release_access(KeyType::Rsa, 2);
}

#[test]
fn grants_belong_to_one_session() {
    let hsm = common::hsm();
    let owner = hsm.open_session();
    let other = hsm.open_session();
    owner
        .generate_ecc_key(EccCurve::NistP256, StoreAt::index(1).password(b"pw"))
        .unwrap();
    owner.acquire_access(KeyType::Ecc, 1, b"pw").unwrap();

    let digest = [0x11u8; 32];
    assert!(owner.ecc_sign_hash(EccKeyRef::Index(1), &digest).is_ok());
    assert_eq!(
        other.ecc_sign_hash(EccKeyRef::Index(1), &digest),
        Err(HsmError::AccessDenied)
    );

    owner.close();
    let reopened = hsm.open_session();
    assert_eq!(
        reopened.ecc_sign_hash(EccKeyRef::Index(1), &digest),
        Err(HsmError::AccessDenied)
    );
}

#[test]
fn expired_grants_are_refused() {
    let hsm = common::hsm_with(HsmConfig {
        credential_iterations: 64,
        grant_ttl_secs: Some(0),
        ..HsmConfig::default()
    });
    let s = hsm.open_session();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(1).password(b"pw"))
        .unwrap();
    s.acquire_access(KeyType::Ecc, 1, b"pw").unwrap();
    assert_eq!(
        s.ecc_sign_hash(EccKeyRef::Index(1), &[0u8; 32]),
        Err(HsmError::AccessDenied)
    );
}

#[test]
fn repeated_wrong_passwords_lock_the_key_for_that_session() {
    let hsm = common::hsm_with(HsmConfig {
        credential_iterations: 64,
        max_password_attempts: 2,
        ..HsmConfig::default()
    });
    let s = hsm.open_session();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(1).password(b"pw"))
        .unwrap();
    for _ in 0..2 {
        assert_eq!(
            s.acquire_access(KeyType::Ecc, 1, b"guess"),
            Err(HsmError::WrongPassword)
        );
    }
    assert_eq!(
        s.acquire_access(KeyType::Ecc, 1, b"pw"),
        Err(HsmError::AccessDenied)
    );
    assert!(hsm.open_session().acquire_access(KeyType::Ecc, 1, b"pw").is_ok());
}

#[test]
fn destroying_a_key_drops_its_grants() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(3).password(b"pw"))
        .unwrap();
    s.acquire_access(KeyType::Ecc, 3, b"pw").unwrap();
    s.destroy_key(KeyType::Ecc, 3).unwrap();
    s.generate_ecc_key(EccCurve::NistP256, StoreAt::index(3).password(b"new"))
        .unwrap();
    assert_eq!(
        s.ecc_sign_hash(EccKeyRef::Index(3), &[0u8; 32]),
        Err(HsmError::AccessDenied)
    );
    assert_eq!(s.destroy_key(KeyType::Symmetric, 3), Err(HsmError::KeyNotFound));
}

#[test]
fn grants_do_not_carry_over_to_a_replacement_key() {
    let hsm = common::hsm_with(HsmConfig {
        credential_iterations: 64,
        max_index: 64,
        max_password_attempts: u32::MAX,
        ..HsmConfig::default()
    });
    for round in 0..8 {
        let alice = hsm.open_session();
        let bob = hsm.open_session();
        let index = round + 1;
        alice
            .generate_ecc_key(EccCurve::NistP256, StoreAt::index(index).password(b"old"))
            .unwrap();

        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    let _ = alice.acquire_access(KeyType::Ecc, index, b"old");
                }
            });
            bob.destroy_key(KeyType::Ecc, index).unwrap();
            bob.generate_ecc_key(
                EccCurve::NistP256,
                StoreAt::index(index).password(b"bob-only"),
            )
            .unwrap();
            stop.store(true, Ordering::Release);
        });

        // Whatever grant Alice ended up with was checked against "old".
        assert_eq!(
            alice.ecc_sign_hash(EccKeyRef::Index(index), &[0u8; 32]),
            Err(HsmError::AccessDenied)
        );
        bob.acquire_access(KeyType::Ecc, index, b"bob-only").unwrap();
        assert!(bob.ecc_sign_hash(EccKeyRef::Index(index), &[0u8; 32]).is_ok());
    }
}

#[test]
fn streaming_contexts_refuse_other_sessions() {
    let hsm = common::hsm();
    let alice = hsm.open_session();
    let bob = hsm.open_session();
    let key = [1u8; 16];
    let mut ctx = alice
        .aead_init(
            SymmKeyRef::Plain {
                alg: SymmAlg::Aes128,
                key: &key,
            },
            lmkvault::engine::aead::AeadMode::Gcm,
            SymmOp::Encrypt,
            &[0u8; 12],
            b"",
        )
        .unwrap();
    assert_eq!(bob.aead_update(&mut ctx, b"data"), Err(HsmError::InvalidContextState));
    assert_eq!(ctx.buffered(), 0);
    alice.aead_update(&mut ctx, b"data").unwrap();
    assert!(bob.aead_finish_encrypt(ctx).is_err());
}

#[test]
fn labels_and_metadata() {
    let hsm = common::hsm();
    let s = hsm.open_session();
    let public = s
        .generate_rsa_key(1024, 65537, StoreAt::index(8).label("issuer").password(b"pw"))
        .unwrap();
    let info = s.key_info(KeyType::Rsa, 8).unwrap();
    assert_eq!(info.bits, 1024);
    assert_eq!(info.exponent.as_deref(), Some(&[0x01, 0x00, 0x01][..]));
    assert!(info.has_password);
    assert_eq!(info.label, "issuer");
    assert_eq!(
        s.rsa_public_from_private(RsaKeyRef::Index(8)).unwrap(),
        public
    );

    s.set_label(KeyType::Rsa, 8, "issuer-2026").unwrap();
    assert_eq!(s.label(KeyType::Rsa, 8).unwrap(), "issuer-2026");
    assert!(matches!(
        s.set_label(KeyType::Rsa, 8, &"x".repeat(500)),
        Err(HsmError::InvalidParameter(_))
    ));
    assert!(matches!(
        s.generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(0))),
        Err(HsmError::InvalidParameter(_))
    ));
}

#[test]
fn concurrent_destroy_and_operate_resolve_cleanly() {
    let hsm = common::hsm();
    let setup = hsm.open_session();
    let wrapped = setup
        .generate_symm_key(SymmAlg::Aes256, Some(StoreAt::index(1)))
        .unwrap();
    let expected = setup
        .operate(
            SymmKeyRef::Lmk(&wrapped.ciphertext),
            &SymmParams::ecb(SymmOp::Encrypt, Padding::None),
            &[0x5Au8; 32],
        )
        .unwrap()
        .data;

    let done = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let hsm = hsm.clone();
            let done = Arc::clone(&done);
            let expected = expected.clone();
            thread::spawn(move || {
                let s = hsm.open_session();
                let mut seen_missing = false;
                while !done.load(Ordering::Acquire) || !seen_missing {
                    match s.operate(
                        SymmKeyRef::Index(1),
                        &SymmParams::ecb(SymmOp::Encrypt, Padding::None),
                        &[0x5Au8; 32],
                    ) {
                        Ok(out) => assert_eq!(out.data, expected),
                        Err(HsmError::KeyNotFound) => seen_missing = true,
                        Err(other) => panic!("unexpected error {other:?}"),
                    }
                }
            })
        })
        .collect();

    thread::sleep(std::time::Duration::from_millis(20));
    setup.destroy_key(KeyType::Symmetric, 1).unwrap();
    done.store(true, Ordering::Release);
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn sessions_can_be_shared_across_threads() {
    let hsm = common::hsm();
    let s = Arc::new(hsm.open_session());
    s.generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(2))).unwrap();
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let s = Arc::clone(&s);
            thread::spawn(move || s.cmac(SymmKeyRef::Index(2), &[i; 40]).unwrap())
        })
        .collect();
    let macs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (i, mac) in macs.iter().enumerate() {
        assert_eq!(mac, &s.cmac(SymmKeyRef::Index(2), &[i as u8; 40]).unwrap());
    }
}
