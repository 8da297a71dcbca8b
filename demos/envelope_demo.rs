//! Minimal example: moving a data key between two parties.
//!
//! A sender wraps a fresh data key for its own RSA key pair, the device
//! re-encrypts that envelope for a receiver's ECC key without exposing the
//! data key, and the receiver imports it into the vault under the LMK.
//! Run with: `cargo run --example envelope_demo`

use lmkvault::audit::FileAuditSink;
use lmkvault::codec::to_hex;
use lmkvault::engine::symm::SymmParams;
use lmkvault::types::{EccKeyRef, EccPublicRef, RsaKeyRef, RsaPublicRef, SymmKeyRef};
use lmkvault::{
    EccCurve, Hsm, HsmConfig, KeyFormat, KeyKind, KeyType, MasterKeyDomain, RsaPadding, StoreAt,
    SymmAlg, SymmMode, SymmOp, Unwrapper, Wrapper,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate()?)?;
    let audit_path = std::env::temp_dir().join("lmkvault_audit.jsonl");
    hsm.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));
    let session = hsm.open_session();

    // Long-term keys for both parties.
    session.generate_rsa_key(2048, 65537, StoreAt::index(1).label("sender").password(b"sender-pw"))?;
    session.generate_ecc_key(
        EccCurve::NistP256,
        StoreAt::index(1).label("receiver").password(b"receiver-pw"),
    )?;
    session.acquire_access(KeyType::Rsa, 1, b"sender-pw")?;
    session.acquire_access(KeyType::Ecc, 1, b"receiver-pw")?;

    // The sender's data key, delivered as an RSA envelope.
    let (data_key, envelope) = session.generate_symm_key_protected(
        SymmAlg::Aes256,
        &Wrapper::RsaPublic {
            key: RsaPublicRef::Index(1),
            padding: RsaPadding::Pkcs1v15,
        },
    )?;
    println!("data key kcv {}", to_hex(&data_key.kcv));

    let iv = [0u8; 16];
    let ciphertext = session.operate(
        SymmKeyRef::Lmk(&data_key.ciphertext),
        &SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Ctr, &iv),
        b"settlement batch 2026-10-17",
    )?;

    // Re-address the envelope to the receiver.
    let moved = session.exchange_envelope(
        &envelope,
        &Unwrapper::RsaPrivate {
            key: RsaKeyRef::Index(1),
            padding: RsaPadding::Pkcs1v15,
        },
        &Wrapper::EccPublic {
            key: EccPublicRef::Index(1),
        },
    )?;

    // The receiver stores the key and decrypts.
    let imported = session.import_wrapped(
        KeyKind::Symmetric(SymmAlg::Aes256),
        &moved,
        &Unwrapper::EccPrivate {
            key: EccKeyRef::Index(1),
        },
        KeyFormat::Raw,
        StoreAt::index(7).label("settlement"),
    )?;
    assert_eq!(imported.kcv, data_key.kcv);

    let plaintext = session.operate(
        SymmKeyRef::Index(7),
        &SymmParams::with_iv(SymmOp::Decrypt, SymmMode::Ctr, &iv),
        &ciphertext.data,
    )?;
    println!("receiver read: {}", String::from_utf8_lossy(&plaintext.data));

    session.close();
    println!("audit log: {}", audit_path.display());
    Ok(())
}
