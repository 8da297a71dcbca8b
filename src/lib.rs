//! # lmkvault
//!
//! Master-key protected key vault and cryptographic operation engine.
//!
//! Every stored key lives encrypted under a local master key (the LMK) in
//! one of three index namespaces: symmetric, RSA and ECC. Callers never see
//! plaintext key material unless they ask for it through an explicit
//! transport protector: a key-encryption key, an RSA public key or an ECC
//! public key. Conversions between protectors are atomic and keep the
//! intermediate plaintext inside the crate.
//!
//! ## Layout
//!
//! - [`engine`] holds the stateless primitives: block ciphers and modes,
//!   AEAD, digests, MACs, KDFs, RSA, ECC, ECIES and key agreement.
//! - [`vault`] is the indexed key store, [`access`] the password grant
//!   table and [`audit`] the append-only event log.
//! - [`wrap`] describes protectors and key layouts.
//! - [`session`] is the entry point: an [`Hsm`] owns the state and hands
//!   out [`Session`]s that run every operation.
//!
//! ```no_run
//! use lmkvault::{Hsm, HsmConfig, MasterKeyDomain, StoreAt, SymmAlg};
//!
//! # fn main() -> lmkvault::Result<()> {
//! let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate()?)?;
//! let session = hsm.open_session();
//! let wrapped = session.generate_symm_key(SymmAlg::Sm4, Some(StoreAt::index(1).label("pin")))?;
//! println!("kcv {}", lmkvault::codec::to_hex(&wrapped.kcv));
//! # Ok(())
//! # }
//! ```

pub(crate) mod crypto;

pub mod access;
pub mod audit;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod lmk;
pub mod session;
pub mod types;
pub mod vault;
pub mod wrap;

pub use config::HsmConfig;
pub use error::{HsmError, Result};
pub use lmk::MasterKeyDomain;
pub use session::{ExportedKey, Hsm, KeySource, MacStart, Session, StoreAt};
pub use types::{
    EccCurve, HashAlg, KeyAlgorithm, KeyFormat, KeyType, RsaPadding, SymmAlg, SymmMode, SymmOp,
    WrappedKey,
};
pub use wrap::{Conversion, KekParams, KeyKind, Unwrapper, Wrapper};
