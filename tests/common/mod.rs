#![allow(dead_code)]

use lmkvault::{Hsm, HsmConfig, MasterKeyDomain};

/// A device with a fixed LMK and cheap password hashing.
pub fn hsm() -> Hsm {
    hsm_with(HsmConfig {
        credential_iterations: 64,
        max_index: 64,
        ..HsmConfig::default()
    })
}

pub fn hsm_with(config: HsmConfig) -> Hsm {
    let lmk = MasterKeyDomain::from_bytes([0x5Au8; 32]).unwrap();
    Hsm::new(config, lmk).unwrap()
}
