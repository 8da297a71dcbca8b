//! Symmetric operations from several threads while another thread keeps
//! replacing keys in the same namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lmkvault::codec::Padding;
use lmkvault::engine::symm::SymmParams;
use lmkvault::types::SymmKeyRef;
use lmkvault::{Hsm, HsmConfig, MasterKeyDomain, StoreAt, SymmAlg, SymmOp};

const KEYS: u32 = 32;

fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("vault_contention");

    let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate().unwrap()).unwrap();
    let setup = hsm.open_session();
    for index in 1..=KEYS {
        setup
            .generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(index)))
            .unwrap();
    }

    for writers in [0usize, 1, 4] {
        let stop = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let hsm = hsm.clone();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let session = hsm.open_session();
                    // Writers churn the upper half; readers stay in the lower half.
                    let mut index = KEYS / 2 + 1 + w as u32;
                    while !stop.load(Ordering::Relaxed) {
                        session
                            .generate_symm_key(SymmAlg::Aes128, Some(StoreAt::index(index).cover()))
                            .unwrap();
                        index = if index == KEYS { KEYS / 2 + 1 } else { index + 1 };
                    }
                })
            })
            .collect();

        let session = hsm.open_session();
        let params = SymmParams::ecb(SymmOp::Encrypt, Padding::None);
        let block = [0u8; 16];
        let mut index = 1;
        group.bench_with_input(BenchmarkId::new("operate", writers), &writers, |b, _| {
            b.iter(|| {
                index = index % (KEYS / 2) + 1;
                session
                    .operate(SymmKeyRef::Index(black_box(index)), &params, &block)
                    .unwrap()
            });
        });

        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_contention);
criterion_main!(benches);
