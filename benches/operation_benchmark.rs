use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lmkvault::codec::Padding;
use lmkvault::engine::aead::AeadMode;
use lmkvault::engine::symm::SymmParams;
use lmkvault::types::SymmKeyRef;
use lmkvault::{Hsm, HsmConfig, HashAlg, MasterKeyDomain, StoreAt, SymmAlg, SymmMode, SymmOp};

fn benchmark_symmetric(c: &mut Criterion) {
    let mut group = c.benchmark_group("symmetric");

    let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate().unwrap()).unwrap();
    let session = hsm.open_session();
    for (index, alg) in [(1, SymmAlg::Aes128), (2, SymmAlg::Sm4), (3, SymmAlg::Tdes192)] {
        session
            .generate_symm_key(alg, Some(StoreAt::index(index)))
            .unwrap();
    }

    let iv = [0u8; 16];
    let sizes = [("64B", 64), ("1KB", 1024), ("8KB", 8192)];
    for (name, size) in sizes {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        for (index, alg) in [(1, SymmAlg::Aes128), (2, SymmAlg::Sm4), (3, SymmAlg::Tdes192)] {
            let params = SymmParams::with_iv(SymmOp::Encrypt, SymmMode::Cbc, &iv[..alg.block_len()]);
            group.bench_with_input(
                BenchmarkId::new(format!("{alg:?}-cbc"), name),
                &payload,
                |b, payload| {
                    b.iter(|| {
                        session
                            .operate(SymmKeyRef::Index(index), black_box(&params), black_box(payload))
                            .unwrap()
                    });
                },
            );
        }

        group.bench_with_input(BenchmarkId::new("Aes128-gcm", name), &payload, |b, payload| {
            b.iter(|| {
                session
                    .aead_encrypt(
                        SymmKeyRef::Index(1),
                        AeadMode::Gcm,
                        &iv[..12],
                        b"",
                        black_box(payload),
                    )
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn benchmark_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate().unwrap()).unwrap();
    let session = hsm.open_session();
    let payload = vec![0u8; 8192];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for alg in [HashAlg::Sha256, HashAlg::Sm3] {
        group.bench_function(BenchmarkId::from_parameter(format!("{alg:?}")), |b| {
            b.iter(|| session.hash(alg, black_box(&payload)).unwrap());
        });
    }
    group.bench_function("cmac-sm4", |b| {
        let key = [7u8; 16];
        let key = SymmKeyRef::Plain {
            alg: SymmAlg::Sm4,
            key: &key,
        };
        b.iter(|| session.cmac(key, black_box(&payload)).unwrap());
    });
    group.bench_function("ecb-pkcs7-unaligned", |b| {
        let params = SymmParams::ecb(SymmOp::Encrypt, Padding::Pkcs7);
        let key = [7u8; 16];
        let key = SymmKeyRef::Plain {
            alg: SymmAlg::Aes128,
            key: &key,
        };
        b.iter(|| session.operate(key, &params, black_box(&payload[..8191])).unwrap());
    });
    group.finish();
}

fn benchmark_lmk(c: &mut Criterion) {
    let mut group = c.benchmark_group("lmk");

    let hsm = Hsm::new(HsmConfig::default(), MasterKeyDomain::generate().unwrap()).unwrap();
    let session = hsm.open_session();

    group.bench_function("wrap-aes256", |b| {
        b.iter(|| session.generate_symm_key(black_box(SymmAlg::Aes256), None).unwrap());
    });

    let wrapped = session.generate_symm_key(SymmAlg::Aes256, None).unwrap();
    group.bench_function("unwrap-aes256", |b| {
        b.iter(|| {
            session
                .symm_kcv(SymmKeyRef::Lmk(black_box(&wrapped.ciphertext)))
                .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_symmetric, benchmark_digest, benchmark_lmk);
criterion_main!(benches);
