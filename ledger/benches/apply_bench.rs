// Apply-path benchmarks for the Tally ledger.
//
// Covers validation alone, a committed debit on a device ledger, an
// idempotent replay, and the authority judging sync batches of various sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;

use tally_ledger::config::LedgerLimits;
use tally_ledger::sync::SyncRequest;
use tally_ledger::transaction::{validate, SenderFunds};
use tally_ledger::{Authority, DeviceId, LedgerDB, LedgerEngine, Perspective, Transaction};

fn bench_validate(c: &mut Criterion) {
    let limits = LedgerLimits::default();
    let tx = Transaction::new(DeviceId::new("alice"), DeviceId::new("bob"), Decimal::from(200));

    c.bench_function("validate/known_sender", |b| {
        b.iter(|| validate(&tx, &limits, SenderFunds::Known(Decimal::from(1_000)), |_| false));
    });
}

fn bench_apply_debit(c: &mut Criterion) {
    let owner = DeviceId::new("alice");
    let engine = LedgerEngine::new(
        LedgerDB::open_temporary().expect("temp db"),
        Perspective::Device(owner.clone()),
        LedgerLimits::default(),
    );
    engine.ensure_account(&owner).expect("account");

    // Receive first so the debits below never run dry.
    for _ in 0..200 {
        let credit = Transaction::new(DeviceId::new("bob"), owner.clone(), Decimal::from(10_000));
        engine.apply(&credit).expect("credit");
    }

    c.bench_function("apply/device_debit", |b| {
        b.iter(|| {
            let tx = Transaction::new(owner.clone(), DeviceId::new("bob"), Decimal::ONE);
            engine.apply(&tx).expect("debit")
        });
    });
}

fn bench_apply_replay(c: &mut Criterion) {
    let owner = DeviceId::new("alice");
    let engine = LedgerEngine::new(
        LedgerDB::open_temporary().expect("temp db"),
        Perspective::Device(owner.clone()),
        LedgerLimits::default(),
    );
    engine.ensure_account(&owner).expect("account");
    let tx = Transaction::new(owner, DeviceId::new("bob"), Decimal::from(200));
    engine.apply(&tx).expect("first apply");

    c.bench_function("apply/replay", |b| {
        b.iter(|| engine.apply(&tx).expect("replay"));
    });
}

fn bench_authority_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("authority/handle_sync");

    for size in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_with_setup(
                || {
                    let authority = Authority::new(
                        LedgerDB::open_temporary().expect("temp db"),
                        LedgerLimits::default(),
                    );
                    let request = SyncRequest {
                        device_id: DeviceId::new("alice"),
                        transactions: (0..size)
                            .map(|_| {
                                Transaction::new(
                                    DeviceId::new("alice"),
                                    DeviceId::new("bob"),
                                    Decimal::from(10),
                                )
                            })
                            .collect(),
                    };
                    (authority, request)
                },
                |(authority, request)| authority.handle_sync(&request).expect("judged"),
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_validate,
    bench_apply_debit,
    bench_apply_replay,
    bench_authority_batch
);
criterion_main!(benches);
