//! Hot-path benchmark: validation plus candle folding for one lane.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;

use feed_pipeline::candles::{Interval, SymbolCandles};
use feed_pipeline::config::ValidatorConfig;
use feed_pipeline::events::{IngressRecord, RawRecord};
use feed_pipeline::validation::SymbolValidator;
use types::ids::Symbol;

fn make_records(count: u64) -> Vec<IngressRecord> {
    (1..=count)
        .map(|seq| IngressRecord {
            record: RawRecord {
                symbol: "rb2405".to_string(),
                price: Decimal::from(3500 + (seq % 7) as i64),
                volume: Decimal::from(10),
                bids: vec![],
                asks: vec![],
                sequence: seq,
                event_time: 1_708_123_456_000_000_000 + seq as i64 * 1_000_000,
            },
            source: "bench".to_string(),
            arrival_index: seq,
            arrival_time: 1_708_123_456_000_500_000 + seq as i64 * 1_000_000,
            replay: false,
        })
        .collect()
}

fn bench_validate_and_fold(c: &mut Criterion) {
    let records = make_records(10_000);
    let symbol = Symbol::new("rb2405");
    let config = ValidatorConfig::default();

    c.bench_function("validate_and_fold_10k", |b| {
        b.iter(|| {
            let mut validator = SymbolValidator::new();
            let mut candles = SymbolCandles::new(symbol.clone(), &[Interval::M1], 100);
            for record in &records {
                if let Ok(tick) = validator.validate(&symbol, record, &config) {
                    black_box(candles.process_tick(&tick));
                }
            }
        })
    });
}

criterion_group!(benches, bench_validate_and_fold);
criterion_main!(benches);
