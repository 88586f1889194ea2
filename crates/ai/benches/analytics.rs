use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use fitpulse_ai::{
    ForecastEngine, NaiveBayesModel, OutlierConfig, OutlierFilter, SentimentClassifier, TextNormalizer,
    TrainingSettings,
};
use fitpulse_core::{Period, RevenuePoint, SentimentLabel};

const POSITIVE: &[&str] = &["ótimo treino", "adorei a aula", "instrutor excelente", "academia limpa"];
const NEUTRAL: &[&str] = &["preço normal", "aula razoável", "horário comum", "estrutura média"];
const NEGATIVE: &[&str] = &["esteira quebrada", "vestiário sujo", "atendimento péssimo", "muito lotado"];

fn classifier() -> SentimentClassifier {
    let normalizer = TextNormalizer::new();
    let mut corpus = Vec::new();
    for (texts, label) in [
        (POSITIVE, SentimentLabel::Positive),
        (NEUTRAL, SentimentLabel::Neutral),
        (NEGATIVE, SentimentLabel::Negative),
    ] {
        for text in texts {
            corpus.push((normalizer.normalize(text), label));
        }
    }
    SentimentClassifier::train::<NaiveBayesModel>(normalizer, &corpus, &TrainingSettings::default())
        .expect("bench corpus trains")
}

fn revenue(months: usize) -> Vec<RevenuePoint> {
    let start = Period::new(2015, 1).expect("valid period");
    (0..months)
        .map(|i| {
            let seasonal = ((i % 12) as f64 * std::f64::consts::PI / 6.0).sin() * 800.0;
            RevenuePoint::new(start.add_months(i as i64), 20_000.0 + 150.0 * i as f64 + seasonal)
                .expect("finite amount")
        })
        .collect()
}

fn bench_classification(c: &mut Criterion) {
    let classifier = classifier();
    let mut group = c.benchmark_group("sentiment");
    group.throughput(Throughput::Elements(1));

    group.bench_function("classify_short_feedback", |b| {
        b.iter(|| classifier.classify_text(black_box("O instrutor foi excelente, mas a esteira estava quebrada!")))
    });

    group.finish();
}

fn bench_forecasting(c: &mut Criterion) {
    let filter = OutlierFilter::new(OutlierConfig::default()).expect("default config");
    let engine = ForecastEngine::default();
    let mut group = c.benchmark_group("forecast");

    for months in [24usize, 60, 120].iter() {
        let history = revenue(*months);
        group.throughput(Throughput::Elements(*months as u64));
        group.bench_with_input(BenchmarkId::new("filter_and_forecast", months), &history, |b, history| {
            b.iter(|| {
                let report = filter.apply(history).expect("filter");
                engine.run(&report.points, 6, Utc::now()).expect("forecast")
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classification, bench_forecasting);
criterion_main!(benches);
