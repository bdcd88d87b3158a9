//! Session run loop and host benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rstchart_core::{DetachedContext, Session, SessionConfig, SessionSignals};
use rstchart_host::{DocumentSource, Host, HostConfig};
use rstchart_model::{Document, Event, InterpreterModel, ModelBuilder};
use rstchart_value::{DataObject, DataValue};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn counter_document() -> serde_json::Value {
    serde_json::json!({
        "data": [{"id": "count", "value": 0}],
        "states": [
            {"id": "counting", "transitions": [
                {"event": "inc", "actions": [
                    {"assign": {"location": "ctx.count", "expr": "ctx.count + 1"}}
                ]},
                {"event": "finish", "target": "done"}
            ]},
            {"id": "done", "kind": "final", "done_data": {"content": {"expr": "ctx.count"}}}
        ]
    })
}

fn toggle_document(regions: usize) -> serde_json::Value {
    let regions: Vec<serde_json::Value> = (0..regions)
        .map(|r| {
            serde_json::json!({"id": format!("r{}", r), "states": [
                {"id": format!("r{}_on", r),
                 "transitions": [{"event": "toggle", "target": format!("r{}_off", r)}]},
                {"id": format!("r{}_off", r),
                 "transitions": [{"event": "toggle", "target": format!("r{}_on", r)}]}
            ]})
        })
        .collect();
    serde_json::json!({
        "states": [
            {"id": "main", "kind": "parallel", "states": regions,
             "transitions": [{"event": "finish", "target": "done"}]},
            {"id": "done", "kind": "final"}
        ]
    })
}

fn build(rt: &Runtime, doc: serde_json::Value) -> Arc<InterpreterModel> {
    let document = Document::from_json(&doc).unwrap();
    let builder = ModelBuilder::default().without_loader();
    Arc::new(rt.block_on(builder.build(&document)).unwrap())
}

/// Runs one session through `events` followed by `finish`.
async fn drive(model: Arc<InterpreterModel>, event: &str, events: usize) -> DataValue {
    let (session, handle) = Session::new(
        "bench",
        model,
        Arc::new(DetachedContext),
        SessionConfig::default(),
        SessionSignals::default(),
    );
    session.spawn();
    for _ in 0..events {
        handle.send(Event::new(event)).await.unwrap();
    }
    handle.send(Event::new("finish")).await.unwrap();
    handle.result().await.unwrap()
}

fn bench_event_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let model = build(&rt, counter_document());
    let mut group = c.benchmark_group("session_events");

    for events in [100usize, 1000] {
        group.throughput(Throughput::Elements(events as u64));
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, &events| {
            b.to_async(&rt)
                .iter(|| async { black_box(drive(model.clone(), "inc", events).await) });
        });
    }

    group.finish();
}

fn bench_parallel_microsteps(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("session_parallel");

    for regions in [4usize, 16] {
        let model = build(&rt, toggle_document(regions));
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::from_parameter(regions), &model, |b, model| {
            b.to_async(&rt)
                .iter(|| async { black_box(drive(model.clone(), "toggle", 100).await) });
        });
    }

    group.finish();
}

fn bench_host_start(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let host = Host::new(HostConfig::default());
    let doc = counter_document();
    let mut group = c.benchmark_group("host");

    group.bench_function("start_and_finish", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = host
                .start(DocumentSource::Json(doc.clone()), DataObject::new())
                .await
                .unwrap();
            host.dispatch(handle.id(), Event::new("finish")).unwrap();
            black_box(handle.result().await.unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_throughput,
    bench_parallel_microsteps,
    bench_host_start
);
criterion_main!(benches);
