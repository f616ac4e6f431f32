use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bothost_supervisor::{
    resolve, BotRecord, BotRepository, BotUpdate, MetricsSnapshot, SqliteRepository,
};

fn bench_resolve(c: &mut Criterion) {
    c.bench_function("resolve_node_bare", |b| {
        b.iter(|| black_box(resolve("Node.js 18", "index.js --verbose").unwrap()));
    });

    c.bench_function("resolve_python_prefixed", |b| {
        b.iter(|| black_box(resolve("Python 3.11", "python3 main.py --token abc").unwrap()));
    });

    c.bench_function("resolve_passthrough", |b| {
        b.iter(|| black_box(resolve("Other", "java -Xmx256m -jar bot.jar --mode prod").unwrap()));
    });
}

async fn setup_repository() -> SqliteRepository {
    let repository = SqliteRepository::new(":memory:").await.unwrap();

    for i in 0..100 {
        let bot = BotRecord::new(
            format!("bot{}", i),
            "Node.js 18",
            "index.js",
            format!("/srv/bots/bot{}/index.js", i),
        );
        repository.upsert_bot(bot).await.unwrap();
    }

    repository
}

fn bench_repository(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let repository = runtime.block_on(setup_repository());
    let snapshot = MetricsSnapshot {
        cpu: 2.5,
        memory: 48 * 1024 * 1024,
        uptime: 120,
    };

    c.bench_function("repository_get_bot", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(repository.get_bot("bot50").await.unwrap())
        });
    });

    c.bench_function("repository_update_metrics", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                repository
                    .update_bot("bot50", BotUpdate::metrics(&snapshot))
                    .await
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, bench_resolve, bench_repository);
criterion_main!(benches);
