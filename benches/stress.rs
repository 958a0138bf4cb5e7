use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ulid::Ulid;

use rentd::engine::{Engine, EngineError};
use rentd::model::{DateRange, Item, Money};
use rentd::notify::NotifyHub;
use rentd::policy::{Principal, Role};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn day_range(start_offset: i64, len_days: i64) -> DateRange {
    let start = Utc::now().date_naive() + chrono::Duration::days(start_offset);
    DateRange::new(start, start + chrono::Duration::days(len_days - 1))
}

async fn setup(engine: &Engine, count: usize) -> Vec<Item> {
    let boss = Principal { id: Ulid::new(), role: Role::Manager };
    let category = engine
        .create_category(&boss, "Bench Fleet", "")
        .await
        .unwrap();
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let item = engine
            .register_item(
                &boss,
                &format!("machine-{i}"),
                "",
                category.id,
                Money::from(50),
                "good",
            )
            .await
            .unwrap();
        items.push(item);
    }
    println!("  created {} items", items.len());
    items
}

/// Sequential single-item bookings on disjoint one-day windows.
async fn phase1_sequential(engine: &Engine, item: &Item) {
    let renter = Principal { id: Ulid::new(), role: Role::Customer };
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let window = day_range(1 + i as i64, 1);
        let t = Instant::now();
        engine.reserve(&renter, item.id, window).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {} bookings in {:.2}s ({:.0} ops/sec)",
        n,
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("sequential reserve", &mut latencies);
}

/// Concurrent workers hammering a small fleet with colliding windows.
async fn phase2_contention(engine: Arc<Engine>, items: &[Item]) {
    let workers = 8;
    let per_worker = 250;
    let start = Instant::now();

    let mut handles = Vec::new();
    for w in 0..workers {
        let engine = engine.clone();
        let item_ids: Vec<Ulid> = items.iter().map(|i| i.id).collect();
        handles.push(tokio::spawn(async move {
            let renter = Principal { id: Ulid::new(), role: Role::Customer };
            let mut booked = 0usize;
            let mut conflicts = 0usize;
            for i in 0..per_worker {
                // Deterministic pseudo-spread: overlap is common but not total.
                let item = item_ids[(w * 7 + i * 13) % item_ids.len()];
                let window = day_range(1 + ((i * 37 + w * 11) % 300) as i64, 3);
                match engine.reserve(&renter, item, window).await {
                    Ok(_) => booked += 1,
                    Err(EngineError::Conflict { .. }) => conflicts += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            (booked, conflicts)
        }));
    }

    let mut booked = 0usize;
    let mut conflicts = 0usize;
    for handle in handles {
        let (b, c) = handle.await.unwrap();
        booked += b;
        conflicts += c;
    }
    let elapsed = start.elapsed();
    let total = workers * per_worker;
    println!(
        "  {} attempts in {:.2}s ({:.0} ops/sec): {} booked, {} conflicts",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64(),
        booked,
        conflicts
    );
}

/// Conflict-rejection latency: every attempt hits an occupied window.
async fn phase3_conflict_path(engine: &Engine, item: &Item) {
    let renter = Principal { id: Ulid::new(), role: Role::Customer };
    let window = day_range(400, 5);
    engine.reserve(&renter, item.id, window).await.unwrap();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        let result = engine
            .reserve(&Principal { id: Ulid::new(), role: Role::Customer }, item.id, window)
            .await;
        assert!(matches!(result, Err(EngineError::Conflict { .. })));
        latencies.push(t.elapsed());
    }
    print_latency("conflict rejection", &mut latencies);
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("rentd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("bench.wal"), Arc::new(NotifyHub::new())).unwrap(),
    );

    println!("rentd stress run (WAL at {})", dir.display());

    println!("phase 0: setup");
    let items = setup(&engine, 10).await;

    println!("phase 1: sequential bookings");
    phase1_sequential(&engine, &items[0]).await;

    println!("phase 2: contended bookings");
    phase2_contention(engine.clone(), &items[1..]).await;

    println!("phase 3: conflict path");
    phase3_conflict_path(&engine, &items[1]).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("done");
}
