use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const SLOT: i64 = 1_200_000; // 20 minutes in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("bench@school.edu")
        .password("tutorium");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// First slot boundary at least a day in the future.
fn day_base() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    now - now % SLOT + 24 * 3_600_000
}

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

fn submit_sql(resource: &str, requester: &str, start: i64) -> String {
    format!(
        r#"INSERT INTO bookings (resource, requester, start, "end", location, comment) VALUES ('{resource}', '{requester}', {start}, {}, 'Online', 'bench')"#,
        start + SLOT
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let base = day_base();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .simple_query(&submit_sql(
                "t@school.edu",
                &format!("s{i}@school.edu"),
                base + (i as i64) * SLOT,
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task uses its own school (unique dbname from connect())
            let client = connect(&host, port).await;
            let base = day_base();
            for j in 0..n_per_task {
                client
                    .simple_query(&submit_sql(
                        &format!("lab-{i}"),
                        &format!("s{j}@school.edu"),
                        base + (j as i64) * SLOT,
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Writer tasks: continuously add bookings in the background
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let base = day_base();
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = client
                    .simple_query(&submit_sql(
                        "writer-lab",
                        &format!("w{i}@school.edu"),
                        base + i * SLOT,
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    // Reader tasks: query availability and measure latency. Each reader has
    // its own school with some bookings so the scan is non-trivial.
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let base = day_base();
            for i in 0..50 {
                client
                    .simple_query(&submit_sql(
                        "reader-lab",
                        &format!("r{i}@school.edu"),
                        base + i * SLOT,
                    ))
                    .await
                    .unwrap();
            }

            let window_end = base + 31 * 24 * 3_600_000;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE resource = 'reader-lab' AND start >= {base} AND \"end\" <= {window_end}"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let base = day_base();
            for i in 0..ops_per_conn {
                client
                    .simple_query(&submit_sql(
                        "storm-lab",
                        &format!("c{i}@school.edu"),
                        base + (i as i64) * SLOT,
                    ))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TUTORIUM_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TUTORIUM_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid TUTORIUM_PORT");

    println!("=== tutorium stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own school (unique dbname) to avoid interference

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
