//! Benchmarks for the fingerprint hash and the outbound queue hot paths.
//! Run with: cargo bench

#![allow(unused)]

use chrono::Utc;
use pulse_core::events::{MessageType, Priority, WireMessage};
use pulse_fingerprint::stable_hash;
use pulse_transport::MessageQueue;

fn sample_message(i: u64) -> WireMessage {
    WireMessage {
        id: format!("m-{i}"),
        message_type: MessageType::Event,
        data: Some(serde_json::json!({"n": i})),
        timestamp: Utc::now().timestamp_millis(),
        session_id: "bench-session".into(),
        visitor_id: "bench-visitor".into(),
        priority: Some(Priority::Normal),
        retry: Some(true),
    }
}

fn main() {
    let composite = "2560x1440x24|-120|de-DE|macOS|Firefox|128.0|abcd1234|";

    // Warmup
    for _ in 0..1_000 {
        stable_hash(composite);
    }

    let iterations = 100_000u32;
    let start = std::time::Instant::now();
    for _ in 0..iterations {
        std::hint::black_box(stable_hash(composite));
    }
    let elapsed = start.elapsed();

    println!("=== Fingerprint Hash Benchmark ===");
    println!("Iterations:  {}", iterations);
    println!("Total time:  {:?}", elapsed);
    println!("Per call:    {:?}", elapsed / iterations);

    let iterations = 100_000u64;
    let start = std::time::Instant::now();
    let mut queue = MessageQueue::new(1_000);
    for i in 0..iterations {
        queue.push(sample_message(i), 3);
    }
    let elapsed = start.elapsed();

    println!("=== Queue Push Benchmark ===");
    println!("Iterations:  {}", iterations);
    println!("Total time:  {:?}", elapsed);
    println!("Per push:    {:?}", elapsed / iterations as u32);
    println!("Final size:  {}", queue.len());
}
