#![forbid(unsafe_code)]

// Human-facing console output: banner, progress line, final summary

use crate::config::RunConfig;
use crate::metrics::RunSummary;

pub fn print_banner(config: &RunConfig) {
    println!("\n=== ASR Stress Test ===");
    println!("Server: {}", config.server_url);
    println!("Connections: {}", config.connections);
    println!("Audio files per connection: {}", config.audio_per_connection);
    println!("Audio directory: {}", config.audio_dir.display());
    println!("Chunk size: {} bytes", config.streamer.chunk_size);
    if let Some(seed) = config.seed {
        println!("Seed: {}", seed);
    }
    println!("=======================\n");
}

pub fn print_progress(completed: usize, total: usize) {
    let pct = if total > 0 {
        completed as f64 / total as f64 * 100.0
    } else {
        100.0
    };
    println!("Progress: {}/{} ({:.1}%)", completed, total, pct);
}

pub fn print_summary(summary: &RunSummary) {
    println!("\n=== Stress Test Summary ===");
    println!("Total Time: {:.2} s", summary.total_time_ms as f64 / 1000.0);

    println!("\nConnections:");
    println!("  Total: {}", summary.total_connections);
    println!("  Successful: {}", summary.successful_connections);
    println!("  Failed: {}", summary.failed_connections);
    println!("  Success Rate: {:.1}%", summary.connection_success_rate * 100.0);
    println!(
        "  Average Duration: {:.2} s",
        summary.average_connection_duration_ms as f64 / 1000.0
    );

    println!("\nRecognition:");
    println!("  Audio Files Sent: {}", summary.total_audio_files);
    println!("  Recognized: {}", summary.successful_recognitions);
    println!("  Failed: {}", summary.failed_recognitions);
    println!("  Timeouts: {}", summary.timeouts);
    println!("  Recognition Rate: {:.1}%", summary.recognition_rate * 100.0);
    println!(
        "  Mean Per-Connection Success: {:.1}%",
        summary.average_connection_success_rate * 100.0
    );

    println!("\nThroughput:");
    println!("  Audio Files/s: {:.2}", summary.audio_files_per_sec);
    println!("  Recognitions/s: {:.2}", summary.recognitions_per_sec);

    let rt = &summary.response_times;
    if rt.count > 0 {
        println!("\nResponse Time (n={}):", rt.count);
        println!("  Average: {} ms", rt.avg_ms);
        println!("  Median: {} ms", rt.p50_ms);
        println!("  Min: {} ms", rt.min_ms);
        println!("  Max: {} ms", rt.max_ms);
        println!("  P95: {} ms", rt.p95_ms);
        println!("  P99: {} ms", rt.p99_ms);
    }

    let res = &summary.resources;
    if res.samples > 0 {
        println!("\nHost Resources ({} samples):", res.samples);
        println!(
            "  CPU: avg {:.1}%, peak {:.1}%",
            res.avg_cpu_percent, res.peak_cpu_percent
        );
        println!(
            "  Memory: avg {:.1}%, peak {:.1}%",
            res.avg_memory_percent, res.peak_memory_percent
        );
        println!(
            "  Network: {:.2} MB total, {:.1} KB avg per sample",
            res.total_network_bytes as f64 / 1_000_000.0,
            res.avg_network_delta_bytes / 1000.0
        );
    }

    if !summary.recognitions_by_file.is_empty() {
        println!("\nRecognitions by File:");
        for (file, texts) in &summary.recognitions_by_file {
            println!("  {} ({} results)", file, texts.len());
            if let Some(sample) = texts.first() {
                println!("    e.g. \"{}\"", sample);
            }
        }
    }

    if !summary.error_distribution.is_empty() {
        println!("\nErrors ({} total):", summary.errors.len());
        for entry in &summary.error_distribution {
            println!("  {}x {}", entry.count, entry.message);
        }
    }
    println!("===========================\n");
}
