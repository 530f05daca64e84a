use framebus_frame::{AudioFormat, FrameRecord, ImageFormat, StreamFormat};
use framebus_publish::{FrameProducer, TestPattern};

// ─── Latency summary ────────────────────────────────────────────────────────

/// Publish-to-receive latencies of one run, in nanoseconds.
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub frames: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
    pub mean_ns: f64,
}

impl LatencySummary {
    /// `None` when no frame made it through.
    pub fn from_samples(mut latencies: Vec<u64>) -> Option<Self> {
        let (&min, &max) = (latencies.iter().min()?, latencies.iter().max()?);
        latencies.sort_unstable();
        let total: u128 = latencies.iter().map(|&ns| u128::from(ns)).sum();
        Some(Self {
            frames: latencies.len(),
            min,
            p50: nearest_rank(&latencies, 500),
            p90: nearest_rank(&latencies, 900),
            p99: nearest_rank(&latencies, 990),
            p999: nearest_rank(&latencies, 999),
            max,
            mean_ns: total as f64 / latencies.len() as f64,
        })
    }
}

/// Smallest sample with at least `per_mille` of the run at or below it.
fn nearest_rank(sorted: &[u64], per_mille: usize) -> u64 {
    let rank = (sorted.len() * per_mille).div_ceil(1000).max(1);
    sorted[rank - 1]
}

// ─── Helpers ────────────────────────────────────────────────────────────────

pub fn temp_shm_path(label: &str) -> String {
    let pid = std::process::id();
    format!("/tmp/framebus_bench_{label}_{pid}")
}

/// 720p 4:2:2 with stereo audio at 50 fps.
pub fn bench_format() -> StreamFormat {
    StreamFormat {
        image_format: ImageFormat::Yuv422,
        width: 1280,
        height: 720,
        audio_format: AudioFormat::S16,
        frequency: 48_000,
        channels: 2,
        samples: 960,
        frame_rate_num: 50,
        frame_rate_den: 1,
    }
}

pub fn make_frame(format: StreamFormat, n: u32) -> FrameRecord {
    TestPattern::new(format)
        .produce(n)
        .expect("test pattern matches its own format")
}

/// Writes the current monotonic time into the first image bytes.
pub fn stamp(record: &FrameRecord) -> FrameRecord {
    let mut image = record.image().to_vec();
    image[..8].copy_from_slice(&mono_now_ns().to_ne_bytes());
    FrameRecord::new(
        record.frame_number(),
        &record.stream_format().expect("valid header"),
        image,
        record.audio().to_vec(),
    )
    .expect("sizes unchanged")
}

pub fn read_stamp(record: &FrameRecord) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&record.image()[..8]);
    u64::from_ne_bytes(b)
}

#[inline(always)]
pub fn mono_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn format_ns(ns: f64) -> String {
    let abs = ns.abs();
    if abs >= 1_000_000.0 {
        format!("{:.1} ms", ns / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1} us", ns / 1_000.0)
    } else {
        format!("{:.0} ns", ns)
    }
}

pub fn print_table_header() {
    println!(
        "  {:<30} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "Path", "min", "p50", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(96));
}

pub fn print_result_row(name: &str, s: &LatencySummary) {
    println!(
        "  {:<30} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        name,
        format_ns(s.min as f64),
        format_ns(s.p50 as f64),
        format_ns(s.p90 as f64),
        format_ns(s.p99 as f64),
        format_ns(s.p999 as f64),
        format_ns(s.max as f64),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_ranks_latencies() {
        let s = LatencySummary::from_samples((1..=1000).rev().collect()).unwrap();
        assert_eq!(
            (s.min, s.p50, s.p90, s.p99, s.p999, s.max),
            (1, 500, 900, 990, 999, 1000)
        );
        assert_eq!(s.frames, 1000);
        assert!((s.mean_ns - 500.5).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_of_few_frames() {
        assert!(LatencySummary::from_samples(Vec::new()).is_none());
        let one = LatencySummary::from_samples(vec![42]).unwrap();
        assert_eq!((one.p50, one.p999, one.max), (42, 42, 42));
        let two = LatencySummary::from_samples(vec![7, 3]).unwrap();
        assert_eq!((two.p50, two.p90), (3, 7));
    }

    #[test]
    fn stamp_survives_the_record() {
        let f = StreamFormat {
            width: 16,
            height: 16,
            ..bench_format()
        };
        let r = stamp(&make_frame(f, 3));
        assert!(read_stamp(&r) > 0);
        assert_eq!(r.frame_number(), 3);
    }
}
