use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// tagalloc alloc/free throughput.
fn tagalloc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = tagalloc::tagalloc_malloc(size);
      black_box(ptr);
      tagalloc::tagalloc_free(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Keeps a window of live blocks so releases coalesce with real neighbours
/// instead of always hitting the list head.
fn tagalloc_window(size: usize) {
  let mut window = [std::ptr::null_mut(); 64];
  for i in 0..OPS as usize {
    unsafe {
      let slot = &mut window[i % 64];
      tagalloc::tagalloc_free(*slot);
      *slot = tagalloc::tagalloc_malloc(size + i % 128);
      black_box(*slot);
    }
  }
  for ptr in window {
    unsafe { tagalloc::tagalloc_free(ptr) };
  }
}

fn libc_window(size: usize) {
  let mut window = [std::ptr::null_mut(); 64];
  for i in 0..OPS as usize {
    unsafe {
      let slot = &mut window[i % 64];
      libc::free(*slot);
      *slot = libc::malloc(size + i % 128);
      black_box(*slot);
    }
  }
  for ptr in window {
    unsafe { libc::free(ptr) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tagalloc", size), &size, |b, &size| {
      b.iter(|| tagalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_window(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_window");

  for size in [16, 256, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tagalloc", size), &size, |b, &size| {
      b.iter(|| tagalloc_window(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_window(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_window);
criterion_main!(benches);
