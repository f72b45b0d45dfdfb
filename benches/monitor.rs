#![allow(missing_docs, unreachable_pub)]
mod utils;

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use wsrep_core::{ApplyOrder, LocalOrder, Monitor, Seqno};

const BATCH: Seqno = 4096;

fn bench_fifo_single_thread(c: &mut Criterion) {
    c.bench_function("monitor::fifo::single_thread", |b| {
        b.iter(|| {
            let monitor = Monitor::<LocalOrder>::new(1 << 14);
            monitor.assign_initial_position(0);
            for seqno in 1..=BATCH {
                let item = LocalOrder::with_seqno(seqno);
                monitor.enter(&item).unwrap();
                monitor.leave(&item);
            }
            black_box(monitor.last_left());
        })
    });
}

fn bench_self_cancel(c: &mut Criterion) {
    c.bench_function("monitor::self_cancel", |b| {
        b.iter(|| {
            let monitor = Monitor::<LocalOrder>::new(1 << 14);
            monitor.assign_initial_position(0);
            for seqno in 1..=BATCH {
                monitor.self_cancel(&LocalOrder::with_seqno(seqno));
            }
            black_box(monitor.last_left());
        })
    });
}

fn bench_parallel_appliers(c: &mut Criterion) {
    const THREADS: Seqno = 4;

    c.bench_function("monitor::apply::four_threads", |b| {
        b.iter(|| {
            let monitor = Arc::new(Monitor::<ApplyOrder>::new(1 << 14));
            monitor.assign_initial_position(0);
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let monitor = Arc::clone(&monitor);
                    thread::spawn(move || {
                        // Interleaved seqnos, each depending on nothing:
                        // contention is purely on the monitor lock.
                        let mut seqno = t + 1;
                        while seqno <= BATCH {
                            let item = ApplyOrder::with_seqnos(seqno, 0, false);
                            monitor.enter(&item).unwrap();
                            monitor.leave(&item);
                            seqno += THREADS;
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            black_box(monitor.last_left());
        })
    });
}

criterion_group!(benches, bench_fifo_single_thread, bench_self_cancel, bench_parallel_appliers);
criterion_main!(benches);
