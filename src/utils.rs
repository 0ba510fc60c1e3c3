use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hytra::TrAdder;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress reporter for a fixed-length iteration loop. A driver calls
/// [`IterProgress::tick`] once per message-passing iteration and
/// [`IterProgress::finish`] when the loop ends (dropping the handle also
/// finishes). The bar is drawn from a helper thread and only appears once
/// the loop has been running for `Config::progress_min_time`, so short
/// runs stay silent.
pub(crate) struct IterProgress {
    iters_done: Arc<TrAdder<u64>>,
    stopped: Arc<AtomicBool>,
    drawer: Option<JoinHandle<()>>,
}

impl IterProgress {
    pub(crate) fn new(num_iters: u64, label: &'static str, config: &crate::Config) -> Self {
        let iters_done: Arc<TrAdder<u64>> = Arc::new(TrAdder::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let drawer = config.show_progress.then(|| {
            let iters_done = Arc::clone(&iters_done);
            let stopped = Arc::clone(&stopped);
            let min_time = config.progress_min_time;
            std::thread::spawn(move || {
                let started = std::time::Instant::now();
                while started.elapsed() < min_time {
                    std::thread::park_timeout(min_time - started.elapsed());
                    if stopped.load(Ordering::Acquire) {
                        return;
                    }
                }
                let bar = ProgressBar::new(num_iters)
                    .with_style(
                        ProgressStyle::with_template(
                            "{msg} {pos}/{len} iterations [{elapsed_precise}] {wide_bar} (ETA {eta})",
                        )
                        .unwrap(),
                    )
                    .with_message(label)
                    .with_position(iters_done.get());
                while !stopped.load(Ordering::Acquire) {
                    bar.set_position(iters_done.get());
                    std::thread::park_timeout(Duration::from_millis(100));
                }
                bar.finish_and_clear();
            })
        });
        Self {
            iters_done,
            stopped,
            drawer,
        }
    }

    /// Records one completed iteration.
    pub(crate) fn tick(&self) {
        self.iters_done.inc(1);
    }

    pub(crate) fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.drawer.take() {
            // park always consumes the token and unpark always produces
            // it, whether or not the drawer is currently parked
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for IterProgress {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Splits `slice` into consecutive chunks whose lengths are the
/// differences of `bounds`. Kernels use this to hand every factor (or
/// variable) a disjoint mutable window of a flat arena before iterating
/// over them in parallel.
pub(crate) fn partition_mut<'a>(
    mut slice: &'a mut [f64],
    bounds: &[usize],
) -> Vec<&'a mut [f64]> {
    let mut out = Vec::with_capacity(bounds.len().saturating_sub(1));
    for w in bounds.windows(2) {
        let (head, rest) = std::mem::take(&mut slice).split_at_mut(w[1] - w[0]);
        out.push(head);
        slice = rest;
    }
    out
}
