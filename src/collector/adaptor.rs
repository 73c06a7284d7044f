//! Smoothing adaptors for sampling functions
//!
//! Each adaptor takes a float-producing function and returns another one,
//! so they compose freely before being wrapped in a
//! [`PointCollector`](super::PointCollector). They are pure numeric
//! transforms with no I/O.

/// Running mean over every sample ever taken.
pub fn average<F>(mut sample: F) -> impl FnMut() -> f64 + Send
where
    F: FnMut() -> f64 + Send,
{
    let mut count = 0u64;
    let mut total = 0.0;
    move || {
        count += 1;
        total += sample();
        total / count as f64
    }
}

/// Mean of the last `window` samples.
///
/// The divisor is `min(samples_so_far, window)` so early readings are not
/// diluted by the empty slots of the ring. A window of zero is treated as
/// one.
pub fn running_average<F>(mut sample: F, window: usize) -> impl FnMut() -> f64 + Send
where
    F: FnMut() -> f64 + Send,
{
    let window = window.max(1);
    let mut values = vec![0.0; window];
    let mut idx = 0usize;
    move || {
        values[idx % window] = sample();
        idx += 1;
        let count = idx.min(window);
        values.iter().take(count).sum::<f64>() / count as f64
    }
}

/// Accumulates `sample / window` into a running total.
///
/// Used to spread a bursty counter over `window` ticks. A window of zero is
/// treated as one.
pub fn muted_average<F>(mut sample: F, window: usize) -> impl FnMut() -> f64 + Send
where
    F: FnMut() -> f64 + Send,
{
    let window = window.max(1) as f64;
    let mut current = 0.0;
    move || {
        current += sample() / window;
        current
    }
}
