//! Collector abstraction
//!
//! A collector is a sampling capability: every call to [`Collector::collect`]
//! produces a mapping from sub-metric name to reading, as of now. The empty
//! sub-name stands for the metric itself.
//!
//! Two canonical shapes are provided:
//!
//! - [`PointCollector`] wraps a function producing a single `f64`
//! - [`SetCollector`] wraps a function producing the whole mapping
//!
//! Smoothing is done on the sampling function, not on the collector, see
//! [`adaptor`].

pub mod adaptor;
pub mod system;

use std::collections::HashMap;

pub use adaptor::{average, muted_average, running_average};

/// Readings keyed by sub-metric name (`""` = the metric itself)
pub type Readings = HashMap<String, f64>;

/// A sampling capability owned by a relay.
///
/// Implementations may carry state (ring buffers, running counts) and
/// mutate it on every call.
pub trait Collector: Send {
    fn collect(&mut self) -> Readings;
}

/// Collector around a zero-argument `f64` source
pub struct PointCollector<F> {
    sample: F,
}

impl<F> PointCollector<F>
where
    F: FnMut() -> f64 + Send,
{
    pub fn new(sample: F) -> Self {
        Self { sample }
    }
}

impl<F> Collector for PointCollector<F>
where
    F: FnMut() -> f64 + Send,
{
    fn collect(&mut self) -> Readings {
        HashMap::from([(String::new(), (self.sample)())])
    }
}

/// Collector around a source that already yields named readings
pub struct SetCollector<F> {
    sample: F,
}

impl<F> SetCollector<F>
where
    F: FnMut() -> Readings + Send,
{
    pub fn new(sample: F) -> Self {
        Self { sample }
    }
}

impl<F> Collector for SetCollector<F>
where
    F: FnMut() -> Readings + Send,
{
    fn collect(&mut self) -> Readings {
        (self.sample)()
    }
}

/// Box a point source as a trait object.
pub fn point<F>(sample: F) -> Box<dyn Collector>
where
    F: FnMut() -> f64 + Send + 'static,
{
    Box::new(PointCollector::new(sample))
}

/// Box a set source as a trait object.
pub fn set<F>(sample: F) -> Box<dyn Collector>
where
    F: FnMut() -> Readings + Send + 'static,
{
    Box::new(SetCollector::new(sample))
}
