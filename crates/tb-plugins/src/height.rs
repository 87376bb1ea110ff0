//! Height query driver
//!
//! [`HeightQuery`] is the host side of the elevation contract. It splits
//! requests into chunks no larger than the plugin's `maximum_pair_count`,
//! honours the declared success/failure waits between requests, and
//! normalizes whatever the plugin returns so callers always get one finite
//! height (or [`HEIGHT_UNKNOWN`]) per input pair, in input order.
//!
//! A request counts as failed, and the next one waits the failure delay,
//! when the plugin panics, returns the wrong number of samples, or has no
//! known height at all for it. A chunk with at least one real sample is a
//! success even if some of its pairs came back unknown.
//!
//! The driver is synchronous; run it on a blocking thread when the plugin
//! talks to a remote service.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::plugin::{HeightPlugin, ModuleRef};
use tb_core::{is_unknown_height, CapabilityDescriptor, InputMethod, LatLong, HEIGHT_UNKNOWN};

/// Meters per degree of latitude on the reference sphere
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Convert a planar venue offset (meters from the venue centre) into the
/// coordinates a plugin with `input_method` expects.
///
/// Geographic conversion is equirectangular around `origin`, which is fine
/// at venue scale.
pub fn coordinates_for(input_method: InputMethod, x: f64, z: f64, origin: LatLong) -> LatLong {
    match input_method {
        InputMethod::MetersXZ => LatLong::new(z, x),
        InputMethod::LatitudeLongitude => {
            let latitude = origin.latitude_or_z + z / METERS_PER_DEGREE;
            let cos_lat = origin.latitude_or_z.to_radians().cos().abs().max(1e-6);
            let longitude = origin.longitude_or_x + x / (METERS_PER_DEGREE * cos_lat);
            LatLong::new(latitude, longitude)
        }
    }
}

/// Host-side driver over one height plugin
pub struct HeightQuery {
    plugin: Box<dyn HeightPlugin>,
    descriptor: CapabilityDescriptor,
    input_method: InputMethod,
    max_pairs: usize,
    wait_success: Duration,
    wait_failed: Duration,
    pending_wait: Duration,
    // Declared last so the plugin drops before its module
    _module: Option<ModuleRef>,
}

impl HeightQuery {
    pub fn new(plugin: Box<dyn HeightPlugin>) -> Self {
        Self::build(plugin, None)
    }

    /// Wrap a plugin created from a dynamically loaded module.
    pub fn with_module(plugin: Box<dyn HeightPlugin>, module: ModuleRef) -> Self {
        Self::build(plugin, Some(module))
    }

    fn build(plugin: Box<dyn HeightPlugin>, module: Option<ModuleRef>) -> Self {
        let descriptor = plugin.descriptor();
        let input_method = plugin.input_method();
        let max_pairs = plugin.maximum_pair_count().max(1);
        let wait_success = Duration::from_millis(plugin.timer_wait_success());
        let wait_failed = Duration::from_millis(plugin.timer_wait_failed());
        Self {
            plugin,
            descriptor,
            input_method,
            max_pairs,
            wait_success,
            wait_failed,
            pending_wait: Duration::ZERO,
            _module: module,
        }
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Fixed for the lifetime of the plugin instance
    pub fn input_method(&self) -> InputMethod {
        self.input_method
    }

    pub fn maximum_pair_count(&self) -> usize {
        self.max_pairs
    }

    pub fn plugin(&self) -> &dyn HeightPlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn HeightPlugin {
        self.plugin.as_mut()
    }

    pub fn fetch_one(&mut self, latitude_or_z: f64, longitude_or_x: f64) -> f64 {
        self.throttle();
        let plugin = &self.plugin;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            plugin.fetch(latitude_or_z, longitude_or_x)
        }));
        match result {
            Ok(height) => {
                let height = normalize(height);
                self.pending_wait = if is_unknown_height(height) {
                    self.wait_failed
                } else {
                    self.wait_success
                };
                height
            }
            Err(_) => {
                warn!(plugin = %self.descriptor.description, "Height plugin panicked in fetch");
                self.pending_wait = self.wait_failed;
                HEIGHT_UNKNOWN
            }
        }
    }

    /// Heights for `pairs` in input order, chunked by the plugin's pair limit.
    pub fn fetch_batch(&mut self, pairs: &[LatLong]) -> Vec<f64> {
        let mut heights = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(self.max_pairs) {
            heights.extend(self.fetch_chunk(chunk));
        }
        heights
    }

    /// Like [`HeightQuery::fetch_batch`] for any pair source, reporting
    /// `(done, total)` after each chunk.
    pub fn fetch_all<I, F>(&mut self, pairs: I, mut on_chunk: F) -> Vec<f64>
    where
        I: IntoIterator<Item = LatLong>,
        F: FnMut(usize, usize),
    {
        let pairs: Vec<LatLong> = pairs.into_iter().collect();
        let total = pairs.len();
        let mut heights = Vec::with_capacity(total);
        for chunk in pairs.chunks(self.max_pairs) {
            heights.extend(self.fetch_chunk(chunk));
            on_chunk(heights.len(), total);
        }
        heights
    }

    fn fetch_chunk(&mut self, chunk: &[LatLong]) -> Vec<f64> {
        self.throttle();
        let plugin = &self.plugin;
        let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.fetch_batch(chunk)));

        let (mut heights, failed) = match result {
            Ok(heights) if heights.len() == chunk.len() => (heights, false),
            Ok(heights) => {
                warn!(
                    plugin = %self.descriptor.description,
                    expected = chunk.len(),
                    returned = heights.len(),
                    "Height plugin returned the wrong number of samples"
                );
                (heights, true)
            }
            Err(_) => {
                warn!(
                    plugin = %self.descriptor.description,
                    pairs = chunk.len(),
                    "Height plugin panicked in fetch_batch"
                );
                (Vec::new(), true)
            }
        };

        heights.resize(chunk.len(), HEIGHT_UNKNOWN);
        for h in heights.iter_mut() {
            *h = normalize(*h);
        }
        let failed = failed || heights.iter().all(|h| is_unknown_height(*h));

        self.pending_wait = if failed {
            self.wait_failed
        } else {
            self.wait_success
        };
        heights
    }

    fn throttle(&mut self) {
        let wait = std::mem::take(&mut self.pending_wait);
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Throttling height request");
            thread::sleep(wait);
        }
    }
}

fn normalize(height: f64) -> f64 {
    if height.is_finite() {
        height
    } else {
        HEIGHT_UNKNOWN
    }
}
