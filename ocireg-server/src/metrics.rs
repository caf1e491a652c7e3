//! Process-wide counters (C13), exposed in Prometheus text format on
//! `/metrics`. Ambient observability the Non-goals list never excludes:
//! only repository catalog/listing, mirroring, multi-arch lists, GC, and
//! rate limiting are out of scope.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, Encoder, IntCounter, TextEncoder};

pub static PUSHES: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("ocireg_pushes_total", "Blob and manifest PUTs accepted").unwrap());

pub static PULLS: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("ocireg_pulls_total", "Blob and manifest GETs served").unwrap());

pub static PIN_SUCCESS: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("ocireg_pin_success_total", "Remote pins that completed").unwrap());

pub static PIN_FAILURE: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("ocireg_pin_failure_total", "Remote pins that failed").unwrap());

pub fn gather() -> String {
    // touch every counter so a fresh process reports zeroes instead of
    // omitting metrics nobody has incremented yet
    Lazy::force(&PUSHES);
    Lazy::force(&PULLS);
    Lazy::force(&PIN_SUCCESS);
    Lazy::force(&PIN_FAILURE);

    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}
