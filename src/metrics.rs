//! Library metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "accept_errors",
    description = "Accept failures, including descriptor exhaustion"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Bytes read off connections")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Bytes written to connections")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups written to loop eventfds"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();
