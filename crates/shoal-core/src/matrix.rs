//! Hot-path matrix counters.
//!
//! Three bags of atomic counters incremented on the network, request,
//! and worker-pool hot paths. The monitor thread snapshots them once a
//! second and logs the *difference* between consecutive snapshots, so
//! each counter only ever increments — no resets, no locks.
//!
//! Durations are accumulated in microseconds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! matrix {
    ($(#[$doc:meta])* $name:ident, $snap:ident { $($field:ident),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        /// Point-in-time copy of the counters; subtract two snapshots
        /// to get the delta for an interval.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snap {
            $(pub $field: u64,)+
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }

        impl std::ops::Sub for $snap {
            type Output = $snap;

            fn sub(self, rhs: $snap) -> $snap {
                $snap {
                    $($field: self.$field.wrapping_sub(rhs.$field),)+
                }
            }
        }

        impl fmt::Display for $snap {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(write!(f, concat!(stringify!($field), "={} "), self.$field)?;)+
                Ok(())
            }
        }
    };
}

matrix! {
    /// Listener/connection counters.
    NetworkMatrix, NetworkSnapshot {
        sticky_packets,
        conn_created,
        conn_released,
        invalid_packets,
    }
}

matrix! {
    /// Per-request dispatch counters; costs in microseconds.
    RequestMatrix, RequestSnapshot {
        processed,
        process_cost,
        send_packet_cost,
    }
}

matrix! {
    /// Worker-pool queue/execution counters; times in microseconds.
    PoolMatrix, PoolSnapshot {
        in_queue,
        executed,
        queue_time,
        execute_time,
    }
}
