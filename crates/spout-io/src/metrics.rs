//! I/O metrics.
//!
//! The constants defined in this module are the names of metrics that file
//! handles and sockets maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};
use std::sync::Once;

/// Total number of files opened.
pub const FILES_OPENED: &str = "file.total_files_opened";

/// Total number of files closed.
pub const FILES_CLOSED: &str = "file.total_files_closed";

/// Total number of bytes successfully read from files.
pub const FILE_BYTES_READ: &str = "file.total_bytes_read";

/// Total number of bytes successfully written to files.
pub const FILE_BYTES_WRITTEN: &str = "file.total_bytes_written";

/// Total number of writes that accepted fewer bytes than offered.
pub const FILE_PARTIAL_WRITES: &str = "file.total_partial_writes";

/// Histogram of file write latency.
pub const FILE_WRITE_LATENCY: &str = "file.write_latency";

/// Total number of datagrams delivered to readers.
pub const DATAGRAMS_RECEIVED: &str = "udp.total_datagrams_received";

/// Total number of datagrams sent.
pub const DATAGRAMS_SENT: &str = "udp.total_datagrams_sent";

/// Total number of datagrams discarded by multicast source filters.
pub const DATAGRAMS_FILTERED: &str = "udp.total_datagrams_filtered";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_io_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(FILES_OPENED, "total number of files opened");
        describe_counter!(FILES_CLOSED, "total number of files closed");
        describe_counter!(
            FILE_BYTES_READ,
            Unit::Bytes,
            "total number of bytes read from files"
        );
        describe_counter!(
            FILE_BYTES_WRITTEN,
            Unit::Bytes,
            "total number of bytes written to files"
        );
        describe_counter!(
            FILE_PARTIAL_WRITES,
            "total number of writes that accepted fewer bytes than offered"
        );
        describe_histogram!(FILE_WRITE_LATENCY, Unit::Seconds, "File write latency");

        describe_counter!(DATAGRAMS_RECEIVED, "total number of datagrams received");
        describe_counter!(DATAGRAMS_SENT, "total number of datagrams sent");
        describe_counter!(
            DATAGRAMS_FILTERED,
            "total number of datagrams discarded by source filters"
        );
    });
}
