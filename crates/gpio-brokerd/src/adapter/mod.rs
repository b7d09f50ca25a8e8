//! Line access adapters
//!
//! The broker never touches hardware directly. It opens chips and reserves
//! lines through the traits below. Every call is synchronous and maps to a
//! single kernel operation; asynchronous notifications (line info changes and
//! edge events) are pushed into the dispatcher queue through the sinks handed
//! out at open/watch time.

pub mod sim;

#[cfg(target_os = "linux")]
pub mod cdev;

use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::event::{EdgeSink, InfoSink};
use crate::line::{ChipInfo, LineConfig, LineInfo, LineValue, RequestConfig};
use std::collections::BTreeSet;
use std::path::Path;

pub use sim::{SimBackend, SimChipSpec};

#[cfg(target_os = "linux")]
pub use cdev::CdevBackend;

/// Upper bound on lines in a single request
pub const MAX_REQUEST_LINES: usize = 64;

/// Opens chips by device path
pub trait ChipOpener: Send + Sync {
    /// Open the chip at `path`.
    ///
    /// Info changes for lines watched through the returned handle are
    /// delivered to `info_sink`.
    fn open(&self, path: &Path, info_sink: InfoSink) -> AdapterResult<Box<dyn ChipHandle>>;
}

/// An open chip. Dropping the handle closes it.
pub trait ChipHandle: Send {
    /// Device path the chip was opened from
    fn path(&self) -> &Path;

    /// Chip metadata
    fn info(&self) -> AdapterResult<ChipInfo>;

    /// Snapshot of one line
    fn line_info(&self, offset: u32) -> AdapterResult<LineInfo>;

    /// Start reporting info changes for a line, returning its current snapshot
    fn watch_line_info(&mut self, offset: u32) -> AdapterResult<LineInfo>;

    /// Stop reporting info changes for a line
    fn unwatch_line_info(&mut self, offset: u32) -> AdapterResult<()>;

    /// Reserve lines
    fn request_lines(
        &mut self,
        request_config: &RequestConfig,
        line_config: &LineConfig,
    ) -> AdapterResult<Box<dyn RequestHandle>>;
}

/// A granted line reservation
pub trait RequestHandle: Send {
    /// Reserved offsets in submission order
    fn offsets(&self) -> &[u32];

    /// Start delivering edge events to `sink`
    fn watch_edge_events(&mut self, sink: EdgeSink) -> AdapterResult<()>;

    /// Replace the line settings; the offset set must not change
    fn reconfigure_lines(&mut self, line_config: &LineConfig) -> AdapterResult<()>;

    /// Read logical values, for `offsets` or all reserved lines
    fn get_values(&mut self, offsets: Option<&[u32]>) -> AdapterResult<Vec<LineValue>>;

    /// Drive logical values. Either all values are applied or none.
    fn set_values(&mut self, offsets: &[u32], values: &[LineValue]) -> AdapterResult<()>;

    /// Give the lines back. Safe to call more than once.
    fn release(&mut self);
}

/// Checks shared by every backend before a request reaches the hardware
pub fn validate_request_offsets(offsets: &[u32], num_lines: u32) -> AdapterResult<()> {
    if offsets.is_empty() {
        return Err(AdapterError::invalid("no lines requested"));
    }

    if offsets.len() > MAX_REQUEST_LINES {
        return Err(AdapterError::new(
            AdapterErrorKind::TooManyLines,
            format!(
                "too many lines requested: {} (at most {})",
                offsets.len(),
                MAX_REQUEST_LINES
            ),
        ));
    }

    let mut seen = BTreeSet::new();
    for offset in offsets {
        if *offset >= num_lines {
            return Err(AdapterError::invalid(format!(
                "offset {} out of range for chip with {} lines",
                offset, num_lines
            )));
        }
        if !seen.insert(*offset) {
            return Err(AdapterError::invalid(format!(
                "offset {} requested more than once",
                offset
            )));
        }
    }

    Ok(())
}

/// A reconfiguration must name exactly the reserved offsets, in any order
pub fn validate_reconfigure_offsets(reserved: &[u32], requested: &[u32]) -> AdapterResult<()> {
    let reserved_set: BTreeSet<u32> = reserved.iter().copied().collect();
    let requested_set: BTreeSet<u32> = requested.iter().copied().collect();

    if requested_set.len() != requested.len() {
        return Err(AdapterError::invalid("offset repeated in line configuration"));
    }

    if reserved_set != requested_set {
        return Err(AdapterError::invalid(
            "line configuration must contain exactly the requested offsets",
        ));
    }

    Ok(())
}

/// Values for a subset of reserved offsets, or all of them
pub fn select_offsets<'a>(
    reserved: &'a [u32],
    offsets: Option<&'a [u32]>,
) -> AdapterResult<&'a [u32]> {
    let offsets = offsets.unwrap_or(reserved);
    if let Some(stray) = offsets.iter().find(|o| !reserved.contains(*o)) {
        return Err(AdapterError::invalid(format!(
            "offset {} is not part of this request",
            stray
        )));
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_offsets_validation() {
        assert!(validate_request_offsets(&[2, 5, 1], 8).is_ok());

        let err = validate_request_offsets(&[], 8).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidArgument);

        let err = validate_request_offsets(&[1, 2, 1], 8).unwrap_err();
        assert_eq!(err.message, "offset 1 requested more than once");

        let err = validate_request_offsets(&[8], 8).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidArgument);

        let many: Vec<u32> = (0..65).collect();
        let err = validate_request_offsets(&many, 128).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::TooManyLines);
    }

    #[test]
    fn test_reconfigure_ignores_order() {
        assert!(validate_reconfigure_offsets(&[2, 5, 1], &[1, 2, 5]).is_ok());
        assert!(validate_reconfigure_offsets(&[2, 5, 1], &[2, 5]).is_err());
        assert!(validate_reconfigure_offsets(&[2, 5], &[2, 5, 5]).is_err());
        assert!(validate_reconfigure_offsets(&[2, 5], &[2, 6]).is_err());
    }

    #[test]
    fn test_select_offsets() {
        let reserved = [4, 2, 9];
        assert_eq!(select_offsets(&reserved, None).unwrap(), &[4, 2, 9]);
        assert_eq!(select_offsets(&reserved, Some(&[9, 4])).unwrap(), &[9, 4]);
        assert!(select_offsets(&reserved, Some(&[3])).is_err());
    }
}
