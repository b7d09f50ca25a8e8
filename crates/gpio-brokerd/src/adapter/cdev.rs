//! Kernel GPIO character device backend (uAPI v2)
//!
//! Chips are opened from `/dev/gpiochipN`; every adapter operation is a
//! single ioctl on the chip or request file descriptor. Line info changes
//! and edge events are read from those descriptors by tokio tasks and
//! forwarded to the dispatcher through the sinks.

use super::{
    ChipHandle, ChipOpener, MAX_REQUEST_LINES, RequestHandle, select_offsets,
    validate_reconfigure_offsets, validate_request_offsets,
};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::event::{EdgeSink, InfoSink};
use crate::line::{
    Bias, ChipInfo, Direction, Drive, Edge, EdgeEvent, EdgeKind, EventClock, LineConfig, LineInfo,
    LineSettings, LineValue, RequestConfig,
};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const GPIO_MAX_NAME_SIZE: usize = 32;
const GPIO_V2_LINE_NUM_ATTRS_MAX: usize = 10;

const GPIO_V2_LINE_FLAG_USED: u64 = 1 << 0;
const GPIO_V2_LINE_FLAG_ACTIVE_LOW: u64 = 1 << 1;
const GPIO_V2_LINE_FLAG_INPUT: u64 = 1 << 2;
const GPIO_V2_LINE_FLAG_OUTPUT: u64 = 1 << 3;
const GPIO_V2_LINE_FLAG_EDGE_RISING: u64 = 1 << 4;
const GPIO_V2_LINE_FLAG_EDGE_FALLING: u64 = 1 << 5;
const GPIO_V2_LINE_FLAG_OPEN_DRAIN: u64 = 1 << 6;
const GPIO_V2_LINE_FLAG_OPEN_SOURCE: u64 = 1 << 7;
const GPIO_V2_LINE_FLAG_BIAS_PULL_UP: u64 = 1 << 8;
const GPIO_V2_LINE_FLAG_BIAS_PULL_DOWN: u64 = 1 << 9;
const GPIO_V2_LINE_FLAG_BIAS_DISABLED: u64 = 1 << 10;
const GPIO_V2_LINE_FLAG_EVENT_CLOCK_REALTIME: u64 = 1 << 11;
const GPIO_V2_LINE_FLAG_EVENT_CLOCK_HTE: u64 = 1 << 12;

const GPIO_V2_LINE_ATTR_ID_FLAGS: u32 = 1;
const GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES: u32 = 2;
const GPIO_V2_LINE_ATTR_ID_DEBOUNCE: u32 = 3;

const GPIO_V2_LINE_EVENT_RISING_EDGE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct GpioChipInfo {
    name: [u8; GPIO_MAX_NAME_SIZE],
    label: [u8; GPIO_MAX_NAME_SIZE],
    lines: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union GpioV2AttrValue {
    flags: u64,
    values: u64,
    debounce_period_us: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineAttribute {
    id: u32,
    padding: u32,
    value: GpioV2AttrValue,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GpioV2LineConfigAttribute {
    attr: GpioV2LineAttribute,
    mask: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineConfig {
    flags: u64,
    num_attrs: u32,
    padding: [u32; 5],
    attrs: [GpioV2LineConfigAttribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineRequest {
    offsets: [u32; MAX_REQUEST_LINES],
    consumer: [u8; GPIO_MAX_NAME_SIZE],
    config: GpioV2LineConfig,
    num_lines: u32,
    event_buffer_size: u32,
    padding: [u32; 5],
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineInfo {
    name: [u8; GPIO_MAX_NAME_SIZE],
    consumer: [u8; GPIO_MAX_NAME_SIZE],
    offset: u32,
    num_attrs: u32,
    flags: u64,
    attrs: [GpioV2LineAttribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
    padding: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineInfoChanged {
    info: GpioV2LineInfo,
    timestamp_ns: u64,
    event_type: u32,
    padding: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct GpioV2LineValues {
    bits: u64,
    mask: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct GpioV2LineEvent {
    timestamp_ns: u64,
    id: u32,
    offset: u32,
    seqno: u32,
    line_seqno: u32,
    padding: [u32; 6],
}

nix::ioctl_read!(gpio_get_chipinfo, 0xB4, 0x01, GpioChipInfo);
nix::ioctl_readwrite!(gpio_v2_get_lineinfo, 0xB4, 0x05, GpioV2LineInfo);
nix::ioctl_readwrite!(gpio_v2_get_lineinfo_watch, 0xB4, 0x06, GpioV2LineInfo);
nix::ioctl_readwrite!(gpio_v2_get_line, 0xB4, 0x07, GpioV2LineRequest);
nix::ioctl_readwrite!(gpio_get_lineinfo_unwatch, 0xB4, 0x0C, u32);
nix::ioctl_readwrite!(gpio_v2_line_set_config, 0xB4, 0x0D, GpioV2LineConfig);
nix::ioctl_readwrite!(gpio_v2_line_get_values, 0xB4, 0x0E, GpioV2LineValues);
nix::ioctl_readwrite!(gpio_v2_line_set_values, 0xB4, 0x0F, GpioV2LineValues);

/// All uAPI structs above are plain integers and arrays of them.
fn zeroed<T: Copy>() -> T {
    // SAFETY: only instantiated with the repr(C) uAPI structs, for which the
    // all-zero bit pattern is valid.
    unsafe { std::mem::zeroed() }
}

fn errno_error(errno: i32) -> AdapterError {
    let message = io::Error::from_raw_os_error(errno).to_string();
    let kind = match errno {
        libc::EBUSY => AdapterErrorKind::Busy,
        libc::EINVAL => AdapterErrorKind::InvalidArgument,
        libc::E2BIG => AdapterErrorKind::TooManyLines,
        libc::EPERM => AdapterErrorKind::PermissionDenied,
        libc::ENODEV | libc::ENOENT => AdapterErrorKind::NotFound,
        other => AdapterErrorKind::Os(other),
    };
    AdapterError::new(kind, message)
}

impl From<nix::errno::Errno> for AdapterError {
    fn from(errno: nix::errno::Errno) -> Self {
        errno_error(errno as i32)
    }
}

impl From<io::Error> for AdapterError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => errno_error(errno),
            None => AdapterError::new(AdapterErrorKind::Os(libc::EIO), err.to_string()),
        }
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn copy_c_string(dst: &mut [u8; GPIO_MAX_NAME_SIZE], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(GPIO_MAX_NAME_SIZE - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn line_info_from_raw(raw: &GpioV2LineInfo) -> LineInfo {
    let flags = raw.flags;

    let edge = match (
        flags & GPIO_V2_LINE_FLAG_EDGE_RISING != 0,
        flags & GPIO_V2_LINE_FLAG_EDGE_FALLING != 0,
    ) {
        (true, true) => Edge::Both,
        (true, false) => Edge::Rising,
        (false, true) => Edge::Falling,
        (false, false) => Edge::None,
    };

    let bias = if flags & GPIO_V2_LINE_FLAG_BIAS_PULL_UP != 0 {
        Bias::PullUp
    } else if flags & GPIO_V2_LINE_FLAG_BIAS_PULL_DOWN != 0 {
        Bias::PullDown
    } else if flags & GPIO_V2_LINE_FLAG_BIAS_DISABLED != 0 {
        Bias::Disabled
    } else {
        Bias::Unknown
    };

    let drive = if flags & GPIO_V2_LINE_FLAG_OPEN_DRAIN != 0 {
        Drive::OpenDrain
    } else if flags & GPIO_V2_LINE_FLAG_OPEN_SOURCE != 0 {
        Drive::OpenSource
    } else {
        Drive::PushPull
    };

    let event_clock = if flags & GPIO_V2_LINE_FLAG_EVENT_CLOCK_REALTIME != 0 {
        EventClock::Realtime
    } else if flags & GPIO_V2_LINE_FLAG_EVENT_CLOCK_HTE != 0 {
        EventClock::Hte
    } else {
        EventClock::Monotonic
    };

    let num_attrs = (raw.num_attrs as usize).min(GPIO_V2_LINE_NUM_ATTRS_MAX);
    let debounce_period_us = raw.attrs[..num_attrs]
        .iter()
        .find(|a| a.id == GPIO_V2_LINE_ATTR_ID_DEBOUNCE)
        // SAFETY: the kernel fills the debounce member for this attribute id.
        .map(|a| u64::from(unsafe { a.value.debounce_period_us }))
        .unwrap_or(0);

    LineInfo {
        offset: raw.offset,
        name: c_string(&raw.name),
        used: flags & GPIO_V2_LINE_FLAG_USED != 0,
        consumer: c_string(&raw.consumer),
        direction: if flags & GPIO_V2_LINE_FLAG_OUTPUT != 0 {
            Direction::Output
        } else {
            Direction::Input
        },
        edge,
        bias,
        drive,
        active_low: flags & GPIO_V2_LINE_FLAG_ACTIVE_LOW != 0,
        debounced: debounce_period_us != 0,
        debounce_period_us,
        event_clock,
    }
}

fn settings_flags(settings: &LineSettings) -> u64 {
    let mut flags = match settings.direction {
        Direction::Input => GPIO_V2_LINE_FLAG_INPUT,
        Direction::Output => GPIO_V2_LINE_FLAG_OUTPUT,
        Direction::AsIs => 0,
    };

    flags |= match settings.edge {
        Edge::None => 0,
        Edge::Rising => GPIO_V2_LINE_FLAG_INPUT | GPIO_V2_LINE_FLAG_EDGE_RISING,
        Edge::Falling => GPIO_V2_LINE_FLAG_INPUT | GPIO_V2_LINE_FLAG_EDGE_FALLING,
        Edge::Both => {
            GPIO_V2_LINE_FLAG_INPUT
                | GPIO_V2_LINE_FLAG_EDGE_RISING
                | GPIO_V2_LINE_FLAG_EDGE_FALLING
        }
    };

    flags |= match settings.drive {
        Drive::PushPull => 0,
        Drive::OpenDrain => GPIO_V2_LINE_FLAG_OPEN_DRAIN,
        Drive::OpenSource => GPIO_V2_LINE_FLAG_OPEN_SOURCE,
    };

    flags |= match settings.bias {
        Bias::AsIs | Bias::Unknown => 0,
        Bias::Disabled => GPIO_V2_LINE_FLAG_BIAS_DISABLED,
        Bias::PullUp => GPIO_V2_LINE_FLAG_BIAS_PULL_UP,
        Bias::PullDown => GPIO_V2_LINE_FLAG_BIAS_PULL_DOWN,
    };

    if settings.active_low {
        flags |= GPIO_V2_LINE_FLAG_ACTIVE_LOW;
    }

    flags |= match settings.event_clock {
        EventClock::Monotonic => 0,
        EventClock::Realtime => GPIO_V2_LINE_FLAG_EVENT_CLOCK_REALTIME,
        EventClock::Hte => GPIO_V2_LINE_FLAG_EVENT_CLOCK_HTE,
    };

    flags
}

/// Bit for `offset` in the request's line index space
fn line_bit(reserved: &[u32], offset: u32) -> AdapterResult<u64> {
    reserved
        .iter()
        .position(|o| *o == offset)
        .map(|idx| 1u64 << idx)
        .ok_or_else(|| {
            AdapterError::invalid(format!("offset {} is not part of this request", offset))
        })
}

/// Translate a line config into the kernel representation.
///
/// The first line's flags become the default; every other distinct flag
/// set, debounce period and the output values each take one attribute.
fn build_config(reserved: &[u32], line_config: &LineConfig) -> AdapterResult<GpioV2LineConfig> {
    let resolved = line_config.resolved();
    let mut config: GpioV2LineConfig = zeroed();

    let mut attrs: Vec<GpioV2LineConfigAttribute> = Vec::new();
    let mut push_attr = |id: u32, value: GpioV2AttrValue, mask: u64| {
        let slot = attrs.iter_mut().find(|a| {
            a.attr.id == id
                // SAFETY: flags/values/debounce share the low bytes; compare the
                // member matching the attribute id.
                && unsafe {
                    match id {
                        GPIO_V2_LINE_ATTR_ID_DEBOUNCE => {
                            a.attr.value.debounce_period_us == value.debounce_period_us
                        }
                        _ => a.attr.value.flags == value.flags,
                    }
                }
        });
        match slot {
            Some(existing) => existing.mask |= mask,
            None => attrs.push(GpioV2LineConfigAttribute {
                attr: GpioV2LineAttribute {
                    id,
                    padding: 0,
                    value,
                },
                mask,
            }),
        }
    };

    let default_flags = resolved
        .first()
        .map(|(_, settings)| settings_flags(settings))
        .unwrap_or(0);
    config.flags = default_flags;

    let mut output_mask = 0u64;
    let mut output_bits = 0u64;
    for (offset, settings) in &resolved {
        let bit = line_bit(reserved, *offset)?;
        let flags = settings_flags(settings);
        if flags != default_flags {
            push_attr(GPIO_V2_LINE_ATTR_ID_FLAGS, GpioV2AttrValue { flags }, bit);
        }
        if settings.debounce_period_us > 0 {
            let period = u32::try_from(settings.debounce_period_us)
                .map_err(|_| AdapterError::invalid("debounce period too long"))?;
            push_attr(
                GPIO_V2_LINE_ATTR_ID_DEBOUNCE,
                GpioV2AttrValue {
                    debounce_period_us: period,
                },
                bit,
            );
        }
        if settings.direction == Direction::Output {
            output_mask |= bit;
            if settings.output_value == LineValue::Active {
                output_bits |= bit;
            }
        }
    }
    if output_mask != 0 {
        push_attr(
            GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES,
            GpioV2AttrValue {
                values: output_bits,
            },
            output_mask,
        );
    }

    if attrs.len() > GPIO_V2_LINE_NUM_ATTRS_MAX {
        return Err(AdapterError::new(
            AdapterErrorKind::TooManyLines,
            "too many distinct line configurations",
        ));
    }
    config.num_attrs = attrs.len() as u32;
    config.attrs[..attrs.len()].copy_from_slice(&attrs);

    Ok(config)
}

fn spawn_reader<T, F>(file: Arc<File>, mut on_record: F) -> AdapterResult<JoinHandle<()>>
where
    T: Copy + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|e| {
        AdapterError::new(AdapterErrorKind::Os(libc::EIO), e.to_string())
    })?;
    set_nonblocking(file.as_raw_fd())?;

    let _guard = handle.enter();
    let fd = AsyncFd::new(file)?;

    Ok(handle.spawn(async move {
        let record_size = size_of::<T>();
        let mut buf = vec![0u8; record_size * 16];
        loop {
            let mut guard = match fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("gpio descriptor poll failed: {}", e);
                    return;
                }
            };

            match guard.try_io(|inner| (&**inner.get_ref()).read(&mut buf)) {
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => {
                    for chunk in buf[..n].chunks_exact(record_size) {
                        // SAFETY: the kernel writes whole records of type T.
                        let record = unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<T>()) };
                        on_record(record);
                    }
                }
                Ok(Err(e)) => {
                    warn!("gpio descriptor read failed: {}", e);
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }))
}

/// Opens chips through the kernel character device
#[derive(Clone, Copy, Debug, Default)]
pub struct CdevBackend;

impl CdevBackend {
    /// New backend
    pub fn new() -> Self {
        Self
    }
}

impl ChipOpener for CdevBackend {
    fn open(&self, path: &Path, info_sink: InfoSink) -> AdapterResult<Box<dyn ChipHandle>> {
        let file = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);

        let mut raw: GpioChipInfo = zeroed();
        // SAFETY: `raw` is a valid gpiochip_info for the kernel to fill.
        unsafe { gpio_get_chipinfo(file.as_raw_fd(), &mut raw) }?;
        let info = ChipInfo {
            name: c_string(&raw.name),
            label: c_string(&raw.label),
            num_lines: raw.lines,
        };

        let reader = spawn_reader::<GpioV2LineInfoChanged, _>(Arc::clone(&file), move |record| {
            info_sink.send(line_info_from_raw(&record.info));
        })?;

        debug!(path = %path.display(), chip = %info.name, "opened gpio chip");

        Ok(Box::new(CdevChip {
            path: path.to_path_buf(),
            file,
            info,
            reader,
        }))
    }
}

/// Open kernel chip
#[derive(Debug)]
pub struct CdevChip {
    path: PathBuf,
    file: Arc<File>,
    info: ChipInfo,
    reader: JoinHandle<()>,
}

impl CdevChip {
    fn raw_line_info(&self, offset: u32, watch: bool) -> AdapterResult<LineInfo> {
        let mut raw: GpioV2LineInfo = zeroed();
        raw.offset = offset;
        let fd = self.file.as_raw_fd();
        // SAFETY: `raw` is a valid gpio_v2_line_info with the offset set.
        unsafe {
            if watch {
                gpio_v2_get_lineinfo_watch(fd, &mut raw)
            } else {
                gpio_v2_get_lineinfo(fd, &mut raw)
            }
        }?;
        Ok(line_info_from_raw(&raw))
    }
}

impl ChipHandle for CdevChip {
    fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> AdapterResult<ChipInfo> {
        Ok(self.info.clone())
    }

    fn line_info(&self, offset: u32) -> AdapterResult<LineInfo> {
        self.raw_line_info(offset, false)
    }

    fn watch_line_info(&mut self, offset: u32) -> AdapterResult<LineInfo> {
        self.raw_line_info(offset, true)
    }

    fn unwatch_line_info(&mut self, offset: u32) -> AdapterResult<()> {
        let mut offset = offset;
        // SAFETY: the ioctl reads a single u32.
        unsafe { gpio_get_lineinfo_unwatch(self.file.as_raw_fd(), &mut offset) }?;
        Ok(())
    }

    fn request_lines(
        &mut self,
        request_config: &RequestConfig,
        line_config: &LineConfig,
    ) -> AdapterResult<Box<dyn RequestHandle>> {
        let offsets = line_config.offsets();
        validate_request_offsets(&offsets, self.info.num_lines)?;

        let mut raw: GpioV2LineRequest = zeroed();
        raw.offsets[..offsets.len()].copy_from_slice(&offsets);
        raw.num_lines = offsets.len() as u32;
        raw.event_buffer_size = request_config.event_buffer_size;
        if let Some(consumer) = &request_config.consumer {
            copy_c_string(&mut raw.consumer, consumer);
        }
        raw.config = build_config(&offsets, line_config)?;

        // SAFETY: `raw` is a fully initialised gpio_v2_line_request.
        unsafe { gpio_v2_get_line(self.file.as_raw_fd(), &mut raw) }?;
        // SAFETY: on success the kernel hands us a fresh descriptor we now own.
        let file = unsafe { File::from_raw_fd(raw.fd) };

        Ok(Box::new(CdevRequest {
            file: Some(Arc::new(file)),
            offsets,
            reader: None,
        }))
    }
}

impl Drop for CdevChip {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Kernel line request
#[derive(Debug)]
pub struct CdevRequest {
    file: Option<Arc<File>>,
    offsets: Vec<u32>,
    reader: Option<JoinHandle<()>>,
}

impl CdevRequest {
    fn fd(&self) -> AdapterResult<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(AdapterError::released)
    }
}

impl RequestHandle for CdevRequest {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn watch_edge_events(&mut self, sink: EdgeSink) -> AdapterResult<()> {
        let file = self.file.clone().ok_or_else(AdapterError::released)?;
        let reader = spawn_reader::<GpioV2LineEvent, _>(file, move |record| {
            let kind = if record.id == GPIO_V2_LINE_EVENT_RISING_EDGE {
                EdgeKind::Rising
            } else {
                EdgeKind::Falling
            };
            sink.send(EdgeEvent {
                kind,
                timestamp_ns: record.timestamp_ns,
                offset: record.offset,
                global_seqno: record.seqno as u64,
                line_seqno: record.line_seqno as u64,
            });
        })?;
        if let Some(old) = self.reader.replace(reader) {
            old.abort();
        }
        Ok(())
    }

    fn reconfigure_lines(&mut self, line_config: &LineConfig) -> AdapterResult<()> {
        let fd = self.fd()?;
        validate_reconfigure_offsets(&self.offsets, &line_config.offsets())?;
        let mut raw = build_config(&self.offsets, line_config)?;
        // SAFETY: `raw` is a fully initialised gpio_v2_line_config.
        unsafe { gpio_v2_line_set_config(fd, &mut raw) }?;
        Ok(())
    }

    fn get_values(&mut self, offsets: Option<&[u32]>) -> AdapterResult<Vec<LineValue>> {
        let fd = self.fd()?;
        let offsets = select_offsets(&self.offsets, offsets)?;

        let mut raw = GpioV2LineValues::default();
        for offset in offsets {
            raw.mask |= line_bit(&self.offsets, *offset)?;
        }
        // SAFETY: `raw` is a valid gpio_v2_line_values with the mask set.
        unsafe { gpio_v2_line_get_values(fd, &mut raw) }?;

        offsets
            .iter()
            .map(|o| Ok(LineValue::from(raw.bits & line_bit(&self.offsets, *o)? != 0)))
            .collect()
    }

    fn set_values(&mut self, offsets: &[u32], values: &[LineValue]) -> AdapterResult<()> {
        let fd = self.fd()?;
        if offsets.len() != values.len() {
            return Err(AdapterError::invalid(format!(
                "{} values given for {} lines",
                values.len(),
                offsets.len()
            )));
        }
        let offsets = select_offsets(&self.offsets, Some(offsets))?;

        let mut raw = GpioV2LineValues::default();
        for (offset, value) in offsets.iter().zip(values) {
            let bit = line_bit(&self.offsets, *offset)?;
            raw.mask |= bit;
            if *value == LineValue::Active {
                raw.bits |= bit;
            }
        }
        // SAFETY: `raw` is a valid gpio_v2_line_values.
        unsafe { gpio_v2_line_set_values(fd, &mut raw) }?;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.file = None;
    }
}

impl Drop for CdevRequest {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<GpioChipInfo>(), 68);
        assert_eq!(size_of::<GpioV2LineAttribute>(), 16);
        assert_eq!(size_of::<GpioV2LineConfig>(), 272);
        assert_eq!(size_of::<GpioV2LineRequest>(), 592);
        assert_eq!(size_of::<GpioV2LineInfo>(), 256);
        assert_eq!(size_of::<GpioV2LineInfoChanged>(), 288);
        assert_eq!(size_of::<GpioV2LineEvent>(), 48);
    }

    #[test]
    fn test_settings_flags() {
        let settings = LineSettings {
            direction: Direction::Input,
            edge: Edge::Both,
            bias: Bias::PullUp,
            active_low: true,
            event_clock: EventClock::Realtime,
            ..Default::default()
        };
        assert_eq!(
            settings_flags(&settings),
            GPIO_V2_LINE_FLAG_INPUT
                | GPIO_V2_LINE_FLAG_EDGE_RISING
                | GPIO_V2_LINE_FLAG_EDGE_FALLING
                | GPIO_V2_LINE_FLAG_BIAS_PULL_UP
                | GPIO_V2_LINE_FLAG_ACTIVE_LOW
                | GPIO_V2_LINE_FLAG_EVENT_CLOCK_REALTIME
        );
    }

    #[test]
    fn test_build_config_masks_follow_request_order() {
        let output = LineSettings {
            direction: Direction::Output,
            ..Default::default()
        };
        let input = LineSettings {
            direction: Direction::Input,
            debounce_period_us: 100,
            ..Default::default()
        };
        let mut line_config = LineConfig::new();
        line_config
            .add_group(vec![7, 3], output)
            .add_group(vec![1], input)
            .set_output_values(vec![LineValue::Inactive, LineValue::Active]);

        let config = build_config(&[7, 3, 1], &line_config).unwrap();
        assert_eq!(config.flags, GPIO_V2_LINE_FLAG_OUTPUT);
        assert_eq!(config.num_attrs, 3);

        let attrs = &config.attrs[..3];
        assert_eq!(attrs[0].attr.id, GPIO_V2_LINE_ATTR_ID_FLAGS);
        assert_eq!(attrs[0].mask, 0b100);
        assert_eq!(attrs[1].attr.id, GPIO_V2_LINE_ATTR_ID_DEBOUNCE);
        assert_eq!(attrs[2].attr.id, GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES);
        assert_eq!(attrs[2].mask, 0b011);
        assert_eq!(unsafe { attrs[2].attr.value.values }, 0b010);
    }

    #[test]
    fn test_line_info_from_raw() {
        let mut raw: GpioV2LineInfo = zeroed();
        raw.name[..3].copy_from_slice(b"led");
        raw.consumer[..4].copy_from_slice(b"test");
        raw.offset = 4;
        raw.flags = GPIO_V2_LINE_FLAG_USED
            | GPIO_V2_LINE_FLAG_OUTPUT
            | GPIO_V2_LINE_FLAG_OPEN_DRAIN
            | GPIO_V2_LINE_FLAG_BIAS_DISABLED;

        let info = line_info_from_raw(&raw);
        assert_eq!(info.name, "led");
        assert_eq!(info.consumer, "test");
        assert!(info.used);
        assert_eq!(info.direction, Direction::Output);
        assert_eq!(info.drive, Drive::OpenDrain);
        assert_eq!(info.bias, Bias::Disabled);
        assert!(!info.debounced);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno_error(libc::EBUSY).kind, AdapterErrorKind::Busy);
        assert_eq!(errno_error(libc::E2BIG).kind, AdapterErrorKind::TooManyLines);
        assert_eq!(errno_error(libc::EIO).kind, AdapterErrorKind::Os(libc::EIO));
    }
}
