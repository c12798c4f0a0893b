//! Shared-memory frame bus
//!
//! A producer publishes frames into a POSIX shared-memory region laid out as
//! a 128-byte little-endian header followed by `slot_count` slots of
//! `slot_stride` bytes. Frame `seq` lives in slot `(seq - 1) % slot_count`;
//! the producer stores `seq` with release ordering after the slot is
//! written, the consumer loads it with acquire ordering before copying.

use bytemuck::{Pod, Zeroable};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::{CancellationToken, FrameSink, IngestExit};
use crate::error::{PlayoutError, Result};
use crate::types::RgbaFrame;

/// Header magic ("BRGF" stored little-endian)
pub const FRAMEBUS_MAGIC: u32 = 0x4647_5242;
/// Layout version
pub const FRAMEBUS_VERSION: u16 = 1;
/// Header size in bytes
pub const FRAMEBUS_HEADER_SIZE: usize = 128;
/// Delay between sequence polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pixel format tags
pub mod pixel_format {
    /// R, G, B, A bytes
    pub const RGBA8: u32 = 1;
    /// B, G, R, A bytes
    pub const BGRA8: u32 = 2;
    /// A, R, G, B bytes
    pub const ARGB8: u32 = 3;
}

const SEQ_OFFSET: usize = 0x28;

/// Bus header as stored at offset 0 of the region
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameBusHeader {
    /// [`FRAMEBUS_MAGIC`]
    pub magic: u32,
    /// [`FRAMEBUS_VERSION`]
    pub version: u16,
    /// Reserved flags
    pub flags: u16,
    /// [`FRAMEBUS_HEADER_SIZE`]
    pub header_size: u32,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Nominal producer rate
    pub fps: u32,
    /// One of [`pixel_format`]
    pub pixel_format: u32,
    /// Bytes per frame
    pub frame_size: u32,
    /// Number of slots
    pub slot_count: u32,
    /// Distance between slots
    pub slot_stride: u32,
    /// Last published sequence (0 = nothing yet)
    pub seq: u64,
    /// Wall-clock nanoseconds of the last write
    pub last_write_ns: u64,
    /// Zero
    pub reserved: [u64; 9],
}

const _: () = assert!(std::mem::size_of::<FrameBusHeader>() == FRAMEBUS_HEADER_SIZE);

impl FrameBusHeader {
    /// Header for an RGBA8 bus with tightly packed slots
    pub fn rgba(width: u32, height: u32, fps: u32, slot_count: u32) -> Self {
        let frame_size = width * height * 4;
        Self {
            magic: FRAMEBUS_MAGIC,
            version: FRAMEBUS_VERSION,
            header_size: FRAMEBUS_HEADER_SIZE as u32,
            width,
            height,
            fps,
            pixel_format: pixel_format::RGBA8,
            frame_size,
            slot_count,
            slot_stride: frame_size,
            ..Self::zeroed()
        }
    }

    /// Bytes needed for the header and every slot
    pub fn region_size(&self) -> usize {
        FRAMEBUS_HEADER_SIZE + self.slot_count as usize * self.slot_stride as usize
    }

    /// Byte offset of the slot holding frame `seq`
    pub fn slot_offset(&self, seq: u64) -> usize {
        let slot = ((seq - 1) % self.slot_count as u64) as usize;
        FRAMEBUS_HEADER_SIZE + slot * self.slot_stride as usize
    }
}

/// POSIX shared-memory object name for a bus name
pub fn shm_name(name: &str) -> Result<CString> {
    if name.is_empty() {
        return Err(PlayoutError::framebus("FrameBus name is empty"));
    }
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(name).map_err(|_| PlayoutError::framebus("FrameBus name contains a NUL byte"))
}

/// A read/write shared mapping
///
/// All access goes through raw-pointer copies and atomics because another
/// process writes the memory concurrently.
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
    unlink: Option<CString>,
}

// SAFETY: the mapping is plain shared memory; all access is by copy or atomic
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Map an existing shared-memory object
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(PlayoutError::framebus(format!(
                "Failed to open FrameBus shared memory {:?}: {}",
                c_name,
                std::io::Error::last_os_error()
            )));
        }
        let result = Self::map_fd(fd, None, None);
        // SAFETY: fd is owned here and no longer needed once mapped
        unsafe { libc::close(fd) };
        result
    }

    /// Create (or replace) a shared-memory object of `len` bytes; unlinked on drop
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };
        if fd < 0 {
            return Err(PlayoutError::framebus(format!(
                "Failed to create FrameBus shared memory {:?}: {}",
                c_name,
                std::io::Error::last_os_error()
            )));
        }
        let result = Self::map_fd(fd, Some(len), Some(c_name));
        // SAFETY: as in `open`
        unsafe { libc::close(fd) };
        result
    }

    /// Anonymous shared mapping, for producers living in this process
    pub fn anonymous(len: usize) -> Result<Self> {
        // SAFETY: anonymous mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_raw(ptr, len, None)
    }

    fn map_fd(fd: libc::c_int, truncate: Option<usize>, unlink: Option<CString>) -> Result<Self> {
        if let Some(len) = truncate {
            // SAFETY: fd is a valid shared-memory descriptor
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                return Err(PlayoutError::framebus(format!(
                    "Failed to size FrameBus shared memory: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        // SAFETY: stat is plain data and fully written by fstat on success
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return Err(PlayoutError::framebus("Failed to stat FrameBus shared memory"));
        }
        let len = stat.st_size as usize;
        if len < FRAMEBUS_HEADER_SIZE {
            return Err(PlayoutError::framebus(format!(
                "FrameBus shared memory too small ({} bytes)",
                len
            )));
        }

        // SAFETY: fd is valid and len is its current size
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        Self::from_raw(ptr, len, unlink)
    }

    fn from_raw(ptr: *mut libc::c_void, len: usize, unlink: Option<CString>) -> Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(PlayoutError::framebus(format!(
                "Failed to map FrameBus shared memory: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| PlayoutError::framebus("mmap returned a null mapping"))?;
        Ok(Self { ptr, len, unlink })
    }

    /// Mapped length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a mapped bus)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `dst.len()` bytes starting at `offset`
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: range checked against the mapping
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy `src` into the mapping at `offset`
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: range checked against the mapping
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len()) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(PlayoutError::framebus(format!(
                "access {}+{} outside {}-byte mapping",
                offset, len, self.len
            ))),
        }
    }

    fn header(&self) -> Result<FrameBusHeader> {
        let mut bytes = [0u8; FRAMEBUS_HEADER_SIZE];
        self.read(0, &mut bytes)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn seq(&self) -> &AtomicU64 {
        // SAFETY: mappings are page aligned and at least a header long, so
        // the u64 at 0x28 is in bounds and 8-byte aligned
        unsafe { AtomicU64::from_ptr(self.ptr.as_ptr().add(SEQ_OFFSET).cast::<u64>()) }
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if let Some(name) = self.unlink.take() {
            // SAFETY: valid NUL-terminated name
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
    }
}

/// Consumer side of a frame bus
pub struct FrameBusReader {
    mapping: Arc<SharedMapping>,
    header: FrameBusHeader,
    last_seq: u64,
    frames: u64,
}

impl FrameBusReader {
    /// Open a bus by name and check its header
    pub fn open(name: &str) -> Result<Self> {
        let reader = Self::from_mapping(Arc::new(SharedMapping::open(name)?))?;
        info!(
            "Opened FrameBus {} ({}x{}, {} slots)",
            name, reader.header.width, reader.header.height, reader.header.slot_count
        );
        Ok(reader)
    }

    /// Attach to an already mapped bus
    pub fn from_mapping(mapping: Arc<SharedMapping>) -> Result<Self> {
        let header = mapping.header()?;
        if header.magic != FRAMEBUS_MAGIC || header.header_size as usize != FRAMEBUS_HEADER_SIZE {
            return Err(PlayoutError::framebus(format!(
                "FrameBus header invalid (magic=0x{:08x} header_size={})",
                header.magic, header.header_size
            )));
        }
        if header.slot_count == 0 {
            return Err(PlayoutError::framebus("FrameBus has no slots"));
        }
        if header.slot_stride < header.frame_size {
            return Err(PlayoutError::framebus(format!(
                "FrameBus slot stride {} smaller than frame size {}",
                header.slot_stride, header.frame_size
            )));
        }
        if header.region_size() > mapping.len() {
            return Err(PlayoutError::framebus(format!(
                "FrameBus region too small: {} slots need {} bytes, mapped {}",
                header.slot_count,
                header.region_size(),
                mapping.len()
            )));
        }
        Ok(Self {
            mapping,
            header,
            last_seq: 0,
            frames: 0,
        })
    }

    /// Header as read at open time
    pub fn header(&self) -> &FrameBusHeader {
        &self.header
    }

    /// Frames copied out so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Check that the bus carries RGBA8 frames of exactly `width` x `height`
    pub fn validate_target(&self, width: u32, height: u32) -> Result<()> {
        let expected = RgbaFrame::expected_len(width, height);
        let h = &self.header;
        if h.frame_size as usize != expected || h.width != width || h.height != height {
            return Err(PlayoutError::framebus(format!(
                "FrameBus header mismatch. expected={}x{} bytes={} got={}x{} bytes={}",
                width, height, expected, h.width, h.height, h.frame_size
            )));
        }
        if h.pixel_format != pixel_format::RGBA8 {
            return Err(PlayoutError::framebus(format!(
                "FrameBus pixel format mismatch (expected RGBA8, got {})",
                h.pixel_format
            )));
        }
        Ok(())
    }

    /// Copy the newest frame if the sequence advanced since the last call
    pub fn poll_once(&mut self) -> Result<Option<RgbaFrame>> {
        let seq = self.mapping.seq().load(Ordering::Acquire);
        if seq == 0 || seq == self.last_seq {
            return Ok(None);
        }
        if self.last_seq != 0 && seq > self.last_seq + 1 {
            debug!("FrameBus skipped {} frames", seq - self.last_seq - 1);
        }
        self.last_seq = seq;

        let mut data = vec![0u8; self.header.frame_size as usize];
        self.mapping.read(self.header.slot_offset(seq), &mut data)?;
        self.frames += 1;
        Ok(Some(RgbaFrame::new(self.header.width, self.header.height, seq, data)))
    }

    /// Poll until cancelled
    pub fn run(&mut self, sink: &dyn FrameSink, cancel: &CancellationToken) -> Result<IngestExit> {
        while !cancel.is_cancelled() {
            match self.poll_once()? {
                Some(frame) => sink.push_frame(frame),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
        Ok(IngestExit::Cancelled)
    }
}

/// Producer side of a frame bus
pub struct FrameBusWriter {
    mapping: Arc<SharedMapping>,
    header: FrameBusHeader,
    seq: u64,
}

impl FrameBusWriter {
    /// Create a named bus with `header`
    pub fn create(name: &str, header: FrameBusHeader) -> Result<Self> {
        let mapping = SharedMapping::create(name, header.region_size())?;
        Self::with_mapping(Arc::new(mapping), header)
    }

    /// Create a bus visible only inside this process
    pub fn anonymous(header: FrameBusHeader) -> Result<Self> {
        let mapping = SharedMapping::anonymous(header.region_size())?;
        Self::with_mapping(Arc::new(mapping), header)
    }

    fn with_mapping(mapping: Arc<SharedMapping>, header: FrameBusHeader) -> Result<Self> {
        if header.slot_count == 0 {
            return Err(PlayoutError::framebus("FrameBus needs at least one slot"));
        }
        mapping.write(0, bytemuck::bytes_of(&FrameBusHeader { seq: 0, ..header }))?;
        Ok(Self {
            mapping,
            header,
            seq: 0,
        })
    }

    /// The shared mapping, for attaching an in-process reader
    pub fn mapping(&self) -> Arc<SharedMapping> {
        self.mapping.clone()
    }

    /// Last published sequence
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Publish one frame; returns its sequence number
    pub fn write_frame(&mut self, data: &[u8]) -> Result<u64> {
        if data.len() > self.header.slot_stride as usize {
            return Err(PlayoutError::framebus(format!(
                "frame of {} bytes does not fit a {}-byte slot",
                data.len(),
                self.header.slot_stride
            )));
        }
        let seq = self.seq + 1;
        self.mapping.write(self.header.slot_offset(seq), data)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.mapping.write(0x30, &now.to_le_bytes())?;
        self.mapping.seq().store(seq, Ordering::Release);
        self.seq = seq;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offsets() {
        let header = FrameBusHeader {
            seq: 0x1122_3344_5566_7788,
            ..FrameBusHeader::rgba(2, 1, 25, 3)
        };
        let bytes = bytemuck::bytes_of(&header);
        assert_eq!(&bytes[0..4], &[0x42, 0x52, 0x47, 0x46]);
        assert_eq!(bytes[0x1C], 8);
        assert_eq!(bytes[0x20], 3);
        assert_eq!(bytes[SEQ_OFFSET], 0x88);
    }

    #[test]
    fn test_shm_name() {
        assert_eq!(shm_name("bus").unwrap().to_str().unwrap(), "/bus");
        assert_eq!(shm_name("/bus").unwrap().to_str().unwrap(), "/bus");
        assert!(shm_name("").is_err());
    }

    #[test]
    fn test_slot_rotation() {
        let header = FrameBusHeader::rgba(1, 1, 25, 3);
        assert_eq!(header.slot_offset(1), 128);
        assert_eq!(header.slot_offset(3), 136);
        assert_eq!(header.slot_offset(4), 128);
    }

    #[test]
    fn test_poll_sees_each_sequence_once() {
        let mut writer = FrameBusWriter::anonymous(FrameBusHeader::rgba(1, 1, 25, 2)).unwrap();
        let mut reader = FrameBusReader::from_mapping(writer.mapping()).unwrap();
        assert!(reader.poll_once().unwrap().is_none());

        writer.write_frame(&[1, 2, 3, 4]).unwrap();
        let frame = reader.poll_once().unwrap().unwrap();
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
        assert_eq!(frame.timestamp, 1);
        assert!(reader.poll_once().unwrap().is_none());

        writer.write_frame(&[5, 6, 7, 8]).unwrap();
        writer.write_frame(&[9, 10, 11, 12]).unwrap();
        let frame = reader.poll_once().unwrap().unwrap();
        assert_eq!(frame.data(), &[9, 10, 11, 12]);
        assert_eq!(reader.frames(), 2);
    }

    #[test]
    fn test_rejects_short_stride() {
        let header = FrameBusHeader {
            slot_stride: 2,
            ..FrameBusHeader::rgba(1, 1, 25, 2)
        };
        let writer = FrameBusWriter::anonymous(header).unwrap();
        assert!(FrameBusReader::from_mapping(writer.mapping()).is_err());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let header = FrameBusHeader {
            magic: 0,
            ..FrameBusHeader::rgba(1, 1, 25, 2)
        };
        let writer = FrameBusWriter::anonymous(header).unwrap();
        assert!(FrameBusReader::from_mapping(writer.mapping()).is_err());
    }
}
