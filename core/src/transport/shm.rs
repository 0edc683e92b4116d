//! Shared-memory audio buffers.
//!
//! The per-block request/response envelope travels over the audio-thread
//! socket, but the samples themselves live in a named POSIX shared-memory
//! region so they never get copied through the codec. One region per active
//! plugin instance, holding both the input and the output channel planes,
//! indexed by per-bus offset tables.
//!
//! The foreign side owns the region: it creates it on activation, re-creates
//! it when a reconfiguration changes the size, and unlinks it when the
//! instance is destroyed. The native side maps the same name read/write for
//! the lifetime of the instance. Within one processing block the native side
//! is the only writer of the input planes and the foreign side the only
//! writer of the output planes, with the envelope ping providing the
//! synchronization boundary.

use serde::{Deserialize, Serialize};
use std::ffi::CString;

use crate::error::ShmError;

/// The agreed-on layout of a shared audio buffer. Computed on the foreign
/// side after activation and sent to the native side so both map the same
/// region the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioShmBufferConfig {
    /// The name of the shared memory object, starting with a slash.
    pub name: String,
    /// The total size of the region in bytes. Always equal to the sum over
    /// all input and output buses of `channels × max_block_size ×
    /// sample_bytes`.
    pub size: u32,
    /// `input_offsets[bus][channel]` is the byte offset of that channel's
    /// plane within the region.
    pub input_offsets: Vec<Vec<u32>>,
    /// Same, for the output planes.
    pub output_offsets: Vec<Vec<u32>>,
    /// The number of samples every plane holds, i.e. the maximum block size
    /// agreed at activation.
    pub max_block_size: u32,
    /// Whether the planes hold `f64` samples instead of `f32`. Agreed at
    /// activation time as part of the processing setup.
    pub double_precision: bool,
}

impl AudioShmBufferConfig {
    /// Lay out a buffer for the given bus configuration. Channel planes are
    /// packed back to back, inputs first.
    pub fn new(
        name: String,
        input_bus_channels: &[u32],
        output_bus_channels: &[u32],
        max_block_size: u32,
        double_precision: bool,
    ) -> Self {
        let sample_bytes: u32 = if double_precision { 8 } else { 4 };
        let plane_bytes = max_block_size * sample_bytes;

        let mut offset = 0;
        let mut layout_buses = |buses: &[u32]| -> Vec<Vec<u32>> {
            buses
                .iter()
                .map(|num_channels| {
                    (0..*num_channels)
                        .map(|_| {
                            let channel_offset = offset;
                            offset += plane_bytes;
                            channel_offset
                        })
                        .collect()
                })
                .collect()
        };

        let input_offsets = layout_buses(input_bus_channels);
        let output_offsets = layout_buses(output_bus_channels);

        Self { name, size: offset, input_offsets, output_offsets, max_block_size, double_precision }
    }

    pub fn sample_bytes(&self) -> u32 {
        if self.double_precision {
            8
        } else {
            4
        }
    }
}

/// A mapped shared-memory audio buffer.
pub struct AudioShmBuffer {
    config: AudioShmBufferConfig,
    ptr: *mut u8,
    size: usize,
    /// The owning (foreign) side unlinks the object when the buffer is
    /// dropped.
    is_owner: bool,
}

// The raw pointer is to a shared mapping with a stable address. Exclusive
// access per plane per block is part of the audio protocol, not of this type.
unsafe impl Send for AudioShmBuffer {}
unsafe impl Sync for AudioShmBuffer {}

impl AudioShmBuffer {
    /// Create the backing object and map it. Used on the foreign side when an
    /// instance gets activated.
    pub fn create(config: AudioShmBufferConfig) -> Result<Self, ShmError> {
        Self::map(config, true)
    }

    /// Map an object created by the other side.
    pub fn open(config: AudioShmBufferConfig) -> Result<Self, ShmError> {
        Self::map(config, false)
    }

    fn map(config: AudioShmBufferConfig, is_owner: bool) -> Result<Self, ShmError> {
        let c_name = CString::new(config.name.clone())
            .map_err(|_| ShmError::Create { name: config.name.clone(), errno: libc::EINVAL })?;
        let size = config.size as usize;

        unsafe {
            let flags = if is_owner { libc::O_CREAT | libc::O_RDWR } else { libc::O_RDWR };
            let fd = libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::mode_t);
            if fd < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                return Err(if is_owner {
                    ShmError::Create { name: config.name, errno }
                } else {
                    ShmError::Open { name: config.name, errno }
                });
            }

            if is_owner && libc::ftruncate(fd, size as libc::off_t) != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(ShmError::Resize { name: config.name, errno });
            }

            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);

            if ptr == libc::MAP_FAILED {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if is_owner {
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(ShmError::Map { name: config.name, errno });
            }

            Ok(Self { config, ptr: ptr as *mut u8, size, is_owner })
        }
    }

    /// Swap in a new layout after a reconfiguration. Reuses the existing
    /// mapping when the total size is unchanged, otherwise unmaps and maps the
    /// resized object.
    pub fn resize(&mut self, config: AudioShmBufferConfig) -> Result<(), ShmError> {
        if config.size == self.config.size && config.name == self.config.name {
            self.config = config;
            return Ok(());
        }

        let is_owner = self.is_owner;
        let same_name = config.name == self.config.name;

        let mut old = std::mem::replace(self, Self::map(config, is_owner)?);
        if same_name {
            // The new mapping took over the object; the old one must not
            // unlink it on drop
            old.is_owner = false;
        }
        drop(old);

        Ok(())
    }

    pub fn config(&self) -> &AudioShmBufferConfig {
        &self.config
    }

    /// A channel plane as a sample slice.
    ///
    /// # Safety
    ///
    /// The caller must uphold the single-writer-per-plane-per-block rule: the
    /// returned slice aliases the shared mapping, and the peer process reads
    /// or writes the same plane between the process request and its response.
    pub unsafe fn input_channel<T: Copy>(&self, bus: usize, channel: usize) -> &mut [T] {
        self.plane(self.config.input_offsets[bus][channel])
    }

    /// See [`input_channel`](Self::input_channel).
    ///
    /// # Safety
    ///
    /// Same aliasing rules.
    pub unsafe fn output_channel<T: Copy>(&self, bus: usize, channel: usize) -> &mut [T] {
        self.plane(self.config.output_offsets[bus][channel])
    }

    unsafe fn plane<T: Copy>(&self, byte_offset: u32) -> &mut [T] {
        debug_assert_eq!(std::mem::size_of::<T>() as u32, self.config.sample_bytes());

        std::slice::from_raw_parts_mut(
            self.ptr.add(byte_offset as usize) as *mut T,
            self.config.max_block_size as usize,
        )
    }
}

impl Drop for AudioShmBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);

            if self.is_owner {
                if let Ok(c_name) = CString::new(self.config.name.clone()) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("/plugbridge-test-{}-{}", std::process::id(), tag)
    }

    #[test]
    fn size_matches_bus_layout() {
        // 1 stereo in bus + 1 mono in bus, 1 stereo out bus, 512 frames, f32
        let config =
            AudioShmBufferConfig::new(test_name("layout"), &[2, 1], &[2], 512, false);

        assert_eq!(config.size, (2 + 1 + 2) * 512 * 4);
        assert_eq!(config.input_offsets.len(), 2);
        assert_eq!(config.input_offsets[0].len(), 2);
        assert_eq!(config.input_offsets[1].len(), 1);
        assert_eq!(config.output_offsets[0].len(), 2);

        // Planes are packed back to back without overlap
        assert_eq!(config.input_offsets[0][0], 0);
        assert_eq!(config.input_offsets[0][1], 512 * 4);
        assert_eq!(config.input_offsets[1][0], 2 * 512 * 4);
        assert_eq!(config.output_offsets[0][0], 3 * 512 * 4);

        let double = AudioShmBufferConfig::new(test_name("layout64"), &[2], &[2], 256, true);
        assert_eq!(double.size, (2 + 2) * 256 * 8);
    }

    #[test]
    fn both_sides_see_the_same_samples() {
        let config = AudioShmBufferConfig::new(test_name("roundtrip"), &[2], &[2], 64, false);

        let foreign = AudioShmBuffer::create(config.clone()).unwrap();
        let native = AudioShmBuffer::open(config).unwrap();

        unsafe {
            let native_in: &mut [f32] = native.input_channel(0, 0);
            for (i, sample) in native_in.iter_mut().enumerate() {
                *sample = if i % 2 == 0 { -1.0 } else { 1.0 };
            }

            let foreign_in: &[f32] = foreign.input_channel(0, 0);
            assert_eq!(foreign_in.len(), 64);
            assert_eq!(foreign_in[0], -1.0);
            assert_eq!(foreign_in[1], 1.0);

            let foreign_out: &mut [f32] = foreign.output_channel(0, 1);
            foreign_out.fill(0.25);

            let native_out: &[f32] = native.output_channel(0, 1);
            assert!(native_out.iter().all(|s| *s == 0.25));
        }
    }

    #[test]
    fn resize_reuses_equal_sized_mappings() {
        let name = test_name("resize");
        let config = AudioShmBufferConfig::new(name.clone(), &[2], &[2], 128, false);
        let mut buffer = AudioShmBuffer::create(config).unwrap();

        // Same size, different layout: no remap needed
        let same_size = AudioShmBufferConfig::new(name.clone(), &[1, 1], &[2], 128, false);
        buffer.resize(same_size.clone()).unwrap();
        assert_eq!(buffer.config(), &same_size);

        // Bigger block size forces a new mapping
        let bigger = AudioShmBufferConfig::new(name, &[2], &[2], 256, false);
        buffer.resize(bigger.clone()).unwrap();
        assert_eq!(buffer.config(), &bigger);
    }
}
