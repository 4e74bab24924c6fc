//! The shared buffer contract (§4.2): byte-addressable, bounds-checked,
//! stall-free storage with a ready/busy flag and a last-access cycle.
//! Timing is always the engine's responsibility, never the buffer's.

use crate::types::{Cycle, Size};

/// One instance of a memory buffer (one L3 tile, one L2 bank, ...).
#[derive(Debug, Clone)]
pub struct Buffer {
    instance_id: u32,
    data: Vec<u8>,
    busy: bool,
    last_access_cycle: Cycle,
    /// Only meaningful for `External`: peak external bandwidth in GB/s.
    bandwidth_gbps: Option<f64>,
    /// Only meaningful for `L2Bank`: cache line granularity in bytes.
    cache_line_size: Option<Size>,
}

impl Buffer {
    pub fn new(instance_id: u32, capacity: Size) -> Self {
        Self {
            instance_id,
            data: vec![0u8; capacity as usize],
            busy: false,
            last_access_cycle: 0,
            bandwidth_gbps: None,
            cache_line_size: None,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth_gbps: f64) -> Self {
        self.bandwidth_gbps = Some(bandwidth_gbps);
        self
    }

    pub fn with_cache_line(mut self, cache_line_size: Size) -> Self {
        self.cache_line_size = Some(cache_line_size);
        self
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn capacity(&self) -> Size {
        self.data.len() as Size
    }

    pub fn bandwidth_gbps(&self) -> Option<f64> {
        self.bandwidth_gbps
    }

    pub fn cache_line_size(&self) -> Option<Size> {
        self.cache_line_size
    }

    /// Bytes transferable per cycle at a given clock frequency, used by
    /// engines for `cycles = ceil(bytes / bandwidth_bytes_per_cycle)`.
    pub fn bandwidth_bytes_per_cycle(&self, clock_freq_ghz: f64) -> Option<f64> {
        self.bandwidth_gbps
            .map(|gbps| (gbps * 1e9 / 8.0) / (clock_freq_ghz * 1e9))
    }

    pub fn read(&mut self, offset: Size, dst: &mut [u8], n: Size) {
        let (o, n) = (offset as usize, n as usize);
        assert!(
            o + n <= self.data.len(),
            "buffer read out of bounds: offset={o} n={n} capacity={}",
            self.data.len()
        );
        dst[..n].copy_from_slice(&self.data[o..o + n]);
    }

    pub fn write(&mut self, offset: Size, src: &[u8], n: Size) {
        let (o, n) = (offset as usize, n as usize);
        assert!(
            o + n <= self.data.len(),
            "buffer write out of bounds: offset={o} n={n} capacity={}",
            self.data.len()
        );
        self.data[o..o + n].copy_from_slice(&src[..n]);
    }

    /// Cache-line-granular read for the streamer: `offset` and `n` must be
    /// aligned to the configured cache line size.
    pub fn read_cache_line(&mut self, offset: Size, dst: &mut [u8]) {
        let line = self.cache_line_size.expect("no cache line size configured");
        assert_eq!(offset % line, 0, "unaligned cache line read");
        self.read(offset, dst, line);
    }

    pub fn write_cache_line(&mut self, offset: Size, src: &[u8]) {
        let line = self.cache_line_size.expect("no cache line size configured");
        assert_eq!(offset % line, 0, "unaligned cache line write");
        self.write(offset, src, line);
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
        self.busy = false;
        self.last_access_cycle = 0;
    }

    pub fn is_ready(&self) -> bool {
        !self.busy
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn last_access_cycle(&self) -> Cycle {
        self.last_access_cycle
    }

    pub fn touch(&mut self, cycle: Cycle) {
        self.last_access_cycle = cycle;
    }
}

/// An ordered sequence of same-kind buffer instances.
#[derive(Debug, Default, Clone)]
pub struct BufferBank {
    instances: Vec<Buffer>,
}

impl BufferBank {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
        }
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.instances.push(buffer);
    }

    pub fn get(&self, instance_id: u32) -> Option<&Buffer> {
        self.instances
            .iter()
            .find(|b| b.instance_id() == instance_id)
    }

    pub fn get_mut(&mut self, instance_id: u32) -> Option<&mut Buffer> {
        self.instances
            .iter_mut()
            .find(|b| b.instance_id() == instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.instances.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Buffer> {
        self.instances.iter_mut()
    }

    pub fn reset_all(&mut self) {
        self.instances.iter_mut().for_each(Buffer::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Buffer::new(0, 64);
        let payload = [1u8, 2, 3, 4];
        buf.write(8, &payload, 4);
        let mut out = [0u8; 4];
        buf.read(8, &mut out, 4);
        assert_eq!(out, payload);
    }

    #[test]
    fn reset_zeros_bytes() {
        let mut buf = Buffer::new(0, 16);
        buf.write(0, &[9, 9, 9, 9], 4);
        buf.reset();
        let mut out = [1u8; 4];
        buf.read(0, &mut out, 4);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn bandwidth_conversion() {
        let buf = Buffer::new(0, 16).with_bandwidth(16.0); // 16 GB/s
        // at 1 GHz, 16 GB/s = 16 bytes/cycle
        let bpc = buf.bandwidth_bytes_per_cycle(1.0).unwrap();
        assert!((bpc - 16.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn read_out_of_bounds_panics() {
        let mut buf = Buffer::new(0, 4);
        let mut out = [0u8; 4];
        buf.read(2, &mut out, 4);
    }
}
