use std::str::FromStr;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    pub fn size(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 30000,
        }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Configs spell a port range as `"20000-30000"`; (de)serialize through
/// `FromStr`/`Display` rather than the struct's field layout.
impl serde::Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::error::Error for PortRangeParseError {}

impl std::fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::num::ParseIntError> for PortRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        PortRangeParseError(error.to_string())
    }
}

impl FromStr for PortRange {
    type Err = PortRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortRangeParseError(s.to_string()))?;

        Ok(Self {
            start: start.parse()?,
            end: end.parse()?,
        })
    }
}

/// Bit flag used by [`PortAllocator`]'s bucketed bitset.
#[derive(PartialEq, Eq)]
pub enum Bit {
    Low,
    High,
}

/// Bitset-backed port allocator: one bit per port in the configured range,
/// packed into 64-bit buckets, with randomized start offset so repeated
/// restarts don't hand out the same low ports first.
///
/// Adapted near-verbatim from the teacher's TURN relay port allocator
/// (`crates/service/src/session/ports.rs`): the "unique public port per
/// allocation" invariant is identical, only the caller-facing vocabulary
/// changes (TURN relay port → proxy public port).
///
/// # Test
///
/// ```
/// use std::collections::HashSet;
/// use retun_core::session::ports::*;
///
/// let mut pool = PortAllocator::default();
/// let mut ports = HashSet::with_capacity(PortAllocator::default().capacity());
///
/// while let Some(port) = pool.alloc(None) {
///     ports.insert(port);
/// }
///
/// assert_eq!(PortAllocator::default().capacity() + 1, ports.len());
/// ```
pub struct PortAllocator {
    port_range: PortRange,
    buckets: Vec<u64>,
    allocated: usize,
    bit_len: u32,
    max_offset: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

impl PortAllocator {
    pub fn new(port_range: PortRange) -> Self {
        let capacity = port_range.size();
        let bucket_size = (capacity as f32 / 64.0).ceil() as usize;

        Self {
            bit_len: (capacity as f32 % 64.0).ceil() as u32,
            buckets: vec![0; bucket_size.max(1)],
            max_offset: bucket_size.max(1) - 1,
            allocated: 0,
            port_range,
        }
    }

    pub fn capacity(&self) -> usize {
        self.port_range.size()
    }

    pub fn port_range(&self) -> &PortRange {
        &self.port_range
    }

    pub fn len(&self) -> usize {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Allocates a specific port if requested and free, otherwise a random
    /// free port. `start` (a bucket index) is exposed for deterministic
    /// testing; production callers pass `None`.
    pub fn alloc(&mut self, start: Option<usize>) -> Option<u16> {
        let mut index = None;
        let mut offset =
            start.unwrap_or_else(|| rand::rng().random_range(0..=self.max_offset) as usize);

        let previous = if offset == 0 {
            self.max_offset
        } else {
            offset - 1
        };

        loop {
            if let Some(i) = {
                let bucket = self.buckets[offset];
                if bucket < u64::MAX {
                    let idx = bucket.leading_ones();
                    if offset == self.max_offset && idx > self.bit_len {
                        None
                    } else {
                        Some(idx)
                    }
                } else {
                    None
                }
            } {
                index = Some(i as usize);
                break;
            }

            if offset == self.max_offset {
                offset = 0;
            } else {
                offset += 1;
            }

            if offset == previous {
                break;
            }
        }

        let index = index?;
        self.set_bit(offset, index, Bit::High);
        self.allocated += 1;

        let num = (offset * 64 + index) as u16;
        Some(self.port_range.start + num)
    }

    /// Attempts to allocate exactly `port`; fails if it's out of range or
    /// already taken.
    pub fn alloc_specific(&mut self, port: u16) -> Option<u16> {
        if !self.port_range.contains(port) {
            return None;
        }

        let offset = (port - self.port_range.start) as usize;
        let bucket = offset / 64;
        let index = offset - (bucket * 64);

        let taken = (self.buckets[bucket] & (1 << (63 - index))) != 0;
        if taken {
            return None;
        }

        self.set_bit(bucket, index, Bit::High);
        self.allocated += 1;
        Some(port)
    }

    pub fn set_bit(&mut self, bucket: usize, index: usize, bit: Bit) {
        let high_mask = 1u64 << (63 - index);
        let value = self.buckets[bucket];
        self.buckets[bucket] = match bit {
            Bit::High => value | high_mask,
            Bit::Low => value & !high_mask,
        };
    }

    pub fn restore(&mut self, port: u16) {
        assert!(self.port_range.contains(port));

        let offset = (port - self.port_range.start) as usize;
        let bucket = offset / 64;
        let index = offset - (bucket * 64);

        let was_high = (self.buckets[bucket] & (1 << (63 - index))) != 0;
        if !was_high {
            return;
        }

        self.set_bit(bucket, index, Bit::Low);
        self.allocated -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_restores() {
        let mut pool = PortAllocator::new(PortRange::new(20000, 20010));
        let p1 = pool.alloc(Some(0)).unwrap();
        let p2 = pool.alloc(Some(0)).unwrap();
        assert_ne!(p1, p2);
        assert_eq!(pool.len(), 2);

        pool.restore(p1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn specific_port_rejected_if_taken() {
        let mut pool = PortAllocator::new(PortRange::new(20000, 20010));
        assert_eq!(pool.alloc_specific(20005), Some(20005));
        assert_eq!(pool.alloc_specific(20005), None);
    }

    #[test]
    fn parses_dash_separated_range() {
        let range: PortRange = "20000-21000".parse().unwrap();
        assert_eq!(range.start(), 20000);
        assert_eq!(range.end(), 21000);
    }
}
