//! CRC-16/MCRF4XX ("X.25") as used by MAVLink.

/// Initial accumulator value.
pub const X25_INIT: u16 = 0xFFFF;

/// Running X.25 checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X25 {
    crc: u16,
}

impl X25 {
    pub fn new() -> Self {
        Self { crc: X25_INIT }
    }

    /// Fold one byte into the checksum.
    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.crc as u8);
        tmp ^= tmp << 4;
        let tmp = u16::from(tmp);
        self.crc = (self.crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    /// Fold a byte slice into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.accumulate(b);
        }
    }

    pub fn value(&self) -> u16 {
        self.crc
    }
}

impl Default for X25 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a frame body (header without magic, plus payload), seeded
/// at the end with the message's `crc_extra` byte.
pub fn frame_checksum(body: &[u8], crc_extra: u8) -> u16 {
    let mut crc = X25::new();
    crc.update(body);
    crc.accumulate(crc_extra);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_check_value() {
        let mut crc = X25::new();
        crc.update(b"123456789");
        assert_eq!(crc.value(), 0x6F91);
    }

    #[test]
    fn empty_input_keeps_initial_value() {
        assert_eq!(X25::default().value(), X25_INIT);
    }

    #[test]
    fn crc_extra_changes_result() {
        let body = [9u8, 0, 1, 1, 0, 0, 0, 0, 0, 6, 8, 0, 0, 3];
        assert_ne!(frame_checksum(&body, 50), frame_checksum(&body, 51));
    }

    #[test]
    fn incremental_equals_bulk() {
        let mut a = X25::new();
        a.update(b"mav");
        a.update(b"link");
        let mut b = X25::new();
        b.update(b"mavlink");
        assert_eq!(a, b);
    }
}
