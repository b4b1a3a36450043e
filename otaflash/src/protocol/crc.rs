//! CRC16-XMODEM (polynomial 0x1021, initial value 0, no reflection).

const POLY: u16 = 0x1021;

/// Compute the CRC16-XMODEM checksum of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
        crc
    })
}
