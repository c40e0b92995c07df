/// Reflected form of the DNP3 polynomial 0x3D65
const POLY: u16 = 0xA6BC;

/// CRC-16/DNP over `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }
    !crc
}

/// Append the CRC of `data` to `out`, low byte first
pub fn push_crc(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&crc16(data).to_le_bytes());
}

pub fn check(data: &[u8], crc: &[u8]) -> bool {
    crc.len() == 2 && crc16(data).to_le_bytes() == [crc[0], crc[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0xEA82);
    }

    #[test]
    fn test_reset_link_header() {
        // master 1 -> outstation 10, RESET_LINK_STATES
        let header = [0x05, 0x64, 0x05, 0xC0, 0x0A, 0x00, 0x01, 0x00];
        let mut framed = header.to_vec();
        push_crc(&mut framed, &header);
        assert!(check(&framed[..8], &framed[8..]));
        framed[3] ^= 0x01;
        assert!(!check(&framed[..8], &framed[8..]));
    }
}
