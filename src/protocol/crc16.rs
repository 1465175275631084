// CRC16-CCITT (polynomial 0x1021, initial value 0xFFFF, no reflection, no final xor)

const POLYNOMIAL: u16 = 0x1021;
pub const INITIAL: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Fold one byte into a running checksum.
#[inline]
pub fn update(crc: u16, byte: u8) -> u16 {
    let index = ((crc >> 8) as u8 ^ byte) as usize;
    (crc << 8) ^ TABLE[index]
}

/// Checksum of a whole slice.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(INITIAL, |crc, &b| update(crc, b))
}
