//! RBSP 位读取器.
//!
//! 输入必须已去除防竞争字节. 位序为 MSB first, 游标以位为单位.

use crate::{MirraError, MirraResult};

/// Exp-Golomb 码允许的最大前导零个数
const MAX_GOLOMB_ZEROS: u32 = 31;

/// 位读取器
///
/// ```
/// use mirra_core::bitreader::BitstreamReader;
///
/// // 1 | 010 | 011 => ue: 0, 1, 2
/// let mut br = BitstreamReader::new(&[0b1010_0110]);
/// assert_eq!(br.read_ue().unwrap(), 0);
/// assert_eq!(br.read_ue().unwrap(), 1);
/// assert_eq!(br.read_ue().unwrap(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct BitstreamReader<'a> {
    data: &'a [u8],
    /// 已消耗的位数
    pos: usize,
}

impl<'a> BitstreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bits_read(&self) -> usize {
        self.pos
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn is_eof(&self) -> bool {
        self.bits_left() == 0
    }

    /// 当前游标所在字节 (已对齐时即下一个待读字节)
    pub fn byte_position(&self) -> usize {
        self.pos / 8
    }

    pub fn read_bit(&mut self) -> MirraResult<u32> {
        let byte = *self.data.get(self.pos / 8).ok_or(MirraError::Eof)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(u32::from(bit))
    }

    pub fn read_flag(&mut self) -> MirraResult<bool> {
        Ok(self.read_bit()? != 0)
    }

    /// 读取 `n` 位 (0..=32), 结果右对齐
    pub fn read_bits(&mut self, n: u32) -> MirraResult<u32> {
        let value = self.peek_bits(n)?;
        self.pos += n as usize;
        Ok(value)
    }

    /// 读取 `n` 位但不移动游标
    pub fn peek_bits(&self, n: u32) -> MirraResult<u32> {
        if n > 32 {
            return Err(MirraError::InvalidArgument(format!(
                "一次最多读取 32 位, 请求 {} 位",
                n
            )));
        }
        if n as usize > self.bits_left() {
            return Err(MirraError::Eof);
        }
        if n == 0 {
            return Ok(0);
        }

        // 至多跨 5 个字节, 拼入 64 位窗口后一次移位取出
        let first = self.pos / 8;
        let last = (self.pos + n as usize - 1) / 8;
        let window = self.data[first..=last]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        let window_bits = (last - first + 1) * 8;
        let shift = window_bits - self.pos % 8 - n as usize;
        let mask = (1u64 << n) - 1;
        Ok(((window >> shift) & mask) as u32)
    }

    /// 读取 `n` 位二进制补码
    pub fn read_bits_signed(&mut self, n: u32) -> MirraResult<i32> {
        let raw = self.read_bits(n)?;
        if n == 0 || n >= 32 {
            return Ok(raw as i32);
        }
        let unused = 32 - n;
        Ok(((raw << unused) as i32) >> unused)
    }

    pub fn skip_bits(&mut self, n: u32) -> MirraResult<()> {
        if n as usize > self.bits_left() {
            return Err(MirraError::Eof);
        }
        self.pos += n as usize;
        Ok(())
    }

    pub fn align_to_byte(&mut self) {
        self.pos = self.pos.next_multiple_of(8);
    }

    /// ue(v)
    pub fn read_ue(&mut self) -> MirraResult<u32> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > MAX_GOLOMB_ZEROS {
                return Err(MirraError::InvalidData(format!(
                    "Exp-Golomb 前导零超过 {} 个",
                    MAX_GOLOMB_ZEROS
                )));
            }
        }
        let suffix = u64::from(self.read_bits(zeros)?);
        let value = (1u64 << zeros) - 1 + suffix;
        u32::try_from(value)
            .map_err(|_| MirraError::InvalidData(format!("Exp-Golomb 值溢出: {}", value)))
    }

    /// se(v), 码字 k 映射为 (-1)^(k+1) * ceil(k / 2)
    pub fn read_se(&mut self) -> MirraResult<i32> {
        let k = i64::from(self.read_ue()?);
        let magnitude = (k + 1) / 2;
        let value = if k % 2 == 0 { -magnitude } else { magnitude };
        Ok(value as i32)
    }

    /// 游标是否位于 rbsp_stop_one_bit 之前
    pub fn more_rbsp_data(&self) -> bool {
        let Some(last) = self.data.iter().rposition(|&b| b != 0) else {
            return false;
        };
        let stop_bit = last * 8 + 7 - self.data[last].trailing_zeros() as usize;
        self.pos < stop_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_reads_across_bytes() {
        let data = [0xA5, 0x3C, 0xF0];
        let mut br = BitstreamReader::new(&data);
        assert_eq!(br.read_bits(3).unwrap(), 0b101);
        assert_eq!(br.read_bits(10).unwrap(), 0b00_1010_0111);
        assert_eq!(br.bits_read(), 13);
        assert_eq!(br.read_bits(11).unwrap(), 0b100_1111_0000);
        assert!(br.is_eof());
        assert_eq!(br.read_bits(0).unwrap(), 0);
    }

    #[test]
    fn test_read_32_bits_unaligned() {
        let data = [0x0F, 0xFF, 0xFF, 0xFF, 0xF0];
        let mut br = BitstreamReader::new(&data);
        br.skip_bits(4).unwrap();
        assert_eq!(br.read_bits(32).unwrap(), u32::MAX);
        assert!(br.read_bits(33).is_err());
    }

    #[test]
    fn test_read_ue_sequence() {
        // 1 | 010 | 011 | 00100 | 00101 => 0, 1, 2, 3, 4
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut br = BitstreamReader::new(&data);
        for expected in 0..5 {
            assert_eq!(br.read_ue().unwrap(), expected);
        }
    }

    #[test]
    fn test_read_ue_large_value() {
        // 31 个前导零 + 1 + 31 位全 1 => 2^32 - 2
        let mut data = [0u8; 8];
        data[3] = 0x01;
        data[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFE]);
        let mut br = BitstreamReader::new(&data);
        assert_eq!(br.read_ue().unwrap(), u32::MAX - 1);
    }

    #[test]
    fn test_read_ue_rejects_long_prefix() {
        let mut br = BitstreamReader::new(&[0u8; 8]);
        assert!(matches!(br.read_ue(), Err(MirraError::InvalidData(_))));

        let mut br = BitstreamReader::new(&[0x00]);
        assert!(matches!(br.read_ue(), Err(MirraError::Eof)));
    }

    #[test]
    fn test_read_se_mapping() {
        // ue 0,1,2,3,4 => se 0,1,-1,2,-2
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut br = BitstreamReader::new(&data);
        let values: Vec<i32> = (0..5).map(|_| br.read_se().unwrap()).collect();
        assert_eq!(values, vec![0, 1, -1, 2, -2]);
    }

    #[test]
    fn test_read_bits_signed() {
        let mut br = BitstreamReader::new(&[0b1111_1011, 0b0000_0000]);
        assert_eq!(br.read_bits_signed(5).unwrap(), -1);
        assert_eq!(br.read_bits_signed(3).unwrap(), 3);
        assert_eq!(br.read_bits_signed(8).unwrap(), 0);
    }

    #[test]
    fn test_peek_skip_align() {
        let data = [0b1011_0001, 0b0101_0101];
        let mut br = BitstreamReader::new(&data);
        assert_eq!(br.peek_bits(4).unwrap(), 0b1011);
        assert_eq!(br.bits_read(), 0);
        br.skip_bits(5).unwrap();
        br.align_to_byte();
        assert_eq!(br.byte_position(), 1);
        br.align_to_byte();
        assert_eq!(br.byte_position(), 1, "已对齐时不应移动");
        assert!(br.skip_bits(9).is_err());
        assert_eq!(br.bits_left(), 8);
    }

    #[test]
    fn test_more_rbsp_data() {
        // 数据位 101, 随后 stop bit 1 与对齐零
        let mut br = BitstreamReader::new(&[0b1011_0000]);
        assert!(br.more_rbsp_data());
        br.read_bits(3).unwrap();
        assert!(!br.more_rbsp_data());

        // 末尾的 cabac_zero_word 不影响判断
        let mut br = BitstreamReader::new(&[0b0100_0000, 0x80, 0x00, 0x00]);
        br.read_bits(8).unwrap();
        assert!(!br.more_rbsp_data());
        assert!(!BitstreamReader::new(&[0, 0]).more_rbsp_data());
    }

    #[test]
    fn test_eof_error() {
        let mut br = BitstreamReader::new(&[0x00]);
        br.read_bits(8).unwrap();
        assert!(matches!(br.read_bits(1), Err(MirraError::Eof)));
        assert!(br.read_flag().is_err());
    }
}
