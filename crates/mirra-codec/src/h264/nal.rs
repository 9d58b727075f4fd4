//! Annex B 码流切分与 NAL 头部解析.
//!
//! 起始码为 `00 00 01` 或 `00 00 00 01`. NAL 头部 1 字节:
//! `forbidden_zero_bit(1) | nal_ref_idc(2) | nal_unit_type(5)`.
//!
//! [`NalUnit`] 只是调用方缓冲区上的视图, 生命周期不超过一次解析调用.
//! GPU 解码需要带起始码的原始字节, 因此视图同时保留起始码区间.

use std::fmt;

use log::debug;
use mirra_core::{MirraError, MirraResult};

/// NAL 单元类型 (nal_unit_type 1..=13, 其余归入 `Unknown`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// 非 IDR slice
    Slice,
    /// 数据分区 A/B/C, 不支持
    SliceDpa,
    SliceDpb,
    SliceDpc,
    /// IDR slice
    SliceIdr,
    Sei,
    Sps,
    Pps,
    /// 访问单元分隔符
    Aud,
    EndOfSequence,
    EndOfStream,
    FillerData,
    SpsExtension,
    Unknown(u8),
}

/// 编号 1..=13 对应的类型, 下标为编号减一
const KNOWN_TYPES: [NalUnitType; 13] = [
    NalUnitType::Slice,
    NalUnitType::SliceDpa,
    NalUnitType::SliceDpb,
    NalUnitType::SliceDpc,
    NalUnitType::SliceIdr,
    NalUnitType::Sei,
    NalUnitType::Sps,
    NalUnitType::Pps,
    NalUnitType::Aud,
    NalUnitType::EndOfSequence,
    NalUnitType::EndOfStream,
    NalUnitType::FillerData,
    NalUnitType::SpsExtension,
];

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        let id = value & 0x1F;
        match id {
            1..=13 => KNOWN_TYPES[id as usize - 1],
            _ => Self::Unknown(id),
        }
    }
}

impl From<NalUnitType> for u8 {
    fn from(value: NalUnitType) -> Self {
        match value {
            NalUnitType::Unknown(id) => id,
            known => KNOWN_TYPES
                .iter()
                .position(|t| *t == known)
                .map_or(0, |index| index as u8 + 1),
        }
    }
}

impl NalUnitType {
    /// 携带 slice 数据
    pub fn is_vcl(self) -> bool {
        (1..=5).contains(&u8::from(self))
    }

    pub fn is_idr(self) -> bool {
        self == Self::SliceIdr
    }

    /// 日志与探测输出使用的短名称
    pub fn name(self) -> &'static str {
        match self {
            Self::Slice => "Slice",
            Self::SliceDpa => "SliceDPA",
            Self::SliceDpb => "SliceDPB",
            Self::SliceDpc => "SliceDPC",
            Self::SliceIdr => "IDR",
            Self::Sei => "SEI",
            Self::Sps => "SPS",
            Self::Pps => "PPS",
            Self::Aud => "AUD",
            Self::EndOfSequence => "EndOfSeq",
            Self::EndOfStream => "EndOfStream",
            Self::FillerData => "Filler",
            Self::SpsExtension => "SPSExt",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "Unknown({id})"),
            other => f.write_str(other.name()),
        }
    }
}

/// NAL 单元视图
#[derive(Debug, Clone, Copy)]
pub struct NalUnit<'a> {
    pub nal_type: NalUnitType,
    /// nal_ref_idc, 0 表示非参考
    pub ref_idc: u8,
    /// 起始码 + NAL 数据
    raw: &'a [u8],
    /// 起始码长度 (0, 3 或 4)
    header_offset: usize,
}

impl<'a> NalUnit<'a> {
    /// 从不含起始码的 NAL 数据 (含头部字节) 解析
    pub fn parse(data: &'a [u8]) -> MirraResult<Self> {
        Self::parse_with_start_code(data, 0)
    }

    /// `raw` 以长度为 `header_offset` 的起始码开头
    pub fn parse_with_start_code(raw: &'a [u8], header_offset: usize) -> MirraResult<Self> {
        let header = *raw
            .get(header_offset)
            .ok_or_else(|| MirraError::InvalidData("H.264: NAL 缺少头部字节".into()))?;
        if header & 0x80 != 0 {
            return Err(MirraError::InvalidData(format!(
                "H.264: forbidden_zero_bit 置位, header=0x{:02X}",
                header
            )));
        }
        Ok(Self {
            nal_type: NalUnitType::from(header),
            ref_idc: (header >> 5) & 0x03,
            raw,
            header_offset,
        })
    }

    /// 不含起始码, 以头部字节开头
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[self.header_offset..]
    }

    pub fn with_start_code(&self) -> &'a [u8] {
        self.raw
    }

    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    pub fn is_reference(&self) -> bool {
        self.ref_idc != 0
    }

    /// 头部之后的 RBSP (已去除防竞争字节)
    pub fn rbsp(&self) -> Vec<u8> {
        remove_emulation_prevention(&self.payload()[1..])
    }
}

// ============================================================
// Annex B 切分
// ============================================================

/// 按起始码惰性切分的迭代器, 见 [`split_annex_b`]
#[derive(Debug, Clone)]
pub struct AnnexBSplitter<'a> {
    data: &'a [u8],
    /// 下一个起始码的位置与长度
    next: Option<(usize, usize)>,
}

impl<'a> Iterator for AnnexBSplitter<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<NalUnit<'a>> {
        while let Some((start, code_len)) = self.next {
            let body = start + code_len;
            self.next = find_start_code(self.data, body);
            let end = self.next.map_or(self.data.len(), |(pos, _)| pos);

            // trailing_zero_8bits 不属于 NAL
            let trimmed = self.data[body..end]
                .iter()
                .rposition(|&b| b != 0x00)
                .map_or(body, |last| body + last + 1);
            if trimmed == body {
                continue;
            }
            match NalUnit::parse_with_start_code(&self.data[start..trimmed], code_len) {
                Ok(nal) => return Some(nal),
                Err(err) => debug!("H.264: 跳过 NAL, offset={}, {}", start, err),
            }
        }
        None
    }
}

/// 惰性切分 Annex B 数据
///
/// 第一个起始码之前的字节被忽略, forbidden_zero_bit 置位的 NAL 被跳过.
pub fn split_annex_b(data: &[u8]) -> AnnexBSplitter<'_> {
    AnnexBSplitter {
        data,
        next: find_start_code(data, 0),
    }
}

/// 切分 Annex B 数据并收集全部 NAL
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit<'_>> {
    split_annex_b(data).collect()
}

/// 从 `from` 起查找下一个起始码, 返回 (位置, 长度)
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = data.get(from..)?;
    let rel = tail.windows(3).position(|w| w == [0x00, 0x00, 0x01])?;
    let pos = from + rel;
    // 前面多一个 0x00 视为 4 字节起始码
    if rel > 0 && data[pos - 1] == 0x00 {
        Some((pos - 1, 4))
    } else {
        Some((pos, 3))
    }
}

// ============================================================
// 防竞争字节
// ============================================================

/// 去除防竞争字节: `00 00 03` → `00 00`
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// 插入防竞争字节, 是 [`remove_emulation_prevention`] 的逆操作
///
/// 连续两个 0x00 之后若下一字节 <= 0x03, 插入 0x03.
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0usize;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_conversion() {
        for id in 0..32u8 {
            assert_eq!(u8::from(NalUnitType::from(id)), id);
        }
        assert_eq!(NalUnitType::from(0x65), NalUnitType::SliceIdr);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::Slice);
        assert!(NalUnitType::SliceDpc.is_vcl());
        assert!(!NalUnitType::Sei.is_vcl());
        assert_eq!(NalUnitType::Unknown(20).to_string(), "Unknown(20)");
        assert_eq!(NalUnitType::SliceIdr.to_string(), "IDR");
    }

    #[test]
    fn test_header_fields() {
        // 0x41: ref_idc=2, type=1
        let nal = NalUnit::parse(&[0x41, 0x9A, 0x00, 0x00, 0x03, 0x01]).unwrap();
        assert_eq!(nal.nal_type, NalUnitType::Slice);
        assert_eq!(nal.ref_idc, 2);
        assert!(nal.is_reference());
        assert_eq!(nal.rbsp(), vec![0x9A, 0x00, 0x00, 0x01]);

        let nal = NalUnit::parse(&[0x01, 0x9A]).unwrap();
        assert!(!nal.is_reference());
    }

    #[test]
    fn test_header_rejects_forbidden_bit() {
        let err = NalUnit::parse(&[0x85]).expect_err("forbidden_zero_bit=1 应返回错误");
        assert!(err.to_string().contains("forbidden_zero_bit"), "{}", err);
        assert!(NalUnit::parse(&[]).is_err());
        assert!(NalUnit::parse_with_start_code(&[0, 0, 1], 3).is_err());
    }

    #[test]
    fn test_split_keeps_start_codes() {
        let data = [
            0xAB, 0xCD, // 起始码之前的垃圾
            0x00, 0x00, 0x00, 0x01, 0x09, 0xF0, // AUD
            0x00, 0x00, 0x01, 0x06, 0x05, 0x01, 0x80, // SEI
            0x00, 0x00, 0x00, 0x01, 0x25, 0xB8, 0x00, 0x00, // IDR + trailing zero
        ];
        let nals = parse_annex_b(&data);
        let types: Vec<_> = nals.iter().map(|n| n.nal_type).collect();
        assert_eq!(
            types,
            vec![NalUnitType::Aud, NalUnitType::Sei, NalUnitType::SliceIdr]
        );
        assert_eq!(nals[0].with_start_code(), &[0, 0, 0, 1, 0x09, 0xF0]);
        assert_eq!(nals[0].header_offset(), 4);
        assert_eq!(nals[1].header_offset(), 3);
        assert_eq!(nals[1].payload(), &[0x06, 0x05, 0x01, 0x80]);
        assert_eq!(nals[2].payload(), &[0x25, 0xB8], "尾部 0 字节应被去除");
        assert_eq!(nals[2].ref_idc, 1);
    }

    #[test]
    fn test_split_skips_invalid_and_empty_units() {
        let data = [
            0x00, 0x00, 0x01, // 空 NAL
            0x00, 0x00, 0x01, 0xE5, 0x11, // forbidden=1
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80,
        ];
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::Pps);
    }

    #[test]
    fn test_split_without_start_code() {
        assert!(parse_annex_b(&[0x67, 0x42, 0x00]).is_empty());
        assert!(parse_annex_b(&[0x00, 0x00]).is_empty());
        assert!(parse_annex_b(&[]).is_empty());
        assert_eq!(split_annex_b(&[0, 0, 1, 0x09, 0x10]).count(), 1);
    }

    #[test]
    fn test_emulation_prevention_remove() {
        assert_eq!(
            remove_emulation_prevention(&[0x7F, 0x00, 0x00, 0x03, 0x00, 0x11]),
            vec![0x7F, 0x00, 0x00, 0x00, 0x11]
        );
        // 连续两处转义
        assert_eq!(
            remove_emulation_prevention(&[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x02]),
            vec![0x00, 0x00, 0x00, 0x00, 0x02]
        );
        // 单个 0x00 后的 0x03 保留
        assert_eq!(
            remove_emulation_prevention(&[0x10, 0x00, 0x03, 0x40]),
            vec![0x10, 0x00, 0x03, 0x40]
        );
    }

    #[test]
    fn test_emulation_prevention_round_trip() {
        // 合法转义后的 NAL 负载: 每个 00 00 后都带有 03
        let escaped_cases: [&[u8]; 4] = [
            &[0x11, 0x00, 0x00, 0x03, 0x01, 0x22],
            &[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x02],
            &[0x00, 0x00, 0x03, 0x03, 0x80],
            &[0x25, 0x88, 0x80, 0x40],
        ];
        for escaped in escaped_cases {
            let rbsp = remove_emulation_prevention(escaped);
            assert_eq!(add_emulation_prevention(&rbsp), escaped, "往返结果不一致");
        }

        let raw: Vec<u8> = (0..512u32).map(|i| if i % 7 < 4 { 0 } else { (i % 5) as u8 }).collect();
        let escaped = add_emulation_prevention(&raw);
        assert!(
            !escaped.windows(3).any(|w| w[0] == 0 && w[1] == 0 && w[2] <= 2),
            "转义后不应出现起始码前缀"
        );
        assert_eq!(remove_emulation_prevention(&escaped), raw);
    }
}
