//! SPS/PPS 共用的量化矩阵 (scaling list) 语法.
//!
//! 解码本身由硬件完成, 这里解析出矩阵只是为了填充会话参数并保持比特游标正确.

use mirra_core::{BitstreamReader, MirraError, MirraResult};

pub(crate) const DEFAULT_SCALING_4X4_INTRA: [u8; 16] = [
    6, 13, 20, 28, 13, 20, 28, 32, 20, 28, 32, 37, 28, 32, 37, 42,
];

pub(crate) const DEFAULT_SCALING_4X4_INTER: [u8; 16] = [
    10, 14, 20, 24, 14, 20, 24, 27, 20, 24, 27, 30, 24, 27, 30, 34,
];

pub(crate) const DEFAULT_SCALING_8X8_INTRA: [u8; 64] = [
    6, 10, 13, 16, 18, 23, 25, 27, 10, 11, 16, 18, 23, 25, 27, 29, 13, 16, 18, 23, 25, 27, 29, 31,
    16, 18, 23, 25, 27, 29, 31, 33, 18, 23, 25, 27, 29, 31, 33, 36, 23, 25, 27, 29, 31, 33, 36, 38,
    25, 27, 29, 31, 33, 36, 38, 40, 27, 29, 31, 33, 36, 38, 40, 42,
];

pub(crate) const DEFAULT_SCALING_8X8_INTER: [u8; 64] = [
    9, 13, 15, 17, 19, 21, 22, 24, 13, 13, 17, 19, 21, 22, 24, 25, 15, 17, 19, 21, 22, 24, 25, 27,
    17, 19, 21, 22, 24, 25, 27, 28, 19, 21, 22, 24, 25, 27, 28, 30, 21, 22, 24, 25, 27, 28, 30, 32,
    22, 24, 25, 27, 28, 30, 32, 33, 24, 25, 27, 28, 30, 32, 33, 35,
];

/// 一组量化矩阵 (已应用默认/回退规则)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingLists {
    /// 6 组 4x4 矩阵
    pub list_4x4: [[u8; 16]; 6],
    /// 8x8 矩阵 (4:4:4 为 6 组, 其余为 2 组, 未启用 8x8 变换时为空)
    pub list_8x8: Vec<[u8; 64]>,
}

impl ScalingLists {
    /// 全部为默认矩阵
    pub fn defaults(num_8x8: usize) -> Self {
        Self {
            list_4x4: [
                DEFAULT_SCALING_4X4_INTRA,
                DEFAULT_SCALING_4X4_INTRA,
                DEFAULT_SCALING_4X4_INTRA,
                DEFAULT_SCALING_4X4_INTER,
                DEFAULT_SCALING_4X4_INTER,
                DEFAULT_SCALING_4X4_INTER,
            ],
            list_8x8: (0..num_8x8).map(default_8x8_by_idx).collect(),
        }
    }
}

fn default_4x4_by_idx(idx: usize) -> [u8; 16] {
    if idx < 3 {
        DEFAULT_SCALING_4X4_INTRA
    } else {
        DEFAULT_SCALING_4X4_INTER
    }
}

fn default_8x8_by_idx(idx: usize) -> [u8; 64] {
    if idx % 2 == 0 {
        DEFAULT_SCALING_8X8_INTRA
    } else {
        DEFAULT_SCALING_8X8_INTER
    }
}

/// 解析 `num_8x8` 组 8x8 矩阵的 scaling_matrix 语法
///
/// 缺省矩阵的回退规则: list0/list3 与 8x8 的前两组回退到默认矩阵,
/// 其余回退到前一组 (8x8 回退到同奇偶的前一组).
pub(crate) fn parse_scaling_matrix(
    br: &mut BitstreamReader,
    num_8x8: usize,
) -> MirraResult<ScalingLists> {
    let mut lists = ScalingLists::defaults(num_8x8);

    for list_idx in 0..6 + num_8x8 {
        let present = br.read_flag()?;
        if list_idx < 6 {
            lists.list_4x4[list_idx] = if present {
                let (parsed, use_default) = parse_scaling_list::<16>(br)?;
                if use_default {
                    default_4x4_by_idx(list_idx)
                } else {
                    parsed
                }
            } else if list_idx == 0 || list_idx == 3 {
                default_4x4_by_idx(list_idx)
            } else {
                lists.list_4x4[list_idx - 1]
            };
            continue;
        }

        let idx8 = list_idx - 6;
        if idx8 >= lists.list_8x8.len() {
            return Err(MirraError::InvalidData(format!(
                "H.264: scaling_list_8x8 索引越界, idx={}",
                idx8
            )));
        }
        let value = if present {
            let (parsed, use_default) = parse_scaling_list::<64>(br)?;
            if use_default {
                default_8x8_by_idx(idx8)
            } else {
                parsed
            }
        } else if idx8 < 2 {
            default_8x8_by_idx(idx8)
        } else {
            lists.list_8x8[idx8 - 2]
        };
        lists.list_8x8[idx8] = value;
    }

    Ok(lists)
}

fn parse_scaling_list<const N: usize>(br: &mut BitstreamReader) -> MirraResult<([u8; N], bool)> {
    let mut list = [0u8; N];
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    let mut use_default = false;

    for (idx, slot) in list.iter_mut().enumerate() {
        if next_scale != 0 {
            let delta_scale = br.read_se()?;
            let sum = i64::from(last_scale) + i64::from(delta_scale) + 256;
            next_scale = sum.rem_euclid(256) as i32;
            if idx == 0 && next_scale == 0 {
                use_default = true;
            }
        }
        let cur_scale = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
        *slot = cur_scale as u8;
        last_scale = cur_scale;
    }

    Ok((list, use_default))
}
