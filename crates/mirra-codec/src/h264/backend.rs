//! 硬件解码后端接口.
//!
//! [`SliceDecoder`](super::SliceDecoder) 负责码流语义 (POC, 参考标记, 重排),
//! 具体的会话、图像与命令提交由实现 [`DecodeBackend`] 的后端完成.

use mirra_core::MirraResult;

use super::params::ParameterSets;
use super::pps::Pps;
use super::slice::SliceHeader;
use super::sps::Sps;

/// 创建解码会话所需的描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub profile_idc: u8,
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    /// 最大编码宽度 (像素)
    pub max_coded_width: u32,
    /// 最大编码高度 (像素)
    pub max_coded_height: u32,
    /// DPB 槽位数量
    pub max_dpb_slots: u32,
    /// 单次解码最多引用的参考帧数量
    pub max_active_references: u32,
}

impl SessionDescriptor {
    /// 由 SPS 和配置上限构造, 编码尺寸取两者较大值
    pub fn from_sps(sps: &Sps, max_width: u32, max_height: u32, dpb_slots: u32) -> Self {
        Self {
            profile_idc: sps.profile_idc,
            chroma_format_idc: sps.chroma_format_idc,
            bit_depth_luma: sps.bit_depth_luma,
            bit_depth_chroma: sps.bit_depth_chroma,
            max_coded_width: max_width.max(sps.coded_width()),
            max_coded_height: max_height.max(sps.coded_height()),
            max_dpb_slots: dpb_slots,
            max_active_references: dpb_slots.saturating_sub(1).max(1),
        }
    }

    /// 现有会话能否继续解码 `sps` 描述的序列
    pub fn accepts(&self, sps: &Sps) -> bool {
        self.profile_idc == sps.profile_idc
            && self.chroma_format_idc == sps.chroma_format_idc
            && self.bit_depth_luma == sps.bit_depth_luma
            && self.bit_depth_chroma == sps.bit_depth_chroma
            && sps.coded_width() <= self.max_coded_width
            && sps.coded_height() <= self.max_coded_height
    }
}

/// 设备能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCaps {
    pub max_dpb_slots: u32,
    pub max_active_references: u32,
    pub max_coded_width: u32,
    pub max_coded_height: u32,
    /// 码流缓冲的大小与偏移对齐要求
    pub bitstream_alignment: u64,
}

/// 已上传到帧资源环中的码流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamSlot {
    /// 帧资源环中的位置
    pub ring_index: usize,
    /// 有效数据长度 (已按设备要求对齐)
    pub size: u64,
}

/// 参与一次解码的槽位 (输出或参考)
#[derive(Debug)]
pub struct ReferenceSlot<'a, P> {
    pub slot_index: usize,
    pub picture: &'a P,
    pub frame_num: u32,
    pub poc: i32,
    pub is_long_term: bool,
    pub long_term_frame_idx: u32,
}

/// 一次解码提交, 对应一幅完整图像的全部 slice
#[derive(Debug)]
pub struct DecodeSubmission<'a, P> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    /// 图像首个 slice 的 header
    pub header: &'a SliceHeader,
    pub bitstream: BitstreamSlot,
    /// 每个 slice 起始码在码流缓冲中的偏移
    pub slice_offsets: &'a [u32],
    /// 全部 slice 均为帧内编码
    pub intra_only: bool,
    /// 当前图像的 POC
    pub poc: i32,
    /// 输出槽位
    pub target: ReferenceSlot<'a, P>,
    /// 当前全部参考槽位 (不含输出槽位)
    pub references: Vec<ReferenceSlot<'a, P>>,
}

/// 硬件解码后端
pub trait DecodeBackend {
    /// DPB 槽位持有的图像资源
    type Picture;

    /// 查询设备对该描述的支持能力
    fn query_capabilities(&mut self, desc: &SessionDescriptor) -> MirraResult<SessionCaps>;

    /// 创建会话并绑定内存, 失败时不得遗留任何已创建对象
    fn create_session(&mut self, desc: &SessionDescriptor) -> MirraResult<()>;

    /// 创建一个 DPB 图像
    fn create_picture(
        &mut self,
        desc: &SessionDescriptor,
        index: usize,
    ) -> MirraResult<Self::Picture>;

    fn destroy_picture(&mut self, picture: Self::Picture);

    /// 根据当前参数集重建会话参数
    fn update_parameters(&mut self, sets: &ParameterSets) -> MirraResult<()>;

    fn destroy_parameters(&mut self);

    /// 释放会话内存并销毁会话
    fn destroy_session(&mut self);

    /// 等待设备空闲
    fn wait_idle(&mut self);

    /// 获取帧资源并拷入一幅图像的码流 (各 slice 均带起始码)
    fn upload_bitstream(&mut self, data: &[u8]) -> MirraResult<BitstreamSlot>;

    /// 提交一次解码
    fn submit(&mut self, submission: &DecodeSubmission<'_, Self::Picture>) -> MirraResult<()>;
}
