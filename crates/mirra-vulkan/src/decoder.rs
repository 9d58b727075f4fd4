//! GPU 层解码器: slice 状态机 + Vulkan 后端 + 计算转换.

use std::sync::Arc;

use log::{debug, info};

use mirra_codec::{DecoderStats, OutputPicture, SliceDecoder, SliceDecoderConfig};
use mirra_core::{MirraError, MirraResult};
use mirra_scale::ColorSpec;

use crate::backend::VulkanBackend;
use crate::context::{GpuDecoder, GpuDecoderConfig, GpuFrame, VulkanContext};
use crate::convert::ComputeConverter;

/// Vulkan Video H.264 解码器
pub struct VulkanDecoder {
    slice: SliceDecoder<VulkanBackend>,
    converter: ComputeConverter,
}

impl VulkanDecoder {
    /// 检查设备扩展与着色器, 创建解码器 (会话在收到 SPS 后创建)
    pub fn new(ctx: Arc<VulkanContext>, config: &GpuDecoderConfig) -> MirraResult<Self> {
        ctx.check_required_extensions()?;
        let converter = ComputeConverter::new(ctx.clone(), config.dpb_slots as usize)?;
        let backend = VulkanBackend::new(ctx.clone(), config.frames_in_flight, config.sync_decode);
        let slice = SliceDecoder::new(
            backend,
            SliceDecoderConfig {
                max_width: config.max_width,
                max_height: config.max_height,
                dpb_slots: config.dpb_slots,
                reorder_capacity: config.reorder_capacity,
            },
        );
        info!(
            "Vulkan: 解码器已创建, 设备={}, 帧资源 {} 个, {}",
            ctx.device_name(),
            config.frames_in_flight,
            if config.sync_decode { "同步" } else { "异步" }
        );
        Ok(Self {
            slice,
            converter,
        })
    }

    /// 内部状态机 (测试与诊断用)
    pub fn slice_decoder(&self) -> &SliceDecoder<VulkanBackend> {
        &self.slice
    }

    fn present(&mut self, outputs: Vec<OutputPicture>) -> MirraResult<Vec<GpuFrame>> {
        if outputs.is_empty() {
            return Ok(Vec::new());
        }
        let spec = self
            .slice
            .parameter_sets()
            .active_sps()
            .and_then(|sps| sps.vui.as_ref())
            .map(|vui| ColorSpec::from_vui(vui.matrix_coefficients, vui.full_range))
            .unwrap_or_default();
        self.converter.set_color_spec(spec);

        let backend = self.slice.backend();
        let semaphore = backend
            .semaphore()
            .ok_or_else(|| MirraError::Internal("输出图像时会话已销毁".into()))?;
        // 时间线单调递增, 等待最近一次提交即覆盖全部已输出图像
        let wait = (semaphore, backend.last_timeline_value());

        let mut frames = Vec::with_capacity(outputs.len());
        for output in outputs {
            let planes = self
                .slice
                .dpb()
                .and_then(|dpb| dpb.slot(output.slot_index))
                .map(|slot| slot.resource().plane_views())
                .ok_or_else(|| {
                    MirraError::Internal(format!("输出槽位越界: {}", output.slot_index))
                })?;
            let (image, view) = self.converter.convert(
                output.slot_index,
                planes,
                output.width,
                output.height,
                wait,
            )?;
            frames.push(GpuFrame {
                image,
                view,
                width: output.width,
                height: output.height,
                pts: output.pts,
                poc: output.poc,
            });
        }
        Ok(frames)
    }
}

impl GpuDecoder for VulkanDecoder {
    fn decode(&mut self, data: &[u8], pts: i64) -> MirraResult<Vec<GpuFrame>> {
        let outputs = self.slice.decode(data, pts)?;
        self.present(outputs)
    }

    fn decode_access_unit(&mut self, buffers: &[&[u8]], pts: i64) -> MirraResult<Vec<GpuFrame>> {
        let outputs = self.slice.decode_access_unit(buffers, pts)?;
        self.present(outputs)
    }

    fn flush(&mut self) -> MirraResult<Vec<GpuFrame>> {
        let outputs = self.slice.flush();
        self.present(outputs)
    }

    fn stats(&self) -> DecoderStats {
        self.slice.stats()
    }

    fn destroy(&mut self) {
        self.slice.destroy();
        debug!("Vulkan: 解码器已销毁");
    }
}

impl Drop for VulkanDecoder {
    fn drop(&mut self) {
        self.destroy();
    }
}
