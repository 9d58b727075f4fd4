//! 外部解码库回退层.
//!
//! 硬件与软件解码库都通过 [`LibraryFactory`] 接入. 解码库只输出 YUV 4:2:0 平面,
//! RGBA 转换由外观层统一完成. 默认注册 FFmpeg 硬件解码 (`ffmpeg` feature, 需要系统 FFmpeg)
//! 和 OpenH264 软件解码 (`openh264` feature), 集成方也可以注册自己的实现.

use std::sync::Arc;

use mirra_core::MirraResult;
use mirra_scale::YuvPlanes;

use crate::config::DecoderConfig;

/// 解码库输出的一帧, 平面数据只在回调期间有效
#[derive(Debug, Clone)]
pub struct LibraryFrame<'a> {
    pub yuv: YuvPlanes<'a>,
    pub pts: i64,
}

/// 帧接收回调
pub type FrameSink<'s> = dyn FnMut(LibraryFrame<'_>) -> MirraResult<()> + 's;

/// 外部解码库实例
pub trait LibraryDecoder: Send {
    fn name(&self) -> &str;

    /// 解码一段 Annex B 数据, 每输出一帧调用一次 `sink`
    fn decode(&mut self, data: &[u8], pts: i64, sink: &mut FrameSink<'_>) -> MirraResult<()>;

    /// 输出库内缓存的帧
    fn flush(&mut self, sink: &mut FrameSink<'_>) -> MirraResult<()>;
}

/// 解码库工厂
pub trait LibraryFactory: Send + Sync {
    fn name(&self) -> &str;

    /// 是否为硬件加速实现
    fn is_hardware(&self) -> bool;

    fn create(&self, config: &DecoderConfig) -> MirraResult<Box<dyn LibraryDecoder>>;
}

/// 默认注册的解码库, 硬件实现在前
pub fn default_factories() -> Vec<Arc<dyn LibraryFactory>> {
    #[allow(unused_mut)]
    let mut factories: Vec<Arc<dyn LibraryFactory>> = Vec::new();
    #[cfg(feature = "ffmpeg")]
    factories.push(Arc::new(hw::FfmpegFactory));
    #[cfg(feature = "openh264")]
    factories.push(Arc::new(soft::OpenH264Factory));
    factories
}

// ============================================================
// OpenH264 软件解码
// ============================================================

#[cfg(feature = "openh264")]
pub mod soft {
    use log::{debug, info};
    use openh264::decoder::Decoder;
    use openh264::formats::YUVSource;

    use mirra_core::{MirraError, MirraResult};
    use mirra_scale::{YuvLayout, YuvPlanes};

    use super::{FrameSink, LibraryDecoder, LibraryFactory, LibraryFrame};
    use crate::config::DecoderConfig;

    /// OpenH264 工厂
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OpenH264Factory;

    impl LibraryFactory for OpenH264Factory {
        fn name(&self) -> &str {
            "openh264"
        }

        fn is_hardware(&self) -> bool {
            false
        }

        fn create(&self, _config: &DecoderConfig) -> MirraResult<Box<dyn LibraryDecoder>> {
            let decoder = Decoder::new()
                .map_err(|err| MirraError::Unsupported(format!("openh264 初始化失败: {}", err)))?;
            info!("OpenH264 软件解码器已创建");
            Ok(Box::new(OpenH264Decoder {
                decoder,
                frames: 0,
            }))
        }
    }

    /// OpenH264 解码器
    pub struct OpenH264Decoder {
        decoder: Decoder,
        frames: u64,
    }

    // SAFETY: 解码器实例只在外观层的互斥锁内使用, 不会被多个线程同时访问
    unsafe impl Send for OpenH264Decoder {}

    impl LibraryDecoder for OpenH264Decoder {
        fn name(&self) -> &str {
            "openh264"
        }

        fn decode(&mut self, data: &[u8], pts: i64, sink: &mut FrameSink<'_>) -> MirraResult<()> {
            let yuv = match self.decoder.decode(data) {
                Ok(Some(yuv)) => yuv,
                Ok(None) => return Ok(()),
                Err(err) => return Err(MirraError::InvalidData(format!("openh264: {}", err))),
            };
            let (width, height) = yuv.dimensions();
            if width == 0 || height == 0 {
                return Ok(());
            }
            let (y_stride, u_stride, v_stride) = yuv.strides();
            self.frames += 1;
            debug!("openh264: 第 {} 帧 {}x{}", self.frames, width, height);
            sink(LibraryFrame {
                yuv: YuvPlanes {
                    layout: YuvLayout::I420,
                    width: width as u32,
                    height: height as u32,
                    planes: vec![yuv.y(), yuv.u(), yuv.v()],
                    strides: vec![y_stride, u_stride, v_stride],
                },
                pts,
            })
        }

        fn flush(&mut self, _sink: &mut FrameSink<'_>) -> MirraResult<()> {
            // 低延迟模式下每次 decode 即输出, 库内不保留待输出的帧
            Ok(())
        }
    }
}

// ============================================================
// FFmpeg 硬件解码
// ============================================================

#[cfg(feature = "ffmpeg")]
pub mod hw {
    use std::ptr;

    use ffmpeg_next as ffmpeg;
    use ffmpeg::codec::context::Context as CodecContext;
    use ffmpeg::codec::{self, Codec, decoder, threading};
    use ffmpeg::ffi::{AVBufferRef, AVHWDeviceType};
    use ffmpeg::format::Pixel;
    use ffmpeg::software::scaling::{Context as Scaler, Flags as ScalerFlags};
    use ffmpeg::util::error::EAGAIN;
    use ffmpeg::util::frame::video::Video as VideoFrame;
    use log::{debug, info, warn};

    use mirra_core::{MirraError, MirraResult};
    use mirra_scale::{YuvLayout, YuvPlanes};

    use super::{FrameSink, LibraryDecoder, LibraryFactory, LibraryFrame};
    use crate::config::DecoderConfig;

    /// 自带硬件后端的封装解码器, 按顺序尝试
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    pub const WRAPPER_DECODERS: &[&str] = &["h264_cuvid", "h264_qsv"];
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    pub const WRAPPER_DECODERS: &[&str] = &[];

    /// 挂到内置 h264 解码器上的硬件设备类型
    #[cfg(target_os = "linux")]
    const DEVICE_TYPES: &[AVHWDeviceType] = &[
        AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
        AVHWDeviceType::AV_HWDEVICE_TYPE_VDPAU,
    ];
    #[cfg(target_os = "windows")]
    const DEVICE_TYPES: &[AVHWDeviceType] = &[
        AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
        AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
    ];
    #[cfg(target_os = "macos")]
    const DEVICE_TYPES: &[AVHWDeviceType] = &[AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX];
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    const DEVICE_TYPES: &[AVHWDeviceType] = &[];

    /// FFmpeg 硬件解码工厂
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FfmpegFactory;

    impl LibraryFactory for FfmpegFactory {
        fn name(&self) -> &str {
            "ffmpeg-hw"
        }

        fn is_hardware(&self) -> bool {
            true
        }

        fn create(&self, _config: &DecoderConfig) -> MirraResult<Box<dyn LibraryDecoder>> {
            ffmpeg::init()
                .map_err(|err| MirraError::Unsupported(format!("FFmpeg 初始化失败: {}", err)))?;

            for &name in WRAPPER_DECODERS {
                let Some(codec) = decoder::find_by_name(name) else {
                    continue;
                };
                match open_decoder(codec, None) {
                    Ok(decoder) => {
                        info!("FFmpeg 硬件解码器已创建: {}", name);
                        return Ok(Box::new(FfmpegDecoder::new(name.to_string(), decoder)));
                    }
                    Err(err) => debug!("FFmpeg: {} 不可用: {}", name, err),
                }
            }

            let codec = decoder::find(codec::Id::H264)
                .ok_or_else(|| MirraError::Unsupported("FFmpeg 未编译 H.264 解码器".into()))?;
            for &device_type in DEVICE_TYPES {
                match open_decoder(codec, Some(device_type)) {
                    Ok(decoder) => {
                        let name = format!("h264 ({:?})", device_type);
                        info!("FFmpeg 硬件解码器已创建: {}", name);
                        return Ok(Box::new(FfmpegDecoder::new(name, decoder)));
                    }
                    Err(err) => debug!("FFmpeg: 硬件设备 {:?} 不可用: {}", device_type, err),
                }
            }

            Err(MirraError::Unsupported(
                "没有可用的 FFmpeg 硬件 H.264 解码器".into(),
            ))
        }
    }

    /// 低延迟设置下打开解码器, `device` 不为空时先挂上硬件设备
    fn open_decoder(codec: Codec, device: Option<AVHWDeviceType>) -> MirraResult<decoder::Video> {
        let mut ctx = CodecContext::new_with_codec(codec);
        ctx.set_flags(codec::Flags::LOW_DELAY);
        ctx.set_threading(threading::Config::kind(threading::Type::Slice));
        if let Some(device_type) = device {
            attach_device(&mut ctx, device_type)?;
        }
        ctx.decoder()
            .video()
            .map_err(|err| MirraError::Unsupported(format!("打开解码器失败: {}", err)))
    }

    fn attach_device(ctx: &mut CodecContext, device_type: AVHWDeviceType) -> MirraResult<()> {
        // SAFETY: ctx 持有有效的 AVCodecContext; 设备引用计数交给 ctx 后释放本地引用
        unsafe {
            let mut device: *mut AVBufferRef = ptr::null_mut();
            let ret = ffmpeg::ffi::av_hwdevice_ctx_create(
                &mut device,
                device_type,
                ptr::null(),
                ptr::null_mut(),
                0,
            );
            if ret < 0 || device.is_null() {
                return Err(MirraError::Unsupported(format!(
                    "创建硬件设备失败, error={}",
                    ret
                )));
            }
            (*ctx.as_mut_ptr()).hw_device_ctx = ffmpeg::ffi::av_buffer_ref(device);
            ffmpeg::ffi::av_buffer_unref(&mut device);
        }
        Ok(())
    }

    /// 可以直接交给外观层的像素格式
    pub fn plane_layout(format: Pixel) -> Option<YuvLayout> {
        match format {
            Pixel::NV12 => Some(YuvLayout::Nv12),
            Pixel::YUV420P | Pixel::YUVJ420P => Some(YuvLayout::I420),
            _ => None,
        }
    }

    fn map_error(stage: &str, err: ffmpeg::Error) -> MirraError {
        match err {
            ffmpeg::Error::InvalidData => MirraError::InvalidData(format!("ffmpeg {}: {}", stage, err)),
            other => MirraError::Submission(format!("ffmpeg {}: {}", stage, other)),
        }
    }

    fn is_again(err: &ffmpeg::Error) -> bool {
        matches!(err, ffmpeg::Error::Other { errno } if *errno == EAGAIN)
    }

    /// 硬件帧下载到系统内存, 通常得到 NV12
    fn download(frame: &VideoFrame) -> MirraResult<VideoFrame> {
        let mut sw = VideoFrame::empty();
        // SAFETY: 两个帧都由 ffmpeg-next 分配并在作用域内有效
        let ret = unsafe { ffmpeg::ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(MirraError::Submission(format!(
                "ffmpeg: 硬件帧下载失败, error={}",
                ret
            )));
        }
        sw.set_pts(frame.pts());
        Ok(sw)
    }

    fn is_hardware_frame(frame: &VideoFrame) -> bool {
        // SAFETY: frame 指针在借用期间有效
        unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() }
    }

    /// FFmpeg 解码器
    pub struct FfmpegDecoder {
        name: String,
        decoder: decoder::Video,
        /// 其他像素格式转为 I420 的缩放器, 记录源格式与尺寸
        scaler: Option<(Scaler, Pixel, u32, u32)>,
        last_pts: i64,
        frames: u64,
    }

    // SAFETY: 解码器实例只在外观层的互斥锁内使用, 不会被多个线程同时访问
    unsafe impl Send for FfmpegDecoder {}

    impl FfmpegDecoder {
        fn new(name: String, decoder: decoder::Video) -> Self {
            Self {
                name,
                decoder,
                scaler: None,
                last_pts: 0,
                frames: 0,
            }
        }

        fn receive_all(&mut self, sink: &mut FrameSink<'_>) -> MirraResult<()> {
            loop {
                let mut frame = VideoFrame::empty();
                match self.decoder.receive_frame(&mut frame) {
                    Ok(()) => self.emit(&frame, sink)?,
                    Err(ffmpeg::Error::Eof) => return Ok(()),
                    Err(err) if is_again(&err) => return Ok(()),
                    Err(err) => return Err(map_error("receive_frame", err)),
                }
            }
        }

        fn emit(&mut self, frame: &VideoFrame, sink: &mut FrameSink<'_>) -> MirraResult<()> {
            let downloaded;
            let frame = if is_hardware_frame(frame) {
                downloaded = download(frame)?;
                &downloaded
            } else {
                frame
            };

            let converted;
            let (frame, layout) = match plane_layout(frame.format()) {
                Some(layout) => (frame, layout),
                None => {
                    converted = self.to_i420(frame)?;
                    (&converted, YuvLayout::I420)
                }
            };
            let plane_count = match layout {
                YuvLayout::Nv12 => 2,
                YuvLayout::I420 => 3,
            };

            self.frames += 1;
            if self.frames == 1 {
                info!(
                    "{}: 首帧 {}x{}, 格式 {:?}",
                    self.name,
                    frame.width(),
                    frame.height(),
                    frame.format()
                );
            }
            sink(LibraryFrame {
                yuv: YuvPlanes {
                    layout,
                    width: frame.width(),
                    height: frame.height(),
                    planes: (0..plane_count).map(|i| frame.data(i)).collect(),
                    strides: (0..plane_count).map(|i| frame.stride(i)).collect(),
                },
                pts: frame.pts().unwrap_or(self.last_pts),
            })
        }

        fn to_i420(&mut self, frame: &VideoFrame) -> MirraResult<VideoFrame> {
            let (format, width, height) = (frame.format(), frame.width(), frame.height());
            let stale = self
                .scaler
                .as_ref()
                .is_none_or(|(_, f, w, h)| (*f, *w, *h) != (format, width, height));
            if stale {
                debug!("{}: 为 {:?} {}x{} 创建缩放器", self.name, format, width, height);
                let scaler = Scaler::get(
                    format,
                    width,
                    height,
                    Pixel::YUV420P,
                    width,
                    height,
                    ScalerFlags::BILINEAR,
                )
                .map_err(|err| MirraError::Unsupported(format!("ffmpeg 缩放器: {}", err)))?;
                self.scaler = Some((scaler, format, width, height));
            }
            let Some((scaler, ..)) = self.scaler.as_mut() else {
                return Err(MirraError::Internal("ffmpeg 缩放器缺失".into()));
            };
            let mut out = VideoFrame::empty();
            scaler
                .run(frame, &mut out)
                .map_err(|err| map_error("sws_scale", err))?;
            out.set_pts(frame.pts());
            Ok(out)
        }
    }

    impl LibraryDecoder for FfmpegDecoder {
        fn name(&self) -> &str {
            &self.name
        }

        fn decode(&mut self, data: &[u8], pts: i64, sink: &mut FrameSink<'_>) -> MirraResult<()> {
            self.last_pts = pts;
            let mut packet = ffmpeg::Packet::copy(data);
            packet.set_pts(Some(pts));
            match self.decoder.send_packet(&packet) {
                Ok(()) => {}
                Err(err) if is_again(&err) => {
                    // 输出队列已满, 先取走已解码的帧再重发
                    self.receive_all(sink)?;
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|err| map_error("send_packet", err))?;
                }
                Err(err) => return Err(map_error("send_packet", err)),
            }
            self.receive_all(sink)
        }

        fn flush(&mut self, sink: &mut FrameSink<'_>) -> MirraResult<()> {
            match self.decoder.send_eof() {
                Ok(()) | Err(ffmpeg::Error::Eof) => {}
                Err(err) => warn!("{}: 发送 EOF 失败: {}", self.name, err),
            }
            let result = self.receive_all(sink);
            // EOF 之后需要重置才能继续解码
            self.decoder.flush();
            result
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factories_hardware_first() {
        let factories = default_factories();
        let first_software = factories
            .iter()
            .position(|f| !f.is_hardware())
            .unwrap_or(factories.len());
        assert!(
            factories[first_software..].iter().all(|f| !f.is_hardware()),
            "硬件解码库应排在软件解码库之前"
        );
        #[cfg(feature = "ffmpeg")]
        assert_eq!(factories[0].name(), "ffmpeg-hw");
        #[cfg(feature = "openh264")]
        assert_eq!(factories.last().map(|f| f.name()), Some("openh264"));
    }
}
