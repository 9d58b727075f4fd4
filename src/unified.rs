//! 分层解码外观.
//!
//! 初始化按顺序尝试: Vulkan Video (提供了 GPU 设备且配置优先) → 硬件解码库 → 软件解码库.
//! 第一个成功的层在实例生命周期内固定不变. 两层的输出统一为 [`DecodedFrame`] 交给回调.
//!
//! `decode`/`decode_access_unit`/`flush`/`destroy` 由同一把锁互斥. 帧在锁内收集,
//! 回调句柄在锁外复制后调用, 回调中可以安全地再次调用解码器.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use mirra_codec::DecoderStats;
use mirra_core::{MirraError, MirraResult};
use mirra_scale::{ColorSpec, yuv_to_rgba_vec};
use mirra_vulkan::{GpuDecoder, GpuFrame, GpuVideoDevice, H264_DECODE_EXTENSION};

use crate::config::DecoderConfig;
use crate::fallback::{LibraryDecoder, LibraryFactory, LibraryFrame, default_factories};
use crate::frame::{BackendKind, DecodedFrame, FrameCallback, OwnedPayload, PendingOutput};

/// 当前生效的解码层
enum Tier {
    None,
    Gpu(Box<dyn GpuDecoder>),
    Library {
        kind: BackendKind,
        decoder: Box<dyn LibraryDecoder>,
    },
}

struct Inner {
    tier: Tier,
    /// 回退层统计 (GPU 层由解码器自身统计)
    library_stats: DecoderStats,
}

impl Inner {
    fn kind(&self) -> BackendKind {
        match &self.tier {
            Tier::None => BackendKind::None,
            Tier::Gpu(_) => BackendKind::Vulkan,
            Tier::Library { kind, .. } => *kind,
        }
    }

    fn decode(&mut self, buffers: &[&[u8]], pts: i64) -> MirraResult<Vec<PendingOutput>> {
        match &mut self.tier {
            Tier::None => Err(MirraError::InvalidArgument("解码器已销毁".into())),
            Tier::Gpu(decoder) => {
                let frames = match buffers {
                    [single] => decoder.decode(single, pts)?,
                    _ => decoder.decode_access_unit(buffers, pts)?,
                };
                Ok(frames.into_iter().map(gpu_output).collect())
            }
            Tier::Library { decoder, .. } => {
                let mut outputs = Vec::new();
                let mut sink = |f: LibraryFrame<'_>| collect_cpu(f, &mut outputs);
                let result = match buffers {
                    [single] => decoder.decode(single, pts, &mut sink),
                    _ => decoder.decode(&buffers.concat(), pts, &mut sink),
                };
                self.library_stats.frames_submitted += 1;
                if let Err(err) = result {
                    if err.is_parse_error() {
                        self.library_stats.parse_errors += 1;
                    } else {
                        self.library_stats.submit_errors += 1;
                    }
                    return Err(err);
                }
                self.library_stats.frames_emitted += outputs.len() as u64;
                Ok(outputs)
            }
        }
    }

    fn flush(&mut self) -> MirraResult<Vec<PendingOutput>> {
        match &mut self.tier {
            Tier::None => Ok(Vec::new()),
            Tier::Gpu(decoder) => Ok(decoder.flush()?.into_iter().map(gpu_output).collect()),
            Tier::Library { decoder, .. } => {
                let mut outputs = Vec::new();
                decoder.flush(&mut |f: LibraryFrame<'_>| collect_cpu(f, &mut outputs))?;
                self.library_stats.frames_emitted += outputs.len() as u64;
                Ok(outputs)
            }
        }
    }

    fn stats(&self) -> DecoderStats {
        match &self.tier {
            Tier::Gpu(decoder) => decoder.stats(),
            _ => self.library_stats,
        }
    }

    fn destroy(&mut self) {
        let tier = std::mem::replace(&mut self.tier, Tier::None);
        match tier {
            Tier::None => {}
            Tier::Gpu(mut decoder) => {
                decoder.destroy();
                info!("统一解码器: GPU 层已销毁");
            }
            Tier::Library { decoder, .. } => {
                info!("统一解码器: {} 已销毁", decoder.name());
            }
        }
    }
}

fn gpu_output(frame: GpuFrame) -> PendingOutput {
    PendingOutput {
        payload: OwnedPayload::Gpu {
            image: frame.image,
            view: frame.view,
        },
        width: frame.width,
        height: frame.height,
        pts: frame.pts,
        poc: Some(frame.poc),
    }
}

fn collect_cpu(frame: LibraryFrame<'_>, outputs: &mut Vec<PendingOutput>) -> MirraResult<()> {
    let rgba = yuv_to_rgba_vec(&frame.yuv, ColorSpec::default())?;
    outputs.push(PendingOutput {
        payload: OwnedPayload::Cpu {
            rgba,
            stride: frame.yuv.width as usize * 4,
        },
        width: frame.yuv.width,
        height: frame.yuv.height,
        pts: frame.pts,
        poc: None,
    });
    Ok(())
}

/// 分层解码器
pub struct UnifiedDecoder {
    config: DecoderConfig,
    inner: Mutex<Inner>,
    callback: Mutex<Option<FrameCallback>>,
    errors: AtomicU64,
}

impl UnifiedDecoder {
    /// 使用默认注册的解码库创建
    pub fn new(config: DecoderConfig, gpu: Option<Arc<dyn GpuVideoDevice>>) -> MirraResult<Self> {
        Self::with_factories(config, gpu, default_factories())
    }

    /// 指定可用的解码库创建
    ///
    /// 所有层都失败时返回错误; 不允许回退时只尝试 GPU 层.
    pub fn with_factories(
        config: DecoderConfig,
        gpu: Option<Arc<dyn GpuVideoDevice>>,
        factories: Vec<Arc<dyn LibraryFactory>>,
    ) -> MirraResult<Self> {
        config.validate()?;
        let tier = select_tier(&config, gpu, &factories)?;
        let decoder = Self {
            config,
            inner: Mutex::new(Inner {
                tier,
                library_stats: DecoderStats::default(),
            }),
            callback: Mutex::new(None),
            errors: AtomicU64::new(0),
        };
        info!("统一解码器: 使用 {} 层", decoder.backend_kind());
        Ok(decoder)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// 注册帧回调 (替换已有回调)
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&DecodedFrame<'_>) + Send + Sync + 'static,
    {
        *self.lock_callback() = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        *self.lock_callback() = None;
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.lock_inner().kind()
    }

    /// 解码统计
    pub fn stats(&self) -> DecoderStats {
        self.lock_inner().stats()
    }

    /// 失败的解码调用次数
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// 解码一段 Annex B 数据, 返回交给回调的帧数
    pub fn decode(&self, data: &[u8], pts: i64) -> MirraResult<usize> {
        self.run(|inner| inner.decode(&[data], pts))
    }

    /// 解码同一访问单元的多个 NAL 缓冲 (一次加锁)
    pub fn decode_access_unit(&self, buffers: &[&[u8]], pts: i64) -> MirraResult<usize> {
        if buffers.is_empty() {
            return Ok(0);
        }
        self.run(|inner| inner.decode(buffers, pts))
    }

    /// 输出全部缓冲中的帧
    pub fn flush(&self) -> MirraResult<usize> {
        self.run(Inner::flush)
    }

    /// 等待设备空闲并释放解码层, 之后的 decode 调用返回错误
    pub fn destroy(&self) {
        self.lock_inner().destroy();
    }

    fn run<F>(&self, op: F) -> MirraResult<usize>
    where
        F: FnOnce(&mut Inner) -> MirraResult<Vec<PendingOutput>>,
    {
        let (kind, outputs) = {
            let mut inner = self.lock_inner();
            let kind = inner.kind();
            match op(&mut inner) {
                Ok(outputs) => (kind, outputs),
                Err(err) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("统一解码器: {} 层解码失败: {}", kind, err);
                    return Err(err);
                }
            }
        };
        Ok(self.deliver(kind, &outputs))
    }

    fn deliver(&self, kind: BackendKind, outputs: &[PendingOutput]) -> usize {
        if outputs.is_empty() {
            return 0;
        }
        // 复制回调句柄后释放锁再调用
        let callback = self.lock_callback().clone();
        let Some(callback) = callback else {
            debug!("统一解码器: 未注册回调, 丢弃 {} 帧", outputs.len());
            return 0;
        };
        for output in outputs {
            callback(&output.as_frame(kind));
        }
        outputs.len()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<FrameCallback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UnifiedDecoder {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn select_tier(
    config: &DecoderConfig,
    gpu: Option<Arc<dyn GpuVideoDevice>>,
    factories: &[Arc<dyn LibraryFactory>],
) -> MirraResult<Tier> {
    if let Some(device) = gpu.filter(|_| config.prefer_vulkan_video) {
        if device.supports_extension(H264_DECODE_EXTENSION) {
            match device.clone().create_decoder(&config.gpu_config()) {
                Ok(decoder) => {
                    info!("统一解码器: Vulkan Video 初始化成功, 设备={}", device.name());
                    return Ok(Tier::Gpu(decoder));
                }
                Err(err) => warn!("统一解码器: Vulkan Video 初始化失败: {}", err),
            }
        } else {
            info!(
                "统一解码器: 设备 {} 不支持 {}",
                device.name(),
                H264_DECODE_EXTENSION
            );
        }
    }

    if !config.allow_ffmpeg_fallback {
        error!("统一解码器: GPU 层不可用且不允许回退");
        return Err(MirraError::Unsupported(
            "GPU 解码不可用且未允许回退到解码库".into(),
        ));
    }

    let hardware = factories.iter().filter(|f| f.is_hardware());
    let software = factories.iter().filter(|f| !f.is_hardware());
    let ordered: Vec<&Arc<dyn LibraryFactory>> = if config.enable_hw_accel {
        hardware.chain(software).collect()
    } else {
        software.collect()
    };

    for factory in ordered {
        match factory.create(config) {
            Ok(decoder) => {
                let kind = if factory.is_hardware() {
                    BackendKind::HardwareLibrary
                } else {
                    BackendKind::SoftwareLibrary
                };
                info!("统一解码器: 回退到 {}", factory.name());
                return Ok(Tier::Library { kind, decoder });
            }
            Err(err) => warn!("统一解码器: {} 初始化失败: {}", factory.name(), err),
        }
    }

    error!("统一解码器: 没有可用的解码层");
    Err(MirraError::Unsupported("没有可用的解码层".into()))
}
