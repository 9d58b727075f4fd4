//! 解码会话生命周期: 创建 (会话 + 内存 + DPB) 与按序销毁.

use log::{debug, info};
use mirra_core::{MirraError, MirraResult};

use super::backend::{DecodeBackend, SessionCaps, SessionDescriptor};
use super::dpb::DpbManager;

/// 一个已创建的解码会话
#[derive(Debug)]
pub struct DecodeSession<P> {
    pub descriptor: SessionDescriptor,
    pub caps: SessionCaps,
    pub dpb: DpbManager<P>,
    /// 会话参数是否已建立
    pub has_parameters: bool,
}

/// 创建会话
///
/// DPB 槽位数取配置值与设备上限的较小值. 任一步骤失败时,
/// 已创建的图像与会话都会被销毁后再返回错误.
pub fn open_session<B: DecodeBackend + ?Sized>(
    backend: &mut B,
    mut descriptor: SessionDescriptor,
) -> MirraResult<DecodeSession<B::Picture>> {
    let caps = backend.query_capabilities(&descriptor)?;
    if descriptor.max_coded_width > caps.max_coded_width
        || descriptor.max_coded_height > caps.max_coded_height
    {
        return Err(MirraError::Unsupported(format!(
            "编码尺寸超出设备能力, 请求 {}x{}, 上限 {}x{}",
            descriptor.max_coded_width,
            descriptor.max_coded_height,
            caps.max_coded_width,
            caps.max_coded_height
        )));
    }

    let slots = descriptor.max_dpb_slots.min(caps.max_dpb_slots);
    if slots == 0 {
        return Err(MirraError::Unsupported("设备不支持 DPB 槽位".into()));
    }
    descriptor.max_dpb_slots = slots;
    descriptor.max_active_references = descriptor
        .max_active_references
        .min(caps.max_active_references)
        .min(slots);

    backend.create_session(&descriptor)?;

    let dpb = match DpbManager::allocate(
        slots as usize,
        backend,
        |backend, idx| backend.create_picture(&descriptor, idx),
        |backend, picture| backend.destroy_picture(picture),
    ) {
        Ok(dpb) => dpb,
        Err(err) => {
            backend.destroy_session();
            return Err(err);
        }
    };

    info!(
        "解码会话已创建: profile={}, {}x{}, DPB 槽位={}",
        descriptor.profile_idc, descriptor.max_coded_width, descriptor.max_coded_height, slots
    );

    Ok(DecodeSession {
        descriptor,
        caps,
        dpb,
        has_parameters: false,
    })
}

/// 销毁会话
///
/// 顺序: 等待设备空闲, 会话参数, DPB 图像, 会话内存与会话本身.
pub fn close_session<B: DecodeBackend + ?Sized>(backend: &mut B, session: DecodeSession<B::Picture>) {
    backend.wait_idle();
    backend.destroy_parameters();
    for picture in session.dpb.into_resources() {
        backend.destroy_picture(picture);
    }
    backend.destroy_session();
    debug!("解码会话已销毁");
}
