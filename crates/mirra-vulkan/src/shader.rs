//! SPIR-V 着色器加载.

use std::io::Cursor;
use std::sync::Arc;

use ash::vk;

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};

/// SPIR-V 魔数
const SPIRV_MAGIC: u32 = 0x0723_0203;

static YUV_TO_RGBA_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/yuv_to_rgba.spv"));

/// 构建时由 shaderc 编译的 YUV → RGBA 着色器
pub fn yuv_to_rgba_spirv() -> &'static [u8] {
    YUV_TO_RGBA_SPV
}

/// 校验并转换为 u32 字序列
pub fn parse_spirv(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    // 头部至少 5 个字: magic, version, generator, bound, schema
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(VulkanError::Shader(format!(
            "SPIR-V 长度非法: {}",
            bytes.len()
        )));
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|err| VulkanError::Shader(format!("读取 SPIR-V 失败: {}", err)))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(VulkanError::Shader("SPIR-V 魔数错误".into()));
    }
    Ok(words)
}

/// 着色器模块
pub struct ShaderModule {
    ctx: Arc<VulkanContext>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    pub fn from_spirv(ctx: Arc<VulkanContext>, bytes: &[u8]) -> VulkanResult<Self> {
        let words = parse_spirv(bytes)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { ctx.device().create_shader_module(&info, None) }
            .map_err(VulkanError::call("vkCreateShaderModule"))?;
        Ok(Self { ctx, module })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_shader_module(self.module, None) };
    }
}
