//! 用 shaderc 把 YUV → RGBA 计算着色器编译为 SPIR-V, 输出到 OUT_DIR.

use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

const SHADER_SOURCE: &str = "shaders/yuv_to_rgba.comp";

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo::rerun-if-changed={}", SHADER_SOURCE);

    let source = fs::read_to_string(SHADER_SOURCE)?;
    let compiler = shaderc::Compiler::new().ok_or("无法创建 shaderc 编译器")?;
    let mut options = shaderc::CompileOptions::new().ok_or("无法创建 shaderc 编译选项")?;
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let artifact = compiler.compile_into_spirv(
        &source,
        shaderc::ShaderKind::Compute,
        SHADER_SOURCE,
        "main",
        Some(&options),
    )?;
    if artifact.get_num_warnings() > 0 {
        println!(
            "cargo::warning=yuv_to_rgba.comp: {}",
            artifact.get_warning_messages()
        );
    }

    let output = PathBuf::from(env::var("OUT_DIR")?).join("yuv_to_rgba.spv");
    fs::write(output, artifact.as_binary_u8())?;
    Ok(())
}
