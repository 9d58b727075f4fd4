//! mirra-probe - H.264 码流探测工具
//!
//! 读取 Annex B 文件, 列出全部 NAL、参数集摘要与 slice header (含计算出的 POC).
//! `--decode` 用统一解码器的回退层实际解码并统计输出帧数.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use mirra::{DecoderConfig, UnifiedDecoder};
use mirra_codec::h264::{
    NalUnit, NalUnitType, ParameterSets, PocCalculator, parse_annex_b, parse_pps,
    parse_slice_header, parse_sps,
};

/// Mirra H.264 码流探测工具
#[derive(Parser, Debug)]
#[command(name = "mirra-probe", version, about = "H.264 Annex B 码流探测工具")]
struct Cli {
    /// 输入文件 (H.264 Annex B)
    input: PathBuf,

    /// 列出每个 NAL
    #[arg(long, default_value_t = false)]
    show_nals: bool,

    /// 用回退层解码并统计帧数
    #[arg(long)]
    decode: bool,

    /// 解码器配置文件 (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// 输出 JSON 格式
    #[arg(long)]
    json: bool,
}

// ============================================================
// 输出结构体
// ============================================================

#[derive(Serialize, Debug, Default)]
struct ProbeOutput {
    nal_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    nals: Vec<NalInfo>,
    sps: Vec<SpsInfo>,
    pps: Vec<PpsInfo>,
    slices: Vec<SliceInfo>,
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decode: Option<DecodeSummary>,
}

#[derive(Serialize, Debug)]
struct NalInfo {
    index: usize,
    nal_type: String,
    ref_idc: u8,
    size: usize,
}

#[derive(Serialize, Debug)]
struct SpsInfo {
    id: u32,
    profile_idc: u8,
    level_idc: u8,
    width: u32,
    height: u32,
    coded_width: u32,
    coded_height: u32,
    poc_type: u32,
    max_num_ref_frames: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_aspect_ratio: Option<String>,
}

#[derive(Serialize, Debug)]
struct PpsInfo {
    id: u32,
    sps_id: u32,
    cabac: bool,
    transform_8x8: bool,
}

#[derive(Serialize, Debug)]
struct SliceInfo {
    nal_index: usize,
    idr: bool,
    slice_type: String,
    first_mb: u32,
    frame_num: u32,
    poc: i32,
}

#[derive(Serialize, Debug)]
struct DecodeSummary {
    backend: String,
    frames: u64,
    errors: u64,
    parse_errors: u64,
    frames_dropped: u64,
}

// ============================================================
// 主逻辑
// ============================================================

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("错误: {:#}", err);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let data = std::fs::read(&cli.input)
        .with_context(|| format!("无法读取文件 '{}'", cli.input.display()))?;
    let mut output = probe(&data, cli.show_nals || cli.json);

    if cli.decode {
        let config = match &cli.config {
            Some(path) => DecoderConfig::load(path)
                .with_context(|| format!("无法加载配置 '{}'", path.display()))?,
            None => DecoderConfig::default(),
        };
        output.decode = Some(decode(&data, config)?);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text(&output);
    }
    Ok(())
}

/// 解析整段码流
fn probe(data: &[u8], list_nals: bool) -> ProbeOutput {
    let mut output = ProbeOutput::default();
    let mut sets = ParameterSets::new();
    let mut poc = PocCalculator::new();

    let nals = parse_annex_b(data);
    output.nal_count = nals.len();
    for (index, nal) in nals.iter().enumerate() {
        if list_nals {
            output.nals.push(NalInfo {
                index,
                nal_type: nal.nal_type.to_string(),
                ref_idc: nal.ref_idc,
                size: nal.with_start_code().len(),
            });
        }
        if let Err(err) = probe_nal(index, nal, &mut sets, &mut poc, &mut output) {
            output.errors.push(format!("NAL #{} ({}): {}", index, nal.nal_type, err));
        }
    }
    output
}

fn probe_nal(
    index: usize,
    nal: &NalUnit<'_>,
    sets: &mut ParameterSets,
    poc: &mut PocCalculator,
    output: &mut ProbeOutput,
) -> mirra_core::MirraResult<()> {
    match nal.nal_type {
        NalUnitType::Sps => {
            let sps = parse_sps(&nal.rbsp())?;
            output.sps.push(SpsInfo {
                id: sps.sps_id,
                profile_idc: sps.profile_idc,
                level_idc: sps.level_idc,
                width: sps.width(),
                height: sps.height(),
                coded_width: sps.coded_width(),
                coded_height: sps.coded_height(),
                poc_type: sps.poc_type,
                max_num_ref_frames: sps.max_num_ref_frames,
                frame_rate: sps.frame_rate(),
                sample_aspect_ratio: sps
                    .vui
                    .as_ref()
                    .map(|vui| format!("{}:{}", vui.sar.0, vui.sar.1)),
            });
            sets.insert_sps(sps);
        }
        NalUnitType::Pps => {
            let pps = parse_pps(&nal.rbsp(), sets)?;
            output.pps.push(PpsInfo {
                id: pps.pps_id,
                sps_id: pps.sps_id,
                cabac: pps.entropy_coding_mode,
                transform_8x8: pps.transform_8x8_mode,
            });
            sets.insert_pps(pps);
        }
        NalUnitType::Slice | NalUnitType::SliceIdr => {
            let header = parse_slice_header(nal, sets)?;
            let (sps, _) = sets.resolve(header.pps_id)?;
            if header.is_idr() {
                poc.reset();
            }
            let value = poc.compute(sps, &header);
            if header.dec_ref_pic_marking.has_mmco5() {
                poc.on_mmco5();
            }
            output.slices.push(SliceInfo {
                nal_index: index,
                idr: header.is_idr(),
                slice_type: format!("{:?}", header.slice_type),
                first_mb: header.first_mb_in_slice,
                frame_num: header.frame_num,
                poc: value,
            });
        }
        _ => {}
    }
    Ok(())
}

/// 逐个 NAL 送入统一解码器 (不使用 GPU 层)
fn decode(data: &[u8], config: DecoderConfig) -> Result<DecodeSummary> {
    let decoder = UnifiedDecoder::new(config, None).context("创建解码器失败")?;
    let frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&frames);
    decoder.set_callback(move |_frame| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    for (pts, nal) in parse_annex_b(data).iter().enumerate() {
        if let Err(err) = decoder.decode(nal.with_start_code(), pts as i64) {
            tracing::warn!("NAL #{} 解码失败: {}", pts, err);
        }
    }
    decoder.flush().context("flush 失败")?;

    let stats = decoder.stats();
    Ok(DecodeSummary {
        backend: decoder.backend_kind().to_string(),
        frames: frames.load(Ordering::Relaxed),
        errors: decoder.error_count(),
        parse_errors: stats.parse_errors,
        frames_dropped: stats.frames_dropped,
    })
}

// ============================================================
// 文本输出
// ============================================================

fn print_text(output: &ProbeOutput) {
    println!("[STREAM]");
    println!("  NAL 数量     : {}", output.nal_count);
    println!("  slice 数量   : {}", output.slices.len());
    println!("[/STREAM]");
    println!();

    for nal in &output.nals {
        println!(
            "  #{:<5} {:<12} ref_idc={} size={}",
            nal.index, nal.nal_type, nal.ref_idc, nal.size
        );
    }
    if !output.nals.is_empty() {
        println!();
    }

    for sps in &output.sps {
        println!("[SPS #{}]", sps.id);
        println!("  profile/level: {}/{}", sps.profile_idc, sps.level_idc);
        println!("  分辨率       : {}x{}", sps.width, sps.height);
        println!("  编码尺寸     : {}x{}", sps.coded_width, sps.coded_height);
        println!("  POC 类型     : {}", sps.poc_type);
        println!("  参考帧数     : {}", sps.max_num_ref_frames);
        if let Some(fps) = sps.frame_rate {
            println!("  帧率         : {:.3}", fps);
        }
        if let Some(sar) = &sps.sample_aspect_ratio {
            println!("  SAR          : {}", sar);
        }
        println!("[/SPS]");
        println!();
    }

    for pps in &output.pps {
        println!(
            "[PPS #{}] sps={} cabac={} 8x8={}",
            pps.id, pps.sps_id, pps.cabac, pps.transform_8x8
        );
    }

    for slice in &output.slices {
        println!(
            "  slice @{:<5} {:<4} {:<3} first_mb={} frame_num={} poc={}",
            slice.nal_index,
            if slice.idr { "IDR" } else { "" },
            slice.slice_type,
            slice.first_mb,
            slice.frame_num,
            slice.poc
        );
    }

    for err in &output.errors {
        println!("  警告: {}", err);
    }

    if let Some(summary) = &output.decode {
        println!();
        println!("[DECODE]");
        println!("  解码层       : {}", summary.backend);
        println!("  输出帧数     : {}", summary.frames);
        println!("  失败调用     : {}", summary.errors);
        println!("  解析错误     : {}", summary.parse_errors);
        println!("  丢弃帧数     : {}", summary.frames_dropped);
        println!("[/DECODE]");
    }
}
