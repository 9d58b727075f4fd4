//! YUV → RGBA 转换.
//!
//! 逆变换使用定点系数 (缩放 256 倍):
//! ```text
//! R = Ys * (Y - Yoff) + Rv * V'
//! G = Ys * (Y - Yoff) - Gu * U' - Gv * V'
//! B = Ys * (Y - Yoff) + Bu * U'
//! ```
//! 其中 U' = U - 128, V' = V - 128, 有限范围时 Yoff = 16.

use rayon::prelude::*;

use mirra_core::{MirraError, MirraResult};

/// 平面布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YuvLayout {
    /// Y 平面 + UV 交错平面
    Nv12,
    /// Y, U, V 三个平面
    I420,
}

/// 色彩矩阵
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Bt601,
    Bt709,
}

/// 色彩描述
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorSpec {
    pub matrix: ColorMatrix,
    pub full_range: bool,
}

impl ColorSpec {
    /// 由 VUI 的 matrix_coefficients 与 video_full_range_flag 推导
    ///
    /// 只识别 BT.709 (1), 其余值按 BT.601 处理.
    pub fn from_vui(matrix_coefficients: u8, full_range: bool) -> Self {
        let matrix = if matrix_coefficients == 1 {
            ColorMatrix::Bt709
        } else {
            ColorMatrix::Bt601
        };
        Self { matrix, full_range }
    }

    /// 浮点系数 [Ys, Yoff, Rv, Gu, Gv, Bu], 供 GPU 着色器使用
    pub fn float_coefficients(&self) -> [f32; 6] {
        let (rv, gu, gv, bu) = match (self.matrix, self.full_range) {
            (ColorMatrix::Bt601, false) => (1.596, 0.391, 0.813, 2.018),
            (ColorMatrix::Bt601, true) => (1.402, 0.344, 0.714, 1.772),
            (ColorMatrix::Bt709, false) => (1.793, 0.213, 0.533, 2.112),
            (ColorMatrix::Bt709, true) => (1.5748, 0.1873, 0.4681, 1.8556),
        };
        let (y_scale, y_offset) = if self.full_range {
            (1.0, 0.0)
        } else {
            (1.164, 16.0)
        };
        [y_scale, y_offset, rv, gu, gv, bu]
    }

    /// 定点系数
    pub fn coefficients(&self) -> ConvertCoefficients {
        let [y_scale, y_offset, rv, gu, gv, bu] = self.float_coefficients();
        let fixed = |v: f32| (v * 256.0).round() as i32;
        ConvertCoefficients {
            y_scale: fixed(y_scale),
            y_offset: y_offset as i32,
            rv: fixed(rv),
            gu: fixed(gu),
            gv: fixed(gv),
            bu: fixed(bu),
        }
    }
}

/// 定点转换系数 (缩放 256 倍)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertCoefficients {
    pub y_scale: i32,
    pub y_offset: i32,
    pub rv: i32,
    pub gu: i32,
    pub gv: i32,
    pub bu: i32,
}

impl ConvertCoefficients {
    #[inline]
    fn pixel(&self, y: u8, u: u8, v: u8) -> [u8; 4] {
        let c = (i32::from(y) - self.y_offset) * self.y_scale;
        let d = i32::from(u) - 128;
        let e = i32::from(v) - 128;
        let r = (c + self.rv * e + 128) >> 8;
        let g = (c - self.gu * d - self.gv * e + 128) >> 8;
        let b = (c + self.bu * d + 128) >> 8;
        [
            r.clamp(0, 255) as u8,
            g.clamp(0, 255) as u8,
            b.clamp(0, 255) as u8,
            255,
        ]
    }
}

/// YUV 4:2:0 输入 (各平面数据切片)
#[derive(Debug, Clone)]
pub struct YuvPlanes<'a> {
    pub layout: YuvLayout,
    pub width: u32,
    pub height: u32,
    /// NV12 为 [Y, UV], I420 为 [Y, U, V]
    pub planes: Vec<&'a [u8]>,
    /// 各平面行字节数
    pub strides: Vec<usize>,
}

impl YuvPlanes<'_> {
    fn validate(&self) -> MirraResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MirraError::InvalidArgument(format!(
                "YUV 尺寸非法: {}x{}",
                self.width, self.height
            )));
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        // (行字节数, 行数)
        let expected: &[(usize, usize)] = match self.layout {
            YuvLayout::Nv12 => &[(w, h), (cw * 2, ch)],
            YuvLayout::I420 => &[(w, h), (cw, ch), (cw, ch)],
        };
        if self.planes.len() < expected.len() || self.strides.len() < expected.len() {
            return Err(MirraError::InvalidArgument(format!(
                "{:?} 需要 {} 个平面",
                self.layout,
                expected.len()
            )));
        }
        for (idx, &(row_bytes, rows)) in expected.iter().enumerate() {
            let stride = self.strides[idx];
            let needed = (rows - 1) * stride + row_bytes;
            if stride < row_bytes || self.planes[idx].len() < needed {
                return Err(MirraError::InvalidArgument(format!(
                    "平面 {} 数据不足: stride={}, len={}, 需要 {}",
                    idx,
                    stride,
                    self.planes[idx].len(),
                    needed
                )));
            }
        }
        Ok(())
    }

    #[inline]
    fn chroma(&self, row: usize, col: usize) -> (u8, u8) {
        let crow = row / 2;
        let ccol = col / 2;
        match self.layout {
            YuvLayout::Nv12 => {
                let off = crow * self.strides[1] + ccol * 2;
                (self.planes[1][off], self.planes[1][off + 1])
            }
            YuvLayout::I420 => (
                self.planes[1][crow * self.strides[1] + ccol],
                self.planes[2][crow * self.strides[2] + ccol],
            ),
        }
    }
}

/// YUV → RGBA, 写入 `dst` (行字节数 `dst_stride`)
pub fn yuv_to_rgba(
    src: &YuvPlanes<'_>,
    spec: ColorSpec,
    dst: &mut [u8],
    dst_stride: usize,
) -> MirraResult<()> {
    src.validate()?;
    let w = src.width as usize;
    let h = src.height as usize;
    if dst_stride < w * 4 || dst.len() < (h - 1) * dst_stride + w * 4 {
        return Err(MirraError::InvalidArgument(format!(
            "RGBA 输出缓冲不足: stride={}, len={}",
            dst_stride,
            dst.len()
        )));
    }

    let coeffs = spec.coefficients();
    let y_stride = src.strides[0];
    dst.par_chunks_mut(dst_stride)
        .take(h)
        .enumerate()
        .for_each(|(row, line)| {
            let y_row = &src.planes[0][row * y_stride..row * y_stride + w];
            for (col, (&y, out)) in y_row.iter().zip(line.chunks_exact_mut(4)).enumerate() {
                let (u, v) = src.chroma(row, col);
                out.copy_from_slice(&coeffs.pixel(y, u, v));
            }
        });
    Ok(())
}

/// YUV → 紧密排列的 RGBA 缓冲
pub fn yuv_to_rgba_vec(src: &YuvPlanes<'_>, spec: ColorSpec) -> MirraResult<Vec<u8>> {
    let stride = src.width as usize * 4;
    let mut dst = vec![0u8; stride * src.height as usize];
    yuv_to_rgba(src, spec, &mut dst, stride)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_i420(width: u32, height: u32, y: u8, u: u8, v: u8) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        (vec![y; w * h], vec![u; cw * ch], vec![v; cw * ch])
    }

    fn i420<'a>(width: u32, height: u32, planes: &'a (Vec<u8>, Vec<u8>, Vec<u8>)) -> YuvPlanes<'a> {
        let cw = (width as usize).div_ceil(2);
        YuvPlanes {
            layout: YuvLayout::I420,
            width,
            height,
            planes: vec![&planes.0, &planes.1, &planes.2],
            strides: vec![width as usize, cw, cw],
        }
    }

    #[test]
    fn test_limited_range_black_white() {
        let black = solid_i420(4, 4, 16, 128, 128);
        let rgba = yuv_to_rgba_vec(&i420(4, 4, &black), ColorSpec::default()).unwrap();
        assert!(rgba.chunks(4).all(|p| p == [0, 0, 0, 255]));

        let white = solid_i420(4, 4, 235, 128, 128);
        let rgba = yuv_to_rgba_vec(&i420(4, 4, &white), ColorSpec::default()).unwrap();
        assert!(rgba.chunks(4).all(|p| p == [255, 255, 255, 255]));
    }

    #[test]
    fn test_bt601_red() {
        // BT.601 有限范围下的纯红
        let red = solid_i420(2, 2, 81, 90, 240);
        let rgba = yuv_to_rgba_vec(&i420(2, 2, &red), ColorSpec::default()).unwrap();
        let px = &rgba[..4];
        assert!(px[0] >= 250, "R={}", px[0]);
        assert!(px[1] <= 5, "G={}", px[1]);
        assert!(px[2] <= 5, "B={}", px[2]);
    }

    #[test]
    fn test_nv12_matches_i420() {
        let (w, h) = (6u32, 4u32);
        let y: Vec<u8> = (0..w * h).map(|i| (i * 7 % 220 + 16) as u8).collect();
        let u: Vec<u8> = (0..6).map(|i| 100 + i * 10).collect();
        let v: Vec<u8> = (0..6).map(|i| 180 - i * 12).collect();
        let uv: Vec<u8> = u.iter().zip(&v).flat_map(|(&a, &b)| [a, b]).collect();

        let planar = YuvPlanes {
            layout: YuvLayout::I420,
            width: w,
            height: h,
            planes: vec![&y, &u, &v],
            strides: vec![6, 3, 3],
        };
        let semi = YuvPlanes {
            layout: YuvLayout::Nv12,
            width: w,
            height: h,
            planes: vec![&y, &uv],
            strides: vec![6, 6],
        };
        let spec = ColorSpec::from_vui(1, false);
        assert_eq!(
            yuv_to_rgba_vec(&planar, spec).unwrap(),
            yuv_to_rgba_vec(&semi, spec).unwrap()
        );
    }

    #[test]
    fn test_odd_size_and_padded_output() {
        let planes = solid_i420(5, 3, 128, 128, 128);
        let src = i420(5, 3, &planes);
        let stride = 5 * 4 + 12;
        let mut dst = vec![0u8; stride * 3];
        yuv_to_rgba(&src, ColorSpec::default(), &mut dst, stride).unwrap();
        for row in 0..3 {
            assert!(dst[row * stride..row * stride + 20].chunks(4).all(|p| p[3] == 255));
            assert!(dst[row * stride + 20..(row + 1) * stride].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_reject_short_planes() {
        let y = vec![0u8; 10];
        let uv = vec![128u8; 4];
        let src = YuvPlanes {
            layout: YuvLayout::Nv12,
            width: 4,
            height: 4,
            planes: vec![&y, &uv],
            strides: vec![4, 4],
        };
        assert!(yuv_to_rgba_vec(&src, ColorSpec::default()).is_err());
        let mut dst = vec![0u8; 8];
        let planes = solid_i420(4, 4, 16, 128, 128);
        assert!(yuv_to_rgba(&i420(4, 4, &planes), ColorSpec::default(), &mut dst, 16).is_err());
    }

    #[test]
    fn test_color_spec_from_vui() {
        assert_eq!(ColorSpec::from_vui(1, true).matrix, ColorMatrix::Bt709);
        assert_eq!(ColorSpec::from_vui(6, false).matrix, ColorMatrix::Bt601);
        assert_eq!(ColorSpec::from_vui(2, false).coefficients().y_offset, 16);
        assert_eq!(ColorSpec::from_vui(2, true).coefficients().y_scale, 256);
    }
}
