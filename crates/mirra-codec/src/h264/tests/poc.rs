use super::super::{
    NalUnitType, ParameterSets, PocCalculator, Pps, SliceHeader, Sps, parse_pps,
    parse_slice_header_with, parse_sps,
};
use super::helpers::{TestPps, TestSlice, TestSps, build_pps_rbsp, build_slice_rbsp, build_sps_rbsp};

struct PocFixture {
    sps_input: TestSps,
    pps_input: TestPps,
    sps: Sps,
    pps: Pps,
    calc: PocCalculator,
}

impl PocFixture {
    fn new(sps_input: TestSps) -> Self {
        let pps_input = TestPps::default();
        let sps = parse_sps(&build_sps_rbsp(&sps_input)).expect("SPS 解析失败");
        let pps = parse_pps(&build_pps_rbsp(&pps_input), &ParameterSets::new()).expect("PPS 解析失败");
        Self {
            sps_input,
            pps_input,
            sps,
            pps,
            calc: PocCalculator::new(),
        }
    }

    fn header(&self, slice: &TestSlice) -> SliceHeader {
        let nal_type = if slice.idr {
            NalUnitType::SliceIdr
        } else {
            NalUnitType::Slice
        };
        let rbsp = build_slice_rbsp(slice, &self.sps_input, &self.pps_input);
        parse_slice_header_with(&rbsp, nal_type, slice.ref_idc, &self.sps, &self.pps)
            .expect("slice header 解析失败")
    }

    fn poc(&mut self, slice: &TestSlice) -> i32 {
        let header = self.header(slice);
        self.calc.compute(&self.sps, &header)
    }
}

#[test]
fn test_poc_type0_lsb_wraparound_strictly_increasing() {
    let mut fx = PocFixture::new(TestSps::default());
    let max_lsb = fx.sps.max_poc_lsb();
    let max_frame_num = fx.sps.max_frame_num();

    let mut last = fx.poc(&TestSlice::idr(0));
    assert_eq!(last, 0);
    for i in 1..(max_lsb * 3 + 7) {
        let slice = TestSlice::p(i % max_frame_num).with_poc_lsb(i % max_lsb);
        let poc = fx.poc(&slice);
        assert!(poc > last, "POC 应严格递增, i={} last={} poc={}", i, last, poc);
        assert_eq!(poc, i as i32, "环绕后 MSB 应累加");
        last = poc;
    }
}

#[test]
fn test_poc_type0_idr_resets_state() {
    let mut fx = PocFixture::new(TestSps::default());
    fx.poc(&TestSlice::idr(0));
    for i in 1..40 {
        fx.poc(&TestSlice::p(i % 16).with_poc_lsb((i * 2) % 64));
    }
    assert_ne!(fx.calc.prev_poc_msb(), 0);

    let poc = fx.poc(&TestSlice::idr(1));
    assert_eq!(poc, 0);
    assert_eq!(fx.calc.prev_poc_msb(), 0);
    assert_eq!(fx.calc.prev_poc_lsb(), 0);
}

#[test]
fn test_poc_type0_non_reference_keeps_state() {
    let mut fx = PocFixture::new(TestSps::default());
    fx.poc(&TestSlice::idr(0));
    assert_eq!(fx.poc(&TestSlice::p(1).with_poc_lsb(10)), 10);

    // 非参考帧的 LSB 大幅跳变只影响自身
    let b = TestSlice::b(2).with_poc_lsb(60);
    assert_eq!(fx.poc(&b), 60 - 64);
    assert_eq!(fx.calc.prev_poc_lsb(), 10);

    assert_eq!(fx.poc(&TestSlice::p(2).with_poc_lsb(12)), 12);
    assert_eq!(fx.calc.prev_poc_lsb(), 12);
}

#[test]
fn test_poc_type1_cycle_offsets() {
    let mut fx = PocFixture::new(TestSps {
        poc_type: 1,
        offset_for_ref_frame: vec![2],
        offset_for_non_ref_pic: -1,
        ..TestSps::default()
    });
    assert_eq!(fx.poc(&TestSlice::idr(0)), 0);
    assert_eq!(fx.poc(&TestSlice::p(1)), 2);
    assert_eq!(fx.poc(&TestSlice::p(2)), 4);
    assert_eq!(fx.poc(&TestSlice::b(3)), 3);

    let mut delta = TestSlice::p(3);
    delta.delta_poc = [1, 0];
    assert_eq!(fx.poc(&delta), 7);
}

#[test]
fn test_poc_type2_follows_decode_order() {
    let mut fx = PocFixture::new(TestSps {
        poc_type: 2,
        ..TestSps::default()
    });
    assert_eq!(fx.poc(&TestSlice::idr(0)), 0);
    assert_eq!(fx.poc(&TestSlice::p(1)), 2);
    assert_eq!(fx.poc(&TestSlice::b(2)), 3);
    assert_eq!(fx.poc(&TestSlice::p(2)), 4);
    for frame_num in 3..16 {
        fx.poc(&TestSlice::p(frame_num));
    }
    // frame_num 回绕, 偏移累加 MaxFrameNum
    assert_eq!(fx.poc(&TestSlice::p(0)), 32);
}

#[test]
fn test_poc_unknown_type_uses_frame_num() {
    let mut fx = PocFixture::new(TestSps {
        poc_type: 5,
        ..TestSps::default()
    });
    assert_eq!(fx.poc(&TestSlice::idr(0)), 0);
    assert_eq!(fx.poc(&TestSlice::p(9)), 9);
}

#[test]
fn test_poc_mmco5_resets_state() {
    let mut fx = PocFixture::new(TestSps::default());
    fx.poc(&TestSlice::idr(0));
    fx.poc(&TestSlice::p(1).with_poc_lsb(20));
    fx.calc.on_mmco5();
    assert_eq!(fx.calc.prev_poc_msb(), 0);
    assert_eq!(fx.calc.prev_poc_lsb(), 0);
}
